//! vf-db: database access and persistence layer.
//!
//! This crate provides SQLite-backed storage with connection pooling,
//! embedded migrations, row mapping, and the [`SqliteJobStore`]
//! implementation of `vf_core::JobStore`.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod store;

pub use pool::{init_memory_pool, init_pool, DbPool};
pub use store::SqliteJobStore;
