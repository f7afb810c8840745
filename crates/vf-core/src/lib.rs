//! vf-core: shared types, IDs, errors, configuration, and change events.
//!
//! This crate is the foundational dependency for all other vf-* crates,
//! providing type-safe identifiers, a unified error type, the video and
//! conversion job models with their state machine, the [`JobStore`] trait,
//! application configuration, and the change notifier.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod media;
pub mod models;
pub mod store;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use events::{ChangeEvent, ChangeNotifier, ChangeRecord, Delivery, Subscription};
pub use ids::*;
pub use media::*;
pub use models::*;
pub use store::JobStore;
