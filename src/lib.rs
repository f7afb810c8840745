//! vidforge: conversion job orchestration.
//!
//! Takes one uploaded video, fans it out into per-resolution encode jobs,
//! drives each job to a terminal state with progress reporting, and keeps
//! observers in sync through change notifications.
//!
//! The domain model, store trait, and change notifier live in `vf-core`, the
//! SQLite store in `vf-db`, and the encoders in `vf-av`. This crate holds the
//! orchestration on top of them.

pub mod context;
pub mod orchestrator;
pub mod progress;
pub mod recovery;
pub mod storage;
pub mod sync;

pub use context::AppContext;
pub use orchestrator::{output_path, JobOutcome, Orchestrator, RunReport};
pub use progress::{ProgressWriter, WriterStats};
pub use recovery::{recover_stalled, RecoveryReport};
pub use storage::{LocalStorage, MediaStorage};
pub use sync::{ApplyOutcome, SyncObserver, SyncUpdate, VideoProjection};
