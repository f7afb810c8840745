//! # vf-av
//!
//! The encoder capability for vidforge.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support and line-by-line stderr streaming for progress.
//! - **Workspace management** ([`Workspace`]) -- temporary directory holding
//!   one encode's input and output.
//! - **Encoders** ([`Encoder`]) -- [`FfmpegEncoder`] for real transcodes and
//!   [`FallbackEncoder`] for hosts without ffmpeg, both reporting through a
//!   [`ProgressReporter`].

pub mod command;
pub mod encoder;
pub mod fallback;
pub mod ffmpeg;
pub mod tools;
pub mod workspace;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use encoder::{Encoder, ProgressReporter};
pub use fallback::FallbackEncoder;
pub use ffmpeg::FfmpegEncoder;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use workspace::Workspace;
