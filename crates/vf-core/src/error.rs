//! Unified error type for vidforge.
//!
//! Every crate in the workspace funnels its failures into [`Error`]. The
//! orchestrator runs every encoder and storage failure through
//! [`Error::is_run_level`]: job-level errors are recorded on the job as they
//! are, and anything run-level is demoted so one job never aborts the batch.

use std::fmt;

/// Unified error type covering all failure modes in vidforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "video", "conversion_job").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// An operation was attempted from a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The shared source media for a run could not be fetched.
    #[error("Source unavailable [{path}]: {message}")]
    SourceUnavailable {
        /// Storage path of the source media.
        path: String,
        /// Human-readable error description.
        message: String,
    },

    /// Encoding a single resolution failed.
    #[error("Encode failed [{resolution}]: {message}")]
    Encode {
        /// Target resolution label (e.g. "720p").
        resolution: String,
        /// Human-readable error description.
        message: String,
    },

    /// The storage collaborator rejected a read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A job store write or read failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Input data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this failure aborts an orchestrator run rather than a single job.
    ///
    /// Encode, tool, and storage failures are isolated to the job that hit
    /// them. Everything else is surfaced to the caller of the run.
    pub fn is_run_level(&self) -> bool {
        !matches!(
            self,
            Error::Encode { .. } | Error::Tool { .. } | Error::Storage(_)
        )
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::InvalidState`].
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(message.into())
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Encode`].
    pub fn encode(resolution: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::Encode {
            resolution: resolution.to_string(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::SourceUnavailable`].
    pub fn source_unavailable(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SourceUnavailable {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
