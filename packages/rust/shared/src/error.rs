//! Error types for Stitchwork.
//!
//! Library crates use [`StitchworkError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Stitchwork operations.
#[derive(Debug, thiserror::Error)]
pub enum StitchworkError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Rejected input at intake (bad identity, malformed payload, unknown provider).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The requested entity or identity does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Pipeline assembly error (unknown stage, duplicate processor id).
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StitchworkError>;

impl StitchworkError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error describing the missing thing.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a [`StitchworkError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
