//! Error types for Stowage
//!
//! Absent keys are never errors: lookups return `Ok(None)` and removals
//! return `Ok(false)`. Errors are reserved for I/O failures, an unavailable
//! index, construction failures and rejected arguments.

use thiserror::Error;

/// Common result type for Stowage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Stowage
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("store construction failed: {0}")]
    Construction(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background worker failed: {0}")]
    Worker(String),
}

impl Error {
    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a background worker error
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Check if a later attempt of the same operation may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::IndexUnavailable(_) | Self::Storage(_))
    }

    /// Check if the caller passed an argument the store never accepts
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}
