//! Common error types for Tideline.

use thiserror::Error;

/// Top-level error type for Tideline operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Outbox store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// The remote endpoint could not be reached or returned a transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A sync pass exceeded its time budget.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The background scheduler is not running or dropped a request.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
