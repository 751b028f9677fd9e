//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The session is missing, expired or no longer accepts writes.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Reserving the requested bytes would push the owner over the limit.
    #[error("quota exceeded: requested {requested} bytes, {remaining} remaining")]
    QuotaExceeded { requested: u64, remaining: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

impl From<reel_core::Error> for MetadataError {
    fn from(e: reel_core::Error) -> Self {
        MetadataError::Internal(format!("corrupt row: {e}"))
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
