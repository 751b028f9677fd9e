//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("invalid share id: {0}")]
    InvalidShareId(String),

    #[error("unknown session status: {0}")]
    InvalidStatus(String),

    #[error("invalid chunk layout: {0}")]
    InvalidChunkLayout(String),

    #[error("chunk {chunk_number} out of range (total chunks: {total_chunks})")]
    ChunkOutOfRange { chunk_number: u32, total_chunks: u32 },

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
