//! Core domain types and shared logic for the reel upload service.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload session identifiers, share identifiers and lifecycle states
//! - Chunk layout math and object key naming
//! - Per-user quota accounting
//! - Token scopes and authorization
//! - Configuration shared by the server and the client

pub mod chunk;
pub mod config;
pub mod error;
pub mod quota;
pub mod session;
pub mod token;

pub use chunk::{ChunkLayout, chunk_object_key, video_object_key};
pub use error::{Error, Result};
pub use quota::UserQuota;
pub use session::{SessionId, SessionStatus, ShareId, UploadSession};
pub use token::{Token, TokenId, TokenScope};

/// Default client chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum chunk size accepted by the server: 32 MiB
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Files at or below this size are uploaded in a single request: 10 MiB
pub const DEFAULT_CHUNKED_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Reason recorded on sessions cancelled by the expiry sweep.
pub const SESSION_EXPIRED_REASON: &str = "Session expired";
