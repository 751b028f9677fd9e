//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;
use time::OffsetDateTime;

/// Type alias for a byte stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Object storage abstraction.
///
/// Keys are `/`-separated relative paths. Chunks of an upload session live
/// under `sessions/{session_id}/chunks/`, assembled files under `videos/`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get object metadata.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's contents.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put an object, replacing any existing one.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Start a streaming upload. The object becomes visible only once
    /// [`StreamingUpload::finish`] succeeds.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object. Missing objects answer [`StorageError::NotFound`].
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List every key under a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Delete every object under a prefix, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u64> {
        let mut deleted = 0;
        for key in self.list(prefix).await? {
            match self.delete(&key).await {
                Ok(()) => deleted += 1,
                // Raced with another sweeper.
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Issue a time-limited URL through which a client can write `key`
    /// directly, bypassing the server.
    ///
    /// Backends without such a facility return [`StorageError::Unsupported`].
    async fn presign_put(&self, key: &str, ttl: Duration) -> StorageResult<PresignedPut>;

    /// Get the name of this storage backend.
    ///
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called during server startup so misconfiguration fails fast. The
    /// default implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}

/// A pre-signed write target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresignedPut {
    pub url: String,
    pub method: String,
    /// Headers the client must send verbatim for the signature to hold.
    pub headers: Vec<(String, String)>,
    pub expires_at: OffsetDateTime,
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
