//! Storage test utilities.

use async_trait::async_trait;
use bytes::Bytes;
use reel_storage::{
    ByteStream, FilesystemBackend, ObjectMeta, ObjectStore, PresignedPut, StorageResult,
    StreamingUpload,
};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

/// Filesystem storage that also hands out direct write targets, the way an
/// S3 bucket would. Clients in tests write the object through `put` and
/// then notify.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct PresigningStore {
    inner: FilesystemBackend,
}

#[allow(dead_code)]
impl PresigningStore {
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self {
            inner: FilesystemBackend::new(root).await?,
        })
    }
}

#[async_trait]
impl ObjectStore for PresigningStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> StorageResult<PresignedPut> {
        Ok(PresignedPut {
            url: format!("https://uploads.test/{key}?signature=test"),
            method: "PUT".to_string(),
            headers: vec![(
                "content-type".to_string(),
                "application/octet-stream".to_string(),
            )],
            expires_at: OffsetDateTime::now_utc() + ttl,
        })
    }

    fn backend_name(&self) -> &'static str {
        "presigning"
    }
}
