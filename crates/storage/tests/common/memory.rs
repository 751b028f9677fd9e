use async_trait::async_trait;
use bytes::Bytes;
use reel_storage::error::{StorageError, StorageResult};
use reel_storage::traits::{ByteStream, ObjectMeta, ObjectStore, PresignedPut, StreamingUpload};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;

type Objects = Arc<Mutex<BTreeMap<String, Bytes>>>;

/// In-memory object store. Pre-signing is available when a base URL is set,
/// producing `{base}/{key}` targets that nothing actually serves.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Objects,
    presign_base: Option<String>,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_presign_base(base: &str) -> Self {
        Self {
            presign_base: Some(base.trim_end_matches('/').to_string()),
            ..Self::default()
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let size = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size,
            last_modified: None,
            content_type: None,
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let data = self.get(key).await?;
        // Split to exercise consumers that concatenate stream items.
        let pieces: Vec<StorageResult<Bytes>> = data
            .chunks(3)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        Ok(Box::pin(futures::stream::iter(pieces)))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        Ok(Box::new(MemoryUpload {
            objects: self.objects.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> StorageResult<PresignedPut> {
        let base = self
            .presign_base
            .as_ref()
            .ok_or_else(|| StorageError::Unsupported("memory store without presign base".into()))?;
        Ok(PresignedPut {
            url: format!("{base}/{key}"),
            method: "PUT".to_string(),
            headers: Vec::new(),
            expires_at: OffsetDateTime::now_utc() + ttl,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryUpload {
    objects: Objects,
    key: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl StreamingUpload for MemoryUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let Self {
            objects,
            key,
            buffer,
        } = *self;
        let len = buffer.len() as u64;
        objects.lock().unwrap().insert(key, Bytes::from(buffer));
        Ok(len)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
