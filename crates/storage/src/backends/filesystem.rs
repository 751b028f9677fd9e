//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, ObjectStore, PresignedPut, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Read size for streamed gets (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Local filesystem object store.
///
/// Writes go to a uniquely named sibling temp file that is fsynced and then
/// renamed over the target, so readers never observe a partial object.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root directory.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key to a path inside the root.
    ///
    /// Resolution touches the filesystem (`canonicalize`), so it runs on the
    /// blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolve_key(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

/// Validate `key` and join it onto `root`.
///
/// Rejects anything but plain relative components, and anything whose
/// nearest existing ancestor (the path itself included) resolves outside
/// the root through a symlink.
fn resolve_key(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.is_empty() || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    if !Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }

    let root_canonical = root.canonicalize().map_err(|e| {
        StorageError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to canonicalize root: {e}"),
        ))
    })?;

    let path = root.join(key);
    let mut candidate = Some(path.as_path());
    while let Some(current) = candidate {
        match std::fs::symlink_metadata(current) {
            Ok(meta) => {
                let canonical = current.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => candidate = current.parent(),
            Err(e) => return Err(StorageError::Io(e)),
        }
    }

    Ok(path)
}

fn map_not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let suffix = format!(".tmp.{}", Uuid::new_v4());
    let name = path
        .file_name()
        .map(|n| format!("{}{suffix}", n.to_string_lossy()))
        .unwrap_or(suffix);
    path.with_file_name(name)
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path).await.map_err(map_not_found(key))?;
        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(Into::into),
            content_type: None,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(map_not_found(key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.key_path(key).await?;
        let mut file = fs::File::open(&path).await.map_err(map_not_found(key))?;

        let stream = async_stream::try_stream! {
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = temp_sibling(&path);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = temp_sibling(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path).await.map_err(map_not_found(key))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base = self.key_path(prefix.trim_end_matches('/')).await?;
        let mut keys = Vec::new();

        match fs::try_exists(&base).await {
            Ok(true) => {}
            Ok(false) => return Ok(keys),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                // file_type() does not follow symlinks; symlinks are skipped.
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && !path.to_string_lossy().contains(".tmp.")
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    keys.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u64> {
        let base = self.key_path(prefix.trim_end_matches('/')).await?;
        let deleted = self.list(prefix).await?.len() as u64;
        match fs::remove_dir_all(&base).await {
            Ok(()) => Ok(deleted),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn presign_put(&self, key: &str, _ttl: Duration) -> StorageResult<PresignedPut> {
        Err(StorageError::Unsupported(format!(
            "filesystem backend cannot pre-sign writes ({key})"
        )))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

/// Streaming upload into a temp file, renamed into place on finish.
struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let Self {
            file,
            temp_path,
            final_path,
            bytes_written,
        } = *self;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &final_path).await?;
        Ok(bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        let Self {
            file, temp_path, ..
        } = *self;
        drop(file);
        let _ = fs::remove_file(&temp_path).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_put_replaces_existing_object() {
        let (_dir, backend) = backend().await;
        let key = "sessions/abc/chunks/000000";

        backend.put(key, Bytes::from("first")).await.unwrap();
        backend.put(key, Bytes::from("second!")).await.unwrap();

        assert_eq!(backend.get(key).await.unwrap(), Bytes::from("second!"));
        assert_eq!(backend.head(key).await.unwrap().size, 7);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (_dir, backend) = backend().await;
        assert!(!backend.exists("videos/none").await.unwrap());
        assert!(matches!(
            backend.get("videos/none").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.delete("videos/none").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, backend) = backend().await;

        assert!(backend.exists("../escape").await.is_err());
        assert!(backend.exists("/absolute/path").await.is_err());
        assert!(backend.exists("foo/../bar").await.is_err());
        assert!(backend.exists("").await.is_err());

        assert!(backend.exists("valid/nested/key").await.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_ancestor_symlink_traversal_rejected() {
        use std::os::unix::fs::symlink;

        let (dir, backend) = backend().await;
        let outside = tempfile::tempdir().unwrap();
        symlink(outside.path(), dir.path().join("escape")).unwrap();

        let result = backend
            .put("escape/nested/file", Bytes::from("data"))
            .await;

        match result {
            Err(StorageError::InvalidKey(msg)) => assert!(msg.contains("escapes storage root")),
            other => panic!("expected InvalidKey, got {other:?}"),
        }
        assert!(!outside.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_streaming_upload_visible_only_after_finish() {
        let (_dir, backend) = backend().await;
        let key = "videos/owner/share";

        let mut upload = backend.put_stream(key).await.unwrap();
        upload.write(Bytes::from("hello ")).await.unwrap();
        upload.write(Bytes::from("world")).await.unwrap();
        assert!(!backend.exists(key).await.unwrap());

        assert_eq!(upload.finish().await.unwrap(), 11);
        assert_eq!(backend.get(key).await.unwrap(), Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_nothing() {
        let (_dir, backend) = backend().await;

        let mut upload = backend.put_stream("videos/owner/gone").await.unwrap();
        upload.write(Bytes::from("partial")).await.unwrap();
        upload.abort().await.unwrap();

        assert!(backend.list("videos/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_and_delete_prefix() {
        let (_dir, backend) = backend().await;
        for n in 0..3 {
            let key = format!("sessions/s1/chunks/{n:06}");
            backend.put(&key, Bytes::from("x")).await.unwrap();
        }
        backend.put("sessions/s2/chunks/000000", Bytes::from("y")).await.unwrap();

        let keys = backend.list("sessions/s1/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "sessions/s1/chunks/000000",
                "sessions/s1/chunks/000001",
                "sessions/s1/chunks/000002",
            ]
        );

        assert_eq!(backend.delete_prefix("sessions/s1/").await.unwrap(), 3);
        assert!(backend.list("sessions/s1/").await.unwrap().is_empty());
        assert_eq!(backend.list("sessions/").await.unwrap().len(), 1);
        assert_eq!(backend.delete_prefix("sessions/s1/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_presign_is_unsupported() {
        let (_dir, backend) = backend().await;
        let result = backend
            .presign_put("sessions/s1/chunks/000000", Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(StorageError::Unsupported(_))));
    }
}
