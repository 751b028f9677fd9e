//! Local resume cache.
//!
//! Remembers, per filename, which session a chunked upload belongs to and
//! which chunks it already delivered. The cache is a hint only: the
//! orchestrator checks every entry against the server before trusting it.

use crate::error::ClientResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeEntry {
    pub session_id: String,
    pub file_size: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub uploaded_chunks: BTreeSet<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ResumeEntry {
    pub fn new(session_id: String, file_size: u64, total_chunks: u32) -> Self {
        Self {
            session_id,
            file_size,
            total_chunks,
            uploaded_chunks: BTreeSet::new(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Whether this entry describes a file of this shape.
    pub fn matches(&self, file_size: u64, total_chunks: u32) -> bool {
        self.file_size == file_size && self.total_chunks == total_chunks
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    uploads: BTreeMap<String, ResumeEntry>,
}

/// Resume entries keyed by filename, optionally persisted as JSON.
#[derive(Debug, Default)]
pub struct ResumeCache {
    path: Option<PathBuf>,
    entries: BTreeMap<String, ResumeEntry>,
}

impl ResumeCache {
    /// A cache that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache at `path`. A missing file is an empty cache; an
    /// unreadable one is discarded with a warning.
    pub async fn load(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(contents) => match serde_json::from_slice::<CacheFile>(&contents) {
                Ok(file) => file.uploads,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt resume cache");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn get(&self, filename: &str) -> Option<&ResumeEntry> {
        self.entries.get(filename)
    }

    pub async fn insert(&mut self, filename: &str, entry: ResumeEntry) -> ClientResult<()> {
        self.entries.insert(filename.to_string(), entry);
        self.persist().await
    }

    /// Note a delivered chunk. Ignored when the entry belongs to another session.
    pub async fn record_chunk(
        &mut self,
        filename: &str,
        session_id: &str,
        chunk_number: u32,
    ) -> ClientResult<()> {
        match self.entries.get_mut(filename) {
            Some(entry) if entry.session_id == session_id => {
                entry.uploaded_chunks.insert(chunk_number);
                entry.updated_at = OffsetDateTime::now_utc();
            }
            _ => return Ok(()),
        }
        self.persist().await
    }

    pub async fn remove(&mut self, filename: &str) -> ClientResult<Option<ResumeEntry>> {
        let removed = self.entries.remove(filename);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn persist(&self) -> ClientResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = CacheFile {
            uploads: self.entries.clone(),
        };
        let contents = serde_json::to_vec_pretty(&file)
            .map_err(|e| std::io::Error::other(format!("failed to encode resume cache: {e}")))?;

        // Write-then-rename so a crash never leaves a torn file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
