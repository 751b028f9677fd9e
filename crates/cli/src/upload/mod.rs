//! Upload orchestration.
//!
//! Files at or below the chunked threshold go up in one request. Larger
//! files are split into fixed-size chunks and sent through a session:
//!
//! 1. Reuse the cached session for this file if the server still has it
//!    open, otherwise start a new one.
//! 2. Send every chunk the server does not already hold. Each chunk has its
//!    own retry budget.
//! 3. Ask the server to assemble the file.
//!
//! A chunk that exhausts its budget abandons the session; the whole file is
//! then retried from a fresh session, up to the same number of attempts.
//! Failures while starting or completing keep the session so the next
//! attempt resumes it.

pub mod progress;
pub mod queue;
pub mod resume;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use crate::api_client::UploadApi;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use bytes::Bytes;
use progress::{ASSEMBLY_CEILING, ProgressTracker, SINGLE_UPLOAD_CEILING, UploadState};
use reel_core::ChunkLayout;
use reel_core::SessionStatus;
use reel_core::session::{CompleteSessionResponse, StartSessionRequest};
use resume::{ResumeCache, ResumeEntry};
use retry::RetryPolicy;
use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport::ChunkTransport;

/// Share of the bar covered by chunk transfer; assembly animates the rest.
const TRANSFER_SHARE: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    pub chunk_size: u64,
    pub chunked_threshold: u64,
    pub retry: RetryPolicy,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl UploadSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunked_threshold: config.chunked_threshold,
            retry: RetryPolicy::new(Duration::from_millis(config.retry_base_delay_ms)),
        }
    }
}

#[derive(Debug, Clone)]
enum SourceData {
    File(PathBuf),
    Memory(Bytes),
}

/// A file to upload.
#[derive(Debug, Clone)]
pub struct UploadSource {
    pub filename: String,
    pub mimetype: String,
    pub size: u64,
    data: SourceData,
}

impl UploadSource {
    pub async fn from_path(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            mimetype: guess_mimetype(&filename).to_string(),
            filename,
            size: metadata.len(),
            data: SourceData::File(path.to_path_buf()),
        })
    }

    pub fn from_bytes(filename: &str, mimetype: &str, data: Bytes) -> Self {
        Self {
            filename: filename.to_string(),
            mimetype: mimetype.to_string(),
            size: data.len() as u64,
            data: SourceData::Memory(data),
        }
    }

    /// Read `len` bytes starting at `offset`.
    pub async fn read(&self, offset: u64, len: u64) -> ClientResult<Bytes> {
        match &self.data {
            SourceData::Memory(bytes) => {
                let start = offset.min(self.size) as usize;
                let end = offset.saturating_add(len).min(self.size) as usize;
                Ok(bytes.slice(start..end))
            }
            SourceData::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    pub async fn read_all(&self) -> ClientResult<Bytes> {
        self.read(0, self.size).await
    }
}

fn guess_mimetype(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

/// Where in a chunked attempt a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Chunks,
    Complete,
}

struct AttemptFailure {
    stage: Stage,
    session_id: Option<String>,
    error: ClientError,
}

struct Tracked {
    id: u64,
    cancel: CancellationToken,
    session_id: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives uploads against an [`UploadApi`].
pub struct UploadOrchestrator {
    api: Arc<dyn UploadApi>,
    transport: Box<dyn ChunkTransport>,
    resume: tokio::sync::Mutex<ResumeCache>,
    progress: ProgressTracker,
    settings: UploadSettings,
    tracked: Mutex<HashMap<String, Tracked>>,
    next_id: AtomicU64,
}

impl UploadOrchestrator {
    pub fn new(
        api: Arc<dyn UploadApi>,
        transport: Box<dyn ChunkTransport>,
        resume: ResumeCache,
        progress: ProgressTracker,
        settings: UploadSettings,
    ) -> Self {
        Self {
            api,
            transport,
            resume: tokio::sync::Mutex::new(resume),
            progress,
            settings,
            tracked: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub async fn resume_entry(&self, filename: &str) -> Option<ResumeEntry> {
        self.resume.lock().await.get(filename).cloned()
    }

    /// Register a file as queued. The returned token cancels it.
    pub fn track(&self, filename: &str) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        lock(&self.tracked).insert(
            filename.to_string(),
            Tracked {
                id,
                cancel: cancel.clone(),
                session_id: None,
            },
        );
        self.progress.set_pending(filename);
        (id, cancel)
    }

    /// Whether a file is queued or uploading.
    pub fn is_tracked(&self, filename: &str) -> bool {
        lock(&self.tracked).contains_key(filename)
    }

    /// Drop the registration made by [`track`](Self::track), unless the
    /// filename has been queued again since.
    pub fn untrack(&self, filename: &str, id: u64) {
        let mut tracked = lock(&self.tracked);
        if tracked.get(filename).is_some_and(|t| t.id == id) {
            tracked.remove(filename);
        }
    }

    fn set_session(&self, filename: &str, session_id: &str) {
        if let Some(tracked) = lock(&self.tracked).get_mut(filename) {
            tracked.session_id = Some(session_id.to_string());
        }
    }

    /// Cancel a queued or running upload.
    ///
    /// Untracks it, stops its timers, cancels its server session and forgets
    /// its resume entry and progress. Returns false if the file is not tracked.
    pub async fn cancel(&self, filename: &str) -> bool {
        let tracked = lock(&self.tracked)
            .remove(filename)
            .map(|t| (t.cancel, t.session_id));
        let Some((token, session_id)) = tracked else {
            return false;
        };

        token.cancel();
        self.progress.stop_animation(filename);
        if let Some(session_id) = session_id {
            self.cancel_session_quietly(&session_id).await;
        }
        self.forget(filename).await;
        self.progress.remove(filename);
        info!(filename, "Upload cancelled");
        true
    }

    async fn cancel_session_quietly(&self, session_id: &str) {
        if let Err(e) = self.api.cancel_session(session_id).await {
            debug!(session_id, error = %e, "Session cancel failed");
        }
    }

    async fn remember(&self, filename: &str, entry: ResumeEntry) {
        if let Err(e) = self.resume.lock().await.insert(filename, entry).await {
            warn!(filename, error = %e, "Failed to update resume cache");
        }
    }

    async fn record_chunk(&self, filename: &str, session_id: &str, chunk_number: u32) {
        let mut cache = self.resume.lock().await;
        if let Err(e) = cache.record_chunk(filename, session_id, chunk_number).await {
            warn!(filename, error = %e, "Failed to update resume cache");
        }
    }

    async fn forget(&self, filename: &str) {
        if let Err(e) = self.resume.lock().await.remove(filename).await {
            warn!(filename, error = %e, "Failed to update resume cache");
        }
    }

    /// Upload one file, choosing the path by size.
    pub async fn upload(
        &self,
        source: &UploadSource,
        cancel: &CancellationToken,
    ) -> ClientResult<CompleteSessionResponse> {
        let filename = source.filename.as_str();
        let chunked = source.size > self.settings.chunked_threshold;
        info!(filename, size = source.size, chunked, "Uploading");

        let result = if chunked {
            self.upload_chunked(source, cancel).await
        } else {
            self.upload_single(source, cancel).await
        };

        if cancel.is_cancelled() {
            // A late chunk acknowledgement may have re-created the entry.
            self.progress.remove(filename);
            return Err(ClientError::Cancelled);
        }
        match &result {
            Ok(done) => {
                self.progress.complete(filename);
                info!(filename, video_id = %done.video_id, share_id = %done.share_id, "Upload complete");
            }
            Err(e) => {
                self.progress.fail(filename, &e.to_string());
                warn!(filename, error = %e, "Upload failed");
            }
        }
        result
    }

    async fn upload_single(
        &self,
        source: &UploadSource,
        cancel: &CancellationToken,
    ) -> ClientResult<CompleteSessionResponse> {
        let filename = source.filename.as_str();
        let data = source.read_all().await?;
        let api = self.api.as_ref();
        let mimetype = source.mimetype.as_str();

        self.progress.set_state(filename, UploadState::Uploading);
        self.progress.start_animation(filename, SINGLE_UPLOAD_CEILING);
        let result = self
            .settings
            .retry
            .run("single upload", cancel, || {
                let data = data.clone();
                async move { api.upload_single(filename, mimetype, data).await }
            })
            .await;
        self.progress.stop_animation(filename);
        result
    }

    async fn upload_chunked(
        &self,
        source: &UploadSource,
        cancel: &CancellationToken,
    ) -> ClientResult<CompleteSessionResponse> {
        let filename = source.filename.as_str();
        let layout = ChunkLayout::new(source.size, self.settings.chunk_size)?;
        let retry = self.settings.retry;

        let mut attempt = 1;
        loop {
            let failure = match self.chunked_attempt(source, &layout, cancel).await {
                Ok(done) => {
                    self.forget(filename).await;
                    return Ok(done);
                }
                Err(failure) => failure,
            };

            let AttemptFailure {
                stage,
                session_id,
                error,
            } = failure;
            if cancel.is_cancelled() || matches!(error, ClientError::Cancelled) {
                if let Some(session_id) = session_id {
                    self.cancel_session_quietly(&session_id).await;
                }
                // The entry may have been written after cancel() cleared it.
                self.forget(filename).await;
                return Err(ClientError::Cancelled);
            }
            if !error.is_transient() {
                if error.is_session_invalid() {
                    self.forget(filename).await;
                }
                return Err(error);
            }
            if stage == Stage::Chunks {
                // A session with a chunk that will not go through is not
                // worth resuming.
                if let Some(session_id) = session_id {
                    self.cancel_session_quietly(&session_id).await;
                }
                self.forget(filename).await;
            }
            if attempt >= retry.max_attempts {
                return Err(error);
            }

            let delay = retry.delay(attempt);
            warn!(
                filename,
                attempt,
                ?stage,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Upload attempt failed, retrying file"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn chunked_attempt(
        &self,
        source: &UploadSource,
        layout: &ChunkLayout,
        cancel: &CancellationToken,
    ) -> Result<CompleteSessionResponse, AttemptFailure> {
        let filename = source.filename.as_str();
        let total = layout.total_chunks();

        let (session_id, mut uploaded) =
            self.open_session(source, layout, cancel)
                .await
                .map_err(|error| AttemptFailure {
                    stage: Stage::Start,
                    session_id: None,
                    error,
                })?;
        let failed = |stage: Stage, error: ClientError| AttemptFailure {
            stage,
            session_id: Some(session_id.clone()),
            error,
        };

        let api = self.api.as_ref();
        let transport = self.transport.as_ref();
        let sid = session_id.as_str();

        self.progress.set_state(filename, UploadState::Uploading);
        self.report_transfer(filename, uploaded.len(), total);

        for chunk_number in 0..total {
            if uploaded.contains(&chunk_number) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(failed(Stage::Chunks, ClientError::Cancelled));
            }

            let range = layout
                .chunk_range(chunk_number)
                .map_err(|e| failed(Stage::Chunks, e.into()))?;
            let data = source
                .read(range.start, range.end - range.start)
                .await
                .map_err(|e| failed(Stage::Chunks, e))?;

            let accepted = self
                .settings
                .retry
                .run("chunk", cancel, || {
                    let data = data.clone();
                    async move { transport.send(api, sid, chunk_number, data).await }
                })
                .await
                .map_err(|e| failed(Stage::Chunks, e))?;

            uploaded.insert(chunk_number);
            self.record_chunk(filename, sid, chunk_number).await;
            debug!(
                filename,
                chunk_number,
                chunks_uploaded = accepted.chunks_uploaded,
                total_chunks = total,
                transport = transport.name(),
                "Chunk accepted"
            );
            self.report_transfer(filename, uploaded.len(), total);
        }

        if cancel.is_cancelled() {
            return Err(failed(Stage::Complete, ClientError::Cancelled));
        }
        self.progress.set_state(filename, UploadState::Processing);
        self.progress.start_animation(filename, ASSEMBLY_CEILING);
        let result = self
            .settings
            .retry
            .run("complete", cancel, || async move {
                api.complete_session(sid).await
            })
            .await;
        self.progress.stop_animation(filename);
        result.map_err(|e| failed(Stage::Complete, e))
    }

    fn report_transfer(&self, filename: &str, uploaded: usize, total: u32) {
        let fraction = uploaded as f64 / f64::from(total.max(1));
        self.progress.set_percent(filename, fraction * TRANSFER_SHARE);
    }

    /// Resume the cached session for this file if the server still accepts
    /// chunks for it; otherwise start a new one.
    ///
    /// Returns the session id and the chunks the server already holds.
    async fn open_session(
        &self,
        source: &UploadSource,
        layout: &ChunkLayout,
        cancel: &CancellationToken,
    ) -> ClientResult<(String, BTreeSet<u32>)> {
        let filename = source.filename.as_str();
        let total = layout.total_chunks();
        let api = self.api.as_ref();

        if let Some(entry) = self.resume_entry(filename).await {
            if entry.matches(source.size, total) {
                if let Some(uploaded) = self.reconcile(filename, &entry, total, cancel).await? {
                    self.set_session(filename, &entry.session_id);
                    info!(
                        filename,
                        session_id = %entry.session_id,
                        chunks_uploaded = uploaded.len(),
                        total_chunks = total,
                        "Resuming upload"
                    );
                    return Ok((entry.session_id, uploaded));
                }
            } else {
                debug!(filename, "Resume entry describes a different file");
            }
            self.forget(filename).await;
        }

        let req = StartSessionRequest {
            filename: filename.to_string(),
            file_size: source.size,
            mimetype: source.mimetype.clone(),
            total_chunks: total,
        };
        let req = &req;
        let started = self
            .settings
            .retry
            .run("start", cancel, || async move { api.start_session(req).await })
            .await?;

        if cancel.is_cancelled() {
            // Cancelled while the session was being created.
            self.cancel_session_quietly(&started.session_id).await;
            return Err(ClientError::Cancelled);
        }

        self.remember(
            filename,
            ResumeEntry::new(started.session_id.clone(), source.size, total),
        )
        .await;
        self.set_session(filename, &started.session_id);
        info!(
            filename,
            session_id = %started.session_id,
            share_id = %started.share_id,
            total_chunks = total,
            "Session started"
        );
        Ok((started.session_id, BTreeSet::new()))
    }

    /// Check a cached session against the server. `None` means start over.
    async fn reconcile(
        &self,
        filename: &str,
        entry: &ResumeEntry,
        total: u32,
        cancel: &CancellationToken,
    ) -> ClientResult<Option<BTreeSet<u32>>> {
        let api = self.api.as_ref();
        let sid = entry.session_id.as_str();
        let status = match self
            .settings
            .retry
            .run("status", cancel, || async move { api.session_status(sid).await })
            .await
        {
            Ok(status) => status,
            Err(e) if e.is_session_invalid() || matches!(e, ClientError::Api { status: 404, .. }) => {
                debug!(filename, session_id = sid, "Cached session is gone");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if status.total_chunks != total || status.file_size != entry.file_size {
            return Ok(None);
        }
        match status.status {
            SessionStatus::Pending | SessionStatus::Uploading => {
                let uploaded: BTreeSet<u32> = status.uploaded_chunks.into_iter().collect();
                if uploaded != entry.uploaded_chunks {
                    // The server is authoritative.
                    let mut refreshed = entry.clone();
                    refreshed.uploaded_chunks = uploaded.clone();
                    self.remember(filename, refreshed).await;
                }
                Ok(Some(uploaded))
            }
            // Assembled but the answer was lost; completing again is idempotent.
            SessionStatus::Completed => Ok(Some((0..total).collect())),
            other => {
                debug!(filename, session_id = sid, status = %other, "Cached session is closed");
                Ok(None)
            }
        }
    }
}
