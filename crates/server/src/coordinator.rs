//! Upload session coordinator.
//!
//! Owns the session lifecycle: quota reservation at start, chunk intake over
//! the direct and proxied paths, assembly at completion, cancellation, and
//! the periodic expiry, garbage collection and reconciliation passes.
//!
//! Every status change goes through a guarded transaction in the metadata
//! store, so concurrent callers (a sweep racing a chunk write, two completes,
//! a cancel during assembly) resolve to exactly one winner.

use crate::catalog::{AssembledVideo, VideoCatalog};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use bytes::Bytes;
use futures::StreamExt;
use reel_core::chunk::{max_chunk_len, session_chunk_prefix};
use reel_core::config::AppConfig;
use reel_core::session::{
    CancelSessionResponse, ChunkAcceptedResponse, ChunkTargetResponse, CompleteSessionResponse,
    NotifyChunkRequest, SessionStatusResponse, StartSessionRequest, StartSessionResponse,
    format_timestamp,
};
use reel_core::{
    SESSION_EXPIRED_REASON, SessionId, SessionStatus, UploadSession, chunk_object_key,
    video_object_key,
};
use reel_metadata::models::{UploadChunkRow, UploadSessionRow};
use reel_metadata::repos::{ReconcileStats, SweepStats};
use reel_metadata::{MetadataError, MetadataStore};
use reel_storage::{ObjectStore, StorageError, StorageResult, StreamingUpload};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use uuid::Uuid;

const DEFAULT_MIMETYPE: &str = "application/octet-stream";

/// How a chunk reached storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkPath {
    Direct,
    Proxied,
}

impl ChunkPath {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Proxied => "proxied",
        }
    }
}

/// Result of concatenating a session's chunks.
enum Assembly {
    Written(u64),
    SizeMismatch(u64),
}

/// Coordinates upload sessions across metadata, storage and the catalog.
pub struct SessionCoordinator {
    config: Arc<AppConfig>,
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    catalog: Arc<dyn VideoCatalog>,
}

impl SessionCoordinator {
    pub fn new(
        config: Arc<AppConfig>,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        catalog: Arc<dyn VideoCatalog>,
    ) -> Self {
        Self {
            config,
            storage,
            metadata,
            catalog,
        }
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Start a session, reserving the whole file size against the owner's quota.
    #[tracing::instrument(skip(self, req), fields(owner_id = %owner_id, file_size = req.file_size))]
    pub async fn start(
        &self,
        owner_id: Uuid,
        req: StartSessionRequest,
    ) -> ApiResult<StartSessionResponse> {
        let server = &self.config.server;

        if req.filename.trim().is_empty() {
            return Err(ApiError::BadRequest("filename is required".to_string()));
        }
        if req.file_size == 0 {
            return Err(ApiError::BadRequest("file_size must be positive".to_string()));
        }
        if req.file_size > server.max_file_size {
            return Err(ApiError::FileTooLarge {
                size: req.file_size,
                limit: server.max_file_size,
            });
        }
        if req.total_chunks == 0 || req.total_chunks > server.max_total_chunks {
            return Err(ApiError::BadRequest(format!(
                "total_chunks must be between 1 and {}",
                server.max_total_chunks
            )));
        }
        if u64::from(req.total_chunks) > req.file_size {
            return Err(ApiError::BadRequest(format!(
                "{} chunks cannot split a {} byte file",
                req.total_chunks, req.file_size
            )));
        }
        let chunk_len = max_chunk_len(req.file_size, req.total_chunks);
        if chunk_len > server.max_chunk_size {
            return Err(ApiError::BadRequest(format!(
                "chunks of {chunk_len} bytes exceed the {} byte maximum",
                server.max_chunk_size
            )));
        }

        let mimetype = if req.mimetype.trim().is_empty() {
            DEFAULT_MIMETYPE.to_string()
        } else {
            req.mimetype
        };
        let session = UploadSession::new(
            owner_id,
            req.filename,
            req.file_size,
            mimetype,
            req.total_chunks,
            server.session_timeout(),
        );
        let row = UploadSessionRow::from_session(&session)?;

        match self
            .metadata
            .create_session_with_reservation(&row, self.config.quota.default_limit_bytes)
            .await
        {
            Ok(()) => {}
            Err(MetadataError::QuotaExceeded {
                requested,
                remaining,
            }) => {
                metrics::QUOTA_REJECTIONS.inc();
                tracing::info!(requested, remaining, "Session refused: quota exceeded");
                return Err(ApiError::QuotaExceeded {
                    requested,
                    remaining,
                });
            }
            Err(e) => return Err(e.into()),
        }

        metrics::SESSIONS_STARTED.inc();
        tracing::info!(
            session_id = %session.id,
            total_chunks = session.total_chunks,
            "Upload session started"
        );

        Ok(StartSessionResponse {
            session_id: session.id.to_string(),
            share_id: session.share_id.to_string(),
            expires_at: format_timestamp(session.expires_at),
            max_chunk_size: server.max_chunk_size,
        })
    }

    /// Report a session's progress to its owner.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn status(
        &self,
        owner_id: Uuid,
        session_id: &SessionId,
    ) -> ApiResult<SessionStatusResponse> {
        let session = self.load_owned(owner_id, session_id).await?;
        let uploaded_chunks = self.metadata.get_chunk_numbers(*session_id.as_uuid()).await?;

        Ok(SessionStatusResponse {
            session_id: session.id.to_string(),
            share_id: session.share_id.to_string(),
            status: session.status,
            chunks_uploaded: session.chunks_uploaded,
            uploaded_chunks,
            total_chunks: session.total_chunks,
            file_size: session.file_size,
            expires_at: format_timestamp(session.expires_at),
            error_message: session.error_message,
        })
    }

    /// Issue a pre-signed write target for one chunk (direct path).
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn request_target(
        &self,
        owner_id: Uuid,
        session_id: &SessionId,
        chunk_number: u32,
    ) -> ApiResult<ChunkTargetResponse> {
        let session = self.load_owned(owner_id, session_id).await?;
        ensure_accepting(&session, OffsetDateTime::now_utc())?;
        check_chunk_number(&session, chunk_number)?;

        let object_key = chunk_object_key(session_id, chunk_number);
        let target = match self
            .storage
            .presign_put(&object_key, self.config.server.presign_ttl())
            .await
        {
            Ok(target) => target,
            Err(StorageError::Unsupported(msg)) => {
                return Err(ApiError::DirectUploadUnavailable(msg));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(ChunkTargetResponse {
            url: target.url,
            method: target.method,
            headers: target.headers.into_iter().collect(),
            object_key,
            expires_at: format_timestamp(target.expires_at),
        })
    }

    /// Record a chunk the client wrote directly to storage.
    #[tracing::instrument(skip(self, req), fields(session_id = %session_id))]
    pub async fn notify_chunk(
        &self,
        owner_id: Uuid,
        session_id: &SessionId,
        chunk_number: u32,
        req: NotifyChunkRequest,
    ) -> ApiResult<ChunkAcceptedResponse> {
        let session = self.load_owned(owner_id, session_id).await?;
        ensure_accepting(&session, OffsetDateTime::now_utc())?;
        check_chunk_number(&session, chunk_number)?;

        let expected_key = chunk_object_key(session_id, chunk_number);
        if req.object_key != expected_key {
            return Err(ApiError::BadRequest(format!(
                "object key {} does not belong to chunk {chunk_number}",
                req.object_key
            )));
        }
        self.check_chunk_size(req.size)?;

        let stored = match self.storage.head(&expected_key).await {
            Ok(meta) => meta,
            Err(StorageError::NotFound(_)) => {
                return Err(ApiError::BadRequest(format!(
                    "chunk object {expected_key} was not written"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if stored.size != req.size {
            return Err(ApiError::BadRequest(format!(
                "stored chunk has {} bytes, notified {}",
                stored.size, req.size
            )));
        }

        self.record(&session, chunk_number, req.size, expected_key, ChunkPath::Direct)
            .await
    }

    /// Store a chunk streamed through the server (proxied path).
    #[tracing::instrument(skip(self, body), fields(session_id = %session_id, size = body.len()))]
    pub async fn accept_chunk(
        &self,
        owner_id: Uuid,
        session_id: &SessionId,
        chunk_number: u32,
        body: Bytes,
    ) -> ApiResult<ChunkAcceptedResponse> {
        let session = self.load_owned(owner_id, session_id).await?;
        ensure_accepting(&session, OffsetDateTime::now_utc())?;
        check_chunk_number(&session, chunk_number)?;
        let size = body.len() as u64;
        self.check_chunk_size(size)?;

        let object_key = chunk_object_key(session_id, chunk_number);
        self.storage
            .put(&object_key, body)
            .await
            .map_err(|e| ApiError::StorageWriteFailure(e.to_string()))?;

        self.record(&session, chunk_number, size, object_key, ChunkPath::Proxied)
            .await
    }

    /// Assemble the chunks into the final object and hand it to the catalog.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn complete(
        &self,
        owner_id: Uuid,
        session_id: &SessionId,
    ) -> ApiResult<CompleteSessionResponse> {
        let session = self.load_owned(owner_id, session_id).await?;
        if session.status == SessionStatus::Completed {
            return self.completed_outcome(&session).await;
        }

        let now = OffsetDateTime::now_utc();
        ensure_accepting(&session, now)?;
        if !session.is_fully_uploaded() {
            return Err(ApiError::IncompleteUpload {
                uploaded: session.chunks_uploaded,
                total: session.total_chunks,
            });
        }

        let claimed = self
            .metadata
            .begin_assembly(*session_id.as_uuid(), now)
            .await?
            .ok_or_else(|| ApiError::SessionInvalid("session not found".to_string()))?
            .into_session()?;
        if claimed.status != SessionStatus::Assembling {
            // Lost a race with another completer, a cancel or the sweep.
            if claimed.status == SessionStatus::Completed {
                return self.completed_outcome(&claimed).await;
            }
            return Err(closed_error(&claimed, now));
        }

        let started = Instant::now();
        let location = video_object_key(&claimed.owner_id, &claimed.share_id);

        let size = match self.assemble(&claimed, &location).await {
            Ok(Assembly::Written(size)) => size,
            Ok(Assembly::SizeMismatch(actual)) => {
                let message = format!(
                    "assembled size {actual} does not match declared size {}",
                    claimed.file_size
                );
                let outcome = self
                    .metadata
                    .fail_session(*session_id.as_uuid(), &message, OffsetDateTime::now_utc())
                    .await?;
                metrics::SESSIONS_FAILED.inc();
                tracing::warn!(
                    expected = claimed.file_size,
                    actual,
                    released_bytes = outcome.released_bytes,
                    "Assembly size mismatch, session failed"
                );
                return Err(ApiError::AssembleSizeMismatch {
                    expected: claimed.file_size,
                    actual,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Assembly failed, returning session to uploading");
                let reverted = self
                    .metadata
                    .abort_assembly(*session_id.as_uuid(), OffsetDateTime::now_utc())
                    .await?;
                if !reverted {
                    return Err(ApiError::SessionInvalid(
                        "session was closed during assembly".to_string(),
                    ));
                }
                return Err(ApiError::StorageWriteFailure(e.to_string()));
            }
        };

        let completed = self
            .metadata
            .complete_session(*session_id.as_uuid(), &location, OffsetDateTime::now_utc())
            .await?;
        if !completed {
            // Cancelled while we were writing; the reservation is already gone.
            if let Err(e) = self.storage.delete(&location).await {
                tracing::warn!(error = %e, "Failed to delete orphaned assembled object");
            }
            return Err(ApiError::SessionInvalid(
                "session was closed during assembly".to_string(),
            ));
        }
        metrics::ASSEMBLY_DURATION.observe(started.elapsed().as_secs_f64());

        let video_id = self
            .catalog
            .materialize(AssembledVideo {
                owner_id: claimed.owner_id,
                storage_location: &location,
                share_id: &claimed.share_id,
                size,
                filename: &claimed.filename,
                mimetype: &claimed.mimetype,
            })
            .await?;

        self.remove_chunk_objects(session_id).await;
        metrics::SESSIONS_COMPLETED.inc();
        tracing::info!(video_id = %video_id, size, "Upload session completed");

        let completed_at = self
            .metadata
            .get_session(*session_id.as_uuid())
            .await?
            .and_then(|row| row.completed_at)
            .unwrap_or_else(OffsetDateTime::now_utc);

        Ok(CompleteSessionResponse {
            session_id: session_id.to_string(),
            share_id: claimed.share_id.to_string(),
            video_id: video_id.to_string(),
            status: SessionStatus::Completed,
            size,
            completed_at: format_timestamp(completed_at),
        })
    }

    /// Cancel a session, giving its reservation back.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn cancel(
        &self,
        owner_id: Uuid,
        session_id: &SessionId,
    ) -> ApiResult<CancelSessionResponse> {
        let session = self.load_owned(owner_id, session_id).await?;
        if session.status.is_terminal() {
            return Err(ApiError::SessionInvalid(format!(
                "session is already {}",
                session.status.as_str()
            )));
        }

        let outcome = self
            .metadata
            .cancel_session(*session_id.as_uuid(), None, OffsetDateTime::now_utc())
            .await?;
        if !outcome.transitioned {
            return Err(ApiError::SessionInvalid(
                "session is already closed".to_string(),
            ));
        }

        self.remove_chunk_objects(session_id).await;
        metrics::SESSIONS_CANCELLED.inc();
        tracing::info!(
            released_bytes = outcome.released_bytes,
            "Upload session cancelled"
        );

        Ok(CancelSessionResponse {
            session_id: session_id.to_string(),
            status: SessionStatus::Cancelled,
        })
    }

    /// Upload a small file in one call: a one-chunk session started, fed and
    /// completed under the same rules as the chunked path.
    #[tracing::instrument(skip(self, body), fields(owner_id = %owner_id, size = body.len()))]
    pub async fn upload_single(
        &self,
        owner_id: Uuid,
        filename: String,
        mimetype: String,
        body: Bytes,
    ) -> ApiResult<CompleteSessionResponse> {
        let started = self
            .start(
                owner_id,
                StartSessionRequest {
                    filename,
                    file_size: body.len() as u64,
                    mimetype,
                    total_chunks: 1,
                },
            )
            .await?;
        let session_id = SessionId::parse(&started.session_id)?;

        let result = match self.accept_chunk(owner_id, &session_id, 0, body).await {
            Ok(_) => self.complete(owner_id, &session_id).await,
            Err(e) => Err(e),
        };

        if result.is_err()
            && let Err(e) = self.cancel(owner_id, &session_id).await
        {
            // Failed sessions have released their reservation already.
            tracing::debug!(error = %e, "Single upload cleanup skipped");
        }
        result
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Cancel every session past its expiry and release its reservation.
    #[tracing::instrument(skip(self))]
    pub async fn expire_stale_sessions(&self, now: OffsetDateTime) -> ApiResult<SweepStats> {
        let batch_size = self.config.sweep.batch_size;
        let mut stats = SweepStats::default();

        loop {
            let batch = self.metadata.get_expired_sessions(now, batch_size).await?;
            let fetched = batch.len();
            let mut progressed = false;

            for row in batch {
                stats.items_processed += 1;
                match self
                    .metadata
                    .expire_session(row.session_id, SESSION_EXPIRED_REASON, now)
                    .await
                {
                    Ok(outcome) if outcome.transitioned => {
                        progressed = true;
                        stats.items_deleted += 1;
                        stats.bytes_released += outcome.released_bytes;
                        metrics::SESSIONS_EXPIRED.inc();
                        tracing::info!(
                            session_id = %row.session_id,
                            released_bytes = outcome.released_bytes,
                            "Session expired"
                        );
                    }
                    // Another sweeper got there first.
                    Ok(_) => {}
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(session_id = %row.session_id, error = %e, "Failed to expire session");
                    }
                }
            }

            if fetched < batch_size as usize || !progressed {
                break;
            }
        }

        Ok(stats)
    }

    /// Delete chunk objects and rows of sessions closed long enough ago.
    #[tracing::instrument(skip(self))]
    pub async fn collect_chunks(&self, now: OffsetDateTime) -> ApiResult<SweepStats> {
        let batch_size = self.config.sweep.batch_size;
        let older_than = now - self.config.sweep.chunk_retention();
        let mut stats = SweepStats::default();

        loop {
            let batch = self
                .metadata
                .get_terminal_sessions_with_chunks(older_than, batch_size)
                .await?;
            let fetched = batch.len();
            let mut progressed = false;

            for row in batch {
                stats.items_processed += 1;
                let session_id = SessionId::from(row.session_id);
                if let Err(e) = self
                    .storage
                    .delete_prefix(&session_chunk_prefix(&session_id))
                    .await
                {
                    stats.errors += 1;
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to delete chunk objects");
                    continue;
                }
                match self.metadata.delete_chunks_for_session(row.session_id).await {
                    Ok(deleted) => {
                        progressed = true;
                        stats.items_deleted += deleted;
                    }
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(session_id = %session_id, error = %e, "Failed to delete chunk rows");
                    }
                }
            }

            if fetched < batch_size as usize || !progressed {
                break;
            }
        }

        Ok(stats)
    }

    /// Delete session rows closed long enough ago.
    #[tracing::instrument(skip(self))]
    pub async fn collect_sessions(&self, now: OffsetDateTime) -> ApiResult<SweepStats> {
        let batch_size = self.config.sweep.batch_size;
        let older_than = now - self.config.sweep.session_retention();
        let mut stats = SweepStats::default();

        loop {
            let deleted = self
                .metadata
                .delete_terminal_sessions(older_than, batch_size)
                .await?;
            stats.items_processed += deleted;
            stats.items_deleted += deleted;
            if deleted < u64::from(batch_size) {
                break;
            }
        }

        Ok(stats)
    }

    /// Recompute every owner's usage and report how many had drifted.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_quotas(&self, now: OffsetDateTime) -> ApiResult<ReconcileStats> {
        let batch_size = self.config.sweep.batch_size;
        let mut stats = ReconcileStats::default();
        let mut after = None;

        loop {
            let owners = self.metadata.list_quota_owners(after, batch_size).await?;
            let Some(last) = owners.last().copied() else {
                break;
            };

            for owner_id in owners.iter().copied() {
                stats.owners_processed += 1;
                match self.metadata.reconcile_quota(owner_id, now).await {
                    Ok(result) if result.drifted() => {
                        stats.owners_corrected += 1;
                        metrics::QUOTA_CORRECTIONS.inc();
                        tracing::info!(
                            owner_id = %owner_id,
                            previous = result.previous_used_bytes,
                            corrected = result.used_bytes,
                            "Quota usage corrected"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(owner_id = %owner_id, error = %e, "Failed to reconcile quota");
                    }
                }
            }

            if owners.len() < batch_size as usize {
                break;
            }
            after = Some(last);
        }

        Ok(stats)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Load a session on behalf of its owner. Sessions of other owners look
    /// exactly like missing ones.
    async fn load_owned(&self, owner_id: Uuid, session_id: &SessionId) -> ApiResult<UploadSession> {
        match self.metadata.get_session(*session_id.as_uuid()).await? {
            Some(row) if row.owner_id == owner_id => Ok(row.into_session()?),
            _ => Err(ApiError::SessionInvalid("session not found".to_string())),
        }
    }

    fn check_chunk_size(&self, size: u64) -> ApiResult<()> {
        if size == 0 {
            return Err(ApiError::BadRequest("chunk is empty".to_string()));
        }
        let max = self.config.server.max_chunk_size;
        if size > max {
            return Err(ApiError::BadRequest(format!(
                "chunk of {size} bytes exceeds the {max} byte maximum"
            )));
        }
        Ok(())
    }

    async fn record(
        &self,
        session: &UploadSession,
        chunk_number: u32,
        size: u64,
        object_key: String,
        path: ChunkPath,
    ) -> ApiResult<ChunkAcceptedResponse> {
        let now = OffsetDateTime::now_utc();
        let row = UploadChunkRow::new(&session.id, chunk_number, size, object_key, now)?;

        let recorded = match self.metadata.record_chunk(&row, now).await {
            Ok(recorded) => recorded,
            Err(MetadataError::SessionClosed(reason)) => {
                // Closed between our check and the write; don't leave the bytes behind.
                if let Err(e) = self.storage.delete(&row.object_key).await
                    && !matches!(e, StorageError::NotFound(_))
                {
                    tracing::warn!(error = %e, "Failed to delete chunk of closed session");
                }
                return Err(ApiError::SessionInvalid(reason));
            }
            Err(e) => return Err(e.into()),
        };

        metrics::record_chunk_accepted(path.as_str(), size);
        tracing::debug!(
            chunk_number,
            size,
            path = path.as_str(),
            replaced = recorded.replaced,
            chunks_uploaded = recorded.chunks_uploaded,
            "Chunk accepted"
        );

        Ok(ChunkAcceptedResponse {
            chunk_number,
            chunks_uploaded: recorded.chunks_uploaded,
            total_chunks: session.total_chunks,
        })
    }

    /// Concatenate the chunks in ascending order into `location`.
    async fn assemble(&self, session: &UploadSession, location: &str) -> StorageResult<Assembly> {
        let chunks = self
            .metadata
            .get_chunks(*session.id.as_uuid())
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))?;

        let mut upload = self.storage.put_stream(location).await?;
        let written = match copy_chunks(self.storage.as_ref(), upload.as_mut(), &chunks).await {
            Ok(written) => written,
            Err(e) => {
                abort_upload(upload, location).await;
                return Err(e);
            }
        };

        if written != session.file_size {
            abort_upload(upload, location).await;
            return Ok(Assembly::SizeMismatch(written));
        }

        let size = upload.finish().await?;
        Ok(Assembly::Written(size))
    }

    /// Answer a repeated complete with the recorded outcome.
    async fn completed_outcome(&self, session: &UploadSession) -> ApiResult<CompleteSessionResponse> {
        let location = session
            .storage_location
            .clone()
            .unwrap_or_else(|| video_object_key(&session.owner_id, &session.share_id));
        let video_id = self
            .catalog
            .materialize(AssembledVideo {
                owner_id: session.owner_id,
                storage_location: &location,
                share_id: &session.share_id,
                size: session.file_size,
                filename: &session.filename,
                mimetype: &session.mimetype,
            })
            .await?;

        Ok(CompleteSessionResponse {
            session_id: session.id.to_string(),
            share_id: session.share_id.to_string(),
            video_id: video_id.to_string(),
            status: SessionStatus::Completed,
            size: session.file_size,
            completed_at: format_timestamp(session.completed_at.unwrap_or(session.updated_at)),
        })
    }

    async fn remove_chunk_objects(&self, session_id: &SessionId) {
        if let Err(e) = self
            .storage
            .delete_prefix(&session_chunk_prefix(session_id))
            .await
        {
            // The chunk GC pass picks these up later.
            tracing::warn!(session_id = %session_id, error = %e, "Failed to delete chunk objects");
        }
    }
}

async fn abort_upload(upload: Box<dyn StreamingUpload>, location: &str) {
    if let Err(e) = upload.abort().await {
        // Leaves a partial object or multipart upload behind.
        tracing::warn!(location, error = %e, "Failed to abort assembly upload");
    }
}

async fn copy_chunks(
    storage: &dyn ObjectStore,
    upload: &mut dyn StreamingUpload,
    chunks: &[UploadChunkRow],
) -> StorageResult<u64> {
    let mut written = 0u64;
    for chunk in chunks {
        let mut stream = storage.get_stream(&chunk.object_key).await?;
        while let Some(piece) = stream.next().await {
            let piece = piece?;
            written += piece.len() as u64;
            upload.write(piece).await?;
        }
    }
    Ok(written)
}

fn check_chunk_number(session: &UploadSession, chunk_number: u32) -> ApiResult<()> {
    session
        .check_chunk_number(chunk_number)
        .map_err(|_| ApiError::ChunkOutOfRange {
            chunk_number,
            total_chunks: session.total_chunks,
        })
}

/// Reject writes to a session that no longer accepts them.
fn ensure_accepting(session: &UploadSession, now: OffsetDateTime) -> ApiResult<()> {
    if session.status.accepts_chunks() && !session.is_expired_at(now) {
        Ok(())
    } else {
        Err(closed_error(session, now))
    }
}

fn closed_error(session: &UploadSession, now: OffsetDateTime) -> ApiError {
    let reason = match session.status {
        SessionStatus::Assembling => "assembly in progress".to_string(),
        status if status.is_terminal() => format!("session is {}", status.as_str()),
        _ if session.is_expired_at(now) => "session expired".to_string(),
        status => format!("session is {}", status.as_str()),
    };
    ApiError::SessionInvalid(reason)
}
