//! Chunk repository.

use crate::error::MetadataResult;
use crate::models::UploadChunkRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Outcome of recording a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedChunk {
    /// Distinct chunk numbers recorded for the session after this write.
    pub chunks_uploaded: u32,
    /// True if this chunk number had already been recorded and was overwritten.
    pub replaced: bool,
}

/// Repository for per-session chunk rows.
#[async_trait]
pub trait ChunkRepo: Send + Sync {
    /// Upsert a chunk row and refresh the session's counter.
    ///
    /// Runs in one transaction guarded on the session still accepting chunks
    /// (status `pending`/`uploading`, not expired at `now`); otherwise fails
    /// with `MetadataError::SessionClosed`. The counter is recomputed from the
    /// distinct rows, so re-sending a chunk number never inflates it.
    async fn record_chunk(
        &self,
        chunk: &UploadChunkRow,
        now: OffsetDateTime,
    ) -> MetadataResult<RecordedChunk>;

    /// Get a single chunk row.
    async fn get_chunk(
        &self,
        session_id: Uuid,
        chunk_number: u32,
    ) -> MetadataResult<Option<UploadChunkRow>>;

    /// All chunk rows of a session in ascending chunk-number order.
    async fn get_chunks(&self, session_id: Uuid) -> MetadataResult<Vec<UploadChunkRow>>;

    /// Recorded chunk numbers of a session, ascending.
    async fn get_chunk_numbers(&self, session_id: Uuid) -> MetadataResult<Vec<u32>>;

    /// Delete all chunk rows of a session. Returns the number deleted.
    async fn delete_chunks_for_session(&self, session_id: Uuid) -> MetadataResult<u64>;
}
