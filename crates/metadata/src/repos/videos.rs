//! Video attribution repository.

use crate::error::MetadataResult;
use crate::models::VideoRow;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait VideoRepo: Send + Sync {
    /// Insert a video unless one with the same share id exists; returns the
    /// stored row either way.
    async fn insert_video(&self, video: &VideoRow) -> MetadataResult<VideoRow>;

    async fn get_video_by_share_id(&self, share_id: &str) -> MetadataResult<Option<VideoRow>>;

    /// Sum of sizes and count of an owner's videos.
    async fn video_totals(&self, owner_id: Uuid) -> MetadataResult<(u64, u64)>;
}
