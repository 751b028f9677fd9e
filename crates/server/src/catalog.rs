//! Video catalog collaborator.
//!
//! Completion hands the assembled object to the catalog, which turns it into
//! a public video addressed by its share id.

use async_trait::async_trait;
use reel_core::ShareId;
use reel_metadata::models::VideoRow;
use reel_metadata::{MetadataResult, MetadataStore};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// A finished upload ready to become a video.
#[derive(Clone, Debug)]
pub struct AssembledVideo<'a> {
    pub owner_id: Uuid,
    pub storage_location: &'a str,
    pub share_id: &'a ShareId,
    pub size: u64,
    pub filename: &'a str,
    pub mimetype: &'a str,
}

/// Materializes completed uploads as public videos.
#[async_trait]
pub trait VideoCatalog: Send + Sync {
    /// Create (or find) the video for a completed upload and return its id.
    ///
    /// Must be idempotent on the share id: completion may be retried.
    async fn materialize(&self, video: AssembledVideo<'_>) -> MetadataResult<Uuid>;
}

/// Catalog backed by the `videos` table of the metadata store.
pub struct MetadataCatalog {
    metadata: Arc<dyn MetadataStore>,
}

impl MetadataCatalog {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl VideoCatalog for MetadataCatalog {
    async fn materialize(&self, video: AssembledVideo<'_>) -> MetadataResult<Uuid> {
        let row = VideoRow::new(
            video.owner_id,
            video.share_id,
            video.storage_location.to_string(),
            video.size,
            video.mimetype.to_string(),
            video.filename.to_string(),
            OffsetDateTime::now_utc(),
        )?;
        let stored = self.metadata.insert_video(&row).await?;
        tracing::debug!(
            video_id = %stored.video_id,
            share_id = %video.share_id,
            "Video materialized"
        );
        Ok(stored.video_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_metadata::SqliteStore;

    #[tokio::test]
    async fn test_materialize_is_idempotent_on_share_id() {
        let dir = tempfile::tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&dir.path().join("metadata.db"), None)
                .await
                .unwrap(),
        );
        let catalog = MetadataCatalog::new(metadata.clone());
        let owner = Uuid::new_v4();
        let share = ShareId::generate();
        let video = AssembledVideo {
            owner_id: owner,
            storage_location: "videos/o/s",
            share_id: &share,
            size: 42,
            filename: "clip.mp4",
            mimetype: "video/mp4",
        };

        let first = catalog.materialize(video.clone()).await.unwrap();
        let second = catalog.materialize(video).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(metadata.video_totals(owner).await.unwrap(), (42, 1));
    }
}
