//! Quota ledger repository.

use crate::error::MetadataResult;
use crate::models::UserQuotaRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Result of recomputing one owner's usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReconciledQuota {
    pub owner_id: Uuid,
    pub previous_used_bytes: u64,
    pub used_bytes: u64,
    pub upload_count: u64,
}

impl ReconciledQuota {
    /// Whether the stored value disagreed with the recomputed one.
    pub fn drifted(&self) -> bool {
        self.previous_used_bytes != self.used_bytes
    }
}

/// Repository for per-owner storage quotas.
///
/// Reservations and releases are applied by the session transitions in
/// [`SessionRepo`](super::SessionRepo); this trait covers reads, limits and
/// reconciliation.
#[async_trait]
pub trait QuotaRepo: Send + Sync {
    /// Get an owner's quota row.
    async fn get_quota(&self, owner_id: Uuid) -> MetadataResult<Option<UserQuotaRow>>;

    /// Get an owner's quota row, creating it with `default_limit_bytes`.
    async fn ensure_quota(
        &self,
        owner_id: Uuid,
        default_limit_bytes: u64,
        now: OffsetDateTime,
    ) -> MetadataResult<UserQuotaRow>;

    /// Set an owner's limit, creating the row if needed.
    async fn set_quota_limit(
        &self,
        owner_id: Uuid,
        limit_bytes: u64,
        now: OffsetDateTime,
    ) -> MetadataResult<UserQuotaRow>;

    /// Owners with a quota row, in a stable order, starting after `after`.
    async fn list_quota_owners(&self, after: Option<Uuid>, limit: u32)
    -> MetadataResult<Vec<Uuid>>;

    /// Recompute `storage_used_bytes` as the sum of the owner's video sizes
    /// plus bytes still reserved by the owner's sessions, and `upload_count`
    /// as the number of videos. One transaction.
    async fn reconcile_quota(
        &self,
        owner_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<ReconciledQuota>;
}
