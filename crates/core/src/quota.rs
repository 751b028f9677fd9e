//! Per-user storage quota.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Storage accounting for one owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuota {
    pub owner_id: Uuid,
    /// Bytes counted against the owner, including outstanding reservations.
    pub storage_used_bytes: u64,
    pub storage_limit_bytes: u64,
    /// Number of completed uploads.
    pub upload_count: u64,
}

impl UserQuota {
    /// Quota for an owner seen for the first time.
    pub fn new(owner_id: Uuid, storage_limit_bytes: u64) -> Self {
        Self {
            owner_id,
            storage_used_bytes: 0,
            storage_limit_bytes,
            upload_count: 0,
        }
    }

    /// Bytes still available.
    pub fn remaining(&self) -> u64 {
        self.storage_limit_bytes
            .saturating_sub(self.storage_used_bytes)
    }

    /// Check whether `bytes` more would still fit under the limit.
    pub fn can_reserve(&self, bytes: u64) -> bool {
        self.storage_used_bytes
            .checked_add(bytes)
            .is_some_and(|total| total <= self.storage_limit_bytes)
    }
}

/// Quota as reported over the API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaResponse {
    pub owner_id: String,
    pub storage_used_bytes: u64,
    pub storage_limit_bytes: u64,
    pub remaining_bytes: u64,
    pub upload_count: u64,
}

impl From<&UserQuota> for QuotaResponse {
    fn from(quota: &UserQuota) -> Self {
        Self {
            owner_id: quota.owner_id.to_string(),
            storage_used_bytes: quota.storage_used_bytes,
            storage_limit_bytes: quota.storage_limit_bytes,
            remaining_bytes: quota.remaining(),
            upload_count: quota.upload_count,
        }
    }
}

/// Admin request to change an owner's limit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetQuotaRequest {
    pub storage_limit_bytes: u64,
}
