//! Maintenance job log repository.

use crate::error::MetadataResult;
use crate::models::MaintenanceJobRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for maintenance job records.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Create a job record.
    async fn create_job(&self, job: &MaintenanceJobRow) -> MetadataResult<()>;

    /// Get a job by ID.
    async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<MaintenanceJobRow>>;

    /// Update job state, finish time and stats.
    async fn update_job_state(
        &self,
        job_id: Uuid,
        state: &str,
        finished_at: Option<OffsetDateTime>,
        stats_json: Option<&str>,
    ) -> MetadataResult<()>;

    /// Most recent jobs first.
    async fn get_recent_jobs(&self, limit: u32) -> MetadataResult<Vec<MaintenanceJobRow>>;

    /// Mark jobs left `running` by a previous process as failed. Returns the
    /// number of rows touched.
    async fn fail_orphaned_jobs(&self, now: OffsetDateTime) -> MetadataResult<u64>;
}

/// Maintenance job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    /// Cancel sessions past their expiry and release their reservations.
    ExpireSessions,
    /// Delete chunks of sessions cancelled or failed long enough ago.
    ChunkGc,
    /// Delete session rows cancelled or failed long enough ago.
    SessionGc,
    /// Recompute every owner's usage from their videos.
    ReconcileQuota,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpireSessions => "expire_sessions",
            Self::ChunkGc => "chunk_gc",
            Self::SessionGc => "session_gc",
            Self::ReconcileQuota => "reconcile_quota",
        }
    }
}

/// Maintenance job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Finished,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// Sweep job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SweepStats {
    /// Number of items examined.
    pub items_processed: u64,
    /// Number of items cancelled or deleted.
    pub items_deleted: u64,
    /// Quota bytes released back to owners.
    pub bytes_released: u64,
    /// Errors encountered.
    pub errors: u64,
}

impl SweepStats {
    /// Fold another run's counters into this one.
    pub fn absorb(&mut self, other: &SweepStats) {
        self.items_processed += other.items_processed;
        self.items_deleted += other.items_deleted;
        self.bytes_released += other.bytes_released;
        self.errors += other.errors;
    }
}

/// Quota reconciliation statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReconcileStats {
    /// Owners recomputed.
    pub owners_processed: u64,
    /// Owners whose stored usage disagreed with the recomputed value.
    pub owners_corrected: u64,
    pub errors: u64,
}
