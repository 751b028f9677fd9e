//! Maintenance runs and the background scheduler.
//!
//! Each run (expiry, chunk GC, session GC, reconciliation) is recorded in the
//! `maintenance_jobs` table so admins can see what the sweeps did.

use crate::error::ApiResult;
use crate::metrics;
use crate::state::AppState;
use reel_metadata::MetadataStore;
use reel_metadata::models::MaintenanceJobRow;
use reel_metadata::repos::{JobState, JobType, ReconcileStats, SweepStats};
use serde::Serialize;
use std::future::Future;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Counters every job type reports.
trait JobStats: Serialize {
    fn errors(&self) -> u64;
    fn items_deleted(&self) -> u64;
}

impl JobStats for SweepStats {
    fn errors(&self) -> u64 {
        self.errors
    }

    fn items_deleted(&self) -> u64 {
        self.items_deleted
    }
}

impl JobStats for ReconcileStats {
    fn errors(&self) -> u64 {
        self.errors
    }

    fn items_deleted(&self) -> u64 {
        self.owners_corrected
    }
}

/// Outcome of one recorded job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport<S> {
    pub job_id: String,
    pub state: &'static str,
    pub stats: S,
}

/// Outcome of a full sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub expire_sessions: JobReport<SweepStats>,
    pub chunk_gc: JobReport<SweepStats>,
    pub session_gc: JobReport<SweepStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<JobReport<ReconcileStats>>,
}

/// Run `work` as a recorded job of `job_type`.
async fn run_job<S, F>(
    metadata: &dyn MetadataStore,
    job_type: JobType,
    work: F,
) -> ApiResult<JobReport<S>>
where
    S: JobStats,
    F: Future<Output = ApiResult<S>>,
{
    let job_id = Uuid::new_v4();
    let started = Instant::now();
    metadata
        .create_job(&MaintenanceJobRow {
            job_id,
            job_type: job_type.as_str().to_string(),
            state: JobState::Running.as_str().to_string(),
            started_at: Some(OffsetDateTime::now_utc()),
            finished_at: None,
            stats_json: None,
        })
        .await?;

    let result = work.await;
    let (state, stats_json) = match &result {
        Ok(stats) => {
            let state = if stats.errors() > 0 {
                JobState::Failed
            } else {
                JobState::Finished
            };
            (state, serde_json::to_string(stats).ok())
        }
        Err(e) => (
            JobState::Failed,
            Some(serde_json::json!({ "error": e.to_string() }).to_string()),
        ),
    };

    metrics::SWEEP_JOB_DURATION
        .with_label_values(&[job_type.as_str(), state.as_str()])
        .observe(started.elapsed().as_secs_f64());
    if let Ok(stats) = &result {
        metrics::SWEEP_ITEMS_DELETED
            .with_label_values(&[job_type.as_str()])
            .inc_by(stats.items_deleted());
    }

    if let Err(e) = metadata
        .update_job_state(
            job_id,
            state.as_str(),
            Some(OffsetDateTime::now_utc()),
            stats_json.as_deref(),
        )
        .await
    {
        tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
    }

    let stats = result?;
    tracing::info!(
        job_id = %job_id,
        job_type = job_type.as_str(),
        state = state.as_str(),
        errors = stats.errors(),
        "Maintenance job done"
    );
    Ok(JobReport {
        job_id: job_id.to_string(),
        state: state.as_str(),
        stats,
    })
}

/// Expire stale sessions, then collect old chunks and sessions.
pub async fn run_sweep(
    state: &AppState,
    now: OffsetDateTime,
    with_reconcile: bool,
) -> ApiResult<SweepReport> {
    let metadata = state.metadata.as_ref();
    let coordinator = &state.coordinator;

    let expire_sessions = run_job(
        metadata,
        JobType::ExpireSessions,
        coordinator.expire_stale_sessions(now),
    )
    .await?;
    let chunk_gc = run_job(metadata, JobType::ChunkGc, coordinator.collect_chunks(now)).await?;
    let session_gc =
        run_job(metadata, JobType::SessionGc, coordinator.collect_sessions(now)).await?;
    let reconcile = if with_reconcile {
        Some(run_reconcile(state, now).await?)
    } else {
        None
    };

    match metadata.count_active_sessions().await {
        Ok(active) => metrics::ACTIVE_SESSIONS.set(i64::try_from(active).unwrap_or(i64::MAX)),
        Err(e) => tracing::warn!(error = %e, "Failed to count active sessions"),
    }

    Ok(SweepReport {
        expire_sessions,
        chunk_gc,
        session_gc,
        reconcile,
    })
}

/// Recompute every owner's usage as a recorded job.
pub async fn run_reconcile(
    state: &AppState,
    now: OffsetDateTime,
) -> ApiResult<JobReport<ReconcileStats>> {
    run_job(
        state.metadata.as_ref(),
        JobType::ReconcileQuota,
        state.coordinator.reconcile_quotas(now),
    )
    .await
}

/// Mark jobs a previous process left running as failed.
pub async fn recover_orphaned_jobs(metadata: &dyn MetadataStore) -> ApiResult<u64> {
    let recovered = metadata
        .fail_orphaned_jobs(OffsetDateTime::now_utc())
        .await?;
    if recovered > 0 {
        tracing::warn!(
            count = recovered,
            "Marked maintenance jobs from a previous instance as failed"
        );
    }
    Ok(recovered)
}

/// Spawn the periodic sweep loop.
pub fn spawn_scheduler(state: AppState) -> JoinHandle<()> {
    let interval = state.config.sweep.auto_schedule_interval();
    let with_reconcile = state.config.sweep.reconcile_enabled;

    tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            with_reconcile,
            "Sweep scheduler started"
        );
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = run_sweep(&state, OffsetDateTime::now_utc(), with_reconcile).await {
                tracing::error!(error = %e, "Scheduled sweep failed");
            }
        }
    })
}
