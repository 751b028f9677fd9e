//! Prometheus metrics for the reel server.
//!
//! Exposes metrics for the session lifecycle, chunk intake, quota decisions
//! and maintenance sweeps.
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Metrics carry no owner or session identifiers, only aggregate usage, but
//! the endpoint should still be network-restricted to the scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Session lifecycle
pub static SESSIONS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reel_sessions_started_total",
        "Total number of upload sessions started",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reel_sessions_completed_total",
        "Total number of upload sessions assembled and completed",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_CANCELLED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reel_sessions_cancelled_total",
        "Total number of upload sessions cancelled by their owner",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reel_sessions_expired_total",
        "Total number of upload sessions cancelled by the expiry sweep",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reel_sessions_failed_total",
        "Total number of upload sessions whose assembly failed",
    )
    .expect("metric creation failed")
});

pub static ACTIVE_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "reel_active_sessions",
        "Sessions accepting chunks or assembling, as of the last sweep",
    )
    .expect("metric creation failed")
});

// Chunk intake
pub static CHUNKS_ACCEPTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "reel_chunks_accepted_total",
            "Total number of chunks recorded, by delivery path",
        ),
        &["path"],
    )
    .expect("metric creation failed")
});

pub static BYTES_ACCEPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reel_bytes_accepted_total",
        "Total chunk bytes recorded",
    )
    .expect("metric creation failed")
});

// Quota
pub static QUOTA_REJECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reel_quota_rejections_total",
        "Session starts refused for lack of quota",
    )
    .expect("metric creation failed")
});

pub static QUOTA_CORRECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "reel_quota_corrections_total",
        "Owners whose stored usage was corrected by reconciliation",
    )
    .expect("metric creation failed")
});

// Assembly
pub static ASSEMBLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "reel_assembly_duration_seconds",
            "Time spent concatenating chunks into the final object",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

// Maintenance
pub static SWEEP_JOB_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "reel_sweep_job_duration_seconds",
            "Maintenance job duration by type and state",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["job_type", "state"],
    )
    .expect("metric creation failed")
});

pub static SWEEP_ITEMS_DELETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "reel_sweep_items_deleted_total",
            "Total items cancelled or deleted by maintenance job type",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; registration happens on the first call.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(SESSIONS_STARTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_CANCELLED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_EXPIRED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_SESSIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_ACCEPTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_ACCEPTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUOTA_REJECTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUOTA_CORRECTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ASSEMBLY_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEP_JOB_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEP_ITEMS_DELETED.clone()))
            .expect("metric registration failed");
    });
}

/// Handler for the `/metrics` endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record a chunk accepted through `path` (`direct` or `proxied`).
pub fn record_chunk_accepted(path: &str, bytes: u64) {
    CHUNKS_ACCEPTED.with_label_values(&[path]).inc();
    BYTES_ACCEPTED.inc_by(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // Panics if any metric creation failed.
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_chunk_counter_labels() {
        register_metrics();
        let before = CHUNKS_ACCEPTED.with_label_values(&["direct"]).get();
        record_chunk_accepted("direct", 10);
        assert_eq!(CHUNKS_ACCEPTED.with_label_values(&["direct"]).get(), before + 1);
    }
}
