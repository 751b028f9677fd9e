//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        // Health check (intentionally unauthenticated for load balancer probes)
        .route("/v1/health", get(handlers::health_check))
        // Session lifecycle
        .route("/v1/sessions", post(handlers::start_session))
        .route(
            "/v1/sessions/{session_id}",
            get(handlers::get_session).delete(handlers::cancel_session),
        )
        .route(
            "/v1/sessions/{session_id}/chunks/{chunk_number}",
            put(handlers::upload_chunk),
        )
        .route(
            "/v1/sessions/{session_id}/chunks/{chunk_number}/target",
            post(handlers::request_chunk_target),
        )
        .route(
            "/v1/sessions/{session_id}/chunks/{chunk_number}/notify",
            post(handlers::notify_chunk),
        )
        .route(
            "/v1/sessions/{session_id}/complete",
            post(handlers::complete_session),
        )
        .route("/v1/uploads", post(handlers::upload_single))
        .route("/v1/quota", get(handlers::get_quota))
        // Admin endpoints (all require the admin scope)
        .route("/v1/admin/tokens", post(handlers::create_token))
        .route("/v1/admin/sweep", post(handlers::trigger_sweep))
        .route("/v1/admin/reconcile", post(handlers::trigger_reconcile))
        .route("/v1/admin/jobs", get(handlers::list_jobs))
        .route(
            "/v1/admin/quotas/{owner_id}",
            get(handlers::get_user_quota).put(handlers::set_user_quota),
        );

    // The metrics endpoint must be network-restricted to the scraper when enabled.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    // Layers run outermost first: TraceLayer -> Auth -> Handler
    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
