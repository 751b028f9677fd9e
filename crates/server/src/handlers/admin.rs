//! Administrative endpoints.

use crate::auth::{hash_token, require_scope};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::sweep::{self, JobReport, SweepReport};
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use reel_core::quota::{QuotaResponse, SetQuotaRequest};
use reel_core::session::format_timestamp;
use reel_core::token::{CreateTokenRequest, CreateTokenResponse, TokenScope};
use reel_metadata::models::TokenRow;
use reel_metadata::repos::ReconcileStats;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Maximum request body size for admin endpoints (1 MiB).
const MAX_ADMIN_BODY_SIZE: usize = 1024 * 1024;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /v1/health - Health check.
///
/// Intentionally unauthenticated for load balancer and orchestrator probes.
/// Returns only non-sensitive information (status and version).
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /v1/admin/tokens - Mint a token for an owner.
pub async fn create_token(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<CreateTokenResponse>)> {
    require_scope(&req, TokenScope::Admin)?;

    let body: CreateTokenRequest = {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_ADMIN_BODY_SIZE)
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?
    };

    let scopes = if body.scopes.is_empty() {
        vec![TokenScope::Upload.as_str().to_string()]
    } else {
        body.scopes
    };
    for scope in &scopes {
        TokenScope::parse(scope)
            .map_err(|_| ApiError::BadRequest(format!("invalid scope: {scope}")))?;
    }

    let owner_id = match body.owner_id.as_deref() {
        Some(id) => Uuid::parse_str(id)
            .map_err(|e| ApiError::BadRequest(format!("invalid owner_id: {e}")))?,
        None => Uuid::new_v4(),
    };

    let now = OffsetDateTime::now_utc();
    let expires_at = match body.expires_in {
        Some(secs) => {
            let secs: i64 = secs.try_into().map_err(|_| {
                ApiError::BadRequest(format!("expires_in too large: {secs}"))
            })?;
            Some(now + time::Duration::seconds(secs))
        }
        None => None,
    };

    let token_secret = generate_token_secret();
    let token_row = TokenRow {
        token_id: Uuid::new_v4(),
        owner_id,
        token_hash: hash_token(&token_secret),
        scopes: serde_json::to_string(&scopes)
            .map_err(|e| ApiError::Internal(format!("failed to serialize scopes: {e}")))?,
        expires_at,
        revoked_at: None,
        created_at: now,
        last_used_at: None,
        description: body.description,
    };
    state.metadata.create_token(&token_row).await?;

    tracing::info!(
        token_id = %token_row.token_id,
        owner_id = %owner_id,
        scopes = ?scopes,
        "Token created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token_id: token_row.token_id.to_string(),
            owner_id: owner_id.to_string(),
            token_secret,
            expires_at: expires_at.map(format_timestamp),
        }),
    ))
}

/// POST /v1/admin/sweep - Expire stale sessions and collect old chunks and sessions.
pub async fn trigger_sweep(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<SweepReport>> {
    require_scope(&req, TokenScope::Admin)?;
    let report = sweep::run_sweep(&state, OffsetDateTime::now_utc(), false).await?;
    Ok(Json(report))
}

/// POST /v1/admin/reconcile - Recompute every owner's usage.
pub async fn trigger_reconcile(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<JobReport<ReconcileStats>>> {
    require_scope(&req, TokenScope::Admin)?;
    let report = sweep::run_reconcile(&state, OffsetDateTime::now_utc()).await?;
    Ok(Json(report))
}

/// Query parameters for listing jobs.
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    /// Maximum number of jobs to return (default: 20, max: 100).
    pub limit: Option<u32>,
}

/// Maintenance job as reported over the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
    pub job_type: String,
    pub state: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub stats: Option<serde_json::Value>,
}

/// GET /v1/admin/jobs - Recent maintenance jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
    req: Request,
) -> ApiResult<Json<Vec<JobResponse>>> {
    require_scope(&req, TokenScope::Admin)?;
    let limit = params.limit.unwrap_or(20).min(100);

    let jobs = state.metadata.get_recent_jobs(limit).await?;
    let responses = jobs
        .into_iter()
        .map(|job| JobResponse {
            job_id: job.job_id.to_string(),
            job_type: job.job_type,
            state: job.state,
            started_at: job.started_at.map(format_timestamp),
            finished_at: job.finished_at.map(format_timestamp),
            stats: job
                .stats_json
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
        })
        .collect();
    Ok(Json(responses))
}

fn parse_owner_id(owner_id: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(owner_id).map_err(|e| ApiError::BadRequest(format!("invalid owner_id: {e}")))
}

/// GET /v1/admin/quotas/{owner_id} - Read an owner's quota.
pub async fn get_user_quota(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    req: Request,
) -> ApiResult<Json<QuotaResponse>> {
    require_scope(&req, TokenScope::Admin)?;
    let owner_id = parse_owner_id(&owner_id)?;

    let quota = state
        .metadata
        .get_quota(owner_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no quota recorded for {owner_id}")))?
        .into_quota()?;
    Ok(Json(QuotaResponse::from(&quota)))
}

/// PUT /v1/admin/quotas/{owner_id} - Set an owner's limit.
///
/// Lowering the limit below current usage is allowed; it only blocks new
/// sessions until usage drops.
pub async fn set_user_quota(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    req: Request,
) -> ApiResult<Json<QuotaResponse>> {
    require_scope(&req, TokenScope::Admin)?;
    let owner_id = parse_owner_id(&owner_id)?;

    let body: SetQuotaRequest = {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_ADMIN_BODY_SIZE)
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?
    };

    let quota = state
        .metadata
        .set_quota_limit(owner_id, body.storage_limit_bytes, OffsetDateTime::now_utc())
        .await?
        .into_quota()?;
    tracing::info!(
        owner_id = %owner_id,
        limit_bytes = body.storage_limit_bytes,
        "Quota limit updated"
    );
    Ok(Json(QuotaResponse::from(&quota)))
}

/// Generate a random token secret.
fn generate_token_secret() -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
