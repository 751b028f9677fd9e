//! Upload session handlers.

use crate::auth::require_scope;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use reel_core::SessionId;
use reel_core::quota::QuotaResponse;
use reel_core::session::{
    CancelSessionResponse, ChunkAcceptedResponse, ChunkTargetResponse, CompleteSessionResponse,
    NotifyChunkRequest, SessionStatusResponse, StartSessionRequest, StartSessionResponse,
};
use reel_core::token::TokenScope;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;

/// Maximum body size for JSON control requests (64 KiB).
const MAX_JSON_BODY_SIZE: usize = 64 * 1024;

async fn read_json<T: DeserializeOwned>(req: Request) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_JSON_BODY_SIZE)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

/// Read a raw body no larger than the configured chunk maximum.
async fn read_chunk_body(state: &AppState, req: Request) -> ApiResult<axum::body::Bytes> {
    let limit = usize::try_from(state.config.server.max_chunk_size).unwrap_or(usize::MAX);
    axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read chunk body: {e}")))
}

/// Start an upload session.
///
/// POST /v1/sessions
#[tracing::instrument(skip(state, req))]
pub async fn start_session(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<StartSessionResponse>)> {
    let auth = require_scope(&req, TokenScope::Upload)?;
    let body: StartSessionRequest = read_json(req).await?;

    let response = state.coordinator.start(auth.owner_id(), body).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Report a session's uploaded chunks and status.
///
/// GET /v1/sessions/{session_id}
#[tracing::instrument(skip(state, req), fields(session_id = %session_id))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    req: Request,
) -> ApiResult<Json<SessionStatusResponse>> {
    let auth = require_scope(&req, TokenScope::Upload)?;
    let session_id = SessionId::parse(&session_id)?;

    let response = state
        .coordinator
        .status(auth.owner_id(), &session_id)
        .await?;
    Ok(Json(response))
}

/// Issue a pre-signed write target for one chunk.
///
/// POST /v1/sessions/{session_id}/chunks/{chunk_number}/target
#[tracing::instrument(skip(state, req), fields(session_id = %session_id))]
pub async fn request_chunk_target(
    State(state): State<AppState>,
    Path((session_id, chunk_number)): Path<(String, u32)>,
    req: Request,
) -> ApiResult<Json<ChunkTargetResponse>> {
    let auth = require_scope(&req, TokenScope::Upload)?;
    let session_id = SessionId::parse(&session_id)?;

    let response = state
        .coordinator
        .request_target(auth.owner_id(), &session_id, chunk_number)
        .await?;
    Ok(Json(response))
}

/// Record a chunk written directly to storage.
///
/// POST /v1/sessions/{session_id}/chunks/{chunk_number}/notify
#[tracing::instrument(skip(state, req), fields(session_id = %session_id))]
pub async fn notify_chunk(
    State(state): State<AppState>,
    Path((session_id, chunk_number)): Path<(String, u32)>,
    req: Request,
) -> ApiResult<Json<ChunkAcceptedResponse>> {
    let auth = require_scope(&req, TokenScope::Upload)?;
    let session_id = SessionId::parse(&session_id)?;
    let body: NotifyChunkRequest = read_json(req).await?;

    let response = state
        .coordinator
        .notify_chunk(auth.owner_id(), &session_id, chunk_number, body)
        .await?;
    Ok(Json(response))
}

/// Accept a chunk streamed through the server.
///
/// PUT /v1/sessions/{session_id}/chunks/{chunk_number}
#[tracing::instrument(skip(state, req), fields(session_id = %session_id))]
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((session_id, chunk_number)): Path<(String, u32)>,
    req: Request,
) -> ApiResult<Json<ChunkAcceptedResponse>> {
    let auth = require_scope(&req, TokenScope::Upload)?;
    let session_id = SessionId::parse(&session_id)?;
    let body = read_chunk_body(&state, req).await?;

    let response = state
        .coordinator
        .accept_chunk(auth.owner_id(), &session_id, chunk_number, body)
        .await?;
    Ok(Json(response))
}

/// Assemble the session into its final object.
///
/// POST /v1/sessions/{session_id}/complete
#[tracing::instrument(skip(state, req), fields(session_id = %session_id))]
pub async fn complete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    req: Request,
) -> ApiResult<Json<CompleteSessionResponse>> {
    let auth = require_scope(&req, TokenScope::Upload)?;
    let session_id = SessionId::parse(&session_id)?;

    let response = state
        .coordinator
        .complete(auth.owner_id(), &session_id)
        .await?;
    Ok(Json(response))
}

/// Cancel a session and release its reservation.
///
/// DELETE /v1/sessions/{session_id}
#[tracing::instrument(skip(state, req), fields(session_id = %session_id))]
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    req: Request,
) -> ApiResult<Json<CancelSessionResponse>> {
    let auth = require_scope(&req, TokenScope::Upload)?;
    let session_id = SessionId::parse(&session_id)?;

    let response = state
        .coordinator
        .cancel(auth.owner_id(), &session_id)
        .await?;
    Ok(Json(response))
}

/// Query parameters of a single-request upload.
#[derive(Debug, Deserialize)]
pub struct SingleUploadParams {
    pub filename: String,
    #[serde(default)]
    pub mimetype: Option<String>,
}

/// Upload a small file in one request.
///
/// POST /v1/uploads?filename=..&mimetype=..
#[tracing::instrument(skip(state, req), fields(filename = %params.filename))]
pub async fn upload_single(
    State(state): State<AppState>,
    Query(params): Query<SingleUploadParams>,
    req: Request,
) -> ApiResult<(StatusCode, Json<CompleteSessionResponse>)> {
    let auth = require_scope(&req, TokenScope::Upload)?;
    let body = read_chunk_body(&state, req).await?;

    let response = state
        .coordinator
        .upload_single(
            auth.owner_id(),
            params.filename,
            params.mimetype.unwrap_or_default(),
            body,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Report the caller's own quota.
///
/// GET /v1/quota
pub async fn get_quota(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<QuotaResponse>> {
    let auth = require_scope(&req, TokenScope::Upload)?;

    let row = state
        .metadata
        .ensure_quota(
            auth.owner_id(),
            state.config.quota.default_limit_bytes,
            OffsetDateTime::now_utc(),
        )
        .await?;
    let quota = row.into_quota()?;
    Ok(Json(QuotaResponse::from(&quota)))
}
