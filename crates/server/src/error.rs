//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reel_metadata::MetadataError;
use reel_storage::StorageError;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: requested {requested} bytes, {remaining} remaining")]
    QuotaExceeded { requested: u64, remaining: u64 },

    #[error("file too large: {size} bytes exceeds the {limit} byte maximum")]
    FileTooLarge { size: u64, limit: u64 },

    /// The session is missing, expired, already terminal, or not the caller's.
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    #[error("chunk {chunk_number} out of range (total chunks: {total_chunks})")]
    ChunkOutOfRange { chunk_number: u32, total_chunks: u32 },

    #[error("incomplete upload: {uploaded} of {total} chunks received")]
    IncompleteUpload { uploaded: u32, total: u32 },

    #[error("assembled size {actual} does not match declared size {expected}")]
    AssembleSizeMismatch { expected: u64, actual: u64 },

    #[error("storage write failure: {0}")]
    StorageWriteFailure(String),

    #[error("direct upload unavailable: {0}")]
    DirectUploadUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("core error: {0}")]
    Core(#[from] reel_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::SessionInvalid(_) => "session_invalid",
            Self::ChunkOutOfRange { .. } => "chunk_out_of_range",
            Self::IncompleteUpload { .. } => "incomplete_upload",
            Self::AssembleSizeMismatch { .. } => "assemble_size_mismatch",
            Self::StorageWriteFailure(_) => "storage_write_failure",
            Self::DirectUploadUnavailable(_) => "direct_upload_unavailable",
            Self::Internal(_) => "internal_error",
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => "not_found",
                StorageError::Unsupported(_) => "direct_upload_unavailable",
                _ => "storage_write_failure",
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => "not_found",
                MetadataError::QuotaExceeded { .. } => "quota_exceeded",
                MetadataError::SessionClosed(_) => "session_invalid",
                MetadataError::AlreadyExists(_) | MetadataError::Constraint(_) => "conflict",
                _ => "internal_error",
            },
            Self::Core(e) => match e {
                reel_core::Error::ChunkOutOfRange { .. } => "chunk_out_of_range",
                reel_core::Error::InvalidSessionId(_) => "session_invalid",
                _ => "bad_request",
            },
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::QuotaExceeded { .. } | Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::SessionInvalid(_) => StatusCode::GONE,
            Self::ChunkOutOfRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::AssembleSizeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StorageWriteFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DirectUploadUnavailable(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                StorageError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                MetadataError::SessionClosed(_) => StatusCode::GONE,
                MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
                MetadataError::Constraint(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(e) => match e {
                reel_core::Error::ChunkOutOfRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
                reel_core::Error::InvalidSessionId(_) => StatusCode::GONE,
                _ => StatusCode::BAD_REQUEST,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_wire_codes() {
        let cases = [
            (
                ApiError::QuotaExceeded {
                    requested: 10,
                    remaining: 5,
                },
                StatusCode::PAYLOAD_TOO_LARGE,
                "quota_exceeded",
            ),
            (
                ApiError::SessionInvalid("gone".into()),
                StatusCode::GONE,
                "session_invalid",
            ),
            (
                ApiError::ChunkOutOfRange {
                    chunk_number: 10,
                    total_chunks: 10,
                },
                StatusCode::RANGE_NOT_SATISFIABLE,
                "chunk_out_of_range",
            ),
            (
                ApiError::IncompleteUpload {
                    uploaded: 2,
                    total: 3,
                },
                StatusCode::CONFLICT,
                "incomplete_upload",
            ),
            (
                ApiError::AssembleSizeMismatch {
                    expected: 3,
                    actual: 2,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
                "assemble_size_mismatch",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status_code(), status, "{err}");
            assert_eq!(err.code(), code, "{err}");
        }
    }

    #[test]
    fn test_nested_errors_keep_their_meaning() {
        let quota: ApiError = MetadataError::QuotaExceeded {
            requested: 600,
            remaining: 512,
        }
        .into();
        assert_eq!(quota.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(quota.code(), "quota_exceeded");

        let closed: ApiError = MetadataError::SessionClosed("expired".into()).into();
        assert_eq!(closed.status_code(), StatusCode::GONE);

        let io: ApiError = StorageError::Io(std::io::Error::other("disk full")).into();
        assert_eq!(io.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(io.code(), "storage_write_failure");

        let unsupported: ApiError = StorageError::Unsupported("presign".into()).into();
        assert_eq!(unsupported.status_code(), StatusCode::NOT_IMPLEMENTED);
    }
}
