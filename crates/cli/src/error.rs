//! Client error types.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Result type alias for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Errors raised while talking to the upload server or storage.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with a non-success status.
    #[error("server returned {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The request never got an answer.
    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The file cannot be split as configured.
    #[error(transparent)]
    Layout(#[from] reel_core::Error),

    /// The upload was cancelled locally.
    #[error("upload cancelled")]
    Cancelled,
}

/// Error body returned by the server.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl ClientError {
    /// Build an error from a failed response's status and body.
    ///
    /// Bodies that are not the server's `{code, message}` JSON (proxies,
    /// storage providers) keep the raw text as the message.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => Self::Api {
                status: status.as_u16(),
                code: parsed.code,
                message: parsed.message,
            },
            Err(_) => Self::Api {
                status: status.as_u16(),
                code: fallback_code(status).to_string(),
                message: body.trim().to_string(),
            },
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Transport failures and 5xx answers are transient, except 501 which
    /// means the server cannot do what was asked at all. Every 4xx is final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => {
                *status >= 500 && *status != StatusCode::NOT_IMPLEMENTED.as_u16()
            }
            Self::Network(_) => true,
            _ => false,
        }
    }

    /// The server's error code, if the server produced this error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the session is gone (expired, cancelled, failed or unknown).
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, Self::Api { status: 410, .. }) || self.code() == Some("session_invalid")
    }

    /// Whether the server cannot issue direct write targets.
    pub fn is_direct_unavailable(&self) -> bool {
        matches!(self, Self::Api { status: 501, .. })
            || self.code() == Some("direct_upload_unavailable")
    }
}

fn fallback_code(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "bad_request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not_found",
        410 => "session_invalid",
        413 => "quota_exceeded",
        501 => "direct_upload_unavailable",
        503 => "storage_write_failure",
        s if s >= 500 => "internal_error",
        _ => "unknown",
    }
}
