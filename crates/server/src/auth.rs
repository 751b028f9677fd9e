//! Authentication and authorization middleware.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use reel_core::token::{Token, TokenId, TokenScope};
use reel_metadata::models::TokenRow;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

/// Maximum length for trace IDs.
/// Longer trace IDs are truncated to prevent log bloat and potential log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a client-provided value, truncated to
    /// `MAX_TRACE_ID_LEN` characters with non-printable characters removed.
    pub fn from_client(value: &str) -> Self {
        // Limit by character count so multi-byte input can't split a boundary.
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    /// Get the trace ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated request extension.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    /// The validated token.
    pub token: Token,
}

impl AuthenticatedUser {
    /// The owner every session and quota operation acts for.
    pub fn owner_id(&self) -> Uuid {
        self.token.owner_id
    }

    /// Check if the user has a specific scope.
    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.token.has_scope(scope)
    }

    /// Require a specific scope, returning an error if not present.
    pub fn require_scope(&self, scope: TokenScope) -> ApiResult<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "missing required scope: {scope}"
            )))
        }
    }
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

/// Extract trace ID from X-Trace-Id header or generate a new one.
fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Hash a token secret for storage lookup.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Build a domain token from its row, dropping scopes this build doesn't know.
fn token_from_row(row: TokenRow) -> ApiResult<Token> {
    let scopes: Vec<String> = serde_json::from_str(&row.scopes)
        .map_err(|e| ApiError::Internal(format!("invalid token scopes: {e}")))?;

    let scopes: HashSet<TokenScope> = scopes
        .iter()
        .filter_map(|s| match TokenScope::parse(s) {
            Ok(scope) => Some(scope),
            Err(_) => {
                tracing::warn!(
                    token_id = %row.token_id,
                    invalid_scope = %s,
                    "Token contains invalid scope, ignoring"
                );
                None
            }
        })
        .collect();

    Ok(Token {
        id: TokenId::from(row.token_id),
        owner_id: row.owner_id,
        scopes,
        expires_at: row.expires_at,
        revoked_at: row.revoked_at,
        created_at: row.created_at,
        description: row.description,
    })
}

/// Authentication middleware that validates tokens and sets up trace context.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    if let Some(secret) = extract_bearer_token(&req) {
        let token_hash = hash_token(secret);

        match state.metadata.get_token_by_hash(&token_hash).await? {
            Some(row) => {
                let token_id = row.token_id;
                let token = token_from_row(row)?;
                if !token.is_valid() {
                    return Err(ApiError::Unauthorized(
                        "token expired or revoked".to_string(),
                    ));
                }

                // Fire and forget; a lost touch only skews last_used_at.
                let metadata = state.metadata.clone();
                tokio::spawn(async move {
                    let _ = metadata
                        .touch_token(token_id, OffsetDateTime::now_utc())
                        .await;
                });

                req.extensions_mut().insert(AuthenticatedUser { token });
            }
            None => {
                tracing::debug!("Bearer token not recognized");
            }
        }
    }

    let response = next
        .run(req)
        .instrument(tracing::info_span!("request", trace_id = %trace_id_str))
        .await;

    Ok(response)
}

/// Require authentication (token must be present).
pub fn require_auth(req: &Request) -> ApiResult<&AuthenticatedUser> {
    req.extensions()
        .get::<AuthenticatedUser>()
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
}

/// Require authentication with a given scope.
pub fn require_scope(req: &Request, scope: TokenScope) -> ApiResult<AuthenticatedUser> {
    let auth = require_auth(req)?;
    auth.require_scope(scope)?;
    Ok(auth.clone())
}

/// Get the trace ID from request extensions.
pub fn get_trace_id(req: &Request) -> Option<&TraceId> {
    req.extensions().get::<TraceId>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_trace_id_sanitized() {
        let id = TraceId::from_client("abc\ndef\u{1b}[31m");
        assert_eq!(id.as_str(), "abcdef[31m");

        let long = "x".repeat(500);
        assert_eq!(TraceId::from_client(&long).as_str().len(), MAX_TRACE_ID_LEN);

        // Nothing printable left: fall back to a generated ID.
        let generated = TraceId::from_client("\n\t");
        assert!(Uuid::parse_str(generated.as_str()).is_ok());
    }

    #[test]
    fn test_bearer_scheme_case_insensitive() {
        let req = Request::builder()
            .header(AUTHORIZATION, "bEaReR secret-value")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), Some("secret-value"));

        let req = Request::builder()
            .header(AUTHORIZATION, "Basic Zm9vOmJhcg==")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), None);
    }

    #[test]
    fn test_hash_token_matches_admin_fixture() {
        assert_eq!(
            hash_token("test-admin-token"),
            reel_core::config::AdminConfig::for_testing().token_hash
        );
    }

    #[test]
    fn test_unknown_scopes_are_dropped() {
        let now = OffsetDateTime::now_utc();
        let row = TokenRow {
            token_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            token_hash: "h".repeat(64),
            scopes: r#"["upload","cache:write"]"#.to_string(),
            expires_at: None,
            revoked_at: None,
            created_at: now,
            last_used_at: None,
            description: None,
        };
        let token = token_from_row(row).unwrap();
        assert_eq!(token.scopes.len(), 1);
        assert!(token.can_upload());
        assert!(!token.is_admin());
    }
}
