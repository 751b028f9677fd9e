//! Token types and authorization.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for a token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(Uuid);

impl TokenId {
    /// Generate a new random token ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidToken(format!("invalid token ID: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TokenId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.0)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token scopes for authorization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    /// Start, feed, complete and cancel own upload sessions.
    Upload,
    /// Maintenance runs, token minting and quota management.
    Admin,
}

impl TokenScope {
    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "upload" => Ok(Self::Upload),
            "admin" => Ok(Self::Admin),
            _ => Err(crate::Error::InvalidToken(format!("unknown scope: {s}"))),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Admin => "admin",
        }
    }

    /// Check if this scope implies another scope.
    pub fn implies(&self, other: &Self) -> bool {
        match self {
            Self::Admin => true,
            Self::Upload => matches!(other, Self::Upload),
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated token with its metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier.
    pub id: TokenId,
    /// Owner the token acts for.
    pub owner_id: Uuid,
    /// Granted scopes.
    pub scopes: HashSet<TokenScope>,
    /// When the token expires.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// When the token was revoked (if revoked).
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    /// When the token was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Description for the token.
    pub description: Option<String>,
}

impl Token {
    /// Check if the token is valid (not expired or revoked).
    pub fn is_valid(&self) -> bool {
        let now = OffsetDateTime::now_utc();

        if self.revoked_at.is_some() {
            return false;
        }

        if let Some(expires_at) = self.expires_at
            && now > expires_at
        {
            return false;
        }

        true
    }

    /// Check if the token has a specific scope.
    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.scopes.iter().any(|s| s.implies(&scope))
    }

    /// Check if the token may run uploads.
    pub fn can_upload(&self) -> bool {
        self.is_valid() && self.has_scope(TokenScope::Upload)
    }

    /// Check if the token has admin access.
    pub fn is_admin(&self) -> bool {
        self.is_valid() && self.has_scope(TokenScope::Admin)
    }
}

/// Request to create a token.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    /// Owner the token acts for; a fresh owner is allocated when absent.
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Scopes to grant (default: `["upload"]`).
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Expiration duration in seconds (optional).
    pub expires_in: Option<u64>,
    /// Description for the token.
    pub description: Option<String>,
}

/// Response from creating a token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    /// The token ID.
    pub token_id: String,
    /// Owner the token acts for.
    pub owner_id: String,
    /// The token secret (only returned once).
    pub token_secret: String,
    /// When the token expires.
    pub expires_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with(scopes: &[TokenScope]) -> Token {
        Token {
            id: TokenId::new(),
            owner_id: Uuid::new_v4(),
            scopes: scopes.iter().copied().collect(),
            expires_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
            description: None,
        }
    }

    #[test]
    fn test_scope_implies() {
        assert!(TokenScope::Admin.implies(&TokenScope::Upload));
        assert!(TokenScope::Admin.implies(&TokenScope::Admin));
        assert!(TokenScope::Upload.implies(&TokenScope::Upload));
        assert!(!TokenScope::Upload.implies(&TokenScope::Admin));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(TokenScope::parse("upload").unwrap(), TokenScope::Upload);
        assert_eq!(TokenScope::parse("admin").unwrap(), TokenScope::Admin);
        assert!(TokenScope::parse("cache:read").is_err());
    }

    #[test]
    fn test_token_validity() {
        let token = token_with(&[TokenScope::Upload]);
        assert!(token.can_upload());
        assert!(!token.is_admin());

        let admin = token_with(&[TokenScope::Admin]);
        assert!(admin.can_upload());
        assert!(admin.is_admin());

        let mut revoked = token_with(&[TokenScope::Admin]);
        revoked.revoked_at = Some(OffsetDateTime::now_utc());
        assert!(!revoked.can_upload());

        let mut expired = token_with(&[TokenScope::Upload]);
        expired.expires_at = Some(OffsetDateTime::now_utc() - time::Duration::minutes(1));
        assert!(!expired.is_valid());
    }
}
