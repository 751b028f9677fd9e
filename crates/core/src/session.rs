//! Upload session types and lifecycle.

use crate::error::Error;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidSessionId(format!("{s}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public share identifier of an uploaded video.
///
/// 16 random bytes, URL-safe base64 without padding. Safe to embed in
/// shareable links since it reveals nothing about owners or sessions.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(String);

impl ShareId {
    /// Encoded length of a share identifier.
    pub const ENCODED_LEN: usize = 22;

    /// Generate a fresh random share identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse and validate a share identifier.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let valid = s.len() == Self::ENCODED_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(Error::InvalidShareId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareId({})", self.0)
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upload session status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created but no reservation taken yet.
    Pending,
    /// Open and accepting chunks.
    Uploading,
    /// Chunks are being concatenated into the final object.
    Assembling,
    /// Final object stored and handed to the video catalog.
    Completed,
    /// Assembly failed; reservation released.
    Failed,
    /// Cancelled by the owner or by the expiry sweep.
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the persisted string form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "assembling" => Ok(Self::Assembling),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }

    /// Check if the session can still receive chunks.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Pending | Self::Uploading)
    }

    /// Check if the session reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resumable upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session identifier.
    pub id: SessionId,
    /// User the session (and its quota reservation) belongs to.
    pub owner_id: Uuid,
    /// Original file name as supplied by the client.
    pub filename: String,
    /// Declared size of the whole file in bytes.
    pub file_size: u64,
    pub mimetype: String,
    pub total_chunks: u32,
    /// Number of distinct chunk numbers recorded so far.
    pub chunks_uploaded: u32,
    /// Final object key, set once assembly succeeds.
    pub storage_location: Option<String>,
    /// Public share identifier, assigned at start and never changed.
    pub share_id: ShareId,
    pub status: SessionStatus,
    /// Whether this session still holds a quota reservation.
    pub quota_reserved: bool,
    pub reserved_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl UploadSession {
    /// Create a new session in the `uploading` status holding a reservation
    /// for the whole file.
    pub fn new(
        owner_id: Uuid,
        filename: impl Into<String>,
        file_size: u64,
        mimetype: impl Into<String>,
        total_chunks: u32,
        expires_in: time::Duration,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: SessionId::new(),
            owner_id,
            filename: filename.into(),
            file_size,
            mimetype: mimetype.into(),
            total_chunks,
            chunks_uploaded: 0,
            storage_location: None,
            share_id: ShareId::generate(),
            status: SessionStatus::Uploading,
            quota_reserved: true,
            reserved_bytes: file_size,
            created_at: now,
            updated_at: now,
            expires_at: now + expires_in,
            completed_at: None,
            error_message: None,
        }
    }

    /// Check if the session has expired at the given instant.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at < now
    }

    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Whether a chunk write may be recorded right now.
    pub fn can_accept_chunks(&self) -> bool {
        self.status.accepts_chunks() && !self.is_expired()
    }

    /// Validate a chunk number against `[0, total_chunks)`.
    pub fn check_chunk_number(&self, chunk_number: u32) -> crate::Result<()> {
        if chunk_number >= self.total_chunks {
            return Err(Error::ChunkOutOfRange {
                chunk_number,
                total_chunks: self.total_chunks,
            });
        }
        Ok(())
    }

    /// Whether every chunk has been recorded.
    pub fn is_fully_uploaded(&self) -> bool {
        self.chunks_uploaded == self.total_chunks
    }
}

/// Request to start an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub filename: String,
    /// Declared file size in bytes.
    pub file_size: u64,
    pub mimetype: String,
    pub total_chunks: u32,
}

/// Response from starting an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub share_id: String,
    /// When the session expires (RFC 3339).
    pub expires_at: String,
    /// Largest chunk body the server accepts.
    pub max_chunk_size: u64,
}

/// Response from querying a session, used by clients to reconcile resume state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub share_id: String,
    pub status: SessionStatus,
    /// Recorded chunk numbers in ascending order.
    pub uploaded_chunks: Vec<u32>,
    pub chunks_uploaded: u32,
    pub total_chunks: u32,
    pub file_size: u64,
    /// When the session expires (RFC 3339).
    pub expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A pre-signed write target for the direct chunk path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkTargetResponse {
    /// URL the chunk bytes are sent to.
    pub url: String,
    /// HTTP method to use (normally `PUT`).
    pub method: String,
    /// Headers that must accompany the request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Object key to report back in the notify call.
    pub object_key: String,
    /// When the target stops being valid (RFC 3339).
    pub expires_at: String,
}

/// Notification that a chunk was written directly to storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyChunkRequest {
    pub object_key: String,
    pub size: u64,
}

/// Response to an accepted chunk, on either path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkAcceptedResponse {
    pub chunk_number: u32,
    pub chunks_uploaded: u32,
    pub total_chunks: u32,
}

/// Response from completing a session (or from a single-request upload).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompleteSessionResponse {
    pub session_id: String,
    pub share_id: String,
    pub video_id: String,
    pub status: SessionStatus,
    pub size: u64,
    /// When the session completed (RFC 3339).
    pub completed_at: String,
}

/// Response from cancelling a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

/// Format a timestamp as RFC 3339, falling back to the debug form.
pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| ts.to_string())
}
