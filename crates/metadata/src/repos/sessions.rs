//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::UploadSessionRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Result of a transition that may give back a quota reservation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Whether this call moved the session into the target status.
    pub transitioned: bool,
    /// Bytes returned to the owner's quota by this call (0 if the
    /// reservation was already released).
    pub released_bytes: u64,
}

/// Repository for upload session lifecycle operations.
///
/// Every method that changes status is a single transaction with a status
/// guard in its `WHERE` clause, so concurrent callers race safely: exactly one
/// of them observes `transitioned = true`.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Insert a session and debit `reserved_bytes` from its owner's quota in
    /// one transaction.
    ///
    /// The quota row is created with `default_limit_bytes` if the owner has
    /// none. Fails with `MetadataError::QuotaExceeded` (and inserts nothing)
    /// when `used + reserved_bytes` would exceed the limit.
    async fn create_session_with_reservation(
        &self,
        session: &UploadSessionRow,
        default_limit_bytes: u64,
    ) -> MetadataResult<()>;

    /// Get a session by ID.
    async fn get_session(&self, session_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Atomically move an `uploading` (or `pending`) session with every chunk
    /// recorded into `assembling`.
    ///
    /// Returns None if the session doesn't exist. Otherwise returns the
    /// session; its status is `assembling` only if this call made the
    /// transition, so callers must check it.
    async fn begin_assembly(
        &self,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<UploadSessionRow>>;

    /// Return an `assembling` session to `uploading` so completion can be
    /// retried. Returns whether the session was moved.
    async fn abort_assembly(&self, session_id: Uuid, now: OffsetDateTime) -> MetadataResult<bool>;

    /// Mark an `assembling` session `completed`, record its final location,
    /// absorb the reservation into real usage (no quota delta) and bump the
    /// owner's upload count. Returns false if the session left `assembling`
    /// meanwhile (cancelled or expired).
    async fn complete_session(
        &self,
        session_id: Uuid,
        storage_location: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Mark an `assembling` session `failed` and release its reservation.
    async fn fail_session(
        &self,
        session_id: Uuid,
        error_message: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<ReleaseOutcome>;

    /// Cancel a non-terminal session and release its reservation.
    async fn cancel_session(
        &self,
        session_id: Uuid,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> MetadataResult<ReleaseOutcome>;

    /// Cancel a session whose expiry passed before `now`, unless it is already
    /// `completed` or `cancelled`. Releases any reservation still held.
    async fn expire_session(
        &self,
        session_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<ReleaseOutcome>;

    /// Sessions past expiry that are not `completed` or `cancelled`.
    async fn get_expired_sessions(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// `cancelled`/`failed` sessions last updated before `older_than` that
    /// still have chunk rows.
    async fn get_terminal_sessions_with_chunks(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Delete `cancelled`/`failed` sessions last updated before `older_than`.
    /// Chunk rows go with them (cascade). Returns the number deleted.
    async fn delete_terminal_sessions(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<u64>;

    /// Count sessions currently accepting chunks or assembling.
    async fn count_active_sessions(&self) -> MetadataResult<u64>;
}
