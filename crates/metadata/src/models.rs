//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use reel_core::{SessionId, SessionStatus, ShareId, UploadSession, UserQuota};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

pub(crate) fn to_i64(value: u64, field: &str) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::Constraint(format!("{field} {value} does not fit in a row")))
}

pub(crate) fn to_u64(value: i64, field: &str) -> MetadataResult<u64> {
    u64::try_from(value)
        .map_err(|_| MetadataError::Internal(format!("negative {field} in row: {value}")))
}

pub(crate) fn to_u32(value: i64, field: &str) -> MetadataResult<u32> {
    u32::try_from(value)
        .map_err(|_| MetadataError::Internal(format!("{field} out of range in row: {value}")))
}

// =============================================================================
// Upload sessions
// =============================================================================

/// Upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub session_id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    pub file_size: i64,
    pub mimetype: String,
    pub total_chunks: i64,
    pub chunks_uploaded: i64,
    pub storage_location: Option<String>,
    pub share_id: String,
    pub status: String,
    pub quota_reserved: bool,
    pub reserved_bytes: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl UploadSessionRow {
    pub fn from_session(session: &UploadSession) -> MetadataResult<Self> {
        Ok(Self {
            session_id: *session.id.as_uuid(),
            owner_id: session.owner_id,
            filename: session.filename.clone(),
            file_size: to_i64(session.file_size, "file_size")?,
            mimetype: session.mimetype.clone(),
            total_chunks: i64::from(session.total_chunks),
            chunks_uploaded: i64::from(session.chunks_uploaded),
            storage_location: session.storage_location.clone(),
            share_id: session.share_id.as_str().to_string(),
            status: session.status.as_str().to_string(),
            quota_reserved: session.quota_reserved,
            reserved_bytes: to_i64(session.reserved_bytes, "reserved_bytes")?,
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
            completed_at: session.completed_at,
            error_message: session.error_message.clone(),
        })
    }

    pub fn into_session(self) -> MetadataResult<UploadSession> {
        Ok(UploadSession {
            id: SessionId::from(self.session_id),
            owner_id: self.owner_id,
            file_size: to_u64(self.file_size, "file_size")?,
            total_chunks: to_u32(self.total_chunks, "total_chunks")?,
            chunks_uploaded: to_u32(self.chunks_uploaded, "chunks_uploaded")?,
            share_id: ShareId::parse(&self.share_id)?,
            status: SessionStatus::parse(&self.status)?,
            reserved_bytes: to_u64(self.reserved_bytes, "reserved_bytes")?,
            filename: self.filename,
            mimetype: self.mimetype,
            storage_location: self.storage_location,
            quota_reserved: self.quota_reserved,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
        })
    }
}

/// One recorded chunk of a session. Unique per (session, chunk number).
#[derive(Debug, Clone, FromRow)]
pub struct UploadChunkRow {
    pub chunk_id: Uuid,
    pub session_id: Uuid,
    pub chunk_number: i64,
    pub size_bytes: i64,
    /// Temporary object key holding the chunk bytes.
    pub object_key: String,
    pub uploaded_at: OffsetDateTime,
}

impl UploadChunkRow {
    pub fn new(
        session_id: &SessionId,
        chunk_number: u32,
        size_bytes: u64,
        object_key: String,
        uploaded_at: OffsetDateTime,
    ) -> MetadataResult<Self> {
        Ok(Self {
            chunk_id: Uuid::new_v4(),
            session_id: *session_id.as_uuid(),
            chunk_number: i64::from(chunk_number),
            size_bytes: to_i64(size_bytes, "size_bytes")?,
            object_key,
            uploaded_at,
        })
    }

    pub fn chunk_number(&self) -> MetadataResult<u32> {
        to_u32(self.chunk_number, "chunk_number")
    }

    pub fn size(&self) -> MetadataResult<u64> {
        to_u64(self.size_bytes, "size_bytes")
    }
}

// =============================================================================
// Quotas and videos
// =============================================================================

/// Per-owner quota record.
#[derive(Debug, Clone, FromRow)]
pub struct UserQuotaRow {
    pub owner_id: Uuid,
    pub storage_used_bytes: i64,
    pub storage_limit_bytes: i64,
    pub upload_count: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserQuotaRow {
    pub fn into_quota(self) -> MetadataResult<UserQuota> {
        Ok(UserQuota {
            owner_id: self.owner_id,
            storage_used_bytes: to_u64(self.storage_used_bytes, "storage_used_bytes")?,
            storage_limit_bytes: to_u64(self.storage_limit_bytes, "storage_limit_bytes")?,
            upload_count: to_u64(self.upload_count, "upload_count")?,
        })
    }
}

/// Completed video attributed to an owner.
#[derive(Debug, Clone, FromRow)]
pub struct VideoRow {
    pub video_id: Uuid,
    pub owner_id: Uuid,
    pub share_id: String,
    pub storage_location: String,
    pub size_bytes: i64,
    pub mimetype: String,
    pub filename: String,
    pub created_at: OffsetDateTime,
}

impl VideoRow {
    pub fn new(
        owner_id: Uuid,
        share_id: &ShareId,
        storage_location: String,
        size: u64,
        mimetype: String,
        filename: String,
        created_at: OffsetDateTime,
    ) -> MetadataResult<Self> {
        Ok(Self {
            video_id: Uuid::new_v4(),
            owner_id,
            share_id: share_id.as_str().to_string(),
            storage_location,
            size_bytes: to_i64(size, "size_bytes")?,
            mimetype,
            filename,
            created_at,
        })
    }

    pub fn size(&self) -> MetadataResult<u64> {
        to_u64(self.size_bytes, "size_bytes")
    }
}

// =============================================================================
// Tokens and maintenance jobs
// =============================================================================

/// Token record.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token_id: Uuid,
    pub owner_id: Uuid,
    pub token_hash: String,
    pub scopes: String, // JSON array
    pub expires_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub description: Option<String>,
}

/// Maintenance job record, one per sweep or reconcile run.
#[derive(Debug, Clone, FromRow)]
pub struct MaintenanceJobRow {
    pub job_id: Uuid,
    pub job_type: String,
    pub state: String,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    pub stats_json: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_row_conversion() {
        let session = UploadSession::new(
            Uuid::new_v4(),
            "clip.mp4",
            1234,
            "video/mp4",
            3,
            time::Duration::hours(24),
        );
        let row = UploadSessionRow::from_session(&session).unwrap();
        assert_eq!(row.status, "uploading");
        assert_eq!(row.reserved_bytes, 1234);

        let back = row.into_session().unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.share_id, session.share_id);
        assert_eq!(back.status, SessionStatus::Uploading);
    }

    #[test]
    fn test_corrupt_rows_are_rejected() {
        let session = UploadSession::new(
            Uuid::new_v4(),
            "clip.mp4",
            10,
            "video/mp4",
            1,
            time::Duration::hours(1),
        );
        let mut row = UploadSessionRow::from_session(&session).unwrap();
        row.status = "open".to_string();
        assert!(row.clone().into_session().is_err());

        row.status = "uploading".to_string();
        row.file_size = -1;
        assert!(row.into_session().is_err());
    }
}
