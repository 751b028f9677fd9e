//! Metadata store trait and implementations.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    BootstrapRepo, ChunkRepo, JobRepo, QuotaRepo, SessionRepo, TokenRepo, VideoRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    SessionRepo
    + ChunkRepo
    + QuotaRepo
    + VideoRepo
    + TokenRepo
    + BootstrapRepo
    + JobRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers; every status transition
            // below is one transaction on it.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout: Duration::from_secs(query_timeout_secs),
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs,
            "SQLite metadata store ready (query timeout is advisory)"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// SQLite cannot cancel statements, so long operations are only reported.
    fn warn_if_slow(&self, operation: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.query_timeout {
            tracing::warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_secs = self.query_timeout.as_secs(),
                "metadata operation exceeded query timeout"
            );
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::{RecordedChunk, ReconciledQuota, ReleaseOutcome};
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;
    use uuid::Uuid;

    /// Flip a session's reservation flag and give the bytes back to its owner.
    ///
    /// The flag is cleared with a guarded UPDATE, so the quota is credited at
    /// most once per session no matter how many transitions race here.
    async fn release_reservation(
        conn: &mut SqliteConnection,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let released: Option<(Uuid, i64)> = sqlx::query_as(
            r#"
            UPDATE upload_sessions SET quota_reserved = 0
            WHERE session_id = ? AND quota_reserved = 1
            RETURNING owner_id, reserved_bytes
            "#,
        )
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((owner_id, reserved_bytes)) = released else {
            return Ok(0);
        };

        sqlx::query(
            r#"
            UPDATE user_quotas
            SET storage_used_bytes = MAX(0, storage_used_bytes - ?), updated_at = ?
            WHERE owner_id = ?
            "#,
        )
        .bind(reserved_bytes)
        .bind(now)
        .bind(owner_id)
        .execute(&mut *conn)
        .await?;

        to_u64(reserved_bytes, "reserved_bytes")
    }

    fn is_unique_violation(err: &sqlx::Error, table: &str) -> bool {
        match err {
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();
                msg.contains("UNIQUE constraint") && msg.contains(table)
            }
            _ => false,
        }
    }

    #[async_trait]
    impl SessionRepo for SqliteStore {
        async fn create_session_with_reservation(
            &self,
            session: &UploadSessionRow,
            default_limit_bytes: u64,
        ) -> MetadataResult<()> {
            let default_limit = to_i64(default_limit_bytes, "default_limit_bytes")?;
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                INSERT INTO user_quotas (
                    owner_id, storage_used_bytes, storage_limit_bytes, upload_count,
                    created_at, updated_at
                ) VALUES (?, 0, ?, 0, ?, ?)
                ON CONFLICT(owner_id) DO NOTHING
                "#,
            )
            .bind(session.owner_id)
            .bind(default_limit)
            .bind(session.created_at)
            .bind(session.created_at)
            .execute(&mut *tx)
            .await?;

            // Check and debit in one statement so concurrent starts for the
            // same owner cannot jointly pass the limit.
            let reserved = sqlx::query(
                r#"
                UPDATE user_quotas
                SET storage_used_bytes = storage_used_bytes + ?, updated_at = ?
                WHERE owner_id = ? AND storage_used_bytes + ? <= storage_limit_bytes
                "#,
            )
            .bind(session.reserved_bytes)
            .bind(session.created_at)
            .bind(session.owner_id)
            .bind(session.reserved_bytes)
            .execute(&mut *tx)
            .await?;

            if reserved.rows_affected() == 0 {
                let (used, limit): (i64, i64) = sqlx::query_as(
                    "SELECT storage_used_bytes, storage_limit_bytes FROM user_quotas WHERE owner_id = ?",
                )
                .bind(session.owner_id)
                .fetch_one(&mut *tx)
                .await?;
                tx.rollback().await?;
                return Err(MetadataError::QuotaExceeded {
                    requested: to_u64(session.reserved_bytes, "reserved_bytes")?,
                    remaining: u64::try_from(limit.saturating_sub(used)).unwrap_or(0),
                });
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    session_id, owner_id, filename, file_size, mimetype, total_chunks,
                    chunks_uploaded, storage_location, share_id, status, quota_reserved,
                    reserved_bytes, created_at, updated_at, expires_at, completed_at,
                    error_message
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session.session_id)
            .bind(session.owner_id)
            .bind(&session.filename)
            .bind(session.file_size)
            .bind(&session.mimetype)
            .bind(session.total_chunks)
            .bind(session.chunks_uploaded)
            .bind(&session.storage_location)
            .bind(&session.share_id)
            .bind(&session.status)
            .bind(session.quota_reserved)
            .bind(session.reserved_bytes)
            .bind(session.created_at)
            .bind(session.updated_at)
            .bind(session.expires_at)
            .bind(session.completed_at)
            .bind(&session.error_message)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e, "upload_sessions") => {
                    tx.rollback().await?;
                    return Err(MetadataError::AlreadyExists(format!(
                        "session {} or share id {}",
                        session.session_id, session.share_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            tx.commit().await?;
            Ok(())
        }

        async fn get_session(&self, session_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn begin_assembly(
            &self,
            session_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<Option<UploadSessionRow>> {
            let mut tx = self.pool.begin().await?;

            let mut session = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(ref mut s) = session {
                let result = sqlx::query(
                    r#"
                    UPDATE upload_sessions SET status = 'assembling', updated_at = ?
                    WHERE session_id = ?
                      AND status IN ('pending', 'uploading')
                      AND chunks_uploaded = total_chunks
                      AND expires_at > ?
                    "#,
                )
                .bind(now)
                .bind(session_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() > 0 {
                    s.status = "assembling".to_string();
                    s.updated_at = now;
                }
            }

            tx.commit().await?;
            Ok(session)
        }

        async fn abort_assembly(
            &self,
            session_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE upload_sessions SET status = 'uploading', updated_at = ? WHERE session_id = ? AND status = 'assembling'",
            )
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn complete_session(
            &self,
            session_id: Uuid,
            storage_location: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            // The reservation already counts the bytes; completion only
            // clears the flag so no later release can credit them back.
            let owner: Option<Uuid> = sqlx::query_scalar(
                r#"
                UPDATE upload_sessions
                SET status = 'completed', storage_location = ?, completed_at = ?,
                    updated_at = ?, quota_reserved = 0, error_message = NULL
                WHERE session_id = ? AND status = 'assembling'
                RETURNING owner_id
                "#,
            )
            .bind(storage_location)
            .bind(now)
            .bind(now)
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(owner_id) = owner else {
                tx.rollback().await?;
                return Ok(false);
            };

            sqlx::query(
                "UPDATE user_quotas SET upload_count = upload_count + 1, updated_at = ? WHERE owner_id = ?",
            )
            .bind(now)
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(true)
        }

        async fn fail_session(
            &self,
            session_id: Uuid,
            error_message: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<ReleaseOutcome> {
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE upload_sessions SET status = 'failed', error_message = ?, updated_at = ?
                WHERE session_id = ? AND status = 'assembling'
                "#,
            )
            .bind(error_message)
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

            let transitioned = result.rows_affected() > 0;
            let released_bytes = if transitioned {
                release_reservation(&mut tx, session_id, now).await?
            } else {
                0
            };

            tx.commit().await?;
            Ok(ReleaseOutcome {
                transitioned,
                released_bytes,
            })
        }

        async fn cancel_session(
            &self,
            session_id: Uuid,
            reason: Option<&str>,
            now: OffsetDateTime,
        ) -> MetadataResult<ReleaseOutcome> {
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET status = 'cancelled', error_message = COALESCE(?, error_message), updated_at = ?
                WHERE session_id = ? AND status IN ('pending', 'uploading', 'assembling')
                "#,
            )
            .bind(reason)
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

            let transitioned = result.rows_affected() > 0;
            let released_bytes = if transitioned {
                release_reservation(&mut tx, session_id, now).await?
            } else {
                0
            };

            tx.commit().await?;
            Ok(ReleaseOutcome {
                transitioned,
                released_bytes,
            })
        }

        async fn expire_session(
            &self,
            session_id: Uuid,
            reason: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<ReleaseOutcome> {
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE upload_sessions SET status = 'cancelled', error_message = ?, updated_at = ?
                WHERE session_id = ?
                  AND status NOT IN ('completed', 'cancelled')
                  AND expires_at < ?
                "#,
            )
            .bind(reason)
            .bind(now)
            .bind(session_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let transitioned = result.rows_affected() > 0;
            let released_bytes = if transitioned {
                release_reservation(&mut tx, session_id, now).await?
            } else {
                0
            };

            tx.commit().await?;
            Ok(ReleaseOutcome {
                transitioned,
                released_bytes,
            })
        }

        async fn get_expired_sessions(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                r#"
                SELECT * FROM upload_sessions
                WHERE status NOT IN ('completed', 'cancelled') AND expires_at < ?
                ORDER BY expires_at
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_terminal_sessions_with_chunks(
            &self,
            older_than: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                r#"
                SELECT s.* FROM upload_sessions s
                WHERE s.status IN ('cancelled', 'failed')
                  AND s.updated_at < ?
                  AND EXISTS (SELECT 1 FROM upload_chunks c WHERE c.session_id = s.session_id)
                ORDER BY s.updated_at
                LIMIT ?
                "#,
            )
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_terminal_sessions(
            &self,
            older_than: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<u64> {
            let started = Instant::now();
            let result = sqlx::query(
                r#"
                DELETE FROM upload_sessions WHERE session_id IN (
                    SELECT session_id FROM upload_sessions
                    WHERE status IN ('cancelled', 'failed') AND updated_at < ?
                    ORDER BY updated_at
                    LIMIT ?
                )
                "#,
            )
            .bind(older_than)
            .bind(limit)
            .execute(&self.pool)
            .await?;
            self.warn_if_slow("delete_terminal_sessions", started);
            Ok(result.rows_affected())
        }

        async fn count_active_sessions(&self) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM upload_sessions WHERE status IN ('pending', 'uploading', 'assembling')",
            )
            .fetch_one(&self.pool)
            .await?;
            to_u64(count, "count")
        }
    }

    #[async_trait]
    impl ChunkRepo for SqliteStore {
        async fn record_chunk(
            &self,
            chunk: &UploadChunkRow,
            now: OffsetDateTime,
        ) -> MetadataResult<RecordedChunk> {
            let mut tx = self.pool.begin().await?;

            // The guard and the upsert share the transaction, so a sweep that
            // cancels the session first makes this write fail.
            let open = sqlx::query(
                r#"
                UPDATE upload_sessions SET status = 'uploading', updated_at = ?
                WHERE session_id = ? AND status IN ('pending', 'uploading') AND expires_at > ?
                "#,
            )
            .bind(now)
            .bind(chunk.session_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if open.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(MetadataError::SessionClosed(chunk.session_id.to_string()));
            }

            let replaced: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM upload_chunks WHERE session_id = ? AND chunk_number = ?)",
            )
            .bind(chunk.session_id)
            .bind(chunk.chunk_number)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO upload_chunks (
                    chunk_id, session_id, chunk_number, size_bytes, object_key, uploaded_at
                ) VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(session_id, chunk_number) DO UPDATE SET
                    size_bytes = excluded.size_bytes,
                    object_key = excluded.object_key,
                    uploaded_at = excluded.uploaded_at
                "#,
            )
            .bind(chunk.chunk_id)
            .bind(chunk.session_id)
            .bind(chunk.chunk_number)
            .bind(chunk.size_bytes)
            .bind(&chunk.object_key)
            .bind(chunk.uploaded_at)
            .execute(&mut *tx)
            .await?;

            let chunks_uploaded: i64 = sqlx::query_scalar(
                r#"
                UPDATE upload_sessions
                SET chunks_uploaded = (SELECT COUNT(*) FROM upload_chunks WHERE session_id = ?)
                WHERE session_id = ?
                RETURNING chunks_uploaded
                "#,
            )
            .bind(chunk.session_id)
            .bind(chunk.session_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(RecordedChunk {
                chunks_uploaded: to_u32(chunks_uploaded, "chunks_uploaded")?,
                replaced,
            })
        }

        async fn get_chunk(
            &self,
            session_id: Uuid,
            chunk_number: u32,
        ) -> MetadataResult<Option<UploadChunkRow>> {
            let row = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks WHERE session_id = ? AND chunk_number = ?",
            )
            .bind(session_id)
            .bind(chunk_number)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_chunks(&self, session_id: Uuid) -> MetadataResult<Vec<UploadChunkRow>> {
            let rows = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks WHERE session_id = ? ORDER BY chunk_number",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_chunk_numbers(&self, session_id: Uuid) -> MetadataResult<Vec<u32>> {
            let numbers: Vec<i64> = sqlx::query_scalar(
                "SELECT chunk_number FROM upload_chunks WHERE session_id = ? ORDER BY chunk_number",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
            numbers
                .into_iter()
                .map(|n| to_u32(n, "chunk_number"))
                .collect()
        }

        async fn delete_chunks_for_session(&self, session_id: Uuid) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
                .bind(session_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl QuotaRepo for SqliteStore {
        async fn get_quota(&self, owner_id: Uuid) -> MetadataResult<Option<UserQuotaRow>> {
            let row =
                sqlx::query_as::<_, UserQuotaRow>("SELECT * FROM user_quotas WHERE owner_id = ?")
                    .bind(owner_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn ensure_quota(
            &self,
            owner_id: Uuid,
            default_limit_bytes: u64,
            now: OffsetDateTime,
        ) -> MetadataResult<UserQuotaRow> {
            sqlx::query(
                r#"
                INSERT INTO user_quotas (
                    owner_id, storage_used_bytes, storage_limit_bytes, upload_count,
                    created_at, updated_at
                ) VALUES (?, 0, ?, 0, ?, ?)
                ON CONFLICT(owner_id) DO NOTHING
                "#,
            )
            .bind(owner_id)
            .bind(to_i64(default_limit_bytes, "default_limit_bytes")?)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

            let row =
                sqlx::query_as::<_, UserQuotaRow>("SELECT * FROM user_quotas WHERE owner_id = ?")
                    .bind(owner_id)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn set_quota_limit(
            &self,
            owner_id: Uuid,
            limit_bytes: u64,
            now: OffsetDateTime,
        ) -> MetadataResult<UserQuotaRow> {
            let row = sqlx::query_as::<_, UserQuotaRow>(
                r#"
                INSERT INTO user_quotas (
                    owner_id, storage_used_bytes, storage_limit_bytes, upload_count,
                    created_at, updated_at
                ) VALUES (?, 0, ?, 0, ?, ?)
                ON CONFLICT(owner_id) DO UPDATE SET
                    storage_limit_bytes = excluded.storage_limit_bytes,
                    updated_at = excluded.updated_at
                RETURNING *
                "#,
            )
            .bind(owner_id)
            .bind(to_i64(limit_bytes, "limit_bytes")?)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_quota_owners(
            &self,
            after: Option<Uuid>,
            limit: u32,
        ) -> MetadataResult<Vec<Uuid>> {
            let owners: Vec<Uuid> = match after {
                Some(after) => {
                    sqlx::query_scalar(
                        "SELECT owner_id FROM user_quotas WHERE owner_id > ? ORDER BY owner_id LIMIT ?",
                    )
                    .bind(after)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_scalar("SELECT owner_id FROM user_quotas ORDER BY owner_id LIMIT ?")
                        .bind(limit)
                        .fetch_all(&self.pool)
                        .await?
                }
            };
            Ok(owners)
        }

        async fn reconcile_quota(
            &self,
            owner_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<ReconciledQuota> {
            let started = Instant::now();
            let mut tx = self.pool.begin().await?;

            let previous: Option<i64> =
                sqlx::query_scalar("SELECT storage_used_bytes FROM user_quotas WHERE owner_id = ?")
                    .bind(owner_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(previous) = previous else {
                tx.rollback().await?;
                return Err(MetadataError::NotFound(format!("quota for owner {owner_id}")));
            };

            let (video_bytes, video_count): (i64, i64) = sqlx::query_as(
                "SELECT COALESCE(SUM(size_bytes), 0), COUNT(*) FROM videos WHERE owner_id = ?",
            )
            .bind(owner_id)
            .fetch_one(&mut *tx)
            .await?;

            let reserved: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(reserved_bytes), 0) FROM upload_sessions WHERE owner_id = ? AND quota_reserved = 1",
            )
            .bind(owner_id)
            .fetch_one(&mut *tx)
            .await?;

            let used = video_bytes.saturating_add(reserved);
            sqlx::query(
                "UPDATE user_quotas SET storage_used_bytes = ?, upload_count = ?, updated_at = ? WHERE owner_id = ?",
            )
            .bind(used)
            .bind(video_count)
            .bind(now)
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            self.warn_if_slow("reconcile_quota", started);

            Ok(ReconciledQuota {
                owner_id,
                previous_used_bytes: to_u64(previous, "storage_used_bytes")?,
                used_bytes: to_u64(used, "storage_used_bytes")?,
                upload_count: to_u64(video_count, "upload_count")?,
            })
        }
    }

    #[async_trait]
    impl VideoRepo for SqliteStore {
        async fn insert_video(&self, video: &VideoRow) -> MetadataResult<VideoRow> {
            sqlx::query(
                r#"
                INSERT INTO videos (
                    video_id, owner_id, share_id, storage_location, size_bytes,
                    mimetype, filename, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(share_id) DO NOTHING
                "#,
            )
            .bind(video.video_id)
            .bind(video.owner_id)
            .bind(&video.share_id)
            .bind(&video.storage_location)
            .bind(video.size_bytes)
            .bind(&video.mimetype)
            .bind(&video.filename)
            .bind(video.created_at)
            .execute(&self.pool)
            .await?;

            let row = sqlx::query_as::<_, VideoRow>("SELECT * FROM videos WHERE share_id = ?")
                .bind(&video.share_id)
                .fetch_one(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_video_by_share_id(&self, share_id: &str) -> MetadataResult<Option<VideoRow>> {
            let row = sqlx::query_as::<_, VideoRow>("SELECT * FROM videos WHERE share_id = ?")
                .bind(share_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn video_totals(&self, owner_id: Uuid) -> MetadataResult<(u64, u64)> {
            let (bytes, count): (i64, i64) = sqlx::query_as(
                "SELECT COALESCE(SUM(size_bytes), 0), COUNT(*) FROM videos WHERE owner_id = ?",
            )
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
            Ok((to_u64(bytes, "size_bytes")?, to_u64(count, "count")?))
        }
    }

    #[async_trait]
    impl TokenRepo for SqliteStore {
        async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO tokens (
                    token_id, owner_id, token_hash, scopes, expires_at,
                    revoked_at, created_at, last_used_at, description
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(token.token_id)
            .bind(token.owner_id)
            .bind(&token.token_hash)
            .bind(&token.scopes)
            .bind(token.expires_at)
            .bind(token.revoked_at)
            .bind(token.created_at)
            .bind(token.last_used_at)
            .bind(&token.description)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e, "tokens") => Err(MetadataError::AlreadyExists(
                    format!("token {}", token.token_id),
                )),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_id = ?")
                .bind(token_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query("UPDATE tokens SET last_used_at = ? WHERE token_id = ?")
                .bind(used_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn revoke_token(
            &self,
            token_id: Uuid,
            revoked_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query("UPDATE tokens SET revoked_at = ? WHERE token_id = ? AND revoked_at IS NULL")
                .bind(revoked_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn list_tokens_for_owner(&self, owner_id: Uuid) -> MetadataResult<Vec<TokenRow>> {
            let rows = sqlx::query_as::<_, TokenRow>(
                "SELECT * FROM tokens WHERE owner_id = ? ORDER BY created_at DESC",
            )
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl BootstrapRepo for SqliteStore {
        async fn get_bootstrap_token_id(&self) -> MetadataResult<Option<Uuid>> {
            let value: Option<Option<String>> =
                sqlx::query_scalar("SELECT bootstrap_token_id FROM bootstrap_state WHERE id = 1")
                    .fetch_optional(&self.pool)
                    .await?;
            value
                .flatten()
                .filter(|id| !id.is_empty())
                .map(|id| {
                    Uuid::parse_str(&id).map_err(|e| {
                        MetadataError::Internal(format!(
                            "invalid bootstrap_token_id uuid '{id}': {e}"
                        ))
                    })
                })
                .transpose()
        }

        async fn set_bootstrap_token_id(&self, token_id: Uuid) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO bootstrap_state (id, bootstrap_token_id)
                VALUES (1, ?)
                ON CONFLICT(id) DO UPDATE
                SET bootstrap_token_id = excluded.bootstrap_token_id
                "#,
            )
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn clear_bootstrap_token_id(&self) -> MetadataResult<()> {
            sqlx::query("UPDATE bootstrap_state SET bootstrap_token_id = NULL WHERE id = 1")
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl JobRepo for SqliteStore {
        async fn create_job(&self, job: &MaintenanceJobRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO maintenance_jobs (job_id, job_type, state, started_at, finished_at, stats_json)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job.job_id)
            .bind(&job.job_type)
            .bind(&job.state)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(&job.stats_json)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<MaintenanceJobRow>> {
            let row = sqlx::query_as::<_, MaintenanceJobRow>(
                "SELECT * FROM maintenance_jobs WHERE job_id = ?",
            )
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn update_job_state(
            &self,
            job_id: Uuid,
            state: &str,
            finished_at: Option<OffsetDateTime>,
            stats_json: Option<&str>,
        ) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE maintenance_jobs SET state = ?, finished_at = ?, stats_json = ? WHERE job_id = ?",
            )
            .bind(state)
            .bind(finished_at)
            .bind(stats_json)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_recent_jobs(&self, limit: u32) -> MetadataResult<Vec<MaintenanceJobRow>> {
            let rows = sqlx::query_as::<_, MaintenanceJobRow>(
                "SELECT * FROM maintenance_jobs ORDER BY started_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn fail_orphaned_jobs(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query(
                "UPDATE maintenance_jobs SET state = 'failed', finished_at = ? WHERE state = 'running'",
            )
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Per-owner quota ledger
CREATE TABLE IF NOT EXISTS user_quotas (
    owner_id BLOB PRIMARY KEY,
    storage_used_bytes INTEGER NOT NULL DEFAULT 0 CHECK (storage_used_bytes >= 0),
    storage_limit_bytes INTEGER NOT NULL CHECK (storage_limit_bytes >= 0),
    upload_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Upload sessions
CREATE TABLE IF NOT EXISTS upload_sessions (
    session_id BLOB PRIMARY KEY,
    owner_id BLOB NOT NULL,
    filename TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    mimetype TEXT NOT NULL,
    total_chunks INTEGER NOT NULL,
    chunks_uploaded INTEGER NOT NULL DEFAULT 0,
    storage_location TEXT,
    share_id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'pending',
    quota_reserved INTEGER NOT NULL DEFAULT 0,
    reserved_bytes INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    completed_at TEXT,
    error_message TEXT,
    CHECK (chunks_uploaded <= total_chunks)
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_status_expiry ON upload_sessions(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_status_updated ON upload_sessions(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_owner_reserved ON upload_sessions(owner_id, quota_reserved);

-- Upload chunks: one row per (session, chunk number); a re-upload overwrites
CREATE TABLE IF NOT EXISTS upload_chunks (
    chunk_id BLOB PRIMARY KEY,
    session_id BLOB NOT NULL,
    chunk_number INTEGER NOT NULL CHECK (chunk_number >= 0),
    size_bytes INTEGER NOT NULL,
    object_key TEXT NOT NULL,
    uploaded_at TEXT NOT NULL,
    UNIQUE (session_id, chunk_number),
    FOREIGN KEY (session_id) REFERENCES upload_sessions(session_id) ON DELETE CASCADE
);

-- Completed videos; authoritative input of quota reconciliation
CREATE TABLE IF NOT EXISTS videos (
    video_id BLOB PRIMARY KEY,
    owner_id BLOB NOT NULL,
    share_id TEXT NOT NULL UNIQUE,
    storage_location TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    mimetype TEXT NOT NULL,
    filename TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_videos_owner ON videos(owner_id);

-- Tokens
CREATE TABLE IF NOT EXISTS tokens (
    token_id BLOB PRIMARY KEY,
    owner_id BLOB NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    scopes TEXT NOT NULL,
    expires_at TEXT,
    revoked_at TEXT,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    description TEXT
);
CREATE INDEX IF NOT EXISTS idx_tokens_owner ON tokens(owner_id);

-- Bootstrap admin token marker
CREATE TABLE IF NOT EXISTS bootstrap_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    bootstrap_token_id TEXT
);

-- Maintenance job log
CREATE TABLE IF NOT EXISTS maintenance_jobs (
    job_id BLOB PRIMARY KEY,
    job_type TEXT NOT NULL,
    state TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    stats_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_maintenance_jobs_started ON maintenance_jobs(started_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{UploadChunkRow, UploadSessionRow, VideoRow};
    use crate::repos::ReleaseOutcome;
    use reel_core::{SessionStatus, UploadSession, chunk_object_key};
    use std::sync::Arc;
    use time::OffsetDateTime;
    use uuid::Uuid;

    const MIB: u64 = 1024 * 1024;

    async fn test_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db"), None)
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    fn new_session(owner: Uuid, size: u64, chunks: u32) -> UploadSession {
        UploadSession::new(
            owner,
            "clip.mp4",
            size,
            "video/mp4",
            chunks,
            time::Duration::hours(24),
        )
    }

    async fn start(store: &SqliteStore, session: &UploadSession, limit: u64) -> MetadataResult<()> {
        let row = UploadSessionRow::from_session(session).unwrap();
        store.create_session_with_reservation(&row, limit).await
    }

    async fn record(store: &SqliteStore, session: &UploadSession, n: u32, size: u64) -> RecordedChunkOut {
        let chunk = UploadChunkRow::new(
            &session.id,
            n,
            size,
            chunk_object_key(&session.id, n),
            OffsetDateTime::now_utc(),
        )
        .unwrap();
        store.record_chunk(&chunk, OffsetDateTime::now_utc()).await
    }

    type RecordedChunkOut = MetadataResult<crate::repos::RecordedChunk>;

    async fn used_bytes(store: &SqliteStore, owner: Uuid) -> u64 {
        store
            .get_quota(owner)
            .await
            .unwrap()
            .unwrap()
            .into_quota()
            .unwrap()
            .storage_used_bytes
    }

    #[tokio::test]
    async fn test_reservation_rejected_over_limit_creates_nothing() {
        let (_dir, store) = test_store().await;
        let owner = Uuid::new_v4();
        let session = new_session(owner, 600 * MIB, 120);

        let err = start(&store, &session, 512 * MIB).await.unwrap_err();
        assert!(matches!(
            err,
            MetadataError::QuotaExceeded { requested, remaining }
                if requested == 600 * MIB && remaining == 512 * MIB
        ));
        assert!(
            store
                .get_session(*session.id.as_uuid())
                .await
                .unwrap()
                .is_none()
        );
        // The quota row created on first use is rolled back with the session.
        assert!(store.get_quota(owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_exceed_limit() {
        let (_dir, store) = test_store().await;
        let owner = Uuid::new_v4();
        let a = new_session(owner, 300 * MIB, 60);
        let b = new_session(owner, 300 * MIB, 60);

        let (ra, rb) = tokio::join!(start(&store, &a, 512 * MIB), start(&store, &b, 512 * MIB));
        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
        assert_eq!(used_bytes(&store, owner).await, 300 * MIB);
    }

    #[tokio::test]
    async fn test_record_chunk_is_idempotent() {
        let (_dir, store) = test_store().await;
        let session = new_session(Uuid::new_v4(), 30, 3);
        start(&store, &session, 1024).await.unwrap();

        let first = record(&store, &session, 1, 10).await.unwrap();
        assert_eq!(first.chunks_uploaded, 1);
        assert!(!first.replaced);

        let again = record(&store, &session, 1, 9).await.unwrap();
        assert_eq!(again.chunks_uploaded, 1);
        assert!(again.replaced);

        let chunk = store
            .get_chunk(*session.id.as_uuid(), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.size().unwrap(), 9);

        record(&store, &session, 0, 10).await.unwrap();
        assert_eq!(
            store.get_chunk_numbers(*session.id.as_uuid()).await.unwrap(),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn test_double_expire_releases_once() {
        let (_dir, store) = test_store().await;
        let owner = Uuid::new_v4();
        let mut session = new_session(owner, 50 * MIB, 10);
        session.expires_at = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        start(&store, &session, 512 * MIB).await.unwrap();
        assert_eq!(used_bytes(&store, owner).await, 50 * MIB);

        let now = OffsetDateTime::now_utc();
        let id = *session.id.as_uuid();
        let (a, b) = tokio::join!(
            store.expire_session(id, reel_core::SESSION_EXPIRED_REASON, now),
            store.expire_session(id, reel_core::SESSION_EXPIRED_REASON, now)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.transitioned as u8 + b.transitioned as u8, 1);
        assert_eq!(a.released_bytes + b.released_bytes, 50 * MIB);
        assert_eq!(used_bytes(&store, owner).await, 0);

        let row = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(row.status, "cancelled");
        assert_eq!(row.error_message.as_deref(), Some("Session expired"));

        // A chunk arriving after the sweep is refused.
        let err = record(&store, &session, 2, 5 * MIB).await.unwrap_err();
        assert!(matches!(err, MetadataError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_assembly_completion_keeps_usage() {
        let (_dir, store) = test_store().await;
        let owner = Uuid::new_v4();
        let session = new_session(owner, 20, 2);
        let id = *session.id.as_uuid();
        start(&store, &session, 100).await.unwrap();

        // Not every chunk is in yet.
        record(&store, &session, 0, 10).await.unwrap();
        let row = store
            .begin_assembly(id, OffsetDateTime::now_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "uploading");

        record(&store, &session, 1, 10).await.unwrap();
        let row = store
            .begin_assembly(id, OffsetDateTime::now_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "assembling");

        // Chunks are refused while assembling.
        assert!(record(&store, &session, 1, 10).await.is_err());

        assert!(
            store
                .complete_session(id, "videos/x/y", OffsetDateTime::now_utc())
                .await
                .unwrap()
        );
        let done = store.get_session(id).await.unwrap().unwrap().into_session().unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(!done.quota_reserved);
        assert!(done.completed_at.is_some());

        let quota = store.get_quota(owner).await.unwrap().unwrap().into_quota().unwrap();
        assert_eq!(quota.storage_used_bytes, 20);
        assert_eq!(quota.upload_count, 1);

        // Cancelling a completed session changes nothing.
        let outcome = store
            .cancel_session(id, None, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::default());
        assert_eq!(used_bytes(&store, owner).await, 20);
    }

    #[tokio::test]
    async fn test_fail_and_cancel_release_reservation() {
        let (_dir, store) = test_store().await;
        let owner = Uuid::new_v4();
        let failing = new_session(owner, 10, 1);
        let cancelled = new_session(owner, 40, 4);
        start(&store, &failing, 100).await.unwrap();
        start(&store, &cancelled, 100).await.unwrap();
        assert_eq!(used_bytes(&store, owner).await, 50);

        record(&store, &failing, 0, 9).await.unwrap();
        let now = OffsetDateTime::now_utc();
        store
            .begin_assembly(*failing.id.as_uuid(), now)
            .await
            .unwrap();
        let outcome = store
            .fail_session(*failing.id.as_uuid(), "size mismatch", now)
            .await
            .unwrap();
        assert!(outcome.transitioned);
        assert_eq!(outcome.released_bytes, 10);

        let outcome = store
            .cancel_session(*cancelled.id.as_uuid(), None, now)
            .await
            .unwrap();
        assert_eq!(outcome.released_bytes, 40);
        let again = store
            .cancel_session(*cancelled.id.as_uuid(), None, now)
            .await
            .unwrap();
        assert!(!again.transitioned);
        assert_eq!(used_bytes(&store, owner).await, 0);
    }

    #[tokio::test]
    async fn test_reconcile_corrects_drift() {
        let (_dir, store) = test_store().await;
        let owner = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        store.set_quota_limit(owner, 1000, now).await.unwrap();

        let share = reel_core::ShareId::generate();
        let video = VideoRow::new(
            owner,
            &share,
            "videos/a".to_string(),
            300,
            "video/mp4".to_string(),
            "a.mp4".to_string(),
            now,
        )
        .unwrap();
        store.insert_video(&video).await.unwrap();
        // Same share id again is a no-op.
        let again = store.insert_video(&video).await.unwrap();
        assert_eq!(again.video_id, video.video_id);

        let in_flight = new_session(owner, 100, 1);
        start(&store, &in_flight, 1000).await.unwrap();

        let reconciled = store.reconcile_quota(owner, now).await.unwrap();
        assert_eq!(reconciled.previous_used_bytes, 100);
        assert_eq!(reconciled.used_bytes, 400);
        assert_eq!(reconciled.upload_count, 1);
        assert!(reconciled.drifted());

        store
            .cancel_session(*in_flight.id.as_uuid(), None, now)
            .await
            .unwrap();
        let reconciled = store.reconcile_quota(owner, now).await.unwrap();
        assert_eq!(reconciled.used_bytes, 300);
        assert!(!reconciled.drifted());
        assert_eq!(store.video_totals(owner).await.unwrap(), (300, 1));
    }

    #[tokio::test]
    async fn test_terminal_session_gc() {
        let (_dir, store) = test_store().await;
        let session = new_session(Uuid::new_v4(), 20, 2);
        let id = *session.id.as_uuid();
        start(&store, &session, 100).await.unwrap();
        record(&store, &session, 0, 10).await.unwrap();
        store
            .cancel_session(id, Some("user"), OffsetDateTime::now_utc())
            .await
            .unwrap();

        let future = OffsetDateTime::now_utc() + time::Duration::days(2);
        let with_chunks = store
            .get_terminal_sessions_with_chunks(future, 10)
            .await
            .unwrap();
        assert_eq!(with_chunks.len(), 1);
        assert_eq!(store.delete_chunks_for_session(id).await.unwrap(), 1);
        assert!(
            store
                .get_terminal_sessions_with_chunks(future, 10)
                .await
                .unwrap()
                .is_empty()
        );

        let past = OffsetDateTime::now_utc() - time::Duration::days(7);
        assert_eq!(store.delete_terminal_sessions(past, 10).await.unwrap(), 0);
        assert_eq!(store.delete_terminal_sessions(future, 10).await.unwrap(), 1);
        assert!(store.get_session(id).await.unwrap().is_none());
    }
}
