//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Largest file a single session may declare, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Maximum chunk size in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Maximum number of chunks a session may declare.
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u32,
    /// Upload session lifetime in seconds.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Lifetime of pre-signed chunk targets in seconds.
    #[serde(default = "default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,
}

/// Admin token configuration.
///
/// The admin token is required for server operation. If the token hash
/// changes between restarts, the previous admin token is revoked and a new
/// one is created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Pre-computed hash of the admin token (SHA256 hex, 64 characters).
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
    /// Description for the admin token.
    pub token_description: Option<String>,
}

impl AdminConfig {
    /// Create a test configuration with a dummy token hash.
    ///
    /// **For testing only.** The hash is deterministic but not a real token.
    pub fn for_testing() -> Self {
        Self {
            // SHA256 of "test-admin-token"
            token_hash: "17d6bfe05d1b1fb7bc499f8e3f639c7b3eda4c40f321eef8887a0c04c89a99c5"
                .to_string(),
            token_description: Some("Test admin token".to_string()),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_max_chunk_size() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_max_total_chunks() -> u32 {
    10_000
}

fn default_session_timeout_secs() -> u64 {
    86400 // 24 hours
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_presign_ttl_secs() -> u64 {
    900
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_file_size: default_max_file_size(),
            max_chunk_size: default_max_chunk_size(),
            max_total_chunks: default_max_total_chunks(),
            session_timeout_secs: default_session_timeout_secs(),
            metrics_enabled: default_metrics_enabled(),
            presign_ttl_secs: default_presign_ttl_secs(),
        }
    }
}

impl ServerConfig {
    /// Get the session timeout as a Duration.
    pub fn session_timeout(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.session_timeout_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Get the pre-signed target lifetime as a std::time::Duration.
    pub fn presign_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.presign_ttl_secs)
    }
}

/// Per-user quota configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Limit assigned to users seen for the first time.
    #[serde(default = "default_quota_limit_bytes")]
    pub default_limit_bytes: u64,
}

fn default_quota_limit_bytes() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GiB
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit_bytes: default_quota_limit_bytes(),
        }
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only, slow queries are logged).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Maintenance sweep configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Maximum sessions handled per sweep step.
    #[serde(default = "default_sweep_batch_size")]
    pub batch_size: u32,
    /// Run the sweep on a timer inside the server process.
    #[serde(default = "default_auto_schedule_enabled")]
    pub auto_schedule_enabled: bool,
    /// Seconds between automatic sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub auto_schedule_interval_secs: u64,
    /// How long chunks of cancelled or failed sessions are kept, in seconds.
    #[serde(default = "default_chunk_retention_secs")]
    pub chunk_retention_secs: u64,
    /// How long cancelled or failed session rows are kept, in seconds.
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
    /// Recompute every owner's quota usage as part of the scheduled sweep.
    #[serde(default = "default_reconcile_enabled")]
    pub reconcile_enabled: bool,
}

fn default_sweep_batch_size() -> u32 {
    500
}

fn default_auto_schedule_enabled() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_chunk_retention_secs() -> u64 {
    86400 // 1 day
}

fn default_session_retention_secs() -> u64 {
    604800 // 7 days
}

fn default_reconcile_enabled() -> bool {
    true
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: default_sweep_batch_size(),
            auto_schedule_enabled: default_auto_schedule_enabled(),
            auto_schedule_interval_secs: default_sweep_interval_secs(),
            chunk_retention_secs: default_chunk_retention_secs(),
            session_retention_secs: default_session_retention_secs(),
            reconcile_enabled: default_reconcile_enabled(),
        }
    }
}

impl SweepConfig {
    /// Get the auto schedule interval as a std::time::Duration.
    pub fn auto_schedule_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.auto_schedule_interval_secs)
    }

    pub fn chunk_retention(&self) -> Duration {
        Duration::seconds(i64::try_from(self.chunk_retention_secs).unwrap_or(i64::MAX))
    }

    pub fn session_retention(&self) -> Duration {
        Duration::seconds(i64::try_from(self.session_retention_secs).unwrap_or(i64::MAX))
    }

    /// Validate sweep configuration for settings that would break the scheduler.
    pub fn validate(&self) -> Result<(), String> {
        if self.auto_schedule_enabled && self.auto_schedule_interval_secs == 0 {
            return Err("sweep.auto_schedule_interval_secs cannot be 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("sweep.batch_size cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Quota defaults.
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Admin token configuration (required).
    pub admin: AdminConfig,
    /// Maintenance sweep configuration.
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage, SQLite metadata,
    /// a dummy admin token and no background sweep.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            quota: QuotaConfig::default(),
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            admin: AdminConfig::for_testing(),
            sweep: SweepConfig {
                auto_schedule_enabled: false,
                ..SweepConfig::default()
            },
        }
    }
}
