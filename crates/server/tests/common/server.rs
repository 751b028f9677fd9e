//! Server test utilities.

use super::storage::PresigningStore;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use reel_core::config::{AppConfig, MetadataConfig, StorageConfig};
use reel_metadata::models::TokenRow;
use reel_metadata::{MetadataStore, SqliteStore};
use reel_server::bootstrap::ensure_admin_token;
use reel_server::{AppState, create_router};
use reel_storage::{FilesystemBackend, ObjectStore};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

/// Raw admin token matching `AdminConfig::for_testing()`.
#[allow(dead_code)]
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Which storage backend a test server runs on.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Plain filesystem storage; direct uploads are unavailable.
    Filesystem,
    /// Filesystem storage that also issues direct write targets.
    Presigning,
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(Backend::Filesystem, |_| {}).await
    }

    /// Create a test server with a customized configuration.
    pub async fn with_config<F>(backend: Backend, configure: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        let storage: Arc<dyn ObjectStore> = match backend {
            Backend::Filesystem => Arc::new(
                FilesystemBackend::new(&storage_path)
                    .await
                    .expect("Failed to create storage backend"),
            ),
            Backend::Presigning => Arc::new(
                PresigningStore::new(&storage_path)
                    .await
                    .expect("Failed to create storage backend"),
            ),
        };

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem {
            path: storage_path,
        };
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };
        configure(&mut config);

        ensure_admin_token(metadata.as_ref(), &config.admin)
            .await
            .expect("Failed to bootstrap admin token");

        let state = AppState::new(config, storage, metadata);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Issue a token for a fresh owner, returning the raw secret and the owner.
    pub async fn create_user_token(&self, scopes: &[&str]) -> (String, Uuid) {
        let owner_id = Uuid::new_v4();
        let secret = format!("user-token-{}", Uuid::new_v4());
        self.create_token_for(owner_id, &secret, scopes).await;
        (secret, owner_id)
    }

    /// Insert a token row for an existing owner.
    pub async fn create_token_for(&self, owner_id: Uuid, secret: &str, scopes: &[&str]) {
        let token = TokenRow {
            token_id: Uuid::new_v4(),
            owner_id,
            token_hash: sha256_hash(secret),
            scopes: serde_json::to_string(scopes).expect("Failed to serialize scopes"),
            expires_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
            last_used_at: None,
            description: Some("test token".to_string()),
        };
        self.state
            .metadata
            .create_token(&token)
            .await
            .expect("Failed to create test token");
    }

    /// Send a JSON request and decode the JSON response.
    pub async fn json(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        json_request(&self.router, method, uri, body, token).await
    }

    /// Send a raw byte body and decode the JSON response.
    pub async fn bytes(
        &self,
        method: &str,
        uri: &str,
        body: Bytes,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/octet-stream");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body)).unwrap();
        send(&self.router, request).await
    }

    /// Start a session, asserting it was accepted.
    pub async fn start_session(
        &self,
        token: &str,
        filename: &str,
        file_size: u64,
        total_chunks: u32,
    ) -> String {
        let (status, body) = self
            .json(
                "POST",
                "/v1/sessions",
                Some(serde_json::json!({
                    "filename": filename,
                    "file_size": file_size,
                    "mimetype": "video/mp4",
                    "total_chunks": total_chunks,
                })),
                Some(token),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "start failed: {body}");
        body["session_id"].as_str().unwrap().to_string()
    }

    /// Upload one chunk through the proxied path.
    pub async fn put_chunk(
        &self,
        token: &str,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> (StatusCode, Value) {
        self.bytes(
            "PUT",
            &format!("/v1/sessions/{session_id}/chunks/{chunk_number}"),
            data,
            Some(token),
        )
        .await
    }

    /// Read the caller's quota.
    pub async fn quota(&self, token: &str) -> Value {
        let (status, body) = self.json("GET", "/v1/quota", None, Some(token)).await;
        assert_eq!(status, StatusCode::OK, "quota failed: {body}");
        body
    }
}

/// Send a JSON request to the router.
#[allow(dead_code)]
pub async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    token: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }

    let body = if let Some(json) = body {
        builder = builder.header("Content-Type", "application/json");
        Body::from(serde_json::to_string(&json).unwrap())
    } else {
        Body::empty()
    };

    send(router, builder.body(body).unwrap()).await
}

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

/// Hash a raw token the way the server stores it.
#[allow(dead_code)]
pub fn sha256_hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}
