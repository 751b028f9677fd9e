//! The upload client driven against a real server router over loopback.

use bytes::Bytes;
use reel_cli::api_client::{ApiClient, UploadApi};
use reel_cli::upload::progress::{ProgressTracker, UploadState};
use reel_cli::upload::resume::{ResumeCache, ResumeEntry};
use reel_cli::upload::retry::RetryPolicy;
use reel_cli::upload::transport::TransportMode;
use reel_cli::upload::{UploadOrchestrator, UploadSettings, UploadSource};
use reel_core::SessionStatus;
use reel_core::config::{AppConfig, MetadataConfig, StorageConfig};
use reel_core::session::StartSessionRequest;
use reel_core::token::CreateTokenRequest;
use reel_metadata::{MetadataStore, SqliteStore};
use reel_server::bootstrap::ensure_admin_token;
use reel_server::{AppState, create_router};
use reel_storage::{FilesystemBackend, ObjectStore};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ADMIN_TOKEN: &str = "test-admin-token";

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

struct LiveServer {
    base_url: String,
    state: AppState,
    _temp_dir: TempDir,
}

impl LiveServer {
    async fn start() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).unwrap();
        let storage: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(&storage_path).await.unwrap());
        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(&db_path, None).await.unwrap());

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem { path: storage_path };
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };
        ensure_admin_token(metadata.as_ref(), &config.admin)
            .await
            .unwrap();

        let state = AppState::new(config, storage, metadata);
        let router = create_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });

        Self {
            base_url: format!("http://{addr}"),
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Mint an upload token through the admin API.
    async fn user_client(&self) -> ApiClient {
        let admin = ApiClient::new(&self.base_url, ADMIN_TOKEN).unwrap();
        let minted = admin
            .create_token(&CreateTokenRequest {
                description: Some("contract test".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        ApiClient::new(&self.base_url, &minted.token_secret).unwrap()
    }
}

fn settings() -> UploadSettings {
    UploadSettings {
        chunk_size: 100,
        chunked_threshold: 50,
        retry: RetryPolicy::new(Duration::from_millis(1)),
    }
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

#[tokio::test]
async fn chunked_upload_is_assembled_by_the_server() {
    if !can_bind_localhost() {
        eprintln!("Skipping loopback tests: cannot bind to localhost");
        return;
    }

    let server = LiveServer::start().await;
    let client = Arc::new(server.user_client().await);
    // Filesystem storage answers 501 for targets, so chunks are proxied.
    let orchestrator = UploadOrchestrator::new(
        client.clone(),
        TransportMode::Auto.build(),
        ResumeCache::in_memory(),
        ProgressTracker::new(Duration::from_millis(5)),
        settings(),
    );

    // Ten chunks with a short last one.
    let data = payload(950);
    let source = UploadSource::from_bytes("trip.mp4", "video/mp4", data.clone());
    let done = orchestrator
        .upload(&source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.size, 950);
    assert_eq!(
        orchestrator.progress().get("trip.mp4").unwrap().state,
        UploadState::Completed
    );

    let status = client.session_status(&done.session_id).await.unwrap();
    assert_eq!(status.total_chunks, 10);
    assert_eq!(status.uploaded_chunks, (0..10).collect::<Vec<_>>());

    let video = server
        .state
        .metadata
        .get_video_by_share_id(&done.share_id)
        .await
        .unwrap()
        .expect("video recorded");
    let stored = server.state.storage.get(&video.storage_location).await.unwrap();
    assert_eq!(stored, data);

    let quota = client.get_quota().await.unwrap();
    assert_eq!(quota.storage_used_bytes, 950);
}

#[tokio::test]
async fn interrupted_upload_resumes_against_the_server() {
    if !can_bind_localhost() {
        eprintln!("Skipping loopback tests: cannot bind to localhost");
        return;
    }

    let server = LiveServer::start().await;
    let client = Arc::new(server.user_client().await);
    let data = payload(400);

    // A previous run got the first two chunks in before stopping.
    let started = client
        .start_session(&StartSessionRequest {
            filename: "resume.mp4".to_string(),
            file_size: 400,
            mimetype: "video/mp4".to_string(),
            total_chunks: 4,
        })
        .await
        .unwrap();
    let mut entry = ResumeEntry::new(started.session_id.clone(), 400, 4);
    for n in 0..2u32 {
        let start = n as usize * 100;
        client
            .put_chunk(&started.session_id, n, data.slice(start..start + 100))
            .await
            .unwrap();
        entry.uploaded_chunks.insert(n);
    }
    let mut cache = ResumeCache::in_memory();
    cache.insert("resume.mp4", entry).await.unwrap();

    let orchestrator = UploadOrchestrator::new(
        client.clone(),
        TransportMode::Proxied.build(),
        cache,
        ProgressTracker::new(Duration::from_millis(5)),
        settings(),
    );
    let source = UploadSource::from_bytes("resume.mp4", "video/mp4", data.clone());
    let done = orchestrator
        .upload(&source, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(done.session_id, started.session_id);
    assert_eq!(done.size, 400);
    assert!(orchestrator.resume_entry("resume.mp4").await.is_none());

    let video = server
        .state
        .metadata
        .get_video_by_share_id(&done.share_id)
        .await
        .unwrap()
        .expect("video recorded");
    let stored = server.state.storage.get(&video.storage_location).await.unwrap();
    assert_eq!(stored, data);
}
