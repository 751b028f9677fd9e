//! HTTP client for the reel upload API.

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use bytes::Bytes;
use reel_core::quota::{QuotaResponse, SetQuotaRequest};
use reel_core::session::{
    CancelSessionResponse, ChunkAcceptedResponse, ChunkTargetResponse, CompleteSessionResponse,
    NotifyChunkRequest, SessionStatusResponse, StartSessionRequest, StartSessionResponse,
};
use reel_core::token::{CreateTokenRequest, CreateTokenResponse};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Calls the orchestrator makes against the server.
///
/// [`ApiClient`] is the real implementation; tests drive the orchestrator
/// with in-process fakes.
#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn start_session(&self, req: &StartSessionRequest) -> ClientResult<StartSessionResponse>;

    async fn session_status(&self, session_id: &str) -> ClientResult<SessionStatusResponse>;

    /// Ask for a pre-signed write target for one chunk.
    async fn chunk_target(
        &self,
        session_id: &str,
        chunk_number: u32,
    ) -> ClientResult<ChunkTargetResponse>;

    /// Write chunk bytes to a pre-signed target.
    async fn put_to_target(&self, target: &ChunkTargetResponse, data: Bytes) -> ClientResult<()>;

    async fn notify_chunk(
        &self,
        session_id: &str,
        chunk_number: u32,
        req: &NotifyChunkRequest,
    ) -> ClientResult<ChunkAcceptedResponse>;

    /// Send chunk bytes through the server.
    async fn put_chunk(
        &self,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> ClientResult<ChunkAcceptedResponse>;

    async fn complete_session(&self, session_id: &str) -> ClientResult<CompleteSessionResponse>;

    async fn cancel_session(&self, session_id: &str) -> ClientResult<CancelSessionResponse>;

    async fn upload_single(
        &self,
        filename: &str,
        mimetype: &str,
        data: Bytes,
    ) -> ClientResult<CompleteSessionResponse>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str) -> ClientResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::Config(format!("invalid server URL: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> ClientResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::Config(format!("failed to build API URL: {e}")))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> ClientResult<T> {
        let response = req.bearer_auth(&self.token).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ClientError::from_response(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// GET /v1/health, no token required.
    pub async fn health(&self) -> ClientResult<HealthResponse> {
        let url = self.url("/v1/health")?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ClientError::from_response(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn get_quota(&self) -> ClientResult<QuotaResponse> {
        let url = self.url("/v1/quota")?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn create_token(&self, req: &CreateTokenRequest) -> ClientResult<CreateTokenResponse> {
        let url = self.url("/v1/admin/tokens")?;
        self.send_json(self.http.post(url).json(req)).await
    }

    pub async fn trigger_sweep(&self) -> ClientResult<serde_json::Value> {
        let url = self.url("/v1/admin/sweep")?;
        self.send_json(self.http.post(url)).await
    }

    pub async fn trigger_reconcile(&self) -> ClientResult<serde_json::Value> {
        let url = self.url("/v1/admin/reconcile")?;
        self.send_json(self.http.post(url)).await
    }

    pub async fn list_jobs(&self, limit: Option<u32>) -> ClientResult<Vec<JobResponse>> {
        let mut url = self.url("/v1/admin/jobs")?;
        if let Some(limit) = limit {
            url.query_pairs_mut()
                .append_pair("limit", &limit.to_string());
        }
        self.send_json(self.http.get(url)).await
    }

    pub async fn get_user_quota(&self, owner_id: &str) -> ClientResult<QuotaResponse> {
        let url = self.url(&format!("/v1/admin/quotas/{owner_id}"))?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn set_user_quota(&self, owner_id: &str, limit_bytes: u64) -> ClientResult<QuotaResponse> {
        let url = self.url(&format!("/v1/admin/quotas/{owner_id}"))?;
        let req = SetQuotaRequest {
            storage_limit_bytes: limit_bytes,
        };
        self.send_json(self.http.put(url).json(&req)).await
    }
}

#[async_trait]
impl UploadApi for ApiClient {
    async fn start_session(&self, req: &StartSessionRequest) -> ClientResult<StartSessionResponse> {
        let url = self.url("/v1/sessions")?;
        self.send_json(self.http.post(url).json(req)).await
    }

    async fn session_status(&self, session_id: &str) -> ClientResult<SessionStatusResponse> {
        let url = self.url(&format!("/v1/sessions/{session_id}"))?;
        self.send_json(self.http.get(url)).await
    }

    async fn chunk_target(
        &self,
        session_id: &str,
        chunk_number: u32,
    ) -> ClientResult<ChunkTargetResponse> {
        let url = self.url(&format!(
            "/v1/sessions/{session_id}/chunks/{chunk_number}/target"
        ))?;
        self.send_json(self.http.post(url)).await
    }

    async fn put_to_target(&self, target: &ChunkTargetResponse, data: Bytes) -> ClientResult<()> {
        let method = Method::from_bytes(target.method.as_bytes())
            .map_err(|_| ClientError::InvalidResponse(format!("bad method {}", target.method)))?;
        let url = Url::parse(&target.url)
            .map_err(|e| ClientError::InvalidResponse(format!("bad target URL: {e}")))?;

        // The signature covers the target headers; the bearer token must not go to storage.
        let mut req = self.http.request(method, url).body(data);
        for (name, value) in &target.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_response(status, &body));
        }
        Ok(())
    }

    async fn notify_chunk(
        &self,
        session_id: &str,
        chunk_number: u32,
        req: &NotifyChunkRequest,
    ) -> ClientResult<ChunkAcceptedResponse> {
        let url = self.url(&format!(
            "/v1/sessions/{session_id}/chunks/{chunk_number}/notify"
        ))?;
        self.send_json(self.http.post(url).json(req)).await
    }

    async fn put_chunk(
        &self,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> ClientResult<ChunkAcceptedResponse> {
        let url = self.url(&format!("/v1/sessions/{session_id}/chunks/{chunk_number}"))?;
        self.send_json(
            self.http
                .put(url)
                .header("content-type", "application/octet-stream")
                .body(data),
        )
        .await
    }

    async fn complete_session(&self, session_id: &str) -> ClientResult<CompleteSessionResponse> {
        let url = self.url(&format!("/v1/sessions/{session_id}/complete"))?;
        self.send_json(self.http.post(url)).await
    }

    async fn cancel_session(&self, session_id: &str) -> ClientResult<CancelSessionResponse> {
        let url = self.url(&format!("/v1/sessions/{session_id}"))?;
        self.send_json(self.http.delete(url)).await
    }

    async fn upload_single(
        &self,
        filename: &str,
        mimetype: &str,
        data: Bytes,
    ) -> ClientResult<CompleteSessionResponse> {
        let mut url = self.url("/v1/uploads")?;
        url.query_pairs_mut()
            .append_pair("filename", filename)
            .append_pair("mimetype", mimetype);
        self.send_json(
            self.http
                .post(url)
                .header("content-type", "application/octet-stream")
                .body(data),
        )
        .await
    }
}

// =============================================================================
// Response types (mirrored from server handlers)
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
    pub job_type: String,
    pub state: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub stats: Option<serde_json::Value>,
}
