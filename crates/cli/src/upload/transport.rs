//! Chunk delivery strategies.
//!
//! A chunk reaches storage either directly, through a pre-signed target
//! followed by a notify call, or proxied through the server. Which one a
//! server supports is learned at runtime: the first target request that
//! answers 501 switches the client to the proxied path for good. Any other
//! direct failure falls back to the proxied path for that chunk only.

use crate::api_client::UploadApi;
use crate::error::ClientResult;
use async_trait::async_trait;
use bytes::Bytes;
use reel_core::session::{ChunkAcceptedResponse, NotifyChunkRequest};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Delivers one chunk of a session.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn send(
        &self,
        api: &dyn UploadApi,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> ClientResult<ChunkAcceptedResponse>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Pre-signed write straight to storage, then notify the server.
pub struct DirectTransport;

#[async_trait]
impl ChunkTransport for DirectTransport {
    async fn send(
        &self,
        api: &dyn UploadApi,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> ClientResult<ChunkAcceptedResponse> {
        let target = api.chunk_target(session_id, chunk_number).await?;
        let size = data.len() as u64;
        api.put_to_target(&target, data).await?;
        api.notify_chunk(
            session_id,
            chunk_number,
            &NotifyChunkRequest {
                object_key: target.object_key,
                size,
            },
        )
        .await
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// Chunk bytes sent through the server.
pub struct ProxiedTransport;

#[async_trait]
impl ChunkTransport for ProxiedTransport {
    async fn send(
        &self,
        api: &dyn UploadApi,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> ClientResult<ChunkAcceptedResponse> {
        api.put_chunk(session_id, chunk_number, data).await
    }

    fn name(&self) -> &'static str {
        "proxied"
    }
}

/// Direct first, proxied when a direct write fails. A 501 rules the direct
/// path out for the rest of the run.
#[derive(Default)]
pub struct FallbackTransport {
    direct_unavailable: AtomicBool,
}

impl FallbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the direct path has been ruled out.
    pub fn is_proxied(&self) -> bool {
        self.direct_unavailable.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChunkTransport for FallbackTransport {
    async fn send(
        &self,
        api: &dyn UploadApi,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> ClientResult<ChunkAcceptedResponse> {
        if !self.is_proxied() {
            match DirectTransport
                .send(api, session_id, chunk_number, data.clone())
                .await
            {
                Ok(accepted) => return Ok(accepted),
                Err(e) if e.is_direct_unavailable() => {
                    tracing::info!(error = %e, "Direct uploads unavailable, proxying chunks");
                    self.direct_unavailable.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::debug!(
                        session_id,
                        chunk_number,
                        error = %e,
                        "Direct chunk write failed, proxying"
                    );
                }
            }
        }
        ProxiedTransport
            .send(api, session_id, chunk_number, data)
            .await
    }

    fn name(&self) -> &'static str {
        if self.is_proxied() { "proxied" } else { "direct" }
    }
}

/// Configured delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Direct when the server supports it, proxied otherwise.
    #[default]
    Auto,
    Direct,
    Proxied,
}

impl TransportMode {
    pub fn build(self) -> Box<dyn ChunkTransport> {
        match self {
            Self::Auto => Box::new(FallbackTransport::new()),
            Self::Direct => Box::new(DirectTransport),
            Self::Proxied => Box::new(ProxiedTransport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::testing::FakeApi;

    #[tokio::test]
    async fn test_fallback_remembers_unavailable_direct_path() {
        let api = FakeApi::new();
        api.set_direct_supported(false);
        let session_id = api.open_session(300, 3);

        let transport = FallbackTransport::new();
        assert_eq!(transport.name(), "direct");

        for n in 0..3 {
            let accepted = transport
                .send(&api, &session_id, n, Bytes::from(vec![n as u8; 100]))
                .await
                .unwrap();
            assert_eq!(accepted.chunks_uploaded, n + 1);
        }

        assert!(transport.is_proxied());
        // Only the first chunk probed for a target.
        assert_eq!(api.count_calls("target"), 1);
        assert_eq!(api.count_calls("put_chunk"), 3);
    }

    #[tokio::test]
    async fn test_fallback_uses_direct_path_when_available() {
        let api = FakeApi::new();
        let session_id = api.open_session(200, 2);

        let transport = FallbackTransport::new();
        for n in 0..2 {
            transport
                .send(&api, &session_id, n, Bytes::from(vec![0u8; 100]))
                .await
                .unwrap();
        }

        assert!(!transport.is_proxied());
        assert_eq!(api.count_calls("put_target"), 2);
        assert_eq!(api.count_calls("notify"), 2);
        assert_eq!(api.count_calls("put_chunk"), 0);
    }

    #[tokio::test]
    async fn test_direct_mode_surfaces_unavailable() {
        let api = FakeApi::new();
        api.set_direct_supported(false);
        let session_id = api.open_session(100, 1);

        let err = TransportMode::Direct
            .build()
            .send(&api, &session_id, 0, Bytes::from(vec![0u8; 100]))
            .await
            .unwrap_err();
        assert!(err.is_direct_unavailable());
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_failed_direct_write_is_proxied_in_the_same_call() {
        let api = FakeApi::new();
        api.fail_chunk(1, 1);
        let session_id = api.open_session(200, 2);

        let transport = FallbackTransport::new();
        let accepted = transport
            .send(&api, &session_id, 1, Bytes::from(vec![1u8; 100]))
            .await
            .unwrap();

        assert_eq!(accepted.chunk_number, 1);
        assert_eq!(api.count_calls("put_target"), 1);
        assert_eq!(api.count_calls("notify"), 0);
        assert_eq!(api.count_calls("put_chunk"), 1);
        assert_eq!(api.session(&session_id).chunks.len(), 1);
        // A storage failure does not rule the direct path out.
        assert!(!transport.is_proxied());

        transport
            .send(&api, &session_id, 0, Bytes::from(vec![0u8; 100]))
            .await
            .unwrap();
        assert_eq!(api.count_calls("put_target"), 2);
        assert_eq!(api.count_calls("notify"), 1);
        assert_eq!(api.count_calls("put_chunk"), 1);
    }
}
