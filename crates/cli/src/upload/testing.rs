//! In-process fake of the upload API for orchestrator tests.

use crate::api_client::UploadApi;
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use bytes::Bytes;
use reel_core::SessionStatus;
use reel_core::session::{
    CancelSessionResponse, ChunkAcceptedResponse, ChunkTargetResponse, CompleteSessionResponse,
    NotifyChunkRequest, SessionStatusResponse, StartSessionRequest, StartSessionResponse,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FakeSession {
    pub filename: String,
    pub file_size: u64,
    pub total_chunks: u32,
    /// Chunk number to stored bytes.
    pub chunks: BTreeMap<u32, Bytes>,
    pub status: SessionStatus,
}

#[derive(Default)]
struct FakeState {
    sessions: BTreeMap<String, FakeSession>,
    next_id: u32,
    direct_unsupported: bool,
    /// Objects written through targets but not yet notified.
    objects: HashMap<String, Bytes>,
    calls: Vec<String>,
    /// (session, chunk number) for every chunk delivery attempt.
    chunk_attempts: Vec<(String, u32)>,
    /// Chunk number to remaining forced failures.
    chunk_failures: HashMap<u32, u32>,
    single_failures: u32,
    complete_failures: u32,
    /// Filenames in the order their upload began.
    started: Vec<String>,
    in_flight: u32,
    max_in_flight: u32,
    delay: Duration,
}

pub struct FakeApi {
    state: Mutex<FakeState>,
}

fn unavailable() -> ClientError {
    ClientError::Api {
        status: 503,
        code: "storage_write_failure".to_string(),
        message: "storage unavailable".to_string(),
    }
}

fn gone() -> ClientError {
    ClientError::Api {
        status: 410,
        code: "session_invalid".to_string(),
        message: "session not found".to_string(),
    }
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_direct_supported(&self, supported: bool) {
        self.lock().direct_unsupported = !supported;
    }

    /// Fail the next `times` deliveries of `chunk_number`, in any session.
    pub fn fail_chunk(&self, chunk_number: u32, times: u32) {
        self.lock().chunk_failures.insert(chunk_number, times);
    }

    pub fn fail_single_uploads(&self, times: u32) {
        self.lock().single_failures = times;
    }

    pub fn fail_completions(&self, times: u32) {
        self.lock().complete_failures = times;
    }

    /// Make every call take this long.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Create an uploading session without going through `start_session`.
    pub fn open_session(&self, file_size: u64, total_chunks: u32) -> String {
        self.insert_session("direct.bin", file_size, total_chunks)
    }

    pub fn session(&self, session_id: &str) -> FakeSession {
        self.lock().sessions[session_id].clone()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    /// Expire a session the way the server's sweep would.
    pub fn expire(&self, session_id: &str) {
        if let Some(session) = self.lock().sessions.get_mut(session_id) {
            session.status = SessionStatus::Cancelled;
        }
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == name).count()
    }

    /// Delivery attempts of chunks in one session.
    pub fn attempts_in(&self, session_id: &str) -> Vec<u32> {
        self.lock()
            .chunk_attempts
            .iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    pub fn max_in_flight(&self) -> u32 {
        self.lock().max_in_flight
    }

    fn insert_session(&self, filename: &str, file_size: u64, total_chunks: u32) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("session-{}", state.next_id);
        state.sessions.insert(
            id.clone(),
            FakeSession {
                filename: filename.to_string(),
                file_size,
                total_chunks,
                chunks: BTreeMap::new(),
                status: SessionStatus::Uploading,
            },
        );
        id
    }

    async fn enter(&self, name: &str) {
        let delay = {
            let mut state = self.lock();
            state.calls.push(name.to_string());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn exit(&self) {
        self.lock().in_flight -= 1;
    }

    fn deliver(
        &self,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> ClientResult<ChunkAcceptedResponse> {
        let mut state = self.lock();
        let session = state.sessions.get_mut(session_id).ok_or_else(gone)?;
        if session.status != SessionStatus::Uploading {
            return Err(gone());
        }
        if chunk_number >= session.total_chunks {
            return Err(ClientError::Api {
                status: 416,
                code: "chunk_out_of_range".to_string(),
                message: format!("chunk {chunk_number} out of range"),
            });
        }
        session.chunks.insert(chunk_number, data);
        Ok(ChunkAcceptedResponse {
            chunk_number,
            chunks_uploaded: session.chunks.len() as u32,
            total_chunks: session.total_chunks,
        })
    }

    /// Count a delivery attempt and apply any forced failure.
    fn attempt(&self, session_id: &str, chunk_number: u32) -> ClientResult<()> {
        let mut state = self.lock();
        state
            .chunk_attempts
            .push((session_id.to_string(), chunk_number));
        if let Some(remaining) = state.chunk_failures.get_mut(&chunk_number)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(unavailable());
        }
        Ok(())
    }

    fn write_object(&self, target: &ChunkTargetResponse, data: Bytes) -> ClientResult<()> {
        // sessions/{session_id}/chunks/{chunk_number}
        let mut parts = target.object_key.split('/');
        let session_id = parts.nth(1).unwrap_or_default().to_string();
        let chunk_number: u32 = parts
            .nth(1)
            .and_then(|n| n.parse().ok())
            .unwrap_or_default();
        self.attempt(&session_id, chunk_number)?;
        self.lock().objects.insert(target.object_key.clone(), data);
        Ok(())
    }

    fn status_of(&self, session_id: &str) -> ClientResult<SessionStatusResponse> {
        let state = self.lock();
        let session = state.sessions.get(session_id).ok_or_else(gone)?;
        Ok(SessionStatusResponse {
            session_id: session_id.to_string(),
            share_id: format!("share-{session_id}"),
            status: session.status,
            uploaded_chunks: session.chunks.keys().copied().collect(),
            chunks_uploaded: session.chunks.len() as u32,
            total_chunks: session.total_chunks,
            file_size: session.file_size,
            expires_at: "2030-01-01T00:00:00Z".to_string(),
            error_message: None,
        })
    }

    fn completed(session_id: &str, size: u64) -> CompleteSessionResponse {
        CompleteSessionResponse {
            session_id: session_id.to_string(),
            share_id: format!("share-{session_id}"),
            video_id: format!("video-{session_id}"),
            status: SessionStatus::Completed,
            size,
            completed_at: "2030-01-01T00:00:00Z".to_string(),
        }
    }

    fn do_complete(&self, session_id: &str) -> ClientResult<CompleteSessionResponse> {
        let mut state = self.lock();
        if state.complete_failures > 0 {
            state.complete_failures -= 1;
            return Err(unavailable());
        }
        let session = state.sessions.get_mut(session_id).ok_or_else(gone)?;
        match session.status {
            SessionStatus::Completed => {}
            SessionStatus::Uploading => {
                if session.chunks.len() as u32 != session.total_chunks {
                    return Err(ClientError::Api {
                        status: 409,
                        code: "incomplete_upload".to_string(),
                        message: "chunks missing".to_string(),
                    });
                }
                session.status = SessionStatus::Completed;
            }
            _ => return Err(gone()),
        }
        let size = session.chunks.values().map(|c| c.len() as u64).sum();
        Ok(Self::completed(session_id, size))
    }

    fn do_cancel(&self, session_id: &str) -> ClientResult<CancelSessionResponse> {
        let mut state = self.lock();
        let session = state.sessions.get_mut(session_id).ok_or_else(gone)?;
        if session.status != SessionStatus::Uploading {
            return Err(gone());
        }
        session.status = SessionStatus::Cancelled;
        Ok(CancelSessionResponse {
            session_id: session_id.to_string(),
            status: SessionStatus::Cancelled,
        })
    }
}

#[async_trait]
impl UploadApi for FakeApi {
    async fn start_session(&self, req: &StartSessionRequest) -> ClientResult<StartSessionResponse> {
        self.enter("start").await;
        {
            let mut state = self.lock();
            if !state.started.contains(&req.filename) {
                state.started.push(req.filename.clone());
            }
        }
        let id = self.insert_session(&req.filename, req.file_size, req.total_chunks);
        self.exit();
        Ok(StartSessionResponse {
            share_id: format!("share-{id}"),
            session_id: id,
            expires_at: "2030-01-01T00:00:00Z".to_string(),
            max_chunk_size: 32 * 1024 * 1024,
        })
    }

    async fn session_status(&self, session_id: &str) -> ClientResult<SessionStatusResponse> {
        self.enter("status").await;
        let result = self.status_of(session_id);
        self.exit();
        result
    }

    async fn chunk_target(
        &self,
        session_id: &str,
        chunk_number: u32,
    ) -> ClientResult<ChunkTargetResponse> {
        self.enter("target").await;
        let unsupported = self.lock().direct_unsupported;
        self.exit();
        if unsupported {
            return Err(ClientError::Api {
                status: 501,
                code: "direct_upload_unavailable".to_string(),
                message: "filesystem backend".to_string(),
            });
        }
        let object_key = format!("sessions/{session_id}/chunks/{chunk_number:06}");
        Ok(ChunkTargetResponse {
            url: format!("https://storage.test/{object_key}"),
            method: "PUT".to_string(),
            headers: BTreeMap::new(),
            object_key,
            expires_at: "2030-01-01T00:00:00Z".to_string(),
        })
    }

    async fn put_to_target(&self, target: &ChunkTargetResponse, data: Bytes) -> ClientResult<()> {
        self.enter("put_target").await;
        let result = self.write_object(target, data);
        self.exit();
        result
    }

    async fn notify_chunk(
        &self,
        session_id: &str,
        chunk_number: u32,
        req: &NotifyChunkRequest,
    ) -> ClientResult<ChunkAcceptedResponse> {
        self.enter("notify").await;
        let object = self.lock().objects.remove(&req.object_key);
        let result = match object {
            Some(data) if data.len() as u64 == req.size => {
                self.deliver(session_id, chunk_number, data)
            }
            _ => Err(ClientError::Api {
                status: 400,
                code: "bad_request".to_string(),
                message: "object missing".to_string(),
            }),
        };
        self.exit();
        result
    }

    async fn put_chunk(
        &self,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> ClientResult<ChunkAcceptedResponse> {
        self.enter("put_chunk").await;
        let result = self
            .attempt(session_id, chunk_number)
            .and_then(|()| self.deliver(session_id, chunk_number, data));
        self.exit();
        result
    }

    async fn complete_session(&self, session_id: &str) -> ClientResult<CompleteSessionResponse> {
        self.enter("complete").await;
        let result = self.do_complete(session_id);
        self.exit();
        result
    }

    async fn cancel_session(&self, session_id: &str) -> ClientResult<CancelSessionResponse> {
        self.enter("cancel").await;
        let result = self.do_cancel(session_id);
        self.exit();
        result
    }

    async fn upload_single(
        &self,
        filename: &str,
        _mimetype: &str,
        data: Bytes,
    ) -> ClientResult<CompleteSessionResponse> {
        self.enter("single").await;
        let result = {
            let mut state = self.lock();
            if !state.started.iter().any(|f| f == filename) {
                state.started.push(filename.to_string());
            }
            if state.single_failures > 0 {
                state.single_failures -= 1;
                Err(unavailable())
            } else {
                Ok(())
            }
        };
        let result = result.map(|()| {
            let id = self.insert_session(filename, data.len() as u64, 1);
            {
                let mut state = self.lock();
                if let Some(session) = state.sessions.get_mut(&id) {
                    session.chunks.insert(0, data.clone());
                    session.status = SessionStatus::Completed;
                }
            }
            Self::completed(&id, data.len() as u64)
        });
        self.exit();
        result
    }
}
