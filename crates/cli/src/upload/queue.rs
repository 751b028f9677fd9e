//! Sequential upload queue.
//!
//! One worker takes files in submission order and uploads them one at a
//! time. Batches submitted while the worker is busy are appended to the
//! same queue.

use super::{UploadOrchestrator, UploadSource};
use crate::error::{ClientError, ClientResult};
use reel_core::session::CompleteSessionResponse;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct QueuedUpload {
    source: UploadSource,
    id: u64,
    cancel: CancellationToken,
    reply: oneshot::Sender<ClientResult<CompleteSessionResponse>>,
}

/// Outcome of one queued file.
pub struct UploadTicket {
    pub filename: String,
    rx: oneshot::Receiver<ClientResult<CompleteSessionResponse>>,
}

impl UploadTicket {
    pub async fn wait(self) -> ClientResult<CompleteSessionResponse> {
        // A dropped sender means the worker is gone.
        self.rx.await.unwrap_or(Err(ClientError::Cancelled))
    }
}

pub struct UploadQueue {
    orchestrator: Arc<UploadOrchestrator>,
    tx: mpsc::UnboundedSender<QueuedUpload>,
    worker: JoinHandle<()>,
}

impl UploadQueue {
    pub fn start(orchestrator: Arc<UploadOrchestrator>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(orchestrator.clone(), rx));
        Self {
            orchestrator,
            tx,
            worker,
        }
    }

    pub fn orchestrator(&self) -> &Arc<UploadOrchestrator> {
        &self.orchestrator
    }

    /// Append files to the queue. Each one is marked pending right away.
    pub fn submit(&self, sources: Vec<UploadSource>) -> Vec<UploadTicket> {
        sources
            .into_iter()
            .map(|source| {
                let filename = source.filename.clone();
                let (id, cancel) = self.orchestrator.track(&filename);
                let (reply, rx) = oneshot::channel();
                if self
                    .tx
                    .send(QueuedUpload {
                        source,
                        id,
                        cancel,
                        reply,
                    })
                    .is_err()
                {
                    debug!(filename, "Upload queue is closed");
                }
                UploadTicket { filename, rx }
            })
            .collect()
    }

    /// Cancel a pending or running file.
    pub async fn cancel(&self, filename: &str) -> bool {
        self.orchestrator.cancel(filename).await
    }

    /// Finish everything already queued, then stop the worker.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

async fn run_worker(
    orchestrator: Arc<UploadOrchestrator>,
    mut rx: mpsc::UnboundedReceiver<QueuedUpload>,
) {
    while let Some(item) = rx.recv().await {
        let filename = item.source.filename.clone();
        let result = if item.cancel.is_cancelled() {
            Err(ClientError::Cancelled)
        } else {
            orchestrator.upload(&item.source, &item.cancel).await
        };
        orchestrator.untrack(&filename, item.id);
        let _ = item.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadSettings;
    use crate::upload::progress::{ProgressTracker, UploadState};
    use crate::upload::resume::ResumeCache;
    use crate::upload::retry::RetryPolicy;
    use crate::upload::testing::FakeApi;
    use crate::upload::transport::TransportMode;
    use bytes::Bytes;
    use std::time::Duration;

    fn queue(api: &Arc<FakeApi>) -> UploadQueue {
        let orchestrator = UploadOrchestrator::new(
            api.clone(),
            TransportMode::Proxied.build(),
            ResumeCache::in_memory(),
            ProgressTracker::new(Duration::from_millis(5)),
            UploadSettings {
                chunk_size: 100,
                chunked_threshold: 150,
                retry: RetryPolicy::new(Duration::from_millis(1)),
            },
        );
        UploadQueue::start(Arc::new(orchestrator))
    }

    fn source(name: &str, len: usize) -> UploadSource {
        UploadSource::from_bytes(name, "video/mp4", Bytes::from(vec![7u8; len]))
    }

    #[tokio::test]
    async fn test_batches_run_one_file_at_a_time_in_order() {
        let api = Arc::new(FakeApi::new());
        api.set_delay(Duration::from_millis(2));
        let queue = queue(&api);

        let mut tickets = queue.submit(vec![source("a.mp4", 400), source("b.mp4", 100)]);
        tickets.extend(queue.submit(vec![source("c.mp4", 300)]));

        for ticket in tickets {
            ticket.wait().await.unwrap();
        }
        assert_eq!(api.started(), vec!["a.mp4", "b.mp4", "c.mp4"]);
        assert_eq!(api.max_in_flight(), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_pending_file_is_skipped() {
        let api = Arc::new(FakeApi::new());
        api.set_delay(Duration::from_millis(10));
        let queue = queue(&api);

        let mut tickets = queue
            .submit(vec![source("a.mp4", 400), source("b.mp4", 400)])
            .into_iter();
        let first = tickets.next().unwrap();
        let second = tickets.next().unwrap();

        assert_eq!(
            queue
                .orchestrator()
                .progress()
                .get("b.mp4")
                .unwrap()
                .state,
            UploadState::Pending
        );
        assert!(queue.cancel("b.mp4").await);

        first.wait().await.unwrap();
        assert!(matches!(second.wait().await, Err(ClientError::Cancelled)));
        assert_eq!(api.started(), vec!["a.mp4"]);
        assert!(queue.orchestrator().progress().get("b.mp4").is_none());
        queue.shutdown().await;
    }
}
