//! Retry budgets with linear backoff.

use crate::error::{ClientError, ClientResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempts allowed per chunk, and separately per file.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How often and how patiently a call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay unit; the wait after attempt `n` is `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::default()
        }
    }

    /// Wait before the attempt following `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or the budget is spent. The last error is returned.
    ///
    /// Cancellation is checked between attempts only; an attempt already in
    /// flight runs to completion.
    pub async fn run<F, Fut, T>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() || attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
