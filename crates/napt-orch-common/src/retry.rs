//! Bounded retry policy for queued work.
//!
//! Work that fails with a retryable [`TaskError`] is re-run up to
//! `max_attempts` times in total, sleeping a linearly growing backoff between
//! attempts. Once attempts run out the last error is returned and nothing
//! re-schedules the work; a later triggering event has to correct the state.

use crate::task::{TaskError, TaskResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy applied by the queue infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (at least 1).
    pub max_attempts: u32,
    /// Delay before the second attempt; attempt `n` waits `n - 1` times this.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay to wait before the given (1-based) attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt.saturating_sub(1))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> TaskResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TaskResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    attempt += 1;
                    let delay = self.delay_before(attempt);
                    debug!(%what, attempt, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(%what, attempts = attempt, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

/// Convenience for callers that only need to know whether an error was the
/// final word after retries.
pub fn is_terminal(error: &TaskError) -> bool {
    !error.is_retryable()
}
