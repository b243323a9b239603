use crate::types::{ObservedError, Result};
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff with jitter for one-shot requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: 10_000,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && Self::is_retryable(&e) => {
                    let delay = self.delay_for(attempts);
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempts,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempts > 1 {
                        tracing::error!("Request failed after {} attempts: {}", attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Backoff before retry number `attempt` (1-based), ±25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base_delay = self
            .base_delay_ms
            .saturating_mul(2u64.pow(exp))
            .min(self.max_delay_ms);
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        let final_delay_ms = (base_delay as i64 + jitter).max(1) as u64;
        Duration::from_millis(final_delay_ms)
    }

    fn is_retryable(err: &ObservedError) -> bool {
        err.inner.is_transient()
    }
}
