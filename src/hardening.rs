use crate::constants::RETRYABLE_STATUS_CODES;
use crate::types::{ObservedError, RelayError, Result};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with jitter around opening an upstream request.
/// `max_attempts` counts the first try; 1 disables retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
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
                        "Request failed (attempt {}): {}. Retrying in {:?} (jittered)...",
                        attempts,
                        e.inner,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base_delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        // ±25% of the base delay
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base_delay as i64 + jitter).max(1) as u64)
    }

    pub fn is_retryable(err: &ObservedError) -> bool {
        match &err.inner {
            RelayError::UpstreamUnreachable(_) | RelayError::UpstreamTimeout(_) => true,
            RelayError::UpstreamHttp(status, _) => {
                RETRYABLE_STATUS_CODES.contains(&status.as_u16())
            }
            _ => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, 100)
    }
}
