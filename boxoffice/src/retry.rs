//! Retry of single atomic store steps on transient failures.
//!
//! Only one-shot steps (a seat claim, a sequence claim, a hold acquisition) go through here.
//! Multi-step work such as batches never retries; it rolls back and surfaces the error.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::errors::Result;

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `backoff_ms * backoff_factor^attempt`,
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self.backoff_ms.saturating_mul(self.backoff_factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}

/// Run `step` until it succeeds, fails with a non-transient error, or `max_attempts` is used up.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &'static str, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match step().await {
            Err(e) if e.is_transient() && attempt + 1 < config.max_attempts => {
                let delay = config.backoff(attempt);
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = config.max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
