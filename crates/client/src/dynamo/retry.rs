//! Retry with exponential, jittered backoff.

use std::future::Future;
use std::time::Duration;

use crawlstore_core::Error;

use super::error::DynamoError;

/// Upper bound on a single backoff sleep.
const MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 25% random jitter to every delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_millis(50), max_delay: MAX_DELAY, jitter: true }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, ..Default::default() }
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base = self.base_delay.as_millis() as f64 * 2f64.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let delay = if self.jitter { capped + rand::random::<f64>() * 0.25 * capped } else { capped };
        Duration::from_millis(delay as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt ceiling is reached.
    ///
    /// # Errors
    ///
    /// Non-retryable failures are translated immediately; exhausting the
    /// attempts yields `Error::BackendUnavailable`.
    pub async fn run<T, F, Fut>(&self, backend: &str, operation: &str, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DynamoError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    tracing::debug!(backend, operation, error = %e, "non-retryable failure");
                    return Err(e.into_cache_error(backend));
                }
                Err(e) if attempt >= self.max_attempts => {
                    tracing::warn!(backend, operation, attempts = attempt, error = %e, "retries exhausted");
                    return Err(Error::BackendUnavailable {
                        backend: backend.to_string(),
                        reason: format!("{operation} failed after {attempt} attempts: {e}"),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(backend, operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
