use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Exponential-backoff retry for a single external operation
///
/// Waits `initial_backoff` after the first failure and doubles the wait after
/// every further failure, for at most `max_attempts` attempts in total. Only
/// errors that report themselves as retryable are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Upper bound on each attempt; a timeout counts as a retryable failure
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(5),
            call_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Delay before the retry that follows the given failed attempt (0-indexed)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Runs `operation` until it succeeds, fails fatally, or attempts run out
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let result = match self.call_timeout {
                Some(limit) => tokio::time::timeout(limit, operation())
                    .await
                    .unwrap_or(Err(AppError::Timeout(limit))),
                None => operation().await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            operation = label,
                            attempts = attempt + 1,
                            "Operation recovered after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            attempt += 1;

            if !error.is_retryable() {
                tracing::error!(
                    operation = label,
                    error = %error,
                    "Operation failed with non-retryable error"
                );
                return Err(error);
            }

            if attempt >= max_attempts {
                tracing::error!(
                    operation = label,
                    attempts = attempt,
                    error = %error,
                    "Operation failed, retries exhausted"
                );
                return Err(error);
            }

            let delay = self.backoff_delay(attempt - 1);
            tracing::warn!(
                operation = label,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
