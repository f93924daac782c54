//! Exponential backoff for transient failures.
//!
//! Base delay doubles on each failed attempt and caps at a configurable
//! maximum. Used by the GitHub adapter and the language-model client;
//! the orchestration core never retries on its own.

use std::future::Future;
use std::time::Duration;

/// Retry policy: how many attempts and how long to wait between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failure (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        is_transient: impl Fn(&anyhow::Error) -> bool,
        mut op: F,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && is_transient(&e) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        err = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Check if an error message indicates a rate-limit / abuse-detection error.
pub fn is_rate_limit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate-limited")
        || lower.contains("abuse detection")
        || lower.contains("secondary rate limit")
        || lower.contains("(429")
}

/// Classify an error as transient: network trouble, 5xx, 429 or rate limits.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(req) = err.downcast_ref::<reqwest::Error>() {
        if req.is_timeout() || req.is_connect() || req.is_request() {
            return true;
        }
    }
    let message = err.to_string();
    is_rate_limit_error(&message)
        || ["(500", "(502", "(503", "(504"]
            .iter()
            .any(|code| message.contains(code))
}
