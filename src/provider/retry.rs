use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::ProviderError;

/// Backoff policy for provider requests: `min(base · 2^attempt, max)`,
/// overridden by a server-supplied `Retry-After`. Five attempts per request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), honoring `Retry-After`.
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        if let Some(after) = error.retry_after() {
            return after;
        }
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32, error: &ProviderError) -> bool {
        error.is_retryable() && attempt + 1 < self.max_attempts
    }

    /// Sleep that observes cancellation. Returns false when aborted;
    /// no retry is started after an abort.
    pub async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
