//! Bounded retry with linear backoff

use crate::error::DownloadError;
use batchdl_types::Settings;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.max_retries,
            Duration::from_millis(settings.retry_base_delay_ms),
        )
    }

    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Whether another attempt may follow `attempt` failing with `error`
    pub fn should_retry(&self, attempt: u32, error: &DownloadError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Sleep before the next attempt, waking early if `cancel` fires
    pub async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), DownloadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(self.delay_for(attempt)) => Ok(()),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(1000))
    }
}
