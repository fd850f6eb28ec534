//! Bounded retry with exponential backoff.
//!
//! Each attempt classifies itself as [`Attempt::Success`],
//! [`Attempt::Retry`] with a reason, or [`Attempt::Fatal`]. Only retries
//! consume the budget; a fatal attempt ends the run at once.

use std::future::Future;
use std::time::Duration;
use swerve_config::RetryConfig;
use swerve_core::cancel::CancellationToken;
use swerve_core::error::{Error, Result};
use tracing::{debug, warn};

/// Why an attempt asked to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The endpoint throttled the request
    RateLimited,
    /// The response hit the output-token limit
    OutputTruncated,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::RateLimited => write!(f, "rate limited"),
            RetryReason::OutputTruncated => write!(f, "output truncated"),
        }
    }
}

/// The outcome of one attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Retry(RetryReason),
    Fatal(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    /// The policy for model invocations.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// The policy for re-reading a lagging log at turn start.
    pub fn lagging_read(config: &RetryConfig) -> Self {
        Self::new(
            config.lag_read_attempts,
            Duration::from_millis(config.lag_min_delay_ms),
            Duration::from_millis(config.lag_max_delay_ms),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `retry` (zero-based): `min * 2^retry`,
    /// capped at the maximum.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(20);
        self.min_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `attempt` until it succeeds, fails fatally, or the budget runs
    /// out. The closure receives the zero-based attempt number.
    ///
    /// Returns `None` when `cancel` is set before an attempt or while
    /// waiting out a backoff delay. An attempt already in flight is never
    /// interrupted.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<Option<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut retries = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match attempt(retries).await {
                Attempt::Success(value) => return Ok(Some(value)),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retry(reason) => {
                    if retries >= self.max_retries {
                        return Err(Error::RetriesExhausted {
                            attempts: retries + 1,
                            last_reason: reason.to_string(),
                        });
                    }
                    let delay = self.delay_for(retries);
                    warn!(
                        attempt = retries + 1,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            debug!(attempt = retries + 1, "Backoff interrupted by cancellation");
                            return Ok(None);
                        }
                    }
                    retries += 1;
                }
            }
        }
    }
}
