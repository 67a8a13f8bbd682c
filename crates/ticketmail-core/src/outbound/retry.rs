//! Exponential backoff for transient transport failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::TransportError;
use crate::config::RetryPolicy;

impl RetryPolicy {
    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Cap for a single delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Outcome of a retried operation with the number of attempts made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    /// Final result.
    pub result: Result<T, TransportError>,
    /// Attempts including the first.
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails permanently, or the retry
/// budget is spent.
///
/// Only [retryable](TransportError::is_retryable) errors are retried; the
/// delay doubles after every attempt and is capped at the policy maximum.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay();

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(e) if !e.is_retryable() || attempts > policy.max_retries => {
                return Attempted {
                    result: Err(e),
                    attempts,
                };
            }
            Err(e) => {
                warn!(
                    attempt = attempts,
                    max = policy.max_retries + 1,
                    error = %e,
                    "Send failed; retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay());
            }
        }
    }
}
