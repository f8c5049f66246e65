/// Bounded execution harness for provider calls: per-attempt timeout,
/// capped exponential backoff with jitter, and cooperative cancellation.
use crate::providers::base::{ErrorCode, ProviderError, ProviderResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Per-attempt deadline; elapsing classifies as a retryable `Timeout`.
    pub attempt_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Backoff before attempt `k` (1-indexed, `k >= 2`):
    /// `min(base * 2^(k-2), max)` with ±20% multiplicative jitter.
    fn delay_before(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2).min(16);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter = 0.8 + 0.4 * fastrand::f64();
        base.mul_f64(jitter)
    }
}

/// Run `op` until it succeeds, fails terminally, or attempts are exhausted.
///
/// Cancellation is honored before each attempt and during the backoff
/// sleep. An in-flight attempt is dropped on cancellation: the transport
/// aborts the call where it can, and the eventual result is discarded
/// either way. The final failure surfaces the last classified error.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut last_error: Option<ProviderError> = None;

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            let delay = match last_error.as_ref().and_then(|e| e.retry_after_secs) {
                Some(secs) => Duration::from_secs(secs),
                None => policy.delay_before(attempt),
            };
            debug!("waiting {}ms before attempt {}", delay.as_millis(), attempt);
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(cancelled_error(last_error));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(cancelled_error(last_error));
        }

        let attempt_result = tokio::select! {
            () = cancel.cancelled() => {
                return Err(cancelled_error(last_error));
            }
            result = tokio::time::timeout(policy.attempt_timeout, op()) => result,
        };

        let error = match attempt_result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_elapsed) => ProviderError::new(
                "local",
                ErrorCode::Timeout,
                format!("attempt exceeded {}ms", policy.attempt_timeout.as_millis()),
            ),
        };

        if !error.is_retryable() {
            return Err(error);
        }
        warn!(
            "attempt {}/{} failed: {} ({})",
            attempt,
            policy.max_attempts,
            error.message,
            error.code.as_str()
        );
        last_error = Some(error);
    }

    Err(last_error.expect("at least one attempt ran"))
}

fn cancelled_error(last: Option<ProviderError>) -> ProviderError {
    last.unwrap_or_else(|| {
        ProviderError::new("local", ErrorCode::Timeout, "cancelled before completion")
    })
}
