use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Reconnect schedule for the live channel: the delay doubles from `base`
/// up to `max`, and the `max_failures`th consecutive failure has no next delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    max_failures: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 10)
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, max_failures: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_failures,
        }
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Delay to wait after consecutive failure number `failures` (1-based),
    /// or `None` once that failure reaches the ceiling.
    pub fn delay(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures >= self.max_failures {
            return None;
        }
        Some(exponential(self.base, 2, failures - 1, self.max))
    }
}

fn exponential(initial: Duration, multiplier: u32, exponent: u32, cap: Duration) -> Duration {
    let factor = (multiplier as u64).checked_pow(exponent).unwrap_or(u64::MAX);
    let millis = (initial.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(cap)
}

/// Bounded retry for single request/response calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        exponential(
            self.initial_delay,
            self.multiplier.max(1),
            attempt.saturating_sub(1),
            self.max_delay,
        )
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent. Exhaustion yields [`SyncError::GaveUp`].
pub async fn retry_with_backoff<T, F, Fut, P>(
    policy: RetryPolicy,
    label: &'static str,
    should_retry: P,
    mut op: F,
) -> SyncResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SyncResult<T>>,
    P: Fn(&SyncError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                warn!(target = "parley::retry", op = label, attempts = attempt, error = %err, "giving up");
                return Err(SyncError::GaveUp {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            Err(err) if !should_retry(&err) => return Err(err),
            Err(err) => {
                let delay = policy.delay_after(attempt);
                debug!(
                    target = "parley::retry",
                    op = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retry scheduled"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
