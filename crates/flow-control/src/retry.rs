//! Retry helpers with exponential backoff and jitter.
//!
//! The delay before attempt `n + 1` is `min(base * 2^(n-1), max)` perturbed by
//! a uniform ±25% jitter. Attempts are numbered from 1, so a policy with
//! `max_retries = 3` makes at most four calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Fraction of the computed delay used as jitter amplitude (±25%).
pub const JITTER_RATIO: f64 = 0.25;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for the un-jittered delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0, 0, 0)
    }

    /// Total number of calls this policy allows.
    #[inline]
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay after the given (1-based) attempt failed.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Jittered delay for `attempt`, using `unit` in `[0, 1)` as the random sample.
    ///
    /// `unit = 0.0` yields the lower bound (-25%), values close to `1.0` the upper bound.
    pub fn jittered_delay(&self, attempt: u32, unit: f64) -> Duration {
        let capped = self.base_delay_for_attempt(attempt) as f64;
        let unit = unit.clamp(0.0, 1.0);
        let factor = 1.0 + JITTER_RATIO * (2.0 * unit - 1.0);
        let delay_ms = (capped * factor).max(0.0).floor() as u64;
        Duration::from_millis(delay_ms)
    }

    /// Jittered delay for `attempt` drawn from the thread-local RNG.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, rand::random::<f64>())
    }
}

/// Successful result of [`retry_with_backoff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Number of calls made, including the successful one.
    pub attempts_used: u32,
    pub total_elapsed_ms: u64,
}

impl<T> RetryOutcome<T> {
    pub fn into_value(self) -> T {
        self.value
    }

    /// Whether at least one retry was needed.
    pub fn retried(&self) -> bool {
        self.attempts_used > 1
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent. The last error is returned unchanged.
///
/// The budget is a number of attempts, not a deadline; wrap the call in
/// `tokio::time::timeout` when a hard deadline is required.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    context: &str,
    config: &RetryConfig,
    should_retry: P,
    mut op: F,
) -> Result<RetryOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let started = Instant::now();
    let total_attempts = config.total_attempts();
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(context, attempt, "Operation succeeded after retry");
                }
                return Ok(RetryOutcome {
                    value,
                    attempts_used: attempt,
                    total_elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(err) => {
                if !should_retry(&err) {
                    debug!(context, attempt, error = %err, "Error is not retryable");
                    return Err(err);
                }
                if attempt >= total_attempts {
                    warn!(
                        context,
                        attempts = attempt,
                        error = %err,
                        "Retry budget exhausted"
                    );
                    return Err(err);
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    context,
                    attempt,
                    max_attempts = total_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
