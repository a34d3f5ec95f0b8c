//! Bounded retry with exponential backoff for broker operations.
//!
//! Broker calls (publish, commit, rewind, lag queries) get a per-attempt
//! timeout and a small, fixed number of retries. When the budget is spent the
//! failure becomes a fatal [`ConsumerError::Broker`]: the consumer halts rather
//! than acknowledging something it could not finish.
//!
//! Business processing is never retried in-process. A failing dependency
//! leaves the message for broker redelivery instead.
//!
//! # Example
//!
//! ```rust
//! use fulfillment_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(50))
//!     .max_delay(Duration::from_secs(2))
//!     .attempt_timeout(Duration::from_secs(5))
//!     .build();
//!
//! let value = retry_with_backoff(&policy, || async { Ok::<_, String>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::ConsumerError;
use crate::metrics::RetryMetrics;
use fulfillment_core::event_bus::EventBusError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 5 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: 0.1 (±10% of each delay)
/// - `attempt_timeout`: 5 seconds
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap for exponential backoff
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.1,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    ///
    /// `initial_delay * multiplier^retry`, capped at `max_delay`.
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay.max(0.0))
        }
    }

    /// Delay before retry number `retry`, with jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0)).min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    attempt_timeout: Duration,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction (0.0 disables jitter).
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the bound on a single attempt.
    #[must_use]
    pub const fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
            attempt_timeout: self.attempt_timeout,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Returns the first success, or the error of the final attempt once
/// `max_retries` retries are spent.
///
/// # Errors
///
/// Returns the last error produced by `operation`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    tracing::info!(retries = retry, "Operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) if retry >= policy.max_retries => {
                tracing::error!(
                    retries = retry,
                    error = %err,
                    "Operation failed after max retries"
                );
                RetryMetrics::record_exhausted();
                return Err(err);
            },
            Err(err) => {
                let delay = policy.delay_for_attempt(retry);
                tracing::warn!(
                    retry,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                RetryMetrics::record_retry();
                sleep(delay).await;
                retry += 1;
            },
        }
    }
}

/// Run a broker operation under the policy's per-attempt timeout and retries.
///
/// A timed-out attempt counts as a failed attempt with
/// [`EventBusError::Timeout`].
///
/// # Errors
///
/// Returns [`ConsumerError::Broker`] carrying the last broker error once the
/// retry budget is spent.
pub async fn retry_broker<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, ConsumerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EventBusError>>,
{
    let timeout = policy.attempt_timeout;
    retry_with_backoff(policy, || {
        let attempt = call();
        async move {
            tokio::time::timeout(timeout, attempt)
                .await
                .unwrap_or_else(|_| {
                    Err(EventBusError::Timeout {
                        operation: operation.to_string(),
                        timeout,
                    })
                })
        }
    })
    .await
    .map_err(|source| ConsumerError::Broker { operation, source })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .jitter(0.0)
            .attempt_timeout(Duration::from_millis(50))
            .build()
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .jitter(0.0)
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .jitter(0.5)
            .build();
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(49) && delay <= Duration::from_millis(151));
        }
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_with_backoff(&fast_policy(3), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(tokio_test::assert_ok!(result), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), String> = retry_with_backoff(&fast_policy(2), || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {n}")) }
        })
        .await;

        assert_eq!(tokio_test::assert_err!(result), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn broker_timeouts_become_fatal() {
        let result: Result<(), ConsumerError> = retry_broker(&fast_policy(1), "publish", || async {
            sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        match result.unwrap_err() {
            ConsumerError::Broker { operation, source } => {
                assert_eq!(operation, "publish");
                assert!(matches!(source, EventBusError::Timeout { .. }));
            },
            other => panic!("unexpected error: {other}"),
        }
    }
}
