use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::SprocError;

/// What to do after a failed attempt. Derived from the error, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Bounded retry with exponential backoff.
///
/// Only errors for which [`SprocError::is_retryable`] holds are retried. `max_attempts`
/// counts the first attempt, so N transient failures followed by a success make
/// `min(N + 1, max_attempts)` attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

/// Final outcome of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, SprocError>,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: base_delay.max(Duration::from_secs(5)),
            multiplier: 2.0,
        }
    }

    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before attempt `attempt + 1`, given that `attempt` attempts have failed.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.base_delay.as_secs_f64() * 1000.0 * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_secs_f64() * 1000.0);
        Duration::from_micros((capped_ms * 1000.0) as u64)
    }

    /// Decide whether to retry after `attempt` attempts (1-based) ended in `error`.
    #[must_use]
    pub fn decide(&self, error: &SprocError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_attempts {
            RetryDecision::NoRetry
        } else {
            RetryDecision::RetryAfter(self.delay_after(attempt))
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the attempt budget
    /// is spent. `op` receives the 1-based attempt number.
    ///
    /// Cancellation during a backoff pause ends the loop with `SprocError::Cancelled`.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SprocError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "operation succeeded after retry");
                    }
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) => err,
            };

            let RetryDecision::RetryAfter(delay) = self.decide(&err, attempt) else {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                };
            };

            tracing::warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                kind = ?err.kind(),
                category = ?err.category(),
                "transient failure, retrying after backoff"
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    return Attempted { result: Err(SprocError::Cancelled), attempts: attempt };
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::DatabaseError;

    fn deadlock() -> SprocError {
        SprocError::Database(DatabaseError::from_code(1205, "deadlock victim"))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(30), Duration::from_millis(350));
    }

    #[test]
    fn decide_respects_kind_and_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert!(matches!(policy.decide(&deadlock(), 1), RetryDecision::RetryAfter(_)));
        assert_eq!(policy.decide(&deadlock(), 3), RetryDecision::NoRetry);
        let fatal = SprocError::Database(DatabaseError::from_code(2627, "dup"));
        assert_eq!(policy.decide(&fatal, 1), RetryDecision::NoRetry);
        assert_eq!(
            policy.decide(&SprocError::Validation("x".into()), 1),
            RetryDecision::NoRetry
        );
    }

    async fn fail_then_succeed(failures: u32, max_attempts: u32) -> (bool, u32, u32) {
        let policy = RetryPolicy::new(max_attempts, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let outcome = policy
            .run(&CancellationToken::new(), "test", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < failures { Err(deadlock()) } else { Ok(n) } }
            })
            .await;
        (
            outcome.result.is_ok(),
            outcome.attempts,
            calls.load(Ordering::SeqCst),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn attempts_are_min_of_failures_plus_one_and_budget() {
        for max in 1..=4 {
            for failures in 0..=5 {
                let (ok, attempts, calls) = fail_then_succeed(failures, max).await;
                assert_eq!(ok, failures < max, "n={failures} m={max}");
                assert_eq!(attempts, (failures + 1).min(max));
                assert_eq!(calls, attempts);
            }
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fatal_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let outcome: Attempted<()> = policy
            .run(&CancellationToken::new(), "test", |_| async {
                Err(SprocError::Validation("bad".into()))
            })
            .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome: Attempted<()> = policy
            .run(&cancel, "test", |_| async { Err(deadlock()) })
            .await;
        assert!(matches!(outcome.result, Err(SprocError::Cancelled)));
        assert_eq!(outcome.attempts, 1);
    }
}
