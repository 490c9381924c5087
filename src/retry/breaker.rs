use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::CircuitBreakerConfig;
use crate::error::SprocError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast with `SprocError::CircuitOpen`.
    Open,
    /// The cool-down elapsed; one trial call is admitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Three-state circuit breaker for one target.
///
/// Only failures that say something about the target's health count: transient database
/// errors and reachability failures. Fatal database errors mean the target answered, so
/// they reset the count like a success. Cancellation counts as neither.
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state; an Open circuit whose cool-down elapsed reports `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open && self.cool_down_elapsed(&inner) {
            return CircuitState::HalfOpen;
        }
        inner.state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask to make one call. The returned [`Admission`] reports the call's outcome; if it
    /// is dropped unreported (the call was abandoned), a half-open trial slot is freed.
    ///
    /// # Errors
    /// Returns `SprocError::CircuitOpen` while the circuit is open, or while a half-open
    /// trial call is still in flight.
    pub fn admit(&self) -> Result<Admission<'_>, SprocError> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open if self.cool_down_elapsed(&inner) => {
                self.transition(&mut inner, CircuitState::HalfOpen);
                true
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => true,
            _ => return Err(SprocError::CircuitOpen(self.target.clone())),
        };
        inner.trial_in_flight |= trial;
        Ok(Admission {
            breaker: self,
            trial,
            reported: false,
        })
    }

    /// Feed the outcome of an admitted call back into the breaker.
    pub fn record<T>(&self, outcome: &Result<T, SprocError>) {
        match outcome {
            Ok(_) => self.record_success(),
            Err(SprocError::Cancelled | SprocError::CircuitOpen(_)) => self.release_trial(),
            Err(err) if err.is_retryable() => self.record_failure(),
            Err(_) => self.record_success(),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;
        let trip = match inner.state {
            // A failed trial re-opens immediately.
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            self.transition(&mut inner, CircuitState::Open);
            inner.opened_at = Some(Instant::now());
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn cool_down_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .is_some_and(|at| at.elapsed() >= self.config.cool_down())
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        tracing::warn!(
            target_id = %self.target,
            %from,
            %to,
            consecutive_failures = inner.consecutive_failures,
            "circuit breaker state change"
        );
    }
}

/// Permission for one call through a [`CircuitBreaker`].
#[derive(Debug)]
#[must_use = "an admission should report the call's outcome"]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    reported: bool,
}

impl Admission<'_> {
    /// Whether this call is the half-open trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Feed the outcome of the admitted call back into the breaker.
    pub fn record<T>(mut self, outcome: &Result<T, SprocError>) {
        self.reported = true;
        self.breaker.record(outcome);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.reported {
            tracing::debug!(target_id = %self.breaker.target, "half-open trial abandoned");
            self.breaker.release_trial();
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

/// One breaker per target, created on first use. Disabled when no configuration is given.
#[derive(Default)]
pub struct BreakerRegistry {
    config: Option<CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: Option<CircuitBreakerConfig>) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// The breaker guarding `target`, or `None` when breaking is disabled.
    #[must_use]
    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        let config = self.config.as_ref()?;
        let mut breakers = self.breakers.lock();
        Some(
            breakers
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(target, config.clone())))
                .clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::DatabaseError;

    fn breaker(threshold: u32, cool_down_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "main",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cool_down_ms,
            },
        )
    }

    fn transient() -> Result<(), SprocError> {
        Err(SprocError::Database(DatabaseError::from_code(40613, "db unavailable")))
    }

    #[test]
    fn opens_after_threshold() {
        let cb = breaker(3, 60_000);
        for _ in 0..2 {
            cb.admit().unwrap().record(&transient());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.admit().unwrap().record(&transient());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.admit(), Err(SprocError::CircuitOpen(t)) if t == "main"));
    }

    #[test]
    fn fatal_errors_reset_the_count() {
        let cb = breaker(2, 60_000);
        cb.record(&transient());
        cb.record::<()>(&Err(SprocError::Database(DatabaseError::from_code(2627, "dup"))));
        cb.record(&transient());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_single_trial() {
        let cb = breaker(1, 10);
        cb.record(&transient());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let trial = cb.admit().unwrap();
        assert!(trial.is_trial());
        assert!(cb.admit().is_err());
        trial.record::<()>(&Ok(()));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.admit().unwrap().is_trial());
    }

    #[test]
    fn abandoned_trial_frees_the_slot() {
        let cb = breaker(1, 10);
        cb.record(&transient());
        std::thread::sleep(Duration::from_millis(20));
        let trial = cb.admit().unwrap();
        assert!(cb.admit().is_err());
        drop(trial);

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let retrial = cb.admit().unwrap();
        assert!(retrial.is_trial());
        retrial.record::<()>(&Ok(()));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn failed_trial_reopens() {
        let cb = breaker(1, 10);
        cb.record(&transient());
        std::thread::sleep(Duration::from_millis(20));
        cb.admit().unwrap().record(&transient());
        assert!(cb.admit().is_err());
    }

    #[test]
    fn registry_shares_per_target() {
        let registry = BreakerRegistry::new(Some(CircuitBreakerConfig::default()));
        let a = registry.get("a").unwrap();
        assert!(Arc::ptr_eq(&a, &registry.get("a").unwrap()));
        assert!(!Arc::ptr_eq(&a, &registry.get("b").unwrap()));
        assert!(BreakerRegistry::new(None).get("a").is_none());
    }
}
