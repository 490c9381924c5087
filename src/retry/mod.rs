//! Transient-failure handling.
//!
//! - `policy`: bounded retry with exponential backoff
//! - `breaker`: per-target circuit breaker

mod breaker;
mod policy;

pub use breaker::{Admission, BreakerRegistry, CircuitBreaker, CircuitState};
pub use policy::{Attempted, RetryDecision, RetryPolicy};
