//! Failure handling shared by every task: per-host circuit breakers and the
//! retry coordinator that consults them.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    BreakerKey, BreakerPermit, BreakerStatus, CircuitBreaker, CircuitBreakerRegistry,
    CircuitState, RequestKind,
};
pub use retry::{Backoff, ErrorContext, GiveUpReason, RetryCoordinator, RetryDecision};
