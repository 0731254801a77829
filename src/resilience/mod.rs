//! Failure isolation: circuit breakers, client rate limits and retry policy.

pub mod circuit_breaker;
pub mod error_handler;
pub mod rate_limiter;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitOpen, CircuitState,
};
pub use error_handler::{Classification, ErrorCategory, NackOutcome, TaskErrorHandler, classify};
pub use rate_limiter::{RateLimiter, Throttled, spawn_prune_task};
