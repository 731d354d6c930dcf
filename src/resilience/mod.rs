//! Store-health tracking and degraded-mode fallback.

pub mod circuit_breaker;
pub mod failure_mode;
pub mod fallback;

pub use circuit_breaker::{
    BreakerSnapshot, BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState,
};
pub use failure_mode::FailureModeResolver;
pub use fallback::{FallbackConfig, LocalFallbackLimiter};
