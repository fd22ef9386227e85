//! Call-level resilience patterns
//!
//! - **Circuit Breaker**: stops calling a resource after repeated failures
//!   and admits a trial call once a cooldown has passed
//! - **Retry Logic**: exponential backoff with bounded jitter, driven by a
//!   structured retryability policy
//!
//! A [`RetryExecutor`] can route every attempt through a shared
//! [`CircuitBreaker`]; an open circuit ends the retry loop immediately so
//! the caller can defer the work instead.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitBreakerSnapshot, CircuitOpenError, CircuitState,
};
pub use retry::{
    execute_with_retry, retry, ErrorMatcher, RetryError, RetryExecutor, RetryOutcome, RetryPolicy,
    RetryPolicyBuilder, JITTER_RATIO,
};
