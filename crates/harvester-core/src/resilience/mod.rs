//! Retry and circuit-breaker protection for upstream calls.

pub mod circuit_breaker;
pub mod policy;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use policy::ResiliencePolicy;
pub use retry::{retry_async, RetryConfig, RetryStats};
