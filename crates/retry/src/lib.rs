//! Retry-with-backoff and circuit-breaker primitives for calls to unreliable
//! dependencies.

pub mod backoff;
pub mod circuit;

pub use backoff::{with_retry, with_retry_notify, RetryPolicy, Retryable};
pub use circuit::{CircuitBreaker, CircuitOpenError, CircuitState, CircuitStatus};
