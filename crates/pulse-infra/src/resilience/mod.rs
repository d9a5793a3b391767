//! Resilience patterns for fault-tolerant stage execution
//!
//! Provides error classification, per-category retry policies and circuit
//! breakers keyed by (stage, error category).

pub mod circuit_breaker;
pub mod classifier;
pub mod retry;

pub use circuit_breaker::{BreakerKey, BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use classifier::ErrorClassifier;
pub use retry::{RetryPolicy, RetryPolicyTable};
