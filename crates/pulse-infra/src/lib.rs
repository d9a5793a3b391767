pub mod resilience;

pub use resilience::{
    BreakerKey, BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry, ErrorClassifier,
    RetryPolicy, RetryPolicyTable,
};
