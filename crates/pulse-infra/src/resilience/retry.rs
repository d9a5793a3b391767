//! Retry policies
//!
//! Per-category backoff configuration. The table is immutable configuration;
//! runtime retry counters live on the workflow state.

use pulse_core::{BackoffShape, ErrorCategory, RetryPolicySettings};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::warn;

/// Retry policy for one error category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 means no retries)
    pub max_retries: u32,
    /// Delay unit the backoff shape scales
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    pub backoff: BackoffShape,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffShape) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Fixed delay between every retry
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, BackoffShape::Fixed)
            .with_base_delay(delay)
            .with_max_delay(delay)
    }

    /// Delay growing by `base_delay` on each retry
    pub fn linear(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(max_retries, BackoffShape::Linear)
            .with_base_delay(base_delay)
            .with_max_delay(max_delay)
    }

    /// Delay multiplied by `multiplier` on each retry
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(max_retries, BackoffShape::Exponential)
            .with_base_delay(base_delay)
            .with_max_delay(max_delay)
    }

    /// Retry without waiting
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, BackoffShape::Immediate)
            .with_base_delay(Duration::ZERO)
            .with_max_delay(Duration::ZERO)
    }

    /// Never retry
    pub fn none() -> Self {
        Self::new(0, BackoffShape::None)
            .with_base_delay(Duration::ZERO)
            .with_max_delay(Duration::ZERO)
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether this policy permits another retry after `retry_count` retries
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        self.backoff != BackoffShape::None && retry_count < self.max_retries
    }

    /// Delay before the retry with zero-based index `retry_count`, without jitter.
    ///
    /// The first retry of every non-immediate shape waits `base_delay`.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();

        let secs = match self.backoff {
            BackoffShape::Immediate | BackoffShape::None => return Duration::ZERO,
            BackoffShape::Fixed => base,
            BackoffShape::Linear => base * f64::from(retry_count + 1),
            BackoffShape::Exponential => base * self.multiplier.powi(retry_count as i32),
        };

        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Delay before the retry with zero-based index `retry_count`, jitter applied
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = self.base_delay_for(retry_count);

        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

impl From<&RetryPolicySettings> for RetryPolicy {
    fn from(settings: &RetryPolicySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff: settings.backoff,
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }
}

/// Retry policy per error category
#[derive(Debug, Clone)]
pub struct RetryPolicyTable {
    policies: HashMap<ErrorCategory, RetryPolicy>,
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        let mut policies = HashMap::new();

        policies.insert(
            ErrorCategory::RateLimit,
            RetryPolicy::exponential(5, Duration::from_secs(2), Duration::from_secs(60))
                .with_jitter(true),
        );
        policies.insert(
            ErrorCategory::Network,
            RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(30))
                .with_jitter(true),
        );
        policies.insert(
            ErrorCategory::Llm,
            RetryPolicy::linear(3, Duration::from_secs(2), Duration::from_secs(20)),
        );
        policies.insert(ErrorCategory::Validation, RetryPolicy::immediate(1));
        policies.insert(
            ErrorCategory::BusinessLogic,
            RetryPolicy::fixed(2, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5)),
        );
        policies.insert(ErrorCategory::Critical, RetryPolicy::none());

        Self { policies }
    }
}

impl RetryPolicyTable {
    /// Built-in table with configured overrides applied.
    ///
    /// Override keys that are not a known category are logged and ignored.
    pub fn from_settings(overrides: &HashMap<String, RetryPolicySettings>) -> Self {
        let mut table = Self::default();

        for (key, settings) in overrides {
            match key.parse::<ErrorCategory>() {
                Ok(category) => {
                    table.policies.insert(category, RetryPolicy::from(settings));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Ignoring retry policy override");
                }
            }
        }

        table
    }

    /// Replace the policy for one category
    pub fn with_policy(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
        self.policies.insert(category, policy);
        self
    }

    /// Policy for a category; a category missing from the table never retries
    pub fn get(&self, category: ErrorCategory) -> RetryPolicy {
        self.policies
            .get(&category)
            .cloned()
            .unwrap_or_else(RetryPolicy::none)
    }

    /// All policies ordered by category
    pub fn entries(&self) -> BTreeMap<ErrorCategory, RetryPolicy> {
        self.policies
            .iter()
            .map(|(category, policy)| (*category, policy.clone()))
            .collect()
    }
}
