use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::BackoffShape;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("PULSE")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("PULSE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("pipeline.parallel_processing", false)?
            .set_default("pipeline.parallel_threshold", 10)?
            .set_default("pipeline.lightweight_mode", false)?
            .set_default("pipeline.max_retries", 3)?
            .set_default("pipeline.max_total_attempts", 10)?
            .set_default("pipeline.budget_guard_ratio", 0.9)?
            .set_default("pipeline.global_timeout_secs", 1800)?
            .set_default("pipeline.max_iterations", 10)?
            .set_default("pipeline.circuit_breaker.failure_threshold", 5)?
            .set_default("pipeline.circuit_breaker.cool_down_secs", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)
    }
}

/// Settings that steer routing, retries and guards for one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub parallel_processing: bool,
    /// Raw content count above which parallel processing is chosen
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
    /// Reduces LLM calls in downstream stages; flipped by budget recovery
    #[serde(default)]
    pub lightweight_mode: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Hard ceiling of attempts for one stage invocation chain, any category
    #[serde(default = "default_max_total_attempts")]
    pub max_total_attempts: u32,
    /// Fraction of the budget at which retries stop
    #[serde(default = "default_budget_guard_ratio")]
    pub budget_guard_ratio: f64,
    #[serde(default = "default_global_timeout_secs")]
    pub global_timeout_secs: u64,
    /// Upper bound on content passes before the workflow is failed
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// Per-category overrides of the built-in retry policy table
    #[serde(default)]
    pub retry_policies: HashMap<String, RetryPolicySettings>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallel_processing: false,
            parallel_threshold: default_parallel_threshold(),
            lightweight_mode: false,
            max_retries: default_max_retries(),
            max_total_attempts: default_max_total_attempts(),
            budget_guard_ratio: default_budget_guard_ratio(),
            global_timeout_secs: default_global_timeout_secs(),
            max_iterations: default_max_iterations(),
            circuit_breaker: CircuitBreakerSettings::default(),
            retry_policies: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallel_processing(mut self, enabled: bool) -> Self {
        self.parallel_processing = enabled;
        self
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn with_lightweight_mode(mut self, enabled: bool) -> Self {
        self.lightweight_mode = enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_retry_policy(mut self, category: &str, settings: RetryPolicySettings) -> Self {
        self.retry_policies.insert(category.to_string(), settings);
        self
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.global_timeout_secs)
    }
}

fn default_parallel_threshold() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_total_attempts() -> u32 {
    10
}

fn default_budget_guard_ratio() -> f64 {
    0.9
}

fn default_global_timeout_secs() -> u64 {
    1800 // 30 minutes
}

fn default_max_iterations() -> u32 {
    10
}

/// Circuit breaker thresholds shared by every (stage, category) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down_secs: default_cool_down_secs(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cool_down_secs() -> u64 {
    300 // 5 minutes
}

/// Override for one category's retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicySettings {
    pub max_retries: u32,
    #[serde(default)]
    pub base_delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: u64,
    pub backoff: BackoffShape,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
}

fn default_multiplier() -> f64 {
    2.0
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
