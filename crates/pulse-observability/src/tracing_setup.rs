//! Tracing subscriber setup

use crate::{ObservabilityError, Result};
use pulse_core::LoggingConfig;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Service name reported on startup
    pub service_name: String,
    pub service_version: String,
    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit one JSON object per line
    pub json_logs: bool,
    /// Log span enter/exit
    pub span_events: bool,
    pub colored_output: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "brandpulse".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            span_events: false,
            colored_output: true,
        }
    }
}

impl From<&LoggingConfig> for TracingConfig {
    fn from(logging: &LoggingConfig) -> Self {
        Self {
            log_level: logging.level.clone(),
            json_logs: logging.json,
            colored_output: !logging.json,
            ..Default::default()
        }
    }
}

impl TracingConfig {
    /// JSON logs without colors, for log shippers
    pub fn production() -> Self {
        Self {
            json_logs: true,
            colored_output: false,
            ..Default::default()
        }
    }

    pub fn with_service_name(mut self, name: &str) -> Self {
        self.service_name = name.to_string();
        self
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.log_level = level.to_string();
        self
    }

    pub fn with_json_logs(mut self, enabled: bool) -> Self {
        self.json_logs = enabled;
        self
    }

    /// Filter from `RUST_LOG`, falling back to the configured level
    pub fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.log_level).map_err(|e| {
                ObservabilityError::Configuration(format!(
                    "invalid log level '{}': {}",
                    self.log_level, e
                ))
            }),
        }
    }
}

/// Install the global subscriber writing to stderr. Fails if one is
/// already set.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let subscriber = tracing_subscriber::registry().with(config.env_filter()?);

    if config.json_logs {
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        subscriber
            .with(fmt_layer)
            .try_init()
            .map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    } else {
        let mut layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(config.colored_output);

        if config.span_events {
            layer = layer.with_span_events(FmtSpan::ENTER | FmtSpan::EXIT);
        }

        subscriber
            .with(layer)
            .try_init()
            .map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Tracing initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();

        assert_eq!(config.service_name, "brandpulse");
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
        assert!(config.colored_output);
    }

    #[test]
    fn test_production_config() {
        let config = TracingConfig::production();

        assert!(config.json_logs);
        assert!(!config.colored_output);
    }

    #[test]
    fn test_from_logging_config() {
        let logging = LoggingConfig {
            level: "debug,pulse_workflow=trace".to_string(),
            json: true,
        };

        let config = TracingConfig::from(&logging);

        assert_eq!(config.log_level, "debug,pulse_workflow=trace");
        assert!(config.json_logs);
        assert!(!config.colored_output);
    }

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::default()
            .with_service_name("pulse-worker")
            .with_log_level("warn")
            .with_json_logs(true);

        assert_eq!(config.service_name, "pulse-worker");
        assert_eq!(config.log_level, "warn");
        assert!(config.json_logs);
    }

    #[test]
    fn test_config_roundtrips_through_serde() {
        let config = TracingConfig::default().with_log_level("debug");
        let json = serde_json::to_string(&config).unwrap();
        let back: TracingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.log_level, "debug");
    }
}
