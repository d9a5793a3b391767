//! Effective retry policy table

use crate::output::{self, format_output, OutputFormat};
use anyhow::Result;
use pulse_core::{ErrorCategory, PipelineConfig};
use pulse_infra::{RetryPolicy, RetryPolicyTable};
use serde::Serialize;
use tabled::{Table, Tabled};

/// One policy as shown to operators
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct PolicyRow {
    #[tabled(rename = "Category")]
    pub category: String,
    #[tabled(rename = "Retries")]
    pub max_retries: u32,
    #[tabled(rename = "Backoff")]
    pub backoff: String,
    #[tabled(rename = "Base")]
    pub base_delay: String,
    #[tabled(rename = "Max")]
    pub max_delay: String,
    #[tabled(rename = "Multiplier")]
    pub multiplier: f64,
    #[tabled(rename = "Jitter")]
    pub jitter: bool,
}

impl PolicyRow {
    pub fn new(category: ErrorCategory, policy: &RetryPolicy) -> Self {
        Self {
            category: category.to_string(),
            max_retries: policy.max_retries,
            backoff: policy.backoff.to_string(),
            base_delay: output::format_duration(policy.base_delay),
            max_delay: output::format_duration(policy.max_delay),
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

pub fn rows(config: &PipelineConfig) -> Vec<PolicyRow> {
    RetryPolicyTable::from_settings(&config.retry_policies)
        .entries()
        .iter()
        .map(|(category, policy)| PolicyRow::new(*category, policy))
        .collect()
}

pub fn run(config: &PipelineConfig, format: OutputFormat) -> Result<()> {
    let rows = rows(config);

    match format {
        OutputFormat::Text => {
            println!("{}", Table::new(rows));
            output::dimmed(&format!(
                "At most {} attempts per stage chain; retries stop at {:.0}% of the campaign budget.",
                config.max_total_attempts,
                config.budget_guard_ratio * 100.0
            ));
        }
        _ => println!("{}", format_output(&rows, format)?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{BackoffShape, RetryPolicySettings};

    #[test]
    fn test_default_rows_cover_every_category() {
        let rows = rows(&PipelineConfig::default());

        assert_eq!(rows.len(), ErrorCategory::ALL.len());
        let network = rows.iter().find(|r| r.category == "network").unwrap();
        assert_eq!(network.max_retries, 3);
        assert_eq!(network.backoff, "exponential");
        assert_eq!(network.base_delay, "1.0s");
        assert!(network.jitter);
    }

    #[test]
    fn test_overrides_are_reflected() {
        let config = PipelineConfig::default().with_retry_policy(
            "llm",
            RetryPolicySettings {
                max_retries: 7,
                base_delay_ms: 250,
                max_delay_ms: 1_000,
                backoff: BackoffShape::Fixed,
                multiplier: 2.0,
                jitter: false,
            },
        );

        let rows = rows(&config);
        let llm = rows.iter().find(|r| r.category == "llm").unwrap();

        assert_eq!(llm.max_retries, 7);
        assert_eq!(llm.backoff, "fixed");
        assert_eq!(llm.base_delay, "250ms");
    }
}
