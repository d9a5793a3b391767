//! Error message classification

use crate::commands::policies::PolicyRow;
use crate::output::{self, format_output, OutputFormat};
use anyhow::Result;
use pulse_core::{ErrorCategory, PipelineConfig};
use pulse_infra::{ErrorClassifier, RetryPolicyTable};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Classification {
    pub message: String,
    pub category: ErrorCategory,
    pub policy: PolicyRow,
    /// Un-jittered delay before each retry the policy allows
    pub delays: Vec<String>,
}

pub fn classify(config: &PipelineConfig, message: &str) -> Classification {
    let category = ErrorClassifier::default().classify(message);
    let policy = RetryPolicyTable::from_settings(&config.retry_policies).get(category);
    let retries = policy
        .max_retries
        .min(config.max_total_attempts.saturating_sub(1));

    Classification {
        message: message.to_string(),
        category,
        delays: (0..retries)
            .map(|n| output::format_duration(policy.base_delay_for(n)))
            .collect(),
        policy: PolicyRow::new(category, &policy),
    }
}

pub fn run(config: &PipelineConfig, message: &str, format: OutputFormat) -> Result<()> {
    let result = classify(config, message);

    match format {
        OutputFormat::Text => {
            output::key_value("Category", result.category.as_str());
            output::key_value(
                "Policy",
                &format!(
                    "{} retries, {} backoff",
                    result.policy.max_retries, result.policy.backoff
                ),
            );
            if result.delays.is_empty() {
                output::warning("Not retried; the stage fails on the first error");
            } else {
                output::key_value("Delays", &result.delays.join(", "));
            }
        }
        _ => println!("{}", format_output(&result, format)?),
    }

    Ok(())
}
