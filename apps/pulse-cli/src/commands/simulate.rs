//! Workflow rehearsal against a scripted scenario

use crate::output::{self, format_output, OutputFormat};
use crate::scenario::Scenario;
use anyhow::Result;
use pulse_core::PipelineConfig;
use pulse_infra::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicyTable};
use pulse_workflow::{Orchestrator, RetryHandler, RetryLimits, WorkflowState, WorkflowStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Retry table for a rehearsal; `instant` drops every backoff delay
fn policy_table(config: &PipelineConfig, instant: bool) -> RetryPolicyTable {
    let table = RetryPolicyTable::from_settings(&config.retry_policies);
    if !instant {
        return table;
    }

    table
        .entries()
        .into_iter()
        .fold(table, |table, (category, policy)| {
            table.with_policy(
                category,
                policy
                    .with_base_delay(Duration::ZERO)
                    .with_max_delay(Duration::ZERO),
            )
        })
}

pub fn orchestrator(scenario: &Scenario, config: &PipelineConfig, instant: bool) -> Orchestrator {
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::from(
        &config.circuit_breaker,
    )));
    let handler = RetryHandler::new(policy_table(config, instant), breakers)
        .with_limits(RetryLimits::from(config));

    Orchestrator::builder()
        .stages(scenario.stages())
        .retry_handler(Arc::new(handler))
        .build()
}

/// Run a scenario to completion; Ctrl-C cancels the workflow
pub async fn execute(scenario: &Scenario, fallback: &PipelineConfig, instant: bool) -> WorkflowState {
    let state = scenario.state(fallback);
    let orchestrator = orchestrator(scenario, state.config(), instant);

    let cancel = orchestrator.cancel_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling workflow");
            cancel.cancel();
        }
    });

    let state = orchestrator.execute(state).await;
    watcher.abort();
    state
}

pub async fn run(
    config: &PipelineConfig,
    path: &Path,
    trail: bool,
    instant: bool,
    format: OutputFormat,
) -> Result<()> {
    let scenario = Scenario::load(path)?;
    let state = execute(&scenario, config, instant).await;

    match (format, trail) {
        (OutputFormat::Text, true) => print_trail(&state),
        (OutputFormat::Text, false) => print_report(&state),
        (_, true) => println!("{}", format_output(&state.audit_trail(), format)?),
        (_, false) => println!("{}", format_output(&state, format)?),
    }

    Ok(())
}

fn print_trail(state: &WorkflowState) {
    for event in state.audit_trail() {
        println!(
            "{}  {:<20} {:<8} {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.event_type.as_str(),
            event.node.as_deref().unwrap_or("-"),
            event.details
        );
    }
}

fn print_report(state: &WorkflowState) {
    let metrics = state.metrics();

    output::key_value("Workflow", &state.workflow_id().to_string());
    output::key_value("Campaign", &state.campaign().name);
    output::key_value("Type", &state.workflow_type().to_string());
    output::key_value("Duration", &output::format_duration(metrics.processing_time));
    output::key_value(
        "Usage",
        &format!("{} tokens, ${:.4}", metrics.tokens_used, metrics.total_cost),
    );
    output::key_value(
        "Content",
        &format!(
            "{} raw, {} processed, {} analyzed, {} insights",
            state.raw_content().len(),
            state.processed_content().len(),
            state.analyzed_count(),
            state.insights().len()
        ),
    );
    if let Some(response) = state.response() {
        output::key_value("Response", response);
    }

    output::section("Decisions");
    for decision in state.decisions() {
        println!("  {} -> {}", decision.decision_type, decision.selected_path);
    }

    if !state.stage_retries().is_empty() {
        output::section("Retries");
        for (stage, retries) in state.stage_retries() {
            println!("  {}: {}", stage, retries);
        }
    }

    if !state.degraded_stages().is_empty() {
        output::warning(&format!(
            "Degraded stages: {}",
            state
                .degraded_stages()
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if state.config().lightweight_mode {
        output::warning("Lightweight mode engaged for later runs");
    }

    println!();
    match (state.status(), state.last_error()) {
        (WorkflowStatus::Completed, _) => output::success("Workflow completed"),
        (status, Some(failure)) => output::error(&format!("Workflow {}: {}", status, failure)),
        (status, None) => output::error(&format!("Workflow {}", status)),
    }
    output::dimmed(&format!(
        "{} audit events; rerun with --trail to list them",
        state.audit_trail().len()
    ));
}
