//! Per-pass guards: metrics, budget ceiling, deadline and iteration bound

use pulse_core::AuditEventType;
use serde_json::json;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::state::{WorkflowFailure, WorkflowState};

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowMonitor;

impl WorkflowMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Update metrics after a content pass and enforce the hard guards.
    ///
    /// An error already pending on the state takes precedence; the guards
    /// only fire on an otherwise clean pass.
    pub fn check(&self, state: &mut WorkflowState, ctx: &ExecutionContext) {
        state.metrics_mut().observe_processing_time(ctx.elapsed());
        let iteration = state.next_iteration();

        debug!(
            workflow_id = %state.workflow_id(),
            iteration = iteration,
            total_cost = state.metrics().total_cost,
            tokens = state.metrics().tokens_used,
            "Monitoring pass"
        );

        if state.last_error().is_some() {
            return;
        }

        if let Some(limit) = state.budget_limit() {
            let cost = state.metrics().total_cost;
            if cost > limit {
                warn!(
                    workflow_id = %state.workflow_id(),
                    total_cost = cost,
                    budget_limit = limit,
                    "Budget exceeded"
                );
                state.audit(
                    AuditEventType::BudgetExceeded,
                    None,
                    json!({ "total_cost": cost, "budget_limit": limit }),
                );
                state.fail(WorkflowFailure::budget(format!(
                    "budget exceeded: spent {:.4} of {:.4}",
                    cost, limit
                )));
                return;
            }
        }

        if let Some(interrupt) = ctx.interrupt() {
            state.fail(ctx.failure(interrupt));
        }
    }

    /// Fail the workflow once the pass count reaches the configured bound.
    /// Returns whether the limit was hit.
    pub fn enforce_iteration_limit(&self, state: &mut WorkflowState) -> bool {
        let max = state.config().max_iterations;
        if state.iterations() < max {
            return false;
        }

        warn!(
            workflow_id = %state.workflow_id(),
            iterations = state.iterations(),
            "Content pipeline exceeded iteration limit"
        );
        state.fail(WorkflowFailure::iteration_limit(state.iterations()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FailureKind, WorkflowStatus};
    use pulse_core::{Campaign, PipelineConfig, WorkflowType};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn running(campaign: Campaign, config: PipelineConfig) -> WorkflowState {
        let mut state = WorkflowState::new(campaign, WorkflowType::ContentAnalysis, config);
        state.transition_to(WorkflowStatus::Running).unwrap();
        state
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Duration::from_secs(1800), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_budget_ceiling() {
        let monitor = WorkflowMonitor::new();
        let mut state = running(
            Campaign::new("c1", "Launch").with_budget(1.0),
            PipelineConfig::default(),
        );

        state.metrics_mut().add_usage(10, 0.95);
        monitor.check(&mut state, &ctx());
        assert_eq!(state.status(), WorkflowStatus::Running);

        state.metrics_mut().add_usage(10, 0.10);
        monitor.check(&mut state, &ctx());
        assert_eq!(state.status(), WorkflowStatus::Failed);
        assert_eq!(state.last_error().unwrap().kind, FailureKind::BudgetExceeded);
        assert_eq!(state.audit_count(AuditEventType::BudgetExceeded), 1);
        assert_eq!(state.iterations(), 2);
    }

    #[tokio::test]
    async fn test_no_budget_means_no_ceiling() {
        let monitor = WorkflowMonitor::new();
        let mut state = running(Campaign::new("c1", "Launch"), PipelineConfig::default());

        state.metrics_mut().add_usage(0, 1_000.0);
        monitor.check(&mut state, &ctx());

        assert_eq!(state.status(), WorkflowStatus::Running);
        assert!(state.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_workflow() {
        let monitor = WorkflowMonitor::new();
        let mut state = running(Campaign::new("c1", "Launch"), PipelineConfig::default());
        let ctx = ExecutionContext::new(Duration::from_secs(5), CancellationToken::new());

        tokio::time::advance(Duration::from_secs(6)).await;
        monitor.check(&mut state, &ctx);

        assert_eq!(state.status(), WorkflowStatus::Failed);
        assert_eq!(state.last_error().unwrap().kind, FailureKind::Timeout);
        assert!(state.metrics().processing_time >= Duration::from_secs(6));
    }

    #[test]
    fn test_iteration_limit() {
        let monitor = WorkflowMonitor::new();
        let mut state = running(
            Campaign::new("c1", "Launch"),
            PipelineConfig::default().with_max_iterations(2),
        );

        state.next_iteration();
        assert!(!monitor.enforce_iteration_limit(&mut state));

        state.next_iteration();
        assert!(monitor.enforce_iteration_limit(&mut state));
        assert_eq!(state.last_error().unwrap().kind, FailureKind::IterationLimit);
        assert_eq!(state.status(), WorkflowStatus::Failed);
    }
}
