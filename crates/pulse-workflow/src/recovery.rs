//! Recovery strategies for terminal failures
//!
//! Each strategy is idempotent and never fabricates data: a failed stage is
//! marked degraded and its output stays empty. One pass of the error handler
//! runs at most one strategy.

use pulse_core::AuditEventType;
use serde_json::json;
use tracing::{info, warn};

use crate::stage::StageKind;
use crate::state::{FailureKind, WorkflowFailure, WorkflowState, WorkflowStatus};

/// Stage-specific remediation
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, failure: &WorkflowFailure) -> bool;

    /// Apply the remediation. The workflow resumes only if this leaves the
    /// status something other than `Failed`.
    fn recover(&self, state: &mut WorkflowState);
}

fn failed_stage(failure: &WorkflowFailure, stage: StageKind) -> bool {
    matches!(failure.kind, FailureKind::Stage { .. })
        && failure.stage.as_deref() == Some(stage.as_str())
}

fn resume(state: &mut WorkflowState) {
    if let Err(e) = state.transition_to(WorkflowStatus::Running) {
        warn!(workflow_id = %state.workflow_id(), error = %e, "Cannot resume workflow");
    }
}

/// Discovery failed: continue with whatever content is already present
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoutFallback;

impl RecoveryStrategy for ScoutFallback {
    fn name(&self) -> &'static str {
        "scout_fallback"
    }

    fn applies_to(&self, failure: &WorkflowFailure) -> bool {
        failed_stage(failure, StageKind::Scout)
    }

    fn recover(&self, state: &mut WorkflowState) {
        state.mark_degraded(StageKind::Scout);
        resume(state);
    }
}

/// Analysis failed: finish without insights
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalystFallback;

impl RecoveryStrategy for AnalystFallback {
    fn name(&self) -> &'static str {
        "analyst_fallback"
    }

    fn applies_to(&self, failure: &WorkflowFailure) -> bool {
        failed_stage(failure, StageKind::Analyze)
    }

    fn recover(&self, state: &mut WorkflowState) {
        state.mark_degraded(StageKind::Analyze);
        resume(state);
    }
}

/// Budget exhausted: switch to lightweight mode for later runs. The
/// workflow itself stays failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetLightweightMode;

impl RecoveryStrategy for BudgetLightweightMode {
    fn name(&self) -> &'static str {
        "budget_lightweight_mode"
    }

    fn applies_to(&self, failure: &WorkflowFailure) -> bool {
        failure.kind == FailureKind::BudgetExceeded
    }

    fn recover(&self, state: &mut WorkflowState) {
        state.enable_lightweight_mode();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Error cleared; the workflow resumes at the router
    Recovered { strategy: &'static str },
    /// The workflow proceeds to finalization as failed
    Unrecoverable { reason: String },
}

impl RecoveryOutcome {
    pub fn is_recovered(&self) -> bool {
        matches!(self, RecoveryOutcome::Recovered { .. })
    }
}

/// Ordered list of strategies; the first applicable one runs
pub struct RecoveryStrategies {
    strategies: Vec<Box<dyn RecoveryStrategy>>,
}

impl Default for RecoveryStrategies {
    fn default() -> Self {
        Self::new()
            .with_strategy(ScoutFallback)
            .with_strategy(AnalystFallback)
            .with_strategy(BudgetLightweightMode)
    }
}

impl RecoveryStrategies {
    /// Empty list; every failure is unrecoverable
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: impl RecoveryStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// One recovery pass over the pending error
    pub fn attempt(&self, state: &mut WorkflowState) -> RecoveryOutcome {
        let failure = match state.last_error() {
            Some(failure) => failure.clone(),
            None => {
                return RecoveryOutcome::Unrecoverable {
                    reason: "no pending error".to_string(),
                }
            }
        };

        state.audit(
            AuditEventType::RecoveryAttempted,
            failure.stage.as_deref(),
            json!({ "error": failure.to_string(), "failure": failure }),
        );

        let strategy = if failure.is_recoverable() {
            self.strategies.iter().find(|s| s.applies_to(&failure))
        } else {
            None
        };

        let strategy = match strategy {
            Some(strategy) => strategy,
            None => {
                let reason = if failure.is_recoverable() {
                    "no applicable strategy"
                } else {
                    "failure kind is not recoverable"
                };
                return Self::unrecoverable(state, &failure, None, reason);
            }
        };

        strategy.recover(state);

        if state.status() != WorkflowStatus::Running {
            return Self::unrecoverable(
                state,
                &failure,
                Some(strategy.name()),
                "workflow still failed after remediation",
            );
        }

        state.clear_last_error();
        state.audit(
            AuditEventType::RecoverySucceeded,
            failure.stage.as_deref(),
            json!({ "strategy": strategy.name() }),
        );
        info!(
            workflow_id = %state.workflow_id(),
            strategy = strategy.name(),
            error = %failure,
            "Recovered from failure"
        );

        RecoveryOutcome::Recovered {
            strategy: strategy.name(),
        }
    }

    fn unrecoverable(
        state: &mut WorkflowState,
        failure: &WorkflowFailure,
        strategy: Option<&'static str>,
        reason: &str,
    ) -> RecoveryOutcome {
        warn!(
            workflow_id = %state.workflow_id(),
            strategy = strategy.unwrap_or("-"),
            reason = reason,
            error = %failure,
            "Recovery failed"
        );
        state.audit(
            AuditEventType::RecoveryFailed,
            failure.stage.as_deref(),
            json!({ "strategy": strategy, "reason": reason }),
        );

        RecoveryOutcome::Unrecoverable {
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for RecoveryStrategies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|s| s.name()))
            .finish()
    }
}
