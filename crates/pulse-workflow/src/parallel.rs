//! Fan-out/fan-in of independent stages
//!
//! Eligible stages run concurrently against a snapshot of the state. Each
//! branch gets exactly one attempt; a failing branch never cancels its
//! siblings. Outputs are merged in completion order once each branch
//! resolves, so no two branches ever write the state.

use futures::stream::{FuturesUnordered, StreamExt};
use pulse_core::AuditEventType;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::retry::RetryHandler;
use crate::stage::{Stage, StageKind, StageSet};
use crate::state::{ParallelTaskStatus, WorkflowFailure, WorkflowState};

#[derive(Debug, Clone)]
pub struct ParallelCoordinator {
    handler: Arc<RetryHandler>,
}

impl ParallelCoordinator {
    pub fn new(handler: Arc<RetryHandler>) -> Self {
        Self { handler }
    }

    /// Stages among `candidates` that have work to do and are not degraded
    pub fn eligible(state: &WorkflowState, candidates: &[StageKind]) -> Vec<StageKind> {
        candidates
            .iter()
            .copied()
            .filter(|kind| !state.is_degraded(*kind))
            .filter(|kind| match kind {
                StageKind::Clean => state.has_unclean_content(),
                StageKind::Analyze => state.has_unanalyzed_content(),
                StageKind::Scout | StageKind::Chat => false,
            })
            .collect()
    }

    /// Run the eligible stages concurrently and merge their outputs.
    ///
    /// Branch failures are recorded in `last_error` with the workflow left
    /// `Running`; the completion check turns that into a workflow-level
    /// retry. `parallel_tasks` describes this fan-out until the next one.
    pub async fn run_parallel(
        &self,
        state: &mut WorkflowState,
        stages: &StageSet,
        candidates: &[StageKind],
        ctx: &ExecutionContext,
    ) {
        state.clear_parallel_tasks();

        let branches: Vec<Arc<dyn Stage>> = Self::eligible(state, candidates)
            .into_iter()
            .filter_map(|kind| {
                let stage = stages.get(kind);
                if stage.is_none() {
                    warn!(stage = %kind, "No stage registered for fan-out branch");
                }
                stage
            })
            .collect();

        if branches.is_empty() {
            debug!(workflow_id = %state.workflow_id(), "No eligible stages for fan-out");
            return;
        }

        let names: Vec<&str> = branches.iter().map(|s| s.kind().as_str()).collect();
        for branch in &branches {
            state.set_parallel_task(branch.kind(), ParallelTaskStatus::Pending);
        }
        state.audit(
            AuditEventType::ParallelStarted,
            None,
            json!({ "stages": names }),
        );
        info!(
            workflow_id = %state.workflow_id(),
            stages = ?names,
            "Starting parallel stages"
        );

        let snapshot = state.clone();
        for branch in &branches {
            state.set_parallel_task(branch.kind(), ParallelTaskStatus::Running);
            state.audit(
                AuditEventType::NodeStarted,
                Some(branch.kind().as_str()),
                json!({ "parallel": true }),
            );
        }

        let mut pending: FuturesUnordered<_> = branches
            .iter()
            .map(|branch| {
                let view = &snapshot;
                async move { (branch.kind(), ctx.guard(branch.run(view)).await) }
            })
            .collect();

        let mut completed = Vec::new();
        let mut failed = Vec::new();

        while let Some((kind, result)) = pending.next().await {
            let name = kind.as_str();
            match result {
                Ok(Ok(output)) => {
                    self.handler.breakers().reset_stage(name);
                    state.apply_output(kind, output);
                    state.set_parallel_task(kind, ParallelTaskStatus::Completed);
                    state.audit(
                        AuditEventType::NodeCompleted,
                        Some(name),
                        json!({ "parallel": true }),
                    );
                    completed.push(name);
                }
                Ok(Err(err)) => {
                    let category = self.handler.classify(&err);
                    warn!(
                        workflow_id = %state.workflow_id(),
                        stage = name,
                        category = %category,
                        error = %err,
                        "Parallel stage failed"
                    );
                    state.set_parallel_task(kind, ParallelTaskStatus::Failed);
                    state
                        .metrics_mut()
                        .record_error(format!("{}: {}", name, err));
                    state.audit(
                        AuditEventType::NodeFailed,
                        Some(name),
                        json!({
                            "parallel": true,
                            "category": category,
                            "error": err.message,
                        }),
                    );
                    state.set_last_error(WorkflowFailure::stage(name, category, err.message));
                    failed.push(name);
                }
                Err(interrupt) => {
                    let failure = ctx.failure(interrupt).with_stage(name);
                    state.set_parallel_task(kind, ParallelTaskStatus::Failed);
                    state.metrics_mut().record_error(failure.to_string());
                    state.fail(failure);
                    failed.push(name);
                }
            }
        }

        state.audit(
            AuditEventType::ParallelCompleted,
            None,
            json!({ "completed": completed, "failed": failed }),
        );
        info!(
            workflow_id = %state.workflow_id(),
            completed = completed.len(),
            failed = failed.len(),
            "Parallel stages joined"
        );
    }
}
