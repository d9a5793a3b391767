//! Orchestrator
//!
//! Drives one workflow from start to finalization:
//!
//! ```text
//! start -> determine type -> chat stage ------------------------------> finalize
//!                         -> route content -> stages -> monitor -> check completion
//!                                 ^                                   |
//!                                 +---- continue / retry / recovered -+-> finalize
//! ```
//!
//! The orchestrator owns the state for the whole run and is the only writer
//! of status, retry counters and decisions.

use chrono::Utc;
use pulse_core::{AuditEventType, AuditSink, Campaign, PipelineConfig, TracingAuditSink, WorkflowType};
use pulse_infra::{CircuitBreakerRegistry, RetryPolicyTable};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{ExecutionContext, Interrupt};
use crate::monitor::WorkflowMonitor;
use crate::parallel::ParallelCoordinator;
use crate::recovery::RecoveryStrategies;
use crate::retry::{RetryDecision, RetryHandler, RetryingStage, StopReason};
use crate::router::{CompletionStatus, ContentRoute, Router, WorkflowRoute};
use crate::stage::{Stage, StageKind, StageSet};
use crate::state::{WorkflowFailure, WorkflowState, WorkflowStatus};
use crate::WorkflowError;

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    stages: StageSet,
    retry_handler: Option<Arc<RetryHandler>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    recovery: Option<RecoveryStrategies>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage);
        self
    }

    pub fn stages(mut self, stages: StageSet) -> Self {
        self.stages = stages;
        self
    }

    pub fn retry_handler(mut self, handler: Arc<RetryHandler>) -> Self {
        self.retry_handler = Some(handler);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn recovery(mut self, recovery: RecoveryStrategies) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn build(self) -> Orchestrator {
        let retry = self.retry_handler.unwrap_or_else(|| {
            Arc::new(RetryHandler::new(
                RetryPolicyTable::default(),
                Arc::new(CircuitBreakerRegistry::default()),
            ))
        });

        Orchestrator {
            stages: self.stages,
            coordinator: ParallelCoordinator::new(retry.clone()),
            retry,
            router: Router::new(),
            monitor: WorkflowMonitor::new(),
            recovery: self.recovery.unwrap_or_default(),
            audit_sink: self
                .audit_sink
                .unwrap_or_else(|| Arc::new(TracingAuditSink)),
            cancel: CancellationToken::new(),
        }
    }
}

pub struct Orchestrator {
    stages: StageSet,
    retry: Arc<RetryHandler>,
    router: Router,
    coordinator: ParallelCoordinator,
    monitor: WorkflowMonitor,
    recovery: RecoveryStrategies,
    audit_sink: Arc<dyn AuditSink>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn retry_handler(&self) -> &Arc<RetryHandler> {
        &self.retry
    }

    pub fn stages(&self) -> &StageSet {
        &self.stages
    }

    /// Token that cancels every workflow this orchestrator is running
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build the initial state and mark it running
    pub fn start(
        &self,
        campaign: Campaign,
        workflow_type: WorkflowType,
        config: PipelineConfig,
    ) -> WorkflowState {
        let mut state = WorkflowState::new(campaign, workflow_type, config);
        self.begin(&mut state);
        state
    }

    fn begin(&self, state: &mut WorkflowState) {
        if let Err(e) = state.transition_to(WorkflowStatus::Running) {
            warn!(workflow_id = %state.workflow_id(), error = %e, "Cannot start workflow");
            return;
        }

        let details = json!({
            "campaign_id": state.campaign().id,
            "campaign": state.campaign().name,
            "workflow_type": state.workflow_type().to_string(),
            "sources": state.campaign().sources.len(),
            "raw_content": state.raw_content().len(),
        });
        state.audit(AuditEventType::WorkflowStarted, None, details);

        info!(
            workflow_id = %state.workflow_id(),
            campaign_id = %state.campaign().id,
            workflow_type = %state.workflow_type(),
            "Workflow started"
        );
    }

    /// Run a workflow to its terminal state
    pub async fn execute(&self, state: WorkflowState) -> WorkflowState {
        self.execute_with_cancellation(state, self.cancel.child_token())
            .await
    }

    /// Run a workflow with a caller-owned cancellation token
    pub async fn execute_with_cancellation(
        &self,
        mut state: WorkflowState,
        cancel: CancellationToken,
    ) -> WorkflowState {
        if state.status() == WorkflowStatus::Pending {
            self.begin(&mut state);
        }
        if state.status() != WorkflowStatus::Running {
            warn!(
                workflow_id = %state.workflow_id(),
                status = %state.status(),
                "Workflow is not runnable"
            );
            return state;
        }

        let ctx = ExecutionContext::starting_at(
            state.started_instant(),
            state.config().global_timeout(),
            cancel,
        );

        let route = self.router.determine_workflow_type(&state);
        let decision = self.router.workflow_type_decision(&state, route);
        state.record_decision(decision);
        state.audit(
            AuditEventType::DecisionMade,
            None,
            json!({ "decision_type": "workflow_type", "selected_path": route.as_str() }),
        );

        match route {
            WorkflowRoute::ChatQuery => self.run_chat(&mut state, &ctx).await,
            WorkflowRoute::ContentAnalysis => self.run_content(&mut state, &ctx).await,
            WorkflowRoute::Error => {
                state.fail(WorkflowFailure::routing(
                    "nothing to process: no query, conversation, content or sources",
                ));
                self.handle_error(&mut state);
            }
        }

        self.flush(&mut state).await;
        self.finalize(state).await
    }

    async fn run_chat(&self, state: &mut WorkflowState, ctx: &ExecutionContext) {
        let stage = match self.stages.get(StageKind::Chat) {
            Some(stage) => stage,
            None => {
                state.fail(WorkflowFailure::routing(
                    WorkflowError::StageNotRegistered(StageKind::Chat).to_string(),
                ));
                self.handle_error(state);
                return;
            }
        };

        state.plan(&[StageKind::Chat]);
        let stage = RetryingStage::new(stage, self.retry.clone());
        if stage.invoke(state, ctx).await.is_err() {
            self.handle_error(state);
        }
    }

    async fn run_content(&self, state: &mut WorkflowState, ctx: &ExecutionContext) {
        let mut retrying_fanout = false;

        loop {
            let route = self.router.route_content_processing(state);
            state.audit(
                AuditEventType::DecisionMade,
                None,
                json!({ "decision_type": "content_routing", "selected_path": route.as_str() }),
            );
            debug!(workflow_id = %state.workflow_id(), route = route.as_str(), "Content route selected");

            match route {
                ContentRoute::ScoutFirst | ContentRoute::AnalysisOnly => {
                    self.run_sequence(state, route.stages(), ctx).await;
                }
                ContentRoute::ParallelProcessing => {
                    if !retrying_fanout {
                        state.begin_retry_chain();
                    }
                    self.coordinator
                        .run_parallel(state, &self.stages, route.stages(), ctx)
                        .await;
                }
                ContentRoute::Error => {}
            }

            self.monitor.check(state, ctx);
            self.flush(state).await;

            retrying_fanout = false;
            let resume = match self.router.check_completion(state) {
                CompletionStatus::Completed => break,
                CompletionStatus::Continue => {
                    !self.monitor.enforce_iteration_limit(state) || self.handle_error(state)
                }
                CompletionStatus::Retry => {
                    retrying_fanout = self.retry_fanout(state, ctx).await;
                    retrying_fanout || self.handle_error(state)
                }
                CompletionStatus::Error => self.handle_error(state),
            };

            if !resume {
                break;
            }
        }
    }

    /// Run stages one after another through the retry wrapper. Stages that
    /// are degraded or have nothing to do are passed over.
    async fn run_sequence(&self, state: &mut WorkflowState, kinds: &[StageKind], ctx: &ExecutionContext) {
        state.plan(kinds);

        for kind in kinds.iter().copied() {
            if state.is_degraded(kind) {
                state.enter_node(kind);
                state.audit(
                    AuditEventType::NodeSkipped,
                    Some(kind.as_str()),
                    json!({ "reason": "degraded" }),
                );
                continue;
            }

            let has_work = match kind {
                StageKind::Scout | StageKind::Chat => true,
                StageKind::Clean => state.has_unclean_content(),
                StageKind::Analyze => state.has_unanalyzed_content(),
            };
            if !has_work {
                state.enter_node(kind);
                debug!(workflow_id = %state.workflow_id(), stage = %kind, "Nothing to do for stage");
                continue;
            }

            let stage = match self.stages.get(kind) {
                Some(stage) => RetryingStage::new(stage, self.retry.clone()),
                None => {
                    state.fail(
                        WorkflowFailure::routing(WorkflowError::StageNotRegistered(kind).to_string())
                            .with_stage(kind.as_str()),
                    );
                    return;
                }
            };

            if stage.invoke(state, ctx).await.is_err() {
                return;
            }
        }
    }

    /// Workflow-level retry after a failed fan-out branch. Returns whether
    /// another pass should run.
    async fn retry_fanout(&self, state: &mut WorkflowState, ctx: &ExecutionContext) -> bool {
        let failure = match state.last_error() {
            Some(failure) => failure.clone(),
            None => return true,
        };

        let (stage, category) = match (failure.stage.clone(), failure.category()) {
            (Some(stage), Some(category)) => (stage, category),
            _ => {
                state.fail(failure);
                return false;
            }
        };

        let policy = self.retry.policy(category);
        state.set_max_retries(self.retry.effective_max_retries(&policy));
        let attempts = state.retry_count() + 1;

        match self.retry.should_retry(&stage, category, state, attempts, ctx) {
            RetryDecision::Retry => {
                let delay = policy.delay_for(state.retry_count());
                warn!(
                    workflow_id = %state.workflow_id(),
                    stage = %stage,
                    category = %category,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying fan-out after branch failure"
                );
                state.audit(
                    AuditEventType::NodeRetry,
                    Some(stage.as_str()),
                    json!({
                        "scope": "parallel",
                        "attempt": attempts,
                        "retry": state.retry_count() + 1,
                        "category": category,
                        "delay_ms": delay.as_millis() as u64,
                        "error": failure.message,
                    }),
                );

                if let Err(interrupt) = ctx.sleep(delay).await {
                    state.fail(ctx.failure(interrupt).with_stage(stage));
                    return false;
                }
                state.increment_retry(&stage);
                state.clear_last_error();
                true
            }
            RetryDecision::Stop(StopReason::GlobalTimeout) => {
                state.fail(ctx.failure(Interrupt::TimedOut).with_stage(stage));
                false
            }
            RetryDecision::Stop(StopReason::Cancelled) => {
                state.fail(ctx.failure(Interrupt::Cancelled).with_stage(stage));
                false
            }
            RetryDecision::Stop(reason) => {
                self.retry
                    .fail_terminal(state, &stage, category, failure.message, reason, attempts);
                false
            }
        }
    }

    /// One recovery pass. Returns whether the workflow resumes.
    fn handle_error(&self, state: &mut WorkflowState) -> bool {
        if state.status() == WorkflowStatus::Running {
            let failure = state
                .last_error()
                .cloned()
                .unwrap_or_else(|| WorkflowFailure::routing("unresolved workflow error"));
            state.fail(failure);
        }

        self.recovery.attempt(state).is_recovered()
    }

    /// Settle the terminal status and append the run summary
    pub async fn finalize(&self, mut state: WorkflowState) -> WorkflowState {
        if let Ok(elapsed) = (Utc::now() - state.started_at()).to_std() {
            state.metrics_mut().observe_processing_time(elapsed);
        }

        if state.status() == WorkflowStatus::Running {
            if let Err(e) = state.transition_to(WorkflowStatus::Completed) {
                warn!(workflow_id = %state.workflow_id(), error = %e, "Cannot complete workflow");
            }
        }

        if state.status() == WorkflowStatus::Cancelled {
            let reason = state.last_error().map(|f| f.to_string());
            state.audit(
                AuditEventType::WorkflowCancelled,
                None,
                json!({ "reason": reason }),
            );
        }

        let metrics = state.metrics();
        let summary = json!({
            "status": state.status(),
            "total_cost": metrics.total_cost,
            "campaign_spend": state.campaign().current_spend + metrics.total_cost,
            "tokens_used": metrics.tokens_used,
            "duration_secs": metrics.processing_time.as_secs_f64(),
            "raw_content": state.raw_content().len(),
            "processed_content": state.processed_content().len(),
            "analyzed_content": state.analyzed_count(),
            "insights": state.insights().len(),
            "flags": metrics.flags,
            "errors": metrics.errors.len(),
            "warnings": metrics.warnings.len(),
            "stage_retries": state.stage_retries(),
            "degraded_stages": state.degraded_stages(),
            "lightweight_mode": state.config().lightweight_mode,
            "last_error": state.last_error().map(|f| f.to_string()),
        });
        state.audit(AuditEventType::WorkflowCompleted, None, summary);
        state.mark_finished();

        match state.status() {
            WorkflowStatus::Completed => info!(
                workflow_id = %state.workflow_id(),
                total_cost = state.metrics().total_cost,
                insights = state.insights().len(),
                "Workflow completed"
            ),
            status => warn!(
                workflow_id = %state.workflow_id(),
                status = %status,
                error = ?state.last_error().map(|f| f.to_string()),
                "Workflow finished without completing"
            ),
        }

        self.flush(&mut state).await;
        state
    }

    /// Hand trail entries not yet forwarded to the audit sink
    async fn flush(&self, state: &mut WorkflowState) {
        for event in state.take_unforwarded_events() {
            if let Err(e) = self.audit_sink.append(&event).await {
                warn!(
                    workflow_id = %event.workflow_id,
                    event_type = event.event_type.as_str(),
                    error = %e,
                    "Failed to forward audit event"
                );
            }
        }
    }
}
