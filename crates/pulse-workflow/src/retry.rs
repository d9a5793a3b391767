//! Retrying stage invocation
//!
//! Every stage call goes through [`RetryHandler::execute`]: invoke, classify
//! the failure, consult the policy table, breakers and guards, back off and
//! try again, or give up and record a terminal failure.

use pulse_core::{AuditEventType, ErrorCategory, PipelineConfig};
use pulse_infra::{CircuitBreakerRegistry, ErrorClassifier, RetryPolicy, RetryPolicyTable};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::{ExecutionContext, Interrupt};
use crate::stage::{Stage, StageError, StageKind};
use crate::state::{WorkflowFailure, WorkflowState};

/// Limits that apply to every category
#[derive(Debug, Clone)]
pub struct RetryLimits {
    /// Hard ceiling of attempts for one invocation chain
    pub max_total_attempts: u32,
    /// Fraction of the campaign budget above which retries stop
    pub budget_guard_ratio: f64,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_total_attempts: 10,
            budget_guard_ratio: 0.9,
        }
    }
}

impl From<&PipelineConfig> for RetryLimits {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_total_attempts: config.max_total_attempts.max(1),
            budget_guard_ratio: config.budget_guard_ratio,
        }
    }
}

/// Why a failed stage is not retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The category's policy never retries
    NotRetryable,
    RetriesExhausted,
    AttemptCeiling,
    CircuitOpen,
    BudgetGuard,
    GlobalTimeout,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::NotRetryable => "not_retryable",
            StopReason::RetriesExhausted => "retries_exhausted",
            StopReason::AttemptCeiling => "attempt_ceiling",
            StopReason::CircuitOpen => "circuit_open",
            StopReason::BudgetGuard => "budget_guard",
            StopReason::GlobalTimeout => "global_timeout",
            StopReason::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop(StopReason),
}

/// Retry decisions and stage invocation shared by the sequential pipeline
/// and the fan-out coordinator
#[derive(Debug)]
pub struct RetryHandler {
    policies: RetryPolicyTable,
    breakers: Arc<CircuitBreakerRegistry>,
    classifier: ErrorClassifier,
    limits: RetryLimits,
}

impl RetryHandler {
    pub fn new(policies: RetryPolicyTable, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            policies,
            breakers,
            classifier: ErrorClassifier::default(),
            limits: RetryLimits::default(),
        }
    }

    /// Handler using the configured policy overrides and limits
    pub fn from_config(config: &PipelineConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self::new(RetryPolicyTable::from_settings(&config.retry_policies), breakers)
            .with_limits(RetryLimits::from(config))
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_limits(mut self, limits: RetryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn policies(&self) -> &RetryPolicyTable {
        &self.policies
    }

    pub fn limits(&self) -> &RetryLimits {
        &self.limits
    }

    pub fn classify(&self, err: &StageError) -> ErrorCategory {
        self.classifier.classify_with_hint(err.category, &err.message)
    }

    pub fn policy(&self, category: ErrorCategory) -> RetryPolicy {
        self.policies.get(category)
    }

    /// Retry ceiling of a chain failing with `policy`
    pub(crate) fn effective_max_retries(&self, policy: &RetryPolicy) -> u32 {
        policy
            .max_retries
            .min(self.limits.max_total_attempts.saturating_sub(1))
    }

    /// Decide whether the chain for `stage` may try again.
    ///
    /// `attempts` counts invocations made so far in this chain.
    pub fn should_retry(
        &self,
        stage: &str,
        category: ErrorCategory,
        state: &WorkflowState,
        attempts: u32,
        ctx: &ExecutionContext,
    ) -> RetryDecision {
        let policy = self.policy(category);

        if !policy.allows_retry(state.retry_count()) {
            return RetryDecision::Stop(if policy.max_retries == 0 || !policy.allows_retry(0) {
                StopReason::NotRetryable
            } else {
                StopReason::RetriesExhausted
            });
        }

        if attempts >= self.limits.max_total_attempts {
            return RetryDecision::Stop(StopReason::AttemptCeiling);
        }

        if self.breakers.is_open(stage, category) {
            return RetryDecision::Stop(StopReason::CircuitOpen);
        }

        if let Some(limit) = state.budget_limit() {
            if state.metrics().total_cost > self.limits.budget_guard_ratio * limit {
                return RetryDecision::Stop(StopReason::BudgetGuard);
            }
        }

        match ctx.interrupt() {
            Some(Interrupt::TimedOut) => RetryDecision::Stop(StopReason::GlobalTimeout),
            Some(Interrupt::Cancelled) => RetryDecision::Stop(StopReason::Cancelled),
            None => RetryDecision::Retry,
        }
    }

    /// Run one stage to success or terminal failure, retrying per policy.
    ///
    /// Starts a fresh chain: `retry_count` is reset and each retry is also
    /// tallied under the stage name. On terminal failure the state is
    /// `Failed` (or `Cancelled`) with `last_error` set.
    pub async fn execute(
        &self,
        stage: &dyn Stage,
        state: &mut WorkflowState,
        ctx: &ExecutionContext,
    ) -> Result<(), WorkflowFailure> {
        let kind = stage.kind();
        let name = kind.as_str();

        state.enter_node(kind);
        state.begin_retry_chain();
        state.audit(AuditEventType::NodeStarted, Some(name), json!({}));
        debug!(workflow_id = %state.workflow_id(), stage = name, "Invoking stage");

        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let result = match ctx.guard(stage.run(state)).await {
                Ok(result) => result,
                Err(interrupt) => return Err(self.interrupted(state, kind, interrupt, ctx)),
            };

            let err = match result {
                Ok(output) => {
                    self.breakers.reset_stage(name);
                    state.apply_output(kind, output);
                    state.audit(
                        AuditEventType::NodeCompleted,
                        Some(name),
                        json!({
                            "attempts": attempts,
                            "retries": state.retry_count(),
                        }),
                    );
                    info!(
                        workflow_id = %state.workflow_id(),
                        stage = name,
                        attempts = attempts,
                        "Stage completed"
                    );
                    return Ok(());
                }
                Err(err) => err,
            };

            let category = self.classify(&err);
            let policy = self.policy(category);
            state.set_max_retries(self.effective_max_retries(&policy));
            state
                .metrics_mut()
                .record_error(format!("{} attempt {}: {}", name, attempts, err));

            match self.should_retry(name, category, state, attempts, ctx) {
                RetryDecision::Retry => {
                    let delay = policy.delay_for(state.retry_count());
                    warn!(
                        workflow_id = %state.workflow_id(),
                        stage = name,
                        category = %category,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Stage failed, retrying"
                    );
                    state.audit(
                        AuditEventType::NodeRetry,
                        Some(name),
                        json!({
                            "attempt": attempts,
                            "retry": state.retry_count() + 1,
                            "category": category,
                            "delay_ms": delay.as_millis() as u64,
                            "error": err.message,
                        }),
                    );

                    if let Err(interrupt) = ctx.sleep(delay).await {
                        return Err(self.interrupted(state, kind, interrupt, ctx));
                    }
                    state.increment_retry(name);
                }
                RetryDecision::Stop(StopReason::GlobalTimeout) => {
                    return Err(self.interrupted(state, kind, Interrupt::TimedOut, ctx));
                }
                RetryDecision::Stop(StopReason::Cancelled) => {
                    return Err(self.interrupted(state, kind, Interrupt::Cancelled, ctx));
                }
                RetryDecision::Stop(reason) => {
                    return Err(self.fail_terminal(
                        state,
                        name,
                        category,
                        err.message,
                        reason,
                        attempts,
                    ));
                }
            }
        }
    }

    /// Record a terminal stage failure: breaker, trail, `Failed` status
    pub(crate) fn fail_terminal(
        &self,
        state: &mut WorkflowState,
        stage: &str,
        category: ErrorCategory,
        message: String,
        reason: StopReason,
        attempts: u32,
    ) -> WorkflowFailure {
        self.breakers.record_failure(stage, category);

        error!(
            workflow_id = %state.workflow_id(),
            stage = stage,
            category = %category,
            reason = %reason,
            attempts = attempts,
            error = %message,
            "Stage failed permanently"
        );
        state.audit(
            AuditEventType::RetryExhausted,
            Some(stage),
            json!({
                "category": category,
                "reason": reason.as_str(),
                "attempts": attempts,
                "retries": state.retry_count(),
                "error": message,
            }),
        );

        let failure = WorkflowFailure::stage(stage, category, message);
        state.fail(failure.clone());
        failure
    }

    fn interrupted(
        &self,
        state: &mut WorkflowState,
        kind: StageKind,
        interrupt: Interrupt,
        ctx: &ExecutionContext,
    ) -> WorkflowFailure {
        let failure = ctx.failure(interrupt).with_stage(kind.as_str());
        let reason = match interrupt {
            Interrupt::Cancelled => StopReason::Cancelled,
            Interrupt::TimedOut => StopReason::GlobalTimeout,
        };

        warn!(
            workflow_id = %state.workflow_id(),
            stage = kind.as_str(),
            reason = %reason,
            "Stage interrupted"
        );
        state.metrics_mut().record_error(failure.to_string());
        state.audit(
            AuditEventType::RetryExhausted,
            Some(kind.as_str()),
            json!({
                "reason": reason.as_str(),
                "retries": state.retry_count(),
                "error": failure.message,
            }),
        );
        state.fail(failure.clone());
        failure
    }
}

/// A stage bound to the retry handler; invoking it runs the full retry loop
#[derive(Clone)]
pub struct RetryingStage {
    inner: Arc<dyn Stage>,
    handler: Arc<RetryHandler>,
}

impl RetryingStage {
    pub fn new(inner: Arc<dyn Stage>, handler: Arc<RetryHandler>) -> Self {
        Self { inner, handler }
    }

    pub fn kind(&self) -> StageKind {
        self.inner.kind()
    }

    pub async fn invoke(
        &self,
        state: &mut WorkflowState,
        ctx: &ExecutionContext,
    ) -> Result<(), WorkflowFailure> {
        self.handler.execute(self.inner.as_ref(), state, ctx).await
    }
}

impl std::fmt::Debug for RetryingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingStage")
            .field("stage", &self.inner.kind())
            .finish()
    }
}
