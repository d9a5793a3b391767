//! Workflow state model
//!
//! A single typed record owned by the orchestrator for one workflow run.
//! Stages read it through `&WorkflowState` and hand back a [`StageOutput`];
//! every write goes through methods on this type.

use chrono::{DateTime, Utc};
use pulse_core::{
    AuditEvent, AuditEventType, Campaign, ContentItem, ConversationTurn, ErrorCategory, Insight,
    PipelineConfig, ProcessedContent, WorkflowId, WorkflowType,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::stage::{StageKind, StageOutput};
use crate::{Result, WorkflowError};

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Forward moves only, plus `Failed -> Running` after a successful recovery
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        if *self == next {
            return true;
        }

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Running)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one routing choice. Never edited after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_type: String,
    pub criteria: BTreeMap<String, serde_json::Value>,
    pub selected_path: String,
    pub alternatives: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn new(decision_type: impl Into<String>, selected_path: impl Into<String>) -> Self {
        Self {
            decision_type: decision_type.into(),
            criteria: BTreeMap::new(),
            selected_path: selected_path.into(),
            alternatives: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_criterion(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.criteria.insert(key.into(), value);
        self
    }

    pub fn with_alternatives<I, S>(mut self, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternatives = alternatives.into_iter().map(Into::into).collect();
        self
    }
}

/// Status of one branch of a fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Content flag counters fed by the cleaning stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagCounts {
    pub spam: u64,
    pub pii: u64,
    pub toxic: u64,
}

/// Run metrics. Every counter only grows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub tokens_used: u64,
    pub total_cost: f64,
    pub processing_time: Duration,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub flags: FlagCounts,
}

impl WorkflowMetrics {
    /// Add stage usage; negative costs are ignored
    pub fn add_usage(&mut self, tokens: u64, cost: f64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        if cost.is_finite() && cost > 0.0 {
            self.total_cost += cost;
        }
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn record_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn observe_processing_time(&mut self, elapsed: Duration) {
        self.processing_time = self.processing_time.max(elapsed);
    }
}

/// What ended a stage chain or the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    Stage { category: ErrorCategory },
    BudgetExceeded,
    Timeout,
    Cancelled,
    Routing,
    IterationLimit,
}

/// Unresolved error held in `last_error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    #[serde(flatten)]
    pub kind: FailureKind,
    pub stage: Option<String>,
    pub message: String,
}

impl WorkflowFailure {
    pub fn stage(
        stage: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: FailureKind::Stage { category },
            stage: Some(stage.into()),
            message: message.into(),
        }
    }

    pub fn budget(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::BudgetExceeded,
            stage: None,
            message: message.into(),
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            stage: None,
            message: format!("global timeout exceeded after {}s", elapsed.as_secs()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            stage: None,
            message: "workflow cancelled".to_string(),
        }
    }

    pub fn routing(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Routing,
            stage: None,
            message: message.into(),
        }
    }

    pub fn iteration_limit(iterations: u32) -> Self {
        Self {
            kind: FailureKind::IterationLimit,
            stage: None,
            message: format!("content pipeline did not settle after {} passes", iterations),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Error category for stage failures
    pub fn category(&self) -> Option<ErrorCategory> {
        match self.kind {
            FailureKind::Stage { category } => Some(category),
            _ => None,
        }
    }

    /// Whether a recovery strategy may act on this failure at all
    pub fn is_recoverable(&self) -> bool {
        match self.kind {
            FailureKind::Stage { category } => category != ErrorCategory::Critical,
            FailureKind::BudgetExceeded => true,
            FailureKind::Timeout
            | FailureKind::Cancelled
            | FailureKind::Routing
            | FailureKind::IterationLimit => false,
        }
    }
}

impl std::fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "{}: {}", stage, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// The record driven through every stage of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    workflow_id: WorkflowId,
    workflow_type: WorkflowType,
    campaign: Campaign,
    config: PipelineConfig,

    status: WorkflowStatus,
    current_node: Option<String>,
    next_nodes: VecDeque<String>,
    decisions: Vec<Decision>,
    parallel_tasks: BTreeMap<String, ParallelTaskStatus>,

    metrics: WorkflowMetrics,
    retry_count: u32,
    max_retries: u32,
    stage_retries: BTreeMap<String, u32>,
    audit_trail: Vec<AuditEvent>,
    last_error: Option<WorkflowFailure>,
    degraded_stages: BTreeSet<String>,
    iterations: u32,

    raw_content: Vec<ContentItem>,
    processed_content: Vec<ProcessedContent>,
    insights: Vec<Insight>,

    user_query: Option<String>,
    conversation_history: Vec<ConversationTurn>,
    response: Option<String>,

    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,

    /// Monotonic counterpart of `started_at`; anchors the global deadline
    #[serde(skip, default = "Instant::now")]
    started_instant: Instant,
    #[serde(skip)]
    forwarded_events: usize,
}

impl WorkflowState {
    pub fn new(campaign: Campaign, workflow_type: WorkflowType, config: PipelineConfig) -> Self {
        let max_retries = config.max_retries;

        Self {
            workflow_id: WorkflowId::new(),
            workflow_type,
            campaign,
            config,
            status: WorkflowStatus::Pending,
            current_node: None,
            next_nodes: VecDeque::new(),
            decisions: Vec::new(),
            parallel_tasks: BTreeMap::new(),
            metrics: WorkflowMetrics::default(),
            retry_count: 0,
            max_retries,
            stage_retries: BTreeMap::new(),
            audit_trail: Vec::new(),
            last_error: None,
            degraded_stages: BTreeSet::new(),
            iterations: 0,
            raw_content: Vec::new(),
            processed_content: Vec::new(),
            insights: Vec::new(),
            user_query: None,
            conversation_history: Vec::new(),
            response: None,
            started_at: Utc::now(),
            completed_at: None,
            started_instant: Instant::now(),
            forwarded_events: 0,
        }
    }

    // Input builders, used before the workflow is handed to the orchestrator

    pub fn with_raw_content(mut self, items: Vec<ContentItem>) -> Self {
        self.raw_content = items;
        self
    }

    pub fn with_processed_content(mut self, items: Vec<ProcessedContent>) -> Self {
        self.processed_content = items;
        self
    }

    pub fn with_user_query(mut self, query: impl Into<String>) -> Self {
        self.user_query = Some(query.into());
        self
    }

    pub fn with_conversation_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.conversation_history = history;
        self
    }

    // Accessors

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn workflow_type(&self) -> WorkflowType {
        self.workflow_type
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    pub fn next_nodes(&self) -> impl Iterator<Item = &str> {
        self.next_nodes.iter().map(String::as_str)
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    /// Most recent decision; authoritative for the edge that follows it
    pub fn last_decision(&self) -> Option<&Decision> {
        self.decisions.last()
    }

    pub fn parallel_tasks(&self) -> &BTreeMap<String, ParallelTaskStatus> {
        &self.parallel_tasks
    }

    pub fn parallel_task(&self, stage: StageKind) -> Option<ParallelTaskStatus> {
        self.parallel_tasks.get(stage.as_str()).copied()
    }

    pub fn metrics(&self) -> &WorkflowMetrics {
        &self.metrics
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Retries spent by each stage over the whole run
    pub fn stage_retries(&self) -> &BTreeMap<String, u32> {
        &self.stage_retries
    }

    pub fn retries_for(&self, stage: StageKind) -> u32 {
        self.stage_retries.get(stage.as_str()).copied().unwrap_or(0)
    }

    pub fn audit_trail(&self) -> &[AuditEvent] {
        &self.audit_trail
    }

    /// Number of trail entries of one type
    pub fn audit_count(&self, event_type: AuditEventType) -> usize {
        self.audit_trail.iter().filter(|e| e.is(event_type)).count()
    }

    pub fn last_error(&self) -> Option<&WorkflowFailure> {
        self.last_error.as_ref()
    }

    pub fn degraded_stages(&self) -> &BTreeSet<String> {
        &self.degraded_stages
    }

    pub fn is_degraded(&self, stage: StageKind) -> bool {
        self.degraded_stages.contains(stage.as_str())
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn raw_content(&self) -> &[ContentItem] {
        &self.raw_content
    }

    pub fn processed_content(&self) -> &[ProcessedContent] {
        &self.processed_content
    }

    pub fn insights(&self) -> &[Insight] {
        &self.insights
    }

    pub fn user_query(&self) -> Option<&str> {
        self.user_query.as_deref()
    }

    pub fn conversation_history(&self) -> &[ConversationTurn] {
        &self.conversation_history
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn started_instant(&self) -> Instant {
        self.started_instant
    }

    // Content progress queries

    fn processed_entry(&self, content_id: &str) -> Option<&ProcessedContent> {
        self.processed_content
            .iter()
            .find(|p| p.content_id == content_id)
    }

    /// Raw items that have no cleaned counterpart yet
    pub fn unclean_content(&self) -> Vec<&ContentItem> {
        self.raw_content
            .iter()
            .filter(|item| self.processed_entry(&item.id).is_none())
            .collect()
    }

    pub fn has_unclean_content(&self) -> bool {
        self.raw_content
            .iter()
            .any(|item| self.processed_entry(&item.id).is_none())
    }

    /// Cleaned items waiting for analysis
    pub fn unanalyzed_content(&self) -> Vec<&ProcessedContent> {
        self.processed_content.iter().filter(|p| !p.analyzed).collect()
    }

    pub fn has_unanalyzed_content(&self) -> bool {
        self.processed_content.iter().any(|p| !p.analyzed)
    }

    pub fn analyzed_count(&self) -> usize {
        self.processed_content.iter().filter(|p| p.analyzed).count()
    }

    /// Every raw item has been cleaned and analyzed
    pub fn is_fully_analyzed(&self) -> bool {
        !self.has_unclean_content() && !self.has_unanalyzed_content()
    }

    /// Budget ceiling, if the campaign configures one
    pub fn budget_limit(&self) -> Option<f64> {
        self.campaign
            .has_budget()
            .then_some(self.campaign.budget_limit)
    }

    // Orchestrator-owned mutations

    pub(crate) fn transition_to(&mut self, next: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Set `last_error` and move to the terminal status the failure implies
    pub(crate) fn fail(&mut self, failure: WorkflowFailure) {
        let next = match failure.kind {
            FailureKind::Cancelled => WorkflowStatus::Cancelled,
            _ => WorkflowStatus::Failed,
        };
        if self.status.can_transition_to(next) {
            self.status = next;
        }
        self.last_error = Some(failure);
    }

    /// Record an unresolved error without leaving `Running`
    pub(crate) fn set_last_error(&mut self, failure: WorkflowFailure) {
        self.last_error = Some(failure);
    }

    pub(crate) fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    pub(crate) fn record_decision(&mut self, decision: Decision) {
        self.decisions.push(decision);
    }

    pub(crate) fn audit(
        &mut self,
        event_type: AuditEventType,
        node: Option<&str>,
        details: serde_json::Value,
    ) {
        let mut event = AuditEvent::new(self.workflow_id, event_type).with_details(details);
        if let Some(node) = node {
            event = event.with_node(node);
        }
        self.audit_trail.push(event);
    }

    /// Trail entries not yet handed to the audit sink; marks them forwarded
    pub(crate) fn take_unforwarded_events(&mut self) -> Vec<AuditEvent> {
        let start = self.forwarded_events.min(self.audit_trail.len());
        self.forwarded_events = self.audit_trail.len();
        self.audit_trail[start..].to_vec()
    }

    pub(crate) fn plan(&mut self, stages: &[StageKind]) {
        self.next_nodes = stages.iter().map(|s| s.as_str().to_string()).collect();
    }

    pub(crate) fn enter_node(&mut self, stage: StageKind) {
        if self.next_nodes.front().map(String::as_str) == Some(stage.as_str()) {
            self.next_nodes.pop_front();
        }
        self.current_node = Some(stage.as_str().to_string());
    }

    /// Start a fresh invocation chain; retries already spent by earlier
    /// chains no longer count against the ceiling
    pub(crate) fn begin_retry_chain(&mut self) {
        self.retry_count = 0;
    }

    /// Ceiling for the current chain; never drops below the retries it has
    /// already spent
    pub(crate) fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries.max(self.retry_count);
    }

    /// Count one retry of the chain, attributed to the stage that failed
    pub(crate) fn increment_retry(&mut self, stage: &str) {
        self.retry_count += 1;
        *self.stage_retries.entry(stage.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn clear_parallel_tasks(&mut self) {
        self.parallel_tasks.clear();
    }

    pub(crate) fn set_parallel_task(&mut self, stage: StageKind, status: ParallelTaskStatus) {
        self.parallel_tasks
            .insert(stage.as_str().to_string(), status);
    }

    pub(crate) fn mark_degraded(&mut self, stage: StageKind) {
        self.degraded_stages.insert(stage.as_str().to_string());
    }

    pub(crate) fn enable_lightweight_mode(&mut self) {
        self.config.lightweight_mode = true;
    }

    pub(crate) fn next_iteration(&mut self) -> u32 {
        self.iterations += 1;
        self.iterations
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut WorkflowMetrics {
        &mut self.metrics
    }

    pub(crate) fn mark_finished(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    /// Merge one stage's output.
    ///
    /// Discovered items are appended unless their id is already known.
    /// Processed items replace the entry with the same content id; flag
    /// counters only grow for ids seen for the first time.
    pub(crate) fn apply_output(&mut self, stage: StageKind, output: StageOutput) {
        let StageOutput {
            discovered,
            processed,
            insights,
            response,
            usage,
            warnings,
        } = output;

        for item in discovered {
            if !self.raw_content.iter().any(|c| c.id == item.id) {
                self.raw_content.push(item);
            }
        }

        for item in processed {
            match self
                .processed_content
                .iter_mut()
                .find(|p| p.content_id == item.content_id)
            {
                Some(existing) => *existing = item,
                None => {
                    let flags = &mut self.metrics.flags;
                    flags.spam += u64::from(item.flags.spam);
                    flags.pii += u64::from(item.flags.pii);
                    flags.toxic += u64::from(item.flags.toxic);
                    self.processed_content.push(item);
                }
            }
        }

        self.insights.extend(insights);

        if response.is_some() {
            self.response = response;
        }

        self.metrics.add_usage(usage.tokens, usage.cost);
        for warning in warnings {
            self.metrics
                .record_warning(format!("{}: {}", stage, warning));
        }
    }
}
