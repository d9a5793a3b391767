//! End-to-end runs of the orchestrator against scripted stages

use async_trait::async_trait;
use pulse_core::{
    AuditEventType, Campaign, ContentItem, ErrorCategory, InMemoryAuditSink, Insight,
    PipelineConfig, ProcessedContent, WorkflowType,
};
use pulse_infra::{CircuitBreakerRegistry, RetryPolicyTable};
use pulse_workflow::{
    FailureKind, Orchestrator, ParallelTaskStatus, RetryHandler, Stage, StageError, StageKind,
    StageOutput, WorkflowState, WorkflowStatus,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Scripted stages

/// Discovery stage failing with `error` for the first `failures` calls, or
/// with each of `errors` in turn
struct ScriptedScout {
    calls: AtomicU32,
    failures: u32,
    error: &'static str,
    errors: Vec<&'static str>,
    items: usize,
    delay: Duration,
}

impl ScriptedScout {
    fn succeeding(items: usize) -> Self {
        Self::failing(0, "", items)
    }

    fn failing(failures: u32, error: &'static str, items: usize) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
            error,
            errors: Vec::new(),
            items,
            delay: Duration::ZERO,
        }
    }

    fn with_errors(mut self, errors: Vec<&'static str>) -> Self {
        self.errors = errors;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedScout {
    fn kind(&self) -> StageKind {
        StageKind::Scout
    }

    async fn run(&self, state: &WorkflowState) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = self.errors.get(call as usize) {
            return Err(StageError::new(*error));
        }
        if call < self.failures {
            return Err(StageError::new(self.error));
        }

        let source = state
            .campaign()
            .sources
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        Ok(StageOutput::new()
            .with_discovered(
                (0..self.items)
                    .map(|i| ContentItem::new(format!("post-{}", i), source.clone(), "Loving The New Release"))
                    .collect(),
            )
            .with_usage(0, 0.01))
    }
}

struct LowercaseCleaner;

/// Cleans at most `batch` items per call and fails the calls in `fail_on`
struct BatchCleaner {
    calls: AtomicU32,
    batch: usize,
    fail_on: Vec<u32>,
    error: &'static str,
}

impl BatchCleaner {
    fn new(batch: usize, fail_on: Vec<u32>, error: &'static str) -> Self {
        Self {
            calls: AtomicU32::new(0),
            batch,
            fail_on,
            error,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for BatchCleaner {
    fn kind(&self) -> StageKind {
        StageKind::Clean
    }

    async fn run(&self, state: &WorkflowState) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.contains(&call) {
            return Err(StageError::new(self.error));
        }

        Ok(StageOutput::new().with_processed(
            state
                .unclean_content()
                .into_iter()
                .take(self.batch)
                .map(|item| ProcessedContent::cleaned(item.id.clone(), item.text.to_lowercase()))
                .collect(),
        ))
    }
}

#[async_trait]
impl Stage for LowercaseCleaner {
    fn kind(&self) -> StageKind {
        StageKind::Clean
    }

    async fn run(&self, state: &WorkflowState) -> Result<StageOutput, StageError> {
        Ok(StageOutput::new().with_processed(
            state
                .unclean_content()
                .into_iter()
                .map(|item| ProcessedContent::cleaned(item.id.clone(), item.text.to_lowercase()))
                .collect(),
        ))
    }
}

/// Analysis stage failing with `error` for the first `failures` calls
struct ScriptedAnalyst {
    calls: AtomicU32,
    failures: u32,
    error: &'static str,
    emit_insight: bool,
    cost: f64,
    delay: Duration,
}

impl ScriptedAnalyst {
    fn succeeding() -> Self {
        Self::failing(0, "")
    }

    fn failing(failures: u32, error: &'static str) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
            error,
            emit_insight: true,
            cost: 0.02,
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn without_insights(mut self) -> Self {
        self.emit_insight = false;
        self
    }

    fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedAnalyst {
    fn kind(&self) -> StageKind {
        StageKind::Analyze
    }

    async fn run(&self, state: &WorkflowState) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if call < self.failures {
            return Err(StageError::new(self.error));
        }

        let analyzed: Vec<_> = state
            .unanalyzed_content()
            .into_iter()
            .map(|p| p.clone().analyzed_with(Some(0.7)))
            .collect();
        let ids = analyzed.iter().map(|p| p.content_id.clone()).collect();

        let mut output = StageOutput::new()
            .with_processed(analyzed)
            .with_usage(250, self.cost);
        if self.emit_insight {
            output = output.with_insights(vec![
                Insight::new("sentiment", "Reception is positive", 0.8).with_content_ids(ids),
            ]);
        }
        Ok(output)
    }
}

struct EchoChat;

#[async_trait]
impl Stage for EchoChat {
    fn kind(&self) -> StageKind {
        StageKind::Chat
    }

    async fn run(&self, state: &WorkflowState) -> Result<StageOutput, StageError> {
        let query = state.user_query().unwrap_or_default();
        Ok(StageOutput::new()
            .with_response(format!("Answering: {}", query))
            .with_usage(120, 0.003))
    }
}

// Helpers

fn campaign() -> Campaign {
    Campaign::new("camp-1", "Spring Launch").with_sources(vec!["forumA".to_string()])
}

fn raw_items(n: usize) -> Vec<ContentItem> {
    (0..n)
        .map(|i| ContentItem::new(format!("item-{}", i), "forumA", "Shipping Was Slow"))
        .collect()
}

fn handler_with(breakers: Arc<CircuitBreakerRegistry>) -> Arc<RetryHandler> {
    Arc::new(RetryHandler::new(RetryPolicyTable::default(), breakers))
}

fn orchestrator(
    scout: Arc<ScriptedScout>,
    analyst: Arc<ScriptedAnalyst>,
    sink: &InMemoryAuditSink,
) -> Orchestrator {
    Orchestrator::builder()
        .stage(scout)
        .stage(Arc::new(LowercaseCleaner))
        .stage(analyst)
        .retry_handler(handler_with(Arc::new(CircuitBreakerRegistry::default())))
        .audit_sink(Arc::new(sink.clone()))
        .build()
}

// Scenarios

#[tokio::test(start_paused = true)]
async fn test_network_failures_are_retried_then_workflow_completes() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::failing(2, "network timeout", 3));
    let analyst = Arc::new(ScriptedAnalyst::succeeding());
    let orchestrator = orchestrator(scout.clone(), analyst.clone(), &sink);

    let state = WorkflowState::new(campaign(), WorkflowType::ContentAnalysis, PipelineConfig::default());
    let state = orchestrator.execute(state).await;

    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert_eq!(scout.calls(), 3);
    assert_eq!(state.retries_for(StageKind::Scout), 2);
    assert_eq!(state.audit_count(AuditEventType::NodeRetry), 2);
    assert_eq!(state.audit_count(AuditEventType::RetryExhausted), 0);
    assert_eq!(state.raw_content().len(), 3);
    assert_eq!(state.analyzed_count(), 3);
    assert_eq!(state.insights().len(), 1);
    assert!(state.last_error().is_none());

    // The successful scout call continues into cleaning and analysis
    let nodes: Vec<_> = state
        .audit_trail()
        .iter()
        .filter(|e| e.is(AuditEventType::NodeCompleted))
        .filter_map(|e| e.node.clone())
        .collect();
    assert_eq!(nodes, vec!["scout", "clean", "analyze"]);

    let first = state.decisions().first().unwrap();
    assert_eq!(first.decision_type, "workflow_type");
    assert_eq!(first.selected_path, "content_analysis");
    assert_eq!(state.decisions()[1].selected_path, "scout_first");

    // Every trail entry reached the sink, in order
    let forwarded = sink.events();
    assert_eq!(forwarded.len(), state.audit_trail().len());
    assert!(forwarded.first().unwrap().is(AuditEventType::WorkflowStarted));
    assert!(forwarded.last().unwrap().is(AuditEventType::WorkflowCompleted));
    assert_eq!(sink.count(AuditEventType::NodeRetry), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_scout_fails_without_retries() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::failing(u32::MAX, "unauthorized", 0));
    let analyst = Arc::new(ScriptedAnalyst::succeeding());
    let orchestrator = orchestrator(scout.clone(), analyst.clone(), &sink);

    let state = orchestrator.start(campaign(), WorkflowType::ContentAnalysis, PipelineConfig::default());
    let state = orchestrator.execute(state).await;

    assert_eq!(state.status(), WorkflowStatus::Failed);
    assert_eq!(scout.calls(), 1);
    assert_eq!(analyst.calls(), 0);
    assert_eq!(state.retries_for(StageKind::Scout), 0);
    assert_eq!(state.audit_count(AuditEventType::NodeRetry), 0);
    assert_eq!(state.audit_count(AuditEventType::RetryExhausted), 1);
    assert_eq!(state.audit_count(AuditEventType::RecoveryFailed), 1);
    assert!(!state.is_degraded(StageKind::Scout));

    let failure = state.last_error().unwrap();
    assert_eq!(
        failure.kind,
        FailureKind::Stage {
            category: ErrorCategory::Critical
        }
    );
    assert_eq!(failure.to_string(), "scout: unauthorized");

    let summary = state
        .audit_trail()
        .iter()
        .find(|e| e.is(AuditEventType::WorkflowCompleted))
        .unwrap();
    assert_eq!(summary.details["status"], "failed");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_scout_degrades_and_completes_empty() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::failing(u32::MAX, "connection reset by peer", 0));
    let analyst = Arc::new(ScriptedAnalyst::succeeding());
    let orchestrator = orchestrator(scout.clone(), analyst.clone(), &sink);

    let state = orchestrator
        .execute(orchestrator.start(campaign(), WorkflowType::ContentAnalysis, PipelineConfig::default()))
        .await;

    // Network policy: three retries before giving up
    assert_eq!(scout.calls(), 4);
    assert_eq!(state.retries_for(StageKind::Scout), 3);
    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert!(state.is_degraded(StageKind::Scout));
    assert!(state.raw_content().is_empty());
    assert!(state.insights().is_empty());
    assert_eq!(state.audit_count(AuditEventType::RecoverySucceeded), 1);
    assert_eq!(state.audit_count(AuditEventType::NodeSkipped), 1);
    assert_eq!(
        orchestrator
            .retry_handler()
            .breakers()
            .failure_count("scout", ErrorCategory::Network),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_category_switch_keeps_retry_count_within_ceiling() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::succeeding(2).with_errors(vec![
        "429 too many requests",
        "429 too many requests",
        "429 too many requests",
        "429 too many requests",
        "connection reset by peer",
    ]));
    let orchestrator = orchestrator(scout.clone(), Arc::new(ScriptedAnalyst::succeeding()), &sink);

    let state = orchestrator
        .execute(orchestrator.start(campaign(), WorkflowType::ContentAnalysis, PipelineConfig::default()))
        .await;

    // Four rate-limit retries, then a network failure whose policy allows
    // only three: the chain stops without lowering the ceiling below four
    assert_eq!(scout.calls(), 5);
    assert_eq!(state.retry_count(), 4);
    assert_eq!(state.max_retries(), 4);
    assert!(state.retry_count() <= state.max_retries());
    assert_eq!(state.retries_for(StageKind::Scout), 4);

    let exhausted = state
        .audit_trail()
        .iter()
        .find(|e| e.is(AuditEventType::RetryExhausted))
        .unwrap();
    assert_eq!(exhausted.details["category"], "network");
    assert_eq!(exhausted.details["reason"], "retries_exhausted");
    assert_eq!(exhausted.details["retries"], 4);

    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert!(state.is_degraded(StageKind::Scout));
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_blocks_retries_across_workflows() {
    let sink = InMemoryAuditSink::new();
    let breakers = Arc::new(CircuitBreakerRegistry::default());
    for _ in 0..5 {
        breakers.record_failure("scout", ErrorCategory::Network);
    }

    let scout = Arc::new(ScriptedScout::failing(u32::MAX, "network timeout", 0));
    let orchestrator = Orchestrator::builder()
        .stage(scout.clone())
        .stage(Arc::new(LowercaseCleaner))
        .stage(Arc::new(ScriptedAnalyst::succeeding()))
        .retry_handler(handler_with(breakers.clone()))
        .audit_sink(Arc::new(sink.clone()))
        .build();

    let state = orchestrator
        .execute(orchestrator.start(campaign(), WorkflowType::ContentAnalysis, PipelineConfig::default()))
        .await;

    assert_eq!(scout.calls(), 1);
    assert_eq!(state.audit_count(AuditEventType::NodeRetry), 0);
    let exhausted = state
        .audit_trail()
        .iter()
        .find(|e| e.is(AuditEventType::RetryExhausted))
        .unwrap();
    assert_eq!(exhausted.details["reason"], "circuit_open");
    assert_eq!(breakers.failure_count("scout", ErrorCategory::Network), 6);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_branch_failure_retries_the_fan_out() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::succeeding(0));
    let analyst = Arc::new(ScriptedAnalyst::failing(1, "429 rate limit exceeded"));
    let orchestrator = orchestrator(scout.clone(), analyst.clone(), &sink);

    let config = PipelineConfig::default().with_parallel_processing(true);
    let state = orchestrator
        .start(campaign(), WorkflowType::ContentAnalysis, config)
        .with_raw_content(raw_items(12));
    let state = orchestrator.execute(state).await;

    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert_eq!(scout.calls(), 0);
    assert_eq!(analyst.calls(), 2);
    assert_eq!(state.analyzed_count(), 12);
    assert_eq!(state.insights().len(), 1);
    assert_eq!(state.retries_for(StageKind::Analyze), 1);
    assert_eq!(state.audit_count(AuditEventType::NodeFailed), 1);
    assert_eq!(state.audit_count(AuditEventType::NodeRetry), 1);
    assert!(state.audit_count(AuditEventType::ParallelStarted) >= 2);

    let retry = state
        .audit_trail()
        .iter()
        .find(|e| e.is(AuditEventType::NodeRetry))
        .unwrap();
    assert_eq!(retry.details["scope"], "parallel");
    assert_eq!(retry.details["category"], "rate_limit");

    assert!(state
        .decisions()
        .iter()
        .any(|d| d.selected_path == "parallel_processing"));
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_retries_are_attributed_to_the_failing_branch() {
    let sink = InMemoryAuditSink::new();
    let cleaner = Arc::new(BatchCleaner::new(3, vec![1], "connection reset by peer"));
    let analyst = Arc::new(ScriptedAnalyst::failing(1, "429 rate limit exceeded"));
    let orchestrator = Orchestrator::builder()
        .stage(Arc::new(ScriptedScout::succeeding(0)))
        .stage(cleaner.clone())
        .stage(analyst.clone())
        .audit_sink(Arc::new(sink.clone()))
        .build();

    let config = PipelineConfig::default().with_parallel_processing(true);
    let raw = raw_items(12);
    let cleaned = raw[..6]
        .iter()
        .map(|item| ProcessedContent::cleaned(item.id.clone(), item.text.to_lowercase()))
        .collect();
    let state = orchestrator
        .start(campaign(), WorkflowType::ContentAnalysis, config)
        .with_raw_content(raw)
        .with_processed_content(cleaned);
    let state = orchestrator.execute(state).await;

    // Pass 1: analysis fails. Pass 2: cleaning fails. Both retries belong to
    // the same fan-out chain but to different branches.
    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert_eq!(state.audit_count(AuditEventType::NodeRetry), 2);
    assert_eq!(state.retries_for(StageKind::Analyze), 1);
    assert_eq!(state.retries_for(StageKind::Clean), 1);
    assert_eq!(cleaner.calls(), 3);
    assert_eq!(analyst.calls(), 3);
    assert_eq!(state.analyzed_count(), 12);

    let retried: Vec<_> = state
        .audit_trail()
        .iter()
        .filter(|e| e.is(AuditEventType::NodeRetry))
        .filter_map(|e| e.node.clone())
        .collect();
    assert_eq!(retried, vec!["analyze", "clean"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_fan_out_degrades_analysis_and_completes() {
    let sink = InMemoryAuditSink::new();
    let analyst = Arc::new(ScriptedAnalyst::failing(u32::MAX, "429 rate limit exceeded"));
    let orchestrator = orchestrator(Arc::new(ScriptedScout::succeeding(0)), analyst.clone(), &sink);

    let config = PipelineConfig::default().with_parallel_processing(true);
    let state = orchestrator
        .start(campaign(), WorkflowType::ContentAnalysis, config)
        .with_raw_content(raw_items(12));
    let state = orchestrator.execute(state).await;

    // Rate-limit policy: five fan-out retries, six analysis calls
    assert_eq!(analyst.calls(), 6);
    assert_eq!(state.retries_for(StageKind::Analyze), 5);
    assert!(state.retry_count() <= state.max_retries());
    assert_eq!(state.audit_count(AuditEventType::NodeRetry), 5);
    assert_eq!(state.audit_count(AuditEventType::RetryExhausted), 1);
    assert_eq!(state.audit_count(AuditEventType::RecoverySucceeded), 1);

    let exhausted = state
        .audit_trail()
        .iter()
        .find(|e| e.is(AuditEventType::RetryExhausted))
        .unwrap();
    assert_eq!(exhausted.node.as_deref(), Some("analyze"));
    assert_eq!(exhausted.details["reason"], "retries_exhausted");

    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert!(state.is_degraded(StageKind::Analyze));
    assert!(state.last_error().is_none());
    assert!(state.insights().is_empty());
    assert_eq!(state.processed_content().len(), 12);
    assert_eq!(
        orchestrator
            .retry_handler()
            .breakers()
            .failure_count("analyze", ErrorCategory::RateLimit),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_fan_out_fails_in_flight_branch() {
    let sink = InMemoryAuditSink::new();
    let analyst = Arc::new(ScriptedAnalyst::succeeding().with_delay(Duration::from_secs(60)));
    let orchestrator = orchestrator(Arc::new(ScriptedScout::succeeding(0)), analyst.clone(), &sink);

    let handle = orchestrator.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
    });

    let config = PipelineConfig::default().with_parallel_processing(true);
    let state = orchestrator
        .start(campaign(), WorkflowType::ContentAnalysis, config)
        .with_raw_content(raw_items(12));
    let state = orchestrator.execute(state).await;

    assert_eq!(state.status(), WorkflowStatus::Cancelled);
    let failure = state.last_error().unwrap();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.stage.as_deref(), Some("analyze"));

    // Cleaning finished in the first pass; the analysis branch never merged
    assert_eq!(state.processed_content().len(), 12);
    assert_eq!(state.analyzed_count(), 0);
    assert_eq!(
        state.parallel_task(StageKind::Analyze),
        Some(ParallelTaskStatus::Failed)
    );

    let joined = state
        .audit_trail()
        .iter()
        .filter(|e| e.is(AuditEventType::ParallelCompleted))
        .last()
        .unwrap();
    assert_eq!(joined.details["failed"], serde_json::json!(["analyze"]));
    assert_eq!(state.audit_count(AuditEventType::NodeRetry), 0);
    assert_eq!(state.audit_count(AuditEventType::WorkflowCancelled), 1);
}

#[tokio::test(start_paused = true)]
async fn test_budget_overrun_switches_to_lightweight_mode() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::succeeding(0));
    let analyst = Arc::new(ScriptedAnalyst::succeeding().with_cost(2.0));
    let orchestrator = orchestrator(scout, analyst, &sink);

    let state = orchestrator
        .start(campaign().with_budget(1.0), WorkflowType::ContentAnalysis, PipelineConfig::default())
        .with_raw_content(raw_items(3));
    let state = orchestrator.execute(state).await;

    assert_eq!(state.status(), WorkflowStatus::Failed);
    assert_eq!(state.last_error().unwrap().kind, FailureKind::BudgetExceeded);
    assert!(state.config().lightweight_mode);
    assert_eq!(state.audit_count(AuditEventType::BudgetExceeded), 1);
    assert_eq!(state.audit_count(AuditEventType::RecoveryFailed), 1);

    let summary = &sink
        .events()
        .into_iter()
        .find(|e| e.is(AuditEventType::WorkflowCompleted))
        .unwrap()
        .details;
    assert_eq!(summary["lightweight_mode"], true);
    assert_eq!(summary["insights"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_insights_is_bounded_by_iteration_limit() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::succeeding(0));
    let analyst = Arc::new(ScriptedAnalyst::succeeding().without_insights());
    let orchestrator = orchestrator(scout, analyst.clone(), &sink);

    let state = orchestrator
        .start(
            campaign(),
            WorkflowType::ContentAnalysis,
            PipelineConfig::default().with_max_iterations(3),
        )
        .with_raw_content(raw_items(2));
    let state = orchestrator.execute(state).await;

    assert_eq!(state.status(), WorkflowStatus::Failed);
    assert_eq!(state.last_error().unwrap().kind, FailureKind::IterationLimit);
    assert_eq!(state.iterations(), 3);
    assert_eq!(analyst.calls(), 1);
    assert_eq!(state.analyzed_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_global_timeout_interrupts_slow_stage() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::succeeding(1).with_delay(Duration::from_secs(10)));
    let orchestrator = orchestrator(scout, Arc::new(ScriptedAnalyst::succeeding()), &sink);

    let config = PipelineConfig::default().with_global_timeout(Duration::from_secs(5));
    let state = orchestrator
        .execute(orchestrator.start(campaign(), WorkflowType::ContentAnalysis, config))
        .await;

    assert_eq!(state.status(), WorkflowStatus::Failed);
    assert_eq!(state.last_error().unwrap().kind, FailureKind::Timeout);
    assert!(state.raw_content().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_global_timeout_runs_from_workflow_start() {
    let sink = InMemoryAuditSink::new();
    let orchestrator = orchestrator(
        Arc::new(ScriptedScout::succeeding(1)),
        Arc::new(ScriptedAnalyst::succeeding()),
        &sink,
    );

    let config = PipelineConfig::default().with_global_timeout(Duration::from_secs(5));
    let state = orchestrator.start(campaign(), WorkflowType::ContentAnalysis, config);

    // The state waits past its whole budget before being executed
    tokio::time::advance(Duration::from_secs(10)).await;
    let state = orchestrator.execute(state).await;

    assert_eq!(state.status(), WorkflowStatus::Failed);
    assert_eq!(state.last_error().unwrap().kind, FailureKind::Timeout);
    assert!(state.raw_content().is_empty());
    assert_eq!(state.audit_count(AuditEventType::NodeCompleted), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_handle_stops_running_workflow() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::succeeding(1).with_delay(Duration::from_secs(60)));
    let orchestrator = orchestrator(scout, Arc::new(ScriptedAnalyst::succeeding()), &sink);

    let handle = orchestrator.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
    });

    let state = orchestrator
        .execute(orchestrator.start(campaign(), WorkflowType::ContentAnalysis, PipelineConfig::default()))
        .await;

    assert_eq!(state.status(), WorkflowStatus::Cancelled);
    assert_eq!(state.last_error().unwrap().kind, FailureKind::Cancelled);
    assert_eq!(state.audit_count(AuditEventType::WorkflowCancelled), 1);
    assert_eq!(state.audit_count(AuditEventType::WorkflowCompleted), 1);
}

#[tokio::test(start_paused = true)]
async fn test_chat_query_bypasses_content_pipeline() {
    let sink = InMemoryAuditSink::new();
    let scout = Arc::new(ScriptedScout::succeeding(5));
    let analyst = Arc::new(ScriptedAnalyst::succeeding());
    let orchestrator = Orchestrator::builder()
        .stage(scout.clone())
        .stage(analyst.clone())
        .stage(Arc::new(EchoChat))
        .audit_sink(Arc::new(sink.clone()))
        .build();

    let state = orchestrator
        .start(campaign(), WorkflowType::ChatQuery, PipelineConfig::default())
        .with_user_query("How is the launch perceived?");
    let state = orchestrator.execute(state).await;

    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert_eq!(state.response(), Some("Answering: How is the launch perceived?"));
    assert_eq!(scout.calls(), 0);
    assert_eq!(analyst.calls(), 0);
    assert_eq!(state.metrics().tokens_used, 120);
    assert_eq!(state.decisions().len(), 1);
    assert_eq!(state.decisions()[0].selected_path, "chat_query");
}

#[tokio::test(start_paused = true)]
async fn test_nothing_to_process_fails_routing() {
    let sink = InMemoryAuditSink::new();
    let orchestrator = orchestrator(
        Arc::new(ScriptedScout::succeeding(1)),
        Arc::new(ScriptedAnalyst::succeeding()),
        &sink,
    );

    let state = orchestrator
        .execute(orchestrator.start(
            Campaign::new("camp-2", "Empty"),
            WorkflowType::ContentAnalysis,
            PipelineConfig::default(),
        ))
        .await;

    assert_eq!(state.status(), WorkflowStatus::Failed);
    assert_eq!(state.last_error().unwrap().kind, FailureKind::Routing);
    assert_eq!(state.decisions()[0].selected_path, "error");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_workflows_share_breakers_not_state() {
    let sink = InMemoryAuditSink::new();
    let orchestrator = Arc::new(orchestrator(
        Arc::new(ScriptedScout::succeeding(2)),
        Arc::new(ScriptedAnalyst::succeeding()),
        &sink,
    ));

    let mut handles = Vec::new();
    for i in 0..4 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let state = orchestrator.start(
                Campaign::new(format!("camp-{}", i), "Parallel").with_sources(vec!["forumA".to_string()]),
                WorkflowType::ContentAnalysis,
                PipelineConfig::default(),
            );
            orchestrator.execute(state).await
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let state = handle.await.unwrap();
        assert_eq!(state.status(), WorkflowStatus::Completed);
        assert_eq!(state.raw_content().len(), 2);
        ids.insert(state.workflow_id());
    }
    assert_eq!(ids.len(), 4);
    assert_eq!(sink.count(AuditEventType::WorkflowCompleted), 4);
}
