//! Conditional edges of the workflow graph

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::stage::StageKind;
use crate::state::{Decision, ParallelTaskStatus, WorkflowState, WorkflowStatus};

/// Outcome of workflow type detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRoute {
    ContentAnalysis,
    ChatQuery,
    Error,
}

impl WorkflowRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRoute::ContentAnalysis => "content_analysis",
            WorkflowRoute::ChatQuery => "chat_query",
            WorkflowRoute::Error => "error",
        }
    }
}

/// How one pass of the content pipeline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentRoute {
    ScoutFirst,
    ParallelProcessing,
    AnalysisOnly,
    Error,
}

impl ContentRoute {
    pub const ALL: [ContentRoute; 4] = [
        ContentRoute::ScoutFirst,
        ContentRoute::ParallelProcessing,
        ContentRoute::AnalysisOnly,
        ContentRoute::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentRoute::ScoutFirst => "scout_first",
            ContentRoute::ParallelProcessing => "parallel_processing",
            ContentRoute::AnalysisOnly => "analysis_only",
            ContentRoute::Error => "error",
        }
    }

    /// Stages a pass on this route may invoke, in order
    pub fn stages(&self) -> &'static [StageKind] {
        match self {
            ContentRoute::ScoutFirst => &[StageKind::Scout, StageKind::Clean, StageKind::Analyze],
            ContentRoute::ParallelProcessing | ContentRoute::AnalysisOnly => {
                &[StageKind::Clean, StageKind::Analyze]
            }
            ContentRoute::Error => &[],
        }
    }
}

/// Result of the completion check after each pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Continue,
    Error,
    Retry,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Router;

impl Router {
    pub fn new() -> Self {
        Self
    }

    /// Chat when a query or conversation is present, content when there is
    /// content or somewhere to discover it, error otherwise
    pub fn determine_workflow_type(&self, state: &WorkflowState) -> WorkflowRoute {
        let has_query = state
            .user_query()
            .map(|q| !q.trim().is_empty())
            .unwrap_or(false);

        if has_query || !state.conversation_history().is_empty() {
            WorkflowRoute::ChatQuery
        } else if !state.raw_content().is_empty() || !state.campaign().sources.is_empty() {
            WorkflowRoute::ContentAnalysis
        } else {
            WorkflowRoute::Error
        }
    }

    /// Decision record describing a workflow type choice
    pub fn workflow_type_decision(&self, state: &WorkflowState, route: WorkflowRoute) -> Decision {
        Decision::new("workflow_type", route.as_str())
            .with_criterion("has_user_query", json!(state.user_query().is_some()))
            .with_criterion(
                "conversation_turns",
                json!(state.conversation_history().len()),
            )
            .with_criterion("raw_content_count", json!(state.raw_content().len()))
            .with_criterion("source_count", json!(state.campaign().sources.len()))
            .with_alternatives(
                [
                    WorkflowRoute::ContentAnalysis,
                    WorkflowRoute::ChatQuery,
                    WorkflowRoute::Error,
                ]
                .iter()
                .filter(|r| **r != route)
                .map(|r| r.as_str()),
            )
    }

    /// Pick the route for the next content pass and record the decision
    pub fn route_content_processing(&self, state: &mut WorkflowState) -> ContentRoute {
        let raw_count = state.raw_content().len();
        let source_count = state.campaign().sources.len();
        let parallel_enabled = state.config().parallel_processing;
        let threshold = state.config().parallel_threshold;
        let unresolved = state.last_error().is_some() || state.status() != WorkflowStatus::Running;

        let route = if unresolved {
            ContentRoute::Error
        } else if raw_count == 0 && source_count > 0 {
            ContentRoute::ScoutFirst
        } else if parallel_enabled && raw_count > threshold {
            ContentRoute::ParallelProcessing
        } else if raw_count > 0 {
            ContentRoute::AnalysisOnly
        } else {
            ContentRoute::ScoutFirst
        };

        let decision = Decision::new("content_routing", route.as_str())
            .with_criterion("raw_content_count", json!(raw_count))
            .with_criterion("source_count", json!(source_count))
            .with_criterion("parallel_processing", json!(parallel_enabled))
            .with_criterion("parallel_threshold", json!(threshold))
            .with_criterion("unresolved_error", json!(unresolved))
            .with_alternatives(
                ContentRoute::ALL
                    .iter()
                    .filter(|r| **r != route)
                    .map(|r| r.as_str()),
            );
        state.record_decision(decision);

        route
    }

    /// Decide whether the content pipeline is done.
    ///
    /// Degraded stages no longer hold up completion: a failed fan-out branch
    /// of a degraded stage is ignored, and a degraded analysis stage waives
    /// the analyzed-content and insight checks.
    pub fn check_completion(&self, state: &WorkflowState) -> CompletionStatus {
        if state.last_error().is_some() {
            return match state.status() {
                WorkflowStatus::Running => CompletionStatus::Retry,
                _ => CompletionStatus::Error,
            };
        }

        let pending_task = state.parallel_tasks().iter().any(|(stage, status)| {
            *status != ParallelTaskStatus::Completed && !state.degraded_stages().contains(stage)
        });
        if pending_task {
            return CompletionStatus::Continue;
        }

        let analysis_degraded = state.is_degraded(StageKind::Analyze);

        if !state.raw_content().is_empty() {
            let waiting = if analysis_degraded {
                state.has_unclean_content() && !state.is_degraded(StageKind::Clean)
            } else {
                !state.is_fully_analyzed()
            };
            if waiting {
                return CompletionStatus::Continue;
            }
        }

        if !analysis_degraded && !state.processed_content().is_empty() && state.insights().is_empty()
        {
            return CompletionStatus::Continue;
        }

        CompletionStatus::Completed
    }
}
