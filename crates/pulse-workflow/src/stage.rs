//! Stage contract
//!
//! A stage reads the workflow state and returns the part of the state it
//! owns as a [`StageOutput`]. Stages never write the state directly; the
//! orchestrator merges outputs, so concurrently running stages cannot touch
//! each other's fields or the orchestrator's bookkeeping.

use async_trait::async_trait;
use pulse_core::{ContentItem, ErrorCategory, Insight, ProcessedContent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::state::WorkflowState;

/// Pipeline stages the orchestrator knows how to sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Content discovery
    Scout,
    Clean,
    Analyze,
    /// Chat/RAG answer over existing insights
    Chat,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Scout => "scout",
            StageKind::Clean => "clean",
            StageKind::Analyze => "analyze",
            StageKind::Chat => "chat",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a stage.
///
/// Stages that know the nature of a failure attach a category; otherwise the
/// message is classified by keyword.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
    pub category: Option<ErrorCategory>,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: None,
        }
    }

    pub fn categorized(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: Some(category),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::categorized(ErrorCategory::RateLimit, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::categorized(ErrorCategory::Network, message)
    }

    pub fn llm(message: impl Into<String>) -> Self {
        Self::categorized(ErrorCategory::Llm, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::categorized(ErrorCategory::Validation, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::categorized(ErrorCategory::Critical, message)
    }
}

/// Tokens and spend reported by a stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageUsage {
    pub tokens: u64,
    pub cost: f64,
}

/// What a stage contributes to the workflow state
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Newly discovered raw items
    pub discovered: Vec<ContentItem>,
    /// Cleaned or analyzed items, keyed by content id
    pub processed: Vec<ProcessedContent>,
    pub insights: Vec<Insight>,
    /// Chat answer
    pub response: Option<String>,
    pub usage: StageUsage,
    pub warnings: Vec<String>,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_discovered(mut self, items: Vec<ContentItem>) -> Self {
        self.discovered = items;
        self
    }

    pub fn with_processed(mut self, items: Vec<ProcessedContent>) -> Self {
        self.processed = items;
        self
    }

    pub fn with_insights(mut self, insights: Vec<Insight>) -> Self {
        self.insights = insights;
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_usage(mut self, tokens: u64, cost: f64) -> Self {
        self.usage = StageUsage { tokens, cost };
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// One unit of pipeline work.
///
/// Implementations must be safe to call again after a failure: a retried
/// call must not repeat side effects of a partially successful one.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, state: &WorkflowState) -> Result<StageOutput, StageError>;
}

/// Stage implementations registered with an orchestrator
#[derive(Clone, Default)]
pub struct StageSet {
    stages: BTreeMap<StageKind, Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage, replacing any earlier one of the same kind
    pub fn insert(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.kind(), stage);
    }

    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.insert(stage);
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.stages.keys().copied()
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet")
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .finish()
    }
}
