//! Workflow orchestration core for BrandPulse
//!
//! This crate drives a brand-monitoring workflow through its stages:
//! - Routing between the content pipeline and the chat pipeline
//! - Sequential or fan-out execution of discovery, cleaning and analysis
//! - Per-category retry policies with backoff and circuit breakers
//! - Budget, iteration and wall-clock guards
//! - Best-effort recovery when retries are exhausted
//! - An append-only audit trail forwarded to an injected sink

pub mod context;
pub mod monitor;
pub mod orchestrator;
pub mod parallel;
pub mod recovery;
pub mod retry;
pub mod router;
pub mod stage;
pub mod state;

pub use context::{ExecutionContext, Interrupt};
pub use monitor::WorkflowMonitor;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use parallel::ParallelCoordinator;
pub use recovery::{
    AnalystFallback, BudgetLightweightMode, RecoveryOutcome, RecoveryStrategies, RecoveryStrategy,
    ScoutFallback,
};
pub use retry::{RetryDecision, RetryHandler, RetryLimits, RetryingStage, StopReason};
pub use router::{CompletionStatus, ContentRoute, Router, WorkflowRoute};
pub use stage::{Stage, StageError, StageKind, StageOutput, StageSet, StageUsage};
pub use state::{
    Decision, FailureKind, FlagCounts, ParallelTaskStatus, WorkflowFailure, WorkflowMetrics,
    WorkflowState, WorkflowStatus,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("No stage registered for {0}")]
    StageNotRegistered(StageKind),

    #[error("Core error: {0}")]
    Core(#[from] pulse_core::CoreError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
