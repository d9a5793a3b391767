//! Audit trail events and the sink contract that receives them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{CoreError, WorkflowId};

/// Audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Lifecycle
    WorkflowStarted,
    WorkflowCancelled,
    WorkflowCompleted,

    // Routing
    DecisionMade,

    // Stage execution
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeRetry,
    RetryExhausted,
    NodeSkipped,
    ParallelStarted,
    ParallelCompleted,

    // Guards
    BudgetExceeded,

    // Recovery
    RecoveryAttempted,
    RecoverySucceeded,
    RecoveryFailed,
}

impl AuditEventType {
    /// Get the severity level of this event type
    pub fn severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::RetryExhausted
            | AuditEventType::BudgetExceeded
            | AuditEventType::RecoveryFailed => AuditSeverity::High,

            AuditEventType::NodeRetry
            | AuditEventType::NodeFailed
            | AuditEventType::WorkflowCancelled
            | AuditEventType::RecoveryAttempted
            | AuditEventType::NodeSkipped => AuditSeverity::Medium,

            AuditEventType::RecoverySucceeded
            | AuditEventType::ParallelStarted
            | AuditEventType::ParallelCompleted
            | AuditEventType::DecisionMade => AuditSeverity::Low,

            AuditEventType::WorkflowStarted
            | AuditEventType::WorkflowCompleted
            | AuditEventType::NodeStarted
            | AuditEventType::NodeCompleted => AuditSeverity::Info,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::WorkflowStarted => "workflow_started",
            AuditEventType::WorkflowCancelled => "workflow_cancelled",
            AuditEventType::WorkflowCompleted => "workflow_completed",
            AuditEventType::DecisionMade => "decision_made",
            AuditEventType::NodeStarted => "node_started",
            AuditEventType::NodeCompleted => "node_completed",
            AuditEventType::NodeFailed => "node_failed",
            AuditEventType::NodeRetry => "node_retry",
            AuditEventType::RetryExhausted => "retry_exhausted",
            AuditEventType::NodeSkipped => "node_skipped",
            AuditEventType::ParallelStarted => "parallel_started",
            AuditEventType::ParallelCompleted => "parallel_completed",
            AuditEventType::BudgetExceeded => "budget_exceeded",
            AuditEventType::RecoveryAttempted => "recovery_attempted",
            AuditEventType::RecoverySucceeded => "recovery_succeeded",
            AuditEventType::RecoveryFailed => "recovery_failed",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Low,
    Medium,
    High,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Low => "low",
            AuditSeverity::Medium => "medium",
            AuditSeverity::High => "high",
        }
    }
}

/// One timestamped entry of a workflow's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    /// Stage the event concerns, if any
    #[serde(default)]
    pub node: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(workflow_id: WorkflowId, event_type: AuditEventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            event_type,
            severity: event_type.severity(),
            node: None,
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn is(&self, event_type: AuditEventType) -> bool {
        self.event_type == event_type
    }
}

/// Receiver of audit-trail entries. The pipeline only appends; storage format
/// is the sink's business.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<(), CoreError>;
}

/// Tracing-based audit sink (logs to tracing/structured logging)
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), CoreError> {
        let details = serde_json::to_string(&event.details)?;

        match event.severity {
            AuditSeverity::High => {
                warn!(
                    audit = true,
                    workflow_id = %event.workflow_id,
                    event_type = event.event_type.as_str(),
                    node = event.node.as_deref().unwrap_or("-"),
                    details = %details,
                    "Audit event"
                );
            }
            _ => {
                info!(
                    audit = true,
                    workflow_id = %event.workflow_id,
                    event_type = event.event_type.as_str(),
                    node = event.node.as_deref().unwrap_or("-"),
                    details = %details,
                    "Audit event"
                );
            }
        }

        Ok(())
    }
}

/// In-memory audit sink for testing and the CLI rehearsal mode
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().clone()
    }

    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), CoreError> {
        self.events.write().push(event.clone());
        Ok(())
    }
}
