//! Scripted rehearsal scenarios
//!
//! A scenario describes a campaign, its inputs and, per stage, the outcome of
//! each successive call. The last step of a script repeats once the script is
//! exhausted; a stage without a script always succeeds.

use anyhow::{Context, Result};
use async_trait::async_trait;
use pulse_core::{
    Campaign, ContentFlags, ContentItem, ConversationTurn, ErrorCategory, Insight,
    PipelineConfig, ProcessedContent, WorkflowType,
};
use pulse_workflow::{Stage, StageError, StageKind, StageOutput, StageSet, WorkflowState};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SPAM_MARKERS: &[&str] = &["buy now", "click here", "free money"];
const TOXIC_MARKERS: &[&str] = &["idiot", "hate you"];

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub campaign: Campaign,
    #[serde(default = "default_workflow_type")]
    pub workflow_type: WorkflowType,
    /// Replaces the loaded pipeline configuration when present
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub user_query: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ConversationTurn>,
    #[serde(default)]
    pub raw_content: Vec<ScenarioItem>,
    #[serde(default)]
    pub stages: BTreeMap<StageKind, Vec<ScriptStep>>,
}

fn default_workflow_type() -> WorkflowType {
    WorkflowType::ContentAnalysis
}

/// Content present before the run starts
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioItem {
    pub id: String,
    pub source: String,
    pub text: String,
}

/// Outcome of one stage call
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptStep {
    /// Fail the call with this message
    #[serde(default)]
    pub fail: Option<String>,
    /// Typed category attached to the failure
    #[serde(default)]
    pub category: Option<ErrorCategory>,
    #[serde(default)]
    pub delay_ms: u64,
    /// Items a successful discovery call returns
    #[serde(default)]
    pub discover: usize,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost: f64,
    /// Answer a successful chat call returns
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid scenario {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Initial workflow state for this scenario
    pub fn state(&self, fallback: &PipelineConfig) -> WorkflowState {
        let config = self.pipeline.clone().unwrap_or_else(|| fallback.clone());
        let raw = self
            .raw_content
            .iter()
            .map(|item| ContentItem::new(&item.id, &item.source, &item.text))
            .collect();

        let mut state = WorkflowState::new(self.campaign.clone(), self.workflow_type, config)
            .with_raw_content(raw)
            .with_conversation_history(self.conversation.clone());
        if let Some(query) = &self.user_query {
            state = state.with_user_query(query);
        }
        state
    }

    /// One scripted stage per kind
    pub fn stages(&self) -> StageSet {
        [
            StageKind::Scout,
            StageKind::Clean,
            StageKind::Analyze,
            StageKind::Chat,
        ]
        .into_iter()
        .fold(StageSet::new(), |set, kind| {
            let script = self.stages.get(&kind).cloned().unwrap_or_default();
            set.with(Arc::new(ScriptedStage::new(kind, script)))
        })
    }
}

/// Stage replaying a script of outcomes
pub struct ScriptedStage {
    kind: StageKind,
    script: Vec<ScriptStep>,
    calls: AtomicUsize,
}

impl ScriptedStage {
    pub fn new(kind: StageKind, script: Vec<ScriptStep>) -> Self {
        Self {
            kind,
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn step(&self, call: usize) -> ScriptStep {
        self.script
            .get(call)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or_default()
    }

    fn succeed(&self, step: &ScriptStep, call: usize, state: &WorkflowState) -> StageOutput {
        let output = match self.kind {
            StageKind::Scout => StageOutput::new().with_discovered(discover(state, step.discover, call)),
            StageKind::Clean => StageOutput::new().with_processed(
                state.unclean_content().into_iter().map(clean).collect(),
            ),
            StageKind::Analyze => analyze(state),
            StageKind::Chat => StageOutput::new().with_response(
                step.response.clone().unwrap_or_else(|| {
                    format!(
                        "Based on {} insights: no scripted answer for '{}'",
                        state.insights().len(),
                        state.user_query().unwrap_or_default()
                    )
                }),
            ),
        };

        let output = output.with_usage(step.tokens, step.cost);
        match &step.warning {
            Some(warning) => output.with_warning(warning),
            None => output,
        }
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn run(&self, state: &WorkflowState) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.step(call);

        if step.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
        }

        match (&step.fail, step.category) {
            (Some(message), Some(category)) => Err(StageError::categorized(category, message)),
            (Some(message), None) => Err(StageError::new(message)),
            (None, _) => Ok(self.succeed(&step, call, state)),
        }
    }
}

fn discover(state: &WorkflowState, count: usize, call: usize) -> Vec<ContentItem> {
    let campaign = state.campaign();
    let sources = if campaign.sources.is_empty() {
        vec!["unknown".to_string()]
    } else {
        campaign.sources.clone()
    };

    (0..count)
        .map(|i| {
            let source = &sources[i % sources.len()];
            ContentItem::new(
                format!("{}-{}-{}", source, call, i),
                source,
                format!("Mention {} of {}", i + 1, campaign.name),
            )
        })
        .collect()
}

fn clean(item: &ContentItem) -> ProcessedContent {
    let text = item.text.split_whitespace().collect::<Vec<_>>().join(" ");
    let lower = text.to_lowercase();

    ProcessedContent::cleaned(&item.id, text).with_flags(ContentFlags {
        spam: SPAM_MARKERS.iter().any(|m| lower.contains(m)),
        pii: lower.contains('@'),
        toxic: TOXIC_MARKERS.iter().any(|m| lower.contains(m)),
    })
}

fn analyze(state: &WorkflowState) -> StageOutput {
    let pending = state.unanalyzed_content();
    if pending.is_empty() {
        return StageOutput::new();
    }

    let ids: Vec<String> = pending.iter().map(|p| p.content_id.clone()).collect();
    let summary = if state.config().lightweight_mode {
        format!("{} mentions (lightweight pass)", ids.len())
    } else {
        format!("{} mentions analyzed", ids.len())
    };
    let analyzed = pending
        .into_iter()
        .map(|p| p.clone().analyzed_with(None))
        .collect();

    StageOutput::new()
        .with_processed(analyzed)
        .with_insights(vec![Insight::new("volume", summary, 0.6).with_content_ids(ids)])
}
