use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

// Newtype wrappers for type safety

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Error taxonomy

/// Category a stage failure falls into. Drives retry policy and circuit
/// breaker selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Network,
    Llm,
    Validation,
    BusinessLogic,
    Critical,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::RateLimit,
        ErrorCategory::Network,
        ErrorCategory::Llm,
        ErrorCategory::Validation,
        ErrorCategory::BusinessLogic,
        ErrorCategory::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Network => "network",
            ErrorCategory::Llm => "llm",
            ErrorCategory::Validation => "validation",
            ErrorCategory::BusinessLogic => "business_logic",
            ErrorCategory::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rate_limit" | "ratelimit" => Ok(ErrorCategory::RateLimit),
            "network" => Ok(ErrorCategory::Network),
            "llm" => Ok(ErrorCategory::Llm),
            "validation" => Ok(ErrorCategory::Validation),
            "business_logic" | "businesslogic" => Ok(ErrorCategory::BusinessLogic),
            "critical" => Ok(ErrorCategory::Critical),
            other => Err(CoreError::Validation(format!(
                "unknown error category: {}",
                other
            ))),
        }
    }
}

/// Curve governing the delay between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffShape {
    Fixed,
    Linear,
    Exponential,
    Immediate,
    None,
}

impl std::fmt::Display for BackoffShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffShape::Fixed => write!(f, "fixed"),
            BackoffShape::Linear => write!(f, "linear"),
            BackoffShape::Exponential => write!(f, "exponential"),
            BackoffShape::Immediate => write!(f, "immediate"),
            BackoffShape::None => write!(f, "none"),
        }
    }
}

/// Which pipeline a workflow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    ContentAnalysis,
    ChatQuery,
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowType::ContentAnalysis => write!(f, "content_analysis"),
            WorkflowType::ChatQuery => write!(f, "chat_query"),
        }
    }
}

// Campaign

/// Brand-monitoring campaign as read from the campaign store. The pipeline
/// only reads the budget fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Spend ceiling for one workflow run; `<= 0` means no budget configured
    #[serde(default)]
    pub budget_limit: f64,
    #[serde(default)]
    pub current_spend: f64,
}

impl Campaign {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sources: Vec::new(),
            keywords: Vec::new(),
            budget_limit: 0.0,
            current_spend: 0.0,
        }
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_budget(mut self, budget_limit: f64) -> Self {
        self.budget_limit = budget_limit;
        self
    }

    pub fn with_current_spend(mut self, current_spend: f64) -> Self {
        self.current_spend = current_spend;
        self
    }

    pub fn has_budget(&self) -> bool {
        self.budget_limit > 0.0
    }
}

// Content types

/// A piece of discovered content, as returned by the discovery stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ContentItem {
    pub fn new(id: impl Into<String>, source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            text: text.into(),
            url: None,
            author: None,
            discovered_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Advisory flags set by the cleaning stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFlags {
    #[serde(default)]
    pub spam: bool,
    #[serde(default)]
    pub pii: bool,
    #[serde(default)]
    pub toxic: bool,
}

/// Cleaned (and possibly analyzed) view of a [`ContentItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedContent {
    pub content_id: String,
    pub cleaned_text: String,
    #[serde(default)]
    pub flags: ContentFlags,
    #[serde(default)]
    pub analyzed: bool,
    #[serde(default)]
    pub sentiment: Option<f32>,
}

impl ProcessedContent {
    pub fn cleaned(content_id: impl Into<String>, cleaned_text: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            cleaned_text: cleaned_text.into(),
            flags: ContentFlags::default(),
            analyzed: false,
            sentiment: None,
        }
    }

    pub fn with_flags(mut self, flags: ContentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Mark this item analyzed with the given sentiment score.
    pub fn analyzed_with(mut self, sentiment: Option<f32>) -> Self {
        self.analyzed = true;
        self.sentiment = sentiment;
        self
    }
}

/// An insight produced by the analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub kind: String,
    pub summary: String,
    pub confidence: f32,
    #[serde(default)]
    pub content_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    pub fn new(kind: impl Into<String>, summary: impl Into<String>, confidence: f32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            summary: summary.into(),
            confidence: confidence.clamp(0.0, 1.0),
            content_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_content_ids(mut self, content_ids: Vec<String>) -> Self {
        self.content_ids = content_ids;
        self
    }
}

// Conversation types

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}
