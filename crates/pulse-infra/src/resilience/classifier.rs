//! Error classification
//!
//! Maps a stage failure to an [`ErrorCategory`]. A category attached at the
//! failure site always wins; keyword matching on the message is the fallback.

use pulse_core::ErrorCategory;

/// Ordered keyword rules; the first rule with a matching keyword wins.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<(ErrorCategory, Vec<String>)>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(vec![
            (
                ErrorCategory::Critical,
                &[
                    "unauthorized",
                    "forbidden",
                    "permission denied",
                    "access denied",
                    "authentication",
                    "invalid api key",
                    "401",
                    "403",
                ][..],
            ),
            (
                ErrorCategory::RateLimit,
                &["rate limit", "rate_limit", "too many requests", "429", "quota"][..],
            ),
            (
                ErrorCategory::Network,
                &[
                    "timeout",
                    "timed out",
                    "connection",
                    "network",
                    "dns",
                    "unreachable",
                    "502",
                    "503",
                    "504",
                ][..],
            ),
            (
                ErrorCategory::Llm,
                &[
                    "llm",
                    "model",
                    "completion",
                    "context length",
                    "token limit",
                    "openai",
                    "anthropic",
                ][..],
            ),
            (
                ErrorCategory::Validation,
                &["validation", "invalid", "parse", "malformed", "schema", "missing field"][..],
            ),
        ])
    }
}

impl ErrorClassifier {
    /// Build a classifier from ordered (category, keywords) rules
    pub fn new(rules: Vec<(ErrorCategory, &[&str])>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(category, keywords)| {
                    (
                        category,
                        keywords.iter().map(|k| k.to_lowercase()).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Append a rule evaluated after the existing ones
    pub fn with_rule(mut self, category: ErrorCategory, keywords: &[&str]) -> Self {
        self.rules
            .push((category, keywords.iter().map(|k| k.to_lowercase()).collect()));
        self
    }

    /// Classify a free-text failure description
    pub fn classify(&self, message: &str) -> ErrorCategory {
        let message = message.to_lowercase();

        self.rules
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| message.contains(k.as_str())))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::BusinessLogic)
    }

    /// Classify, preferring a category attached where the failure was raised
    pub fn classify_with_hint(&self, hint: Option<ErrorCategory>, message: &str) -> ErrorCategory {
        hint.unwrap_or_else(|| self.classify(message))
    }
}
