use thiserror::Error;

/// Errors raised by the shared core: configuration loading, serialization of
/// audit payloads and value validation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Audit sink error: {0}")]
    AuditSink(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
