//! Observability for BrandPulse
//!
//! Structured logging through a `tracing-subscriber` registry with an
//! environment filter and either a JSON or a human-readable layer.

pub mod tracing_setup;

pub use tracing_setup::*;

use thiserror::Error;

/// Observability errors
#[derive(Error, Debug)]
pub enum ObservabilityError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, ObservabilityError>;
