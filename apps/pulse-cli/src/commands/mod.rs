//! CLI command implementations

pub mod classify;
pub mod policies;
pub mod simulate;
