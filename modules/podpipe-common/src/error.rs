//! Error types shared across crates. Component-specific errors (substrate,
//! event bus, GPU lock, store) live in their own crates and wrap these where
//! they cross a boundary.

use thiserror::Error;

/// Domain-level invariant violations.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid summary: {0}")]
    InvalidSummary(String),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}
