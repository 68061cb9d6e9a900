//! Error types for the core module.

use scene_agents::{AgentError, AgentRole};
use scene_runner::RunnerError;
use thiserror::Error;

use crate::rate_limit::RateLimitError;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur during core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Role {0} cannot fall back to itself")]
    SelfFallback(AgentRole),

    #[error("Fallback {from} -> {to} would close a cycle")]
    FallbackCycle { from: AgentRole, to: AgentRole },

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
