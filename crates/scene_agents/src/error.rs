//! Error types for agents module.

use thiserror::Error;

use crate::roles::AgentRole;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur during agent operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("No agent registered for role: {0}")]
    NotFound(AgentRole),

    #[error("Unknown agent role: {0}")]
    UnknownRole(String),

    #[error("Provider error for {agent}: {message}")]
    Provider { agent: String, message: String },

    #[error("Could not parse {agent} response: {message}")]
    Parse { agent: String, message: String },

    #[error("Agent execution failed: {agent} - {message}")]
    ExecutionFailed { agent: String, message: String },

    #[error("Invalid input for agent {agent}: {message}")]
    InvalidInput { agent: String, message: String },

    #[error("Agent timed out after {0} seconds")]
    Timeout(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Create a provider error.
    pub fn provider(agent: AgentRole, message: impl Into<String>) -> Self {
        Self::Provider {
            agent: agent.to_string(),
            message: message.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(agent: AgentRole, message: impl Into<String>) -> Self {
        Self::Parse {
            agent: agent.to_string(),
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(agent: AgentRole, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            agent: agent.to_string(),
            message: message.into(),
        }
    }

    /// Create an execution failed error.
    pub fn execution_failed(agent: AgentRole, message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            agent: agent.to_string(),
            message: message.into(),
        }
    }
}
