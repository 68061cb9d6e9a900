//! Error types for the runner module.

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur during script execution and rendering.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Required dependency missing: {0}")]
    DependencyMissing(String),

    #[error("Script execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Execution timed out after {0} ms")]
    Timeout(u64),

    #[error("Scene not found: {0}")]
    SceneNotFound(String),

    #[error("Invalid executor configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RunnerError::Timeout(_))
    }
}
