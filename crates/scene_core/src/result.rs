//! Final result of one generation session.

use scene_agents::AgentRole;
use serde::{Deserialize, Serialize};

use crate::recovery::ErrorContext;

/// Produced exactly once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub session_id: String,
    pub success: bool,
    /// Render output path, or the scene file when rendering is off
    pub artifact_reference: Option<String>,
    pub iteration_count: u32,
    pub elapsed_ms: u64,
    pub error: Option<ErrorContext>,
    pub final_rating: Option<f64>,
    /// `(failing role, substitute)` pairs, in order
    #[serde(default)]
    pub substitutions: Vec<(AgentRole, AgentRole)>,
}

impl GenerationResult {
    pub fn success(session_id: impl Into<String>, artifact_reference: impl Into<String>, iteration_count: u32) -> Self {
        Self {
            session_id: session_id.into(),
            success: true,
            artifact_reference: Some(artifact_reference.into()),
            iteration_count,
            elapsed_ms: 0,
            error: None,
            final_rating: None,
            substitutions: Vec::new(),
        }
    }

    pub fn failure(session_id: impl Into<String>, error: ErrorContext, iteration_count: u32) -> Self {
        Self {
            session_id: session_id.into(),
            success: false,
            artifact_reference: None,
            iteration_count,
            elapsed_ms: 0,
            error: Some(error),
            final_rating: None,
            substitutions: Vec::new(),
        }
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn with_rating(mut self, rating: Option<f64>) -> Self {
        self.final_rating = rating;
        self
    }

    pub fn with_substitutions(mut self, substitutions: Vec<(AgentRole, AgentRole)>) -> Self {
        self.substitutions = substitutions;
        self
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        if self.success {
            format!(
                "Scene ready after {} iteration(s): {}",
                self.iteration_count,
                self.artifact_reference.as_deref().unwrap_or("-")
            )
        } else {
            let reason = self
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            format!("Generation failed after {} iteration(s): {}", self.iteration_count, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::ErrorKind;

    #[test]
    fn test_failure_summary_names_role() {
        let err = ErrorContext::new(ErrorKind::ExecutionError, AgentRole::LightCamera, "render failed");
        let result = GenerationResult::failure("s1", err, 2);
        assert!(!result.success);
        assert!(result.artifact_reference.is_none());
        assert!(result.summary().contains("light_camera"));
    }

    #[test]
    fn test_serializes_substitutions() {
        let result = GenerationResult::success("s1", "/tmp/out.png", 1)
            .with_substitutions(vec![(AgentRole::Structure, AgentRole::StructureAlt)]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["substitutions"][0][1], "structure_alt");
        assert_eq!(json["artifact_reference"], "/tmp/out.png");
    }
}
