//! Generation capability trait and request/response types.
//!
//! Every agent, whether backed by an LLM provider, a deterministic template,
//! or a test script, is reached through [`GenerationCapability`]. Failures are
//! reported through [`AgentError`](crate::AgentError) so callers see one
//! tagged result shape regardless of the backing implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentResult;
use crate::roles::AgentRole;

/// Input to a generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Role the call is made for (may be an alternate role)
    pub role: AgentRole,
    /// Fully built stage prompt
    pub prompt_text: String,
    /// Short hints distilled from other agents' published context
    pub context_hints: Vec<String>,
    /// Opaque provider identifier
    pub provider: String,
    /// Opaque model identifier
    pub model: String,
    /// Pipeline iteration the call belongs to (1-based)
    pub iteration: u32,
}

impl GenerationRequest {
    pub fn new(role: AgentRole, prompt_text: impl Into<String>) -> Self {
        Self {
            role,
            prompt_text: prompt_text.into(),
            context_hints: Vec::new(),
            provider: String::new(),
            model: String::new(),
            iteration: 1,
        }
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.context_hints = hints;
        self
    }

    pub fn with_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = provider.into();
        self.model = model.into();
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Rough token estimate for rate limiting (four characters per token).
    pub fn estimated_prompt_tokens(&self) -> u64 {
        let chars = self.prompt_text.len()
            + self.context_hints.iter().map(|h| h.len()).sum::<usize>();
        (chars as u64).div_ceil(4)
    }
}

/// Raw output of a generation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Generation {
    /// The artifact body (script, concept text, or critique document)
    pub artifact_text: String,
    /// Free-form reasoning accompanying the artifact
    pub reasoning_text: String,
    /// Provider metadata (token usage, model, latency)
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Generation {
    pub fn new(artifact_text: impl Into<String>) -> Self {
        Self {
            artifact_text: artifact_text.into(),
            ..Default::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning_text = reasoning.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Tokens the provider reported for this call, if any.
    pub fn tokens_used(&self) -> Option<u64> {
        self.metadata.get("tokens_used").and_then(|v| v.as_u64())
    }
}

/// A source of generated artifacts for one or more agent roles.
///
/// Implementations perform the external call only; rate limiting, retries
/// and fallback substitution belong to the orchestrator.
#[async_trait]
pub trait GenerationCapability: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Produce an artifact for the request.
    async fn generate(&self, request: &GenerationRequest) -> AgentResult<Generation>;
}
