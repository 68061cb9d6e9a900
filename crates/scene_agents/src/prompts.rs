//! Stage prompt construction.
//!
//! Prompts are assembled from a role preamble, the user's request, the scene
//! concept, related context published by other agents, and any critique
//! feedback carried into a refine pass.

use crate::roles::AgentRole;

/// Everything a stage prompt may draw on.
#[derive(Debug, Clone, Default)]
pub struct PromptInput {
    /// The caller's original request
    pub user_prompt: String,
    /// Concept produced by the concept stage, if it has run
    pub concept: Option<String>,
    /// Related context from other agents, most relevant first
    pub hints: Vec<String>,
    /// Critique feedback when re-entering a stage
    pub feedback: Option<String>,
    /// 1-based pipeline iteration
    pub iteration: u32,
}

impl PromptInput {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            iteration: 1,
            ..Default::default()
        }
    }

    pub fn with_concept(mut self, concept: Option<String>) -> Self {
        self.concept = concept;
        self
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_feedback(mut self, feedback: Option<String>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }
}

fn preamble(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Concept => {
            "You are the concept agent. Describe the scene to build: subjects, \
             layout, palette and mood. Answer in plain prose."
        }
        AgentRole::Structure | AgentRole::StructureAlt => {
            "You are the structure agent. Write a Blender Python script that \
             creates the scene geometry. Return the script in a ```python block \
             followed by a short explanation."
        }
        AgentRole::Surface | AgentRole::SurfaceAlt => {
            "You are the surfacing agent. Write a Blender Python script that \
             creates materials and assigns them to existing objects. Return the \
             script in a ```python block followed by a short explanation."
        }
        AgentRole::LightCamera => {
            "You are the lighting and camera agent. Write a Blender Python script \
             that places lights and frames the active camera. Return the script \
             in a ```python block followed by a short explanation."
        }
        AgentRole::Motion => {
            "You are the motion agent. Write a Blender Python script that adds \
             keyframed animation to existing objects. Return the script in a \
             ```python block followed by a short explanation."
        }
        AgentRole::Critique => {
            "You are the critique agent. Review the scene summary and reply with \
             a JSON object: {\"rating\": 0-10, \"should_refine\": bool, \
             \"feedback\": string, \"targets\": [stage names]}."
        }
    }
}

/// Build the prompt text for a role.
pub fn build_prompt(role: AgentRole, input: &PromptInput) -> String {
    let mut prompt = String::new();
    prompt.push_str(preamble(role));
    if role.is_alternate() {
        prompt.push_str(" Prefer simple, robust constructs over ambitious ones.");
    }
    prompt.push_str("\n\n## Request\n");
    prompt.push_str(input.user_prompt.trim());
    prompt.push('\n');

    if let Some(concept) = input.concept.as_deref().filter(|_| role != AgentRole::Concept) {
        prompt.push_str("\n## Concept\n");
        prompt.push_str(concept.trim());
        prompt.push('\n');
    }

    if !input.hints.is_empty() {
        prompt.push_str("\n## Context from other agents\n");
        for hint in &input.hints {
            prompt.push_str("- ");
            prompt.push_str(hint.trim());
            prompt.push('\n');
        }
    }

    if let Some(feedback) = &input.feedback {
        prompt.push_str(&format!(
            "\n## Critique feedback (iteration {})\n{}\n",
            input.iteration,
            feedback.trim()
        ));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_prompt_omits_concept_section() {
        let input = PromptInput::new("a red cube").with_concept(Some("old".to_string()));
        let prompt = build_prompt(AgentRole::Concept, &input);
        assert!(prompt.contains("a red cube"));
        assert!(!prompt.contains("## Concept"));
    }

    #[test]
    fn test_refine_prompt_includes_feedback_and_hints() {
        let input = PromptInput::new("a red cube")
            .with_concept(Some("A single glossy cube".to_string()))
            .with_hints(vec!["structure: cube at origin".to_string()])
            .with_feedback(Some("Too dark".to_string()))
            .with_iteration(2);
        let prompt = build_prompt(AgentRole::LightCamera, &input);

        assert!(prompt.contains("## Concept\nA single glossy cube"));
        assert!(prompt.contains("- structure: cube at origin"));
        assert!(prompt.contains("iteration 2"));
        assert!(prompt.contains("Too dark"));
    }

    #[test]
    fn test_alternate_prompt_asks_for_simplicity() {
        let prompt = build_prompt(AgentRole::StructureAlt, &PromptInput::new("x"));
        assert!(prompt.contains("simple, robust"));
    }
}
