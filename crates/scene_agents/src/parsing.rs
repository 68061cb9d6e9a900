//! Response parsing.
//!
//! Turns a raw [`Generation`] into a [`ParsedResponse`]. Anything that cannot
//! be interpreted for the role becomes [`AgentError::Parse`]; parsing never
//! panics on malformed provider output.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};
use crate::roles::AgentRole;
use crate::traits::Generation;

/// Critique verdict extracted from a critique response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueVerdict {
    /// Score between 0 and 10
    pub rating: f64,
    pub should_refine: bool,
    pub feedback: String,
    /// Stages to revisit; empty means the default refine set
    pub targets: Vec<AgentRole>,
}

/// A response interpreted for its role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub role: AgentRole,
    /// Script for builder roles, concept prose, or the raw critique JSON
    pub artifact: String,
    pub reasoning: String,
    pub verdict: Option<CritiqueVerdict>,
}

#[derive(Deserialize)]
struct RawVerdict {
    rating: f64,
    should_refine: bool,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    targets: Vec<String>,
}

fn code_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:python|py)?[ \t]*\r?\n(.*?)```").expect("valid fence pattern")
    })
}

fn json_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)```").expect("valid json fence pattern"))
}

/// Parse a generation for the given role.
pub fn parse_response(role: AgentRole, generation: &Generation) -> AgentResult<ParsedResponse> {
    match role.stage_role() {
        AgentRole::Concept => parse_concept(role, generation),
        AgentRole::Critique => parse_critique(role, generation),
        _ => parse_script(role, generation),
    }
}

fn parse_concept(role: AgentRole, generation: &Generation) -> AgentResult<ParsedResponse> {
    let concept = generation.artifact_text.trim();
    if concept.is_empty() {
        return Err(AgentError::parse(role, "empty concept"));
    }
    Ok(ParsedResponse {
        role,
        artifact: concept.to_string(),
        reasoning: generation.reasoning_text.trim().to_string(),
        verdict: None,
    })
}

fn parse_script(role: AgentRole, generation: &Generation) -> AgentResult<ParsedResponse> {
    let text = &generation.artifact_text;

    let (script, outside) = match code_fence().captures(text) {
        Some(caps) => {
            let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let outside = format!("{}{}", &text[..whole.start], &text[whole.end..]);
            (body.trim().to_string(), outside)
        }
        None if text.contains("import bpy") => (text.trim().to_string(), String::new()),
        None => return Err(AgentError::parse(role, "no script block in response")),
    };

    if script.is_empty() {
        return Err(AgentError::parse(role, "script block is empty"));
    }

    let reasoning = [outside.trim(), generation.reasoning_text.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");

    Ok(ParsedResponse {
        role,
        artifact: script,
        reasoning,
        verdict: None,
    })
}

fn parse_critique(role: AgentRole, generation: &Generation) -> AgentResult<ParsedResponse> {
    let text = &generation.artifact_text;
    let json = match json_fence().captures(text).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().to_string(),
        None => {
            let start = text.find('{');
            let end = text.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if s < e => text[s..=e].to_string(),
                _ => return Err(AgentError::parse(role, "no verdict object in response")),
            }
        }
    };

    let raw: RawVerdict = serde_json::from_str(&json)
        .map_err(|e| AgentError::parse(role, format!("malformed verdict: {}", e)))?;

    if !raw.rating.is_finite() {
        return Err(AgentError::parse(role, "rating is not a number"));
    }

    let mut targets: Vec<AgentRole> = raw
        .targets
        .iter()
        .filter_map(|t| t.parse::<AgentRole>().ok())
        .map(|r| r.stage_role())
        .filter(|r| r.is_refinable())
        .collect();
    targets.sort();
    targets.dedup();

    Ok(ParsedResponse {
        role,
        artifact: json.trim().to_string(),
        reasoning: raw.feedback.clone(),
        verdict: Some(CritiqueVerdict {
            rating: raw.rating.clamp(0.0, 10.0),
            should_refine: raw.should_refine,
            feedback: raw.feedback,
            targets,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_script() {
        let generation = Generation::new(
            "Here is the cube.\n```python\nimport bpy\nbpy.ops.mesh.primitive_cube_add()\n```\nDone.",
        );
        let parsed = parse_response(AgentRole::Structure, &generation).unwrap();
        assert!(parsed.artifact.starts_with("import bpy"));
        assert!(parsed.reasoning.contains("Here is the cube."));
        assert!(parsed.reasoning.contains("Done."));
    }

    #[test]
    fn test_parse_bare_script() {
        let generation = Generation::new("import bpy\nbpy.ops.object.light_add(type='SUN')");
        let parsed = parse_response(AgentRole::LightCamera, &generation).unwrap();
        assert!(parsed.artifact.contains("light_add"));
    }

    #[test]
    fn test_unparseable_script_is_parse_error() {
        let generation = Generation::new("I would rather not.");
        let err = parse_response(AgentRole::Structure, &generation).unwrap_err();
        assert!(matches!(err, AgentError::Parse { .. }));
    }

    #[test]
    fn test_empty_concept_is_parse_error() {
        let err = parse_response(AgentRole::Concept, &Generation::new("   ")).unwrap_err();
        assert!(matches!(err, AgentError::Parse { .. }));
    }

    #[test]
    fn test_parse_critique_verdict() {
        let generation = Generation::new(
            "Review:\n```json\n{\"rating\": 12, \"should_refine\": true, \"feedback\": \"too dark\", \"targets\": [\"light-camera\", \"surface_alt\", \"concept\", \"bogus\"]}\n```",
        );
        let parsed = parse_response(AgentRole::Critique, &generation).unwrap();
        let verdict = parsed.verdict.unwrap();
        assert_eq!(verdict.rating, 10.0);
        assert!(verdict.should_refine);
        assert_eq!(verdict.targets, vec![AgentRole::Surface, AgentRole::LightCamera]);
    }

    #[test]
    fn test_parse_inline_critique_object() {
        let generation = Generation::new("{\"rating\": 7.5, \"should_refine\": false}");
        let verdict = parse_response(AgentRole::Critique, &generation).unwrap().verdict.unwrap();
        assert_eq!(verdict.rating, 7.5);
        assert!(verdict.targets.is_empty());
    }

    #[test]
    fn test_malformed_critique_is_parse_error() {
        let generation = Generation::new("{\"rating\": \"great\"}");
        assert!(parse_response(AgentRole::Critique, &generation).is_err());
    }
}
