//! Deterministic template-based agents.
//!
//! These agents need no provider: they extract shapes and colors from the
//! request with simple keyword matching and emit Blender Python scripts from
//! fixed templates. They let the pipeline run end-to-end offline and give
//! the CLI a working default.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AgentResult;
use crate::roles::{AgentRegistry, AgentRole};
use crate::traits::{Generation, GenerationCapability, GenerationRequest};

const SHAPES: &[(&str, &str)] = &[
    ("cube", "primitive_cube_add"),
    ("box", "primitive_cube_add"),
    ("sphere", "primitive_uv_sphere_add"),
    ("ball", "primitive_uv_sphere_add"),
    ("cone", "primitive_cone_add"),
    ("cylinder", "primitive_cylinder_add"),
    ("torus", "primitive_torus_add"),
    ("donut", "primitive_torus_add"),
    ("plane", "primitive_plane_add"),
    ("monkey", "primitive_monkey_add"),
];

const COLORS: &[(&str, [f32; 3])] = &[
    ("red", [0.8, 0.05, 0.05]),
    ("green", [0.05, 0.6, 0.1]),
    ("blue", [0.05, 0.15, 0.8]),
    ("yellow", [0.9, 0.8, 0.05]),
    ("orange", [0.9, 0.4, 0.05]),
    ("purple", [0.45, 0.1, 0.7]),
    ("white", [0.9, 0.9, 0.9]),
    ("black", [0.02, 0.02, 0.02]),
    ("gold", [0.85, 0.65, 0.15]),
];

/// Keywords recognised in a request.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneKeywords {
    pub shapes: Vec<(&'static str, &'static str)>,
    pub color: Option<(&'static str, [f32; 3])>,
}

impl SceneKeywords {
    pub fn extract(text: &str) -> Self {
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |needle: &str| {
            words
                .iter()
                .any(|w| *w == needle || w.strip_suffix('s') == Some(needle))
        };

        let mut shapes: Vec<(&'static str, &'static str)> = Vec::new();
        for (name, op) in SHAPES {
            if has(*name) && !shapes.iter().any(|(_, o)| o == op) {
                shapes.push((*name, *op));
            }
        }
        if shapes.is_empty() {
            shapes.push(SHAPES[0]);
        }

        let color = COLORS.iter().find(|(name, _)| has(*name)).copied();

        Self { shapes, color }
    }
}

/// A deterministic agent for one role.
pub struct TemplateAgent {
    role: AgentRole,
    name: String,
}

impl TemplateAgent {
    pub fn new(role: AgentRole) -> Self {
        Self {
            role,
            name: format!("template-{}", role),
        }
    }

    /// Registry with a template agent for every role.
    pub fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for role in AgentRole::all() {
            registry.register(role, Arc::new(TemplateAgent::new(role)));
        }
        registry
    }

    fn user_request(prompt: &str) -> &str {
        prompt
            .split("## Request\n")
            .nth(1)
            .and_then(|rest| rest.lines().next())
            .unwrap_or(prompt)
    }

    fn concept(keywords: &SceneKeywords, request: &str) -> String {
        let subjects = keywords
            .shapes
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ");
        let palette = keywords.color.map(|(name, _)| name).unwrap_or("neutral grey");
        format!(
            "Scene for \"{}\": {} centred on a ground plane, {} palette, soft three-point lighting.",
            request.trim(),
            subjects,
            palette
        )
    }

    fn structure(keywords: &SceneKeywords, simple: bool) -> String {
        let mut script = String::from("import bpy\n\n");
        if !simple {
            script.push_str("bpy.ops.mesh.primitive_plane_add(size=10, location=(0, 0, 0))\n");
            script.push_str("bpy.context.active_object.name = 'Ground'\n");
        }
        let count = keywords.shapes.len() as f32;
        for (i, (name, op)) in keywords.shapes.iter().enumerate() {
            let x = (i as f32 - (count - 1.0) / 2.0) * 2.5;
            script.push_str(&format!("bpy.ops.mesh.{}(location=({:.2}, 0, 1))\n", op, x));
            script.push_str(&format!("bpy.context.active_object.name = 'Subject_{}'\n", name));
        }
        script
    }

    fn surface(keywords: &SceneKeywords, flat: bool) -> String {
        let (name, rgb) = keywords.color.unwrap_or(("grey", [0.5, 0.5, 0.5]));
        let mut script = String::from("import bpy\n\n");
        script.push_str(&format!("mat = bpy.data.materials.new(name='{}_material')\n", name));
        if flat {
            script.push_str(&format!(
                "mat.diffuse_color = ({:.2}, {:.2}, {:.2}, 1.0)\n",
                rgb[0], rgb[1], rgb[2]
            ));
        } else {
            script.push_str("mat.use_nodes = True\n");
            script.push_str("bsdf = mat.node_tree.nodes.get('Principled BSDF')\n");
            script.push_str(&format!(
                "bsdf.inputs['Base Color'].default_value = ({:.2}, {:.2}, {:.2}, 1.0)\n",
                rgb[0], rgb[1], rgb[2]
            ));
        }
        script.push_str("for obj in bpy.data.objects:\n");
        script.push_str("    if obj.name.startswith('Subject_'):\n");
        script.push_str("        obj.data.materials.clear()\n");
        script.push_str("        obj.data.materials.append(mat)\n");
        script
    }

    fn light_camera() -> String {
        [
            "import bpy",
            "",
            "bpy.ops.object.light_add(type='AREA', location=(4, -4, 6))",
            "bpy.context.active_object.data.energy = 800",
            "bpy.ops.object.light_add(type='SUN', location=(-3, 2, 8))",
            "bpy.ops.object.camera_add(location=(7, -7, 5), rotation=(1.1, 0, 0.785))",
            "bpy.context.scene.camera = bpy.context.active_object",
            "",
        ]
        .join("\n")
    }

    fn motion() -> String {
        [
            "import bpy",
            "",
            "scene = bpy.context.scene",
            "scene.frame_start = 1",
            "scene.frame_end = 96",
            "for obj in bpy.data.objects:",
            "    if obj.name.startswith('Subject_'):",
            "        obj.rotation_euler = (0, 0, 0)",
            "        obj.keyframe_insert(data_path='rotation_euler', frame=1)",
            "        obj.rotation_euler = (0, 0, 6.2832)",
            "        obj.keyframe_insert(data_path='rotation_euler', frame=96)",
            "",
        ]
        .join("\n")
    }

    fn critique() -> String {
        serde_json::json!({
            "rating": 7.0,
            "should_refine": false,
            "feedback": "Composition reads clearly; no changes required.",
            "targets": []
        })
        .to_string()
    }
}

#[async_trait]
impl GenerationCapability for TemplateAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> AgentResult<Generation> {
        let user_request = Self::user_request(&request.prompt_text);
        let keywords = SceneKeywords::extract(user_request);

        let (artifact, reasoning) = match self.role {
            AgentRole::Concept => (Self::concept(&keywords, user_request), String::new()),
            AgentRole::Structure => (
                fenced(&Self::structure(&keywords, false)),
                format!("Placed {} subject(s) on a ground plane.", keywords.shapes.len()),
            ),
            AgentRole::StructureAlt => (
                fenced(&Self::structure(&keywords, true)),
                "Placed subjects without supporting geometry.".to_string(),
            ),
            AgentRole::Surface => (
                fenced(&Self::surface(&keywords, false)),
                "Assigned a principled material to every subject.".to_string(),
            ),
            AgentRole::SurfaceAlt => (
                fenced(&Self::surface(&keywords, true)),
                "Assigned a flat viewport color to every subject.".to_string(),
            ),
            AgentRole::LightCamera => (
                fenced(&Self::light_camera()),
                "Area key light, sun fill, three-quarter camera.".to_string(),
            ),
            AgentRole::Motion => (
                fenced(&Self::motion()),
                "One full turntable rotation over 96 frames.".to_string(),
            ),
            AgentRole::Critique => (Self::critique(), String::new()),
        };

        let tokens = (artifact.len() as u64).div_ceil(4) + request.estimated_prompt_tokens();
        Ok(Generation::new(artifact)
            .with_reasoning(reasoning)
            .with_metadata("tokens_used", serde_json::json!(tokens))
            .with_metadata("agent", serde_json::json!(self.name)))
    }
}

fn fenced(script: &str) -> String {
    format!("```python\n{}```", script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse_response;
    use crate::prompts::{build_prompt, PromptInput};

    #[test]
    fn test_keyword_extraction() {
        let keywords = SceneKeywords::extract("Two red spheres next to a cube");
        let names: Vec<_> = keywords.shapes.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["cube", "sphere"]);
        assert_eq!(keywords.color.map(|(n, _)| n), Some("red"));
    }

    #[test]
    fn test_keyword_defaults() {
        let keywords = SceneKeywords::extract("something abstract");
        assert_eq!(keywords.shapes, vec![("cube", "primitive_cube_add")]);
        assert!(keywords.color.is_none());
    }

    #[tokio::test]
    async fn test_template_outputs_parse_for_every_role() {
        let registry = TemplateAgent::registry();
        for role in AgentRole::all() {
            let prompt = build_prompt(role, &PromptInput::new("a red cube"));
            let agent = registry.get_required(role).unwrap();
            let generation = agent.generate(&GenerationRequest::new(role, prompt)).await.unwrap();
            let parsed = parse_response(role, &generation).unwrap();
            assert!(!parsed.artifact.is_empty(), "empty artifact for {}", role);
            assert!(generation.tokens_used().is_some());
        }
    }

    #[tokio::test]
    async fn test_structure_uses_request_not_preamble() {
        let agent = TemplateAgent::new(AgentRole::Structure);
        let prompt = build_prompt(AgentRole::Structure, &PromptInput::new("a torus"));
        let generation = agent
            .generate(&GenerationRequest::new(AgentRole::Structure, prompt))
            .await
            .unwrap();
        assert!(generation.artifact_text.contains("primitive_torus_add"));
        assert!(!generation.artifact_text.contains("primitive_cube_add"));
    }
}
