//! # scene_agents
//!
//! Agent roles and generation capabilities for SceneForge.
//!
//! Agents are responsible for:
//! - Building stage prompts
//! - Producing artifacts (concept prose, Blender scripts, critique verdicts)
//! - Reporting failures through one tagged error type
//!
//! ## Architecture
//!
//! All agents implement the [`GenerationCapability`] trait. The orchestrator
//! looks them up by [`AgentRole`] in an [`AgentRegistry`] and interprets
//! their output with [`parse_response`].
//!
//! ## Roles
//!
//! | Role | Stage | Primary Output |
//! |------|-------|----------------|
//! | Concept | concept | Scene description |
//! | Structure / StructureAlt | structure | Geometry script |
//! | Surface / SurfaceAlt | surface | Material script |
//! | LightCamera | light_camera | Lighting and camera script |
//! | Motion | motion | Animation script |
//! | Critique | critique | Rating and refine request |
//!
//! [`TemplateAgent`] is a deterministic implementation for every role;
//! [`ScriptedAgent`] replays queued replies for tests.

pub mod error;
pub mod parsing;
pub mod prompts;
pub mod roles;
pub mod scripted;
pub mod template;
pub mod traits;

pub use error::{AgentError, AgentResult};
pub use parsing::{parse_response, CritiqueVerdict, ParsedResponse};
pub use prompts::{build_prompt, PromptInput};
pub use roles::{AgentRegistry, AgentRole};
pub use scripted::{ScriptedAgent, ScriptedReply};
pub use template::{SceneKeywords, TemplateAgent};
pub use traits::{Generation, GenerationCapability, GenerationRequest};
