//! Agent role definitions and registry.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::traits::GenerationCapability;

/// Scene generation agent roles.
///
/// Primary roles each own one pipeline stage. Alternate roles (`*Alt`) are
/// fallback agents that serve the same stage as their primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Concept,
    Structure,
    StructureAlt,
    Surface,
    SurfaceAlt,
    LightCamera,
    Motion,
    Critique,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Concept => "concept",
            AgentRole::Structure => "structure",
            AgentRole::StructureAlt => "structure_alt",
            AgentRole::Surface => "surface",
            AgentRole::SurfaceAlt => "surface_alt",
            AgentRole::LightCamera => "light_camera",
            AgentRole::Motion => "motion",
            AgentRole::Critique => "critique",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AgentRole::Concept => "Interprets the prompt into a scene concept",
            AgentRole::Structure => "Builds scene geometry and object layout",
            AgentRole::StructureAlt => "Conservative geometry builder used as a fallback",
            AgentRole::Surface => "Creates and assigns materials",
            AgentRole::SurfaceAlt => "Flat-shaded material builder used as a fallback",
            AgentRole::LightCamera => "Places lights and frames the camera",
            AgentRole::Motion => "Adds keyframed animation",
            AgentRole::Critique => "Reviews the scene and requests refinements",
        }
    }

    /// The primary role whose stage this role serves.
    pub fn stage_role(&self) -> AgentRole {
        match self {
            AgentRole::StructureAlt => AgentRole::Structure,
            AgentRole::SurfaceAlt => AgentRole::Surface,
            other => *other,
        }
    }

    /// Pipeline position of the stage this role serves.
    pub fn ordinal(&self) -> usize {
        match self.stage_role() {
            AgentRole::Concept => 0,
            AgentRole::Structure => 1,
            AgentRole::Surface => 2,
            AgentRole::LightCamera => 3,
            AgentRole::Motion => 4,
            _ => 5,
        }
    }

    /// Whether this role emits a script for the execution collaborator.
    pub fn produces_script(&self) -> bool {
        !matches!(self.stage_role(), AgentRole::Concept | AgentRole::Critique)
    }

    /// Whether the critique loop may send the pipeline back to this stage.
    pub fn is_refinable(&self) -> bool {
        matches!(
            self.stage_role(),
            AgentRole::Structure | AgentRole::Surface | AgentRole::LightCamera | AgentRole::Motion
        )
    }

    pub fn is_alternate(&self) -> bool {
        self.stage_role() != *self
    }

    /// Roles that own a pipeline stage, in stage order.
    pub fn stage_roles() -> Vec<Self> {
        vec![
            AgentRole::Concept,
            AgentRole::Structure,
            AgentRole::Surface,
            AgentRole::LightCamera,
            AgentRole::Motion,
            AgentRole::Critique,
        ]
    }

    /// Stages dispatched when the caller does not pick an agent set.
    pub fn default_set() -> Vec<Self> {
        vec![
            AgentRole::Concept,
            AgentRole::Structure,
            AgentRole::Surface,
            AgentRole::LightCamera,
        ]
    }

    pub fn all() -> Vec<Self> {
        vec![
            AgentRole::Concept,
            AgentRole::Structure,
            AgentRole::StructureAlt,
            AgentRole::Surface,
            AgentRole::SurfaceAlt,
            AgentRole::LightCamera,
            AgentRole::Motion,
            AgentRole::Critique,
        ]
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        AgentRole::all()
            .into_iter()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| AgentError::UnknownRole(s.to_string()))
    }
}

/// Registry mapping roles to the capability that generates for them.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<AgentRole, Arc<dyn GenerationCapability>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register a capability for a role, replacing any previous one.
    pub fn register(&mut self, role: AgentRole, agent: Arc<dyn GenerationCapability>) {
        self.agents.insert(role, agent);
    }

    pub fn with(mut self, role: AgentRole, agent: Arc<dyn GenerationCapability>) -> Self {
        self.register(role, agent);
        self
    }

    pub fn get(&self, role: AgentRole) -> Option<Arc<dyn GenerationCapability>> {
        self.agents.get(&role).cloned()
    }

    pub fn get_required(&self, role: AgentRole) -> Result<Arc<dyn GenerationCapability>, AgentError> {
        self.get(role).ok_or(AgentError::NotFound(role))
    }

    pub fn contains(&self, role: AgentRole) -> bool {
        self.agents.contains_key(&role)
    }

    pub fn roles(&self) -> Vec<AgentRole> {
        let mut roles: Vec<_> = self.agents.keys().copied().collect();
        roles.sort();
        roles
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("light-camera".parse::<AgentRole>().unwrap(), AgentRole::LightCamera);
        assert_eq!("STRUCTURE_ALT".parse::<AgentRole>().unwrap(), AgentRole::StructureAlt);
        assert!("sculptor".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_alternate_roles_serve_primary_stage() {
        assert_eq!(AgentRole::StructureAlt.stage_role(), AgentRole::Structure);
        assert_eq!(AgentRole::StructureAlt.ordinal(), AgentRole::Structure.ordinal());
        assert!(AgentRole::SurfaceAlt.is_alternate());
        assert!(!AgentRole::Surface.is_alternate());
    }

    #[test]
    fn test_script_roles() {
        assert!(!AgentRole::Concept.produces_script());
        assert!(!AgentRole::Critique.produces_script());
        assert!(AgentRole::Motion.produces_script());
        assert!(!AgentRole::Concept.is_refinable());
    }
}
