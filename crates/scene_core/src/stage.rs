//! Stage records and the pipeline state machine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use scene_agents::AgentRole;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::recovery::ErrorContext;

/// Status of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the move `self -> next` is legal.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Concept,
    Structure,
    Surface,
    LightCamera,
    Motion,
    Critique,
    Refine,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Concept => "concept",
            Self::Structure => "structure",
            Self::Surface => "surface",
            Self::LightCamera => "light_camera",
            Self::Motion => "motion",
            Self::Critique => "critique",
            Self::Refine => "refine",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// State for the stage a role serves.
    pub fn for_role(role: AgentRole) -> Self {
        match role.stage_role() {
            AgentRole::Concept => Self::Concept,
            AgentRole::Structure => Self::Structure,
            AgentRole::Surface => Self::Surface,
            AgentRole::LightCamera => Self::LightCamera,
            AgentRole::Motion => Self::Motion,
            _ => Self::Critique,
        }
    }

    fn position(&self) -> usize {
        match self {
            Self::Init => 0,
            Self::Concept => 1,
            Self::Structure => 2,
            Self::Surface => 3,
            Self::LightCamera => 4,
            Self::Motion => 5,
            Self::Critique => 6,
            Self::Refine => 7,
            Self::Done => 8,
            Self::Failed => 9,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn is_builder(&self) -> bool {
        matches!(
            self,
            Self::Structure | Self::Surface | Self::LightCamera | Self::Motion
        )
    }

    /// Whether the pipeline may move from `self` to `next`.
    ///
    /// Stages only move forward except through `Refine`, which may return
    /// to any builder stage (or straight to critique when every target was
    /// dropped). Every non-terminal state may fail.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Self::Failed) => true,
            (_, Self::Init) => false,
            (Self::Critique, Self::Refine) => true,
            (Self::Refine, next) => next.is_builder() || next == Self::Critique,
            (_, Self::Refine) => false,
            (current, next) => next.position() > current.position(),
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded pipeline transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub iteration: u32,
}

/// Every state the pipeline passed through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTrace {
    state: PipelineState,
    transitions: Vec<StateTransition>,
}

impl Default for PipelineTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineTrace {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Init,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Move to `next`, refusing illegal edges. Re-entering the current
    /// state is a no-op.
    pub fn advance(&mut self, next: PipelineState, iteration: u32) -> CoreResult<()> {
        if next == self.state {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(CoreError::invalid_transition(self.state, next));
        }
        self.transitions.push(StateTransition {
            from: self.state,
            to: next,
            iteration,
        });
        self.state = next;
        Ok(())
    }
}

/// One stage of one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage role
    pub role: AgentRole,
    /// Role that produced the final output, differs after substitution
    pub acting_role: AgentRole,
    pub ordinal: usize,
    pub depends_on: BTreeSet<AgentRole>,
    pub status: StageStatus,
    pub iteration: u32,
    /// Generation attempts made, across roles
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorContext>,
}

impl StageRecord {
    pub fn new(role: AgentRole, iteration: u32) -> Self {
        let role = role.stage_role();
        Self {
            role,
            acting_role: role,
            ordinal: role.ordinal(),
            depends_on: BTreeSet::new(),
            status: StageStatus::Pending,
            iteration,
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_dependencies(mut self, depends_on: BTreeSet<AgentRole>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Move to `next`, stamping start and completion times.
    pub fn transition(&mut self, next: StageStatus, at: DateTime<Utc>) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::invalid_transition(
                format!("{}:{}", self.role, self.status),
                next,
            ));
        }
        if next == StageStatus::Running {
            self.started_at = Some(at);
        } else {
            self.completed_at = Some(at);
        }
        self.status = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Default stage dependencies.
///
/// `Structure <- Concept`; `Surface`, `LightCamera`, `Motion <- Structure`;
/// `Critique <-` every builder stage.
pub fn default_dependencies(role: AgentRole) -> Vec<AgentRole> {
    match role.stage_role() {
        AgentRole::Concept => vec![],
        AgentRole::Structure => vec![AgentRole::Concept],
        AgentRole::Surface | AgentRole::LightCamera | AgentRole::Motion => vec![AgentRole::Structure],
        _ => vec![
            AgentRole::Structure,
            AgentRole::Surface,
            AgentRole::LightCamera,
            AgentRole::Motion,
        ],
    }
}

/// Dependencies of `role` restricted to `active` stages.
///
/// An inactive dependency is replaced by its own dependencies, so removing
/// a stage never disconnects the graph.
pub fn resolve_dependencies(role: AgentRole, active: &BTreeSet<AgentRole>) -> BTreeSet<AgentRole> {
    let mut resolved = BTreeSet::new();
    let mut stack = default_dependencies(role);
    let mut seen = BTreeSet::new();
    while let Some(dep) = stack.pop() {
        if !seen.insert(dep) {
            continue;
        }
        if active.contains(&dep) {
            resolved.insert(dep);
        } else {
            stack.extend(default_dependencies(dep));
        }
    }
    resolved
}
