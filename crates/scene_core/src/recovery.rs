//! Error classification and recovery routing.
//!
//! Every stage failure becomes an [`ErrorContext`]. The [`RecoveryRouter`]
//! decides what happens next:
//!
//! - transient kinds retry the same role with exponential backoff;
//! - structural kinds substitute a fallback role, at most one hop per role;
//! - validation shortfalls are deferred to the critique loop;
//! - anything else aborts the session.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scene_agents::{AgentError, AgentRole};
use scene_runner::RunnerError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::rate_limit::RateLimiter;

/// Failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AgentFailure,
    ParseError,
    ExecutionError,
    TimeoutError,
    ProviderError,
    ValidationFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentFailure => "agent_failure",
            Self::ParseError => "parse_error",
            Self::ExecutionError => "execution_error",
            Self::TimeoutError => "timeout_error",
            Self::ProviderError => "provider_error",
            Self::ValidationFailure => "validation_failure",
        }
    }

    /// Whether the same call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TimeoutError | Self::ProviderError)
    }

    /// Whether a fallback role may succeed where the failing one did not.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::AgentFailure | Self::ParseError | Self::ExecutionError)
    }

    pub fn from_agent_error(error: &AgentError) -> Self {
        match error {
            AgentError::Provider { .. } => Self::ProviderError,
            AgentError::Timeout(_) => Self::TimeoutError,
            AgentError::Parse { .. } | AgentError::Json(_) => Self::ParseError,
            _ => Self::AgentFailure,
        }
    }

    pub fn from_runner_error(error: &RunnerError) -> Self {
        match error {
            RunnerError::Timeout(_) => Self::TimeoutError,
            _ => Self::ExecutionError,
        }
    }

    /// Classify any core error.
    pub fn classify(error: &CoreError) -> Self {
        match error {
            CoreError::Agent(e) => Self::from_agent_error(e),
            CoreError::Runner(e) => Self::from_runner_error(e),
            _ => Self::AgentFailure,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified stage failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub message: String,
    pub failing_role: AgentRole,
    /// 1-based attempt number of the failing role
    pub attempt: u32,
    /// Token estimate of the failed call, used for backoff
    #[serde(default)]
    pub estimated_cost: u64,
}

impl ErrorContext {
    pub fn new(kind: ErrorKind, failing_role: AgentRole, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            failing_role,
            attempt: 1,
            estimated_cost: 0,
        }
    }

    pub fn from_agent_error(role: AgentRole, error: &AgentError) -> Self {
        Self::new(ErrorKind::from_agent_error(error), role, error.to_string())
    }

    pub fn from_runner_error(role: AgentRole, error: &RunnerError) -> Self {
        Self::new(ErrorKind::from_runner_error(error), role, error.to_string())
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_estimated_cost(mut self, cost: u64) -> Self {
        self.estimated_cost = cost;
        self
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in {} (attempt {}): {}",
            self.kind, self.failing_role, self.attempt, self.message
        )
    }
}

/// What the caller should do after a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Run the same role again after `backoff`
    Retry { role: AgentRole, backoff: Duration },
    /// Run `to` in place of `from` from now on
    Substitute { from: AgentRole, to: AgentRole },
    /// Let the critique loop decide
    DeferToCritique,
    Abort,
}

/// Router verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub recovered: bool,
    pub action: RecoveryAction,
}

impl RecoveryDecision {
    fn recovered(action: RecoveryAction) -> Self {
        Self {
            recovered: true,
            action,
        }
    }

    fn abort() -> Self {
        Self {
            recovered: false,
            action: RecoveryAction::Abort,
        }
    }
}

/// Retry bounds and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Total attempts allowed for a transient failure
    pub max_transient_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Critique ratings below this are validation failures
    pub acceptability_threshold: f64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            acceptability_threshold: 5.0,
        }
    }
}

impl RecoveryPolicy {
    /// Exponential backoff for the given 1-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let ms = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

/// Acyclic `failing role -> substitute role` edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FallbackMap {
    edges: BTreeMap<AgentRole, AgentRole>,
}

impl FallbackMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Structure -> StructureAlt`, `Surface -> SurfaceAlt`.
    pub fn default_edges() -> Self {
        let mut map = Self::new();
        map.edges.insert(AgentRole::Structure, AgentRole::StructureAlt);
        map.edges.insert(AgentRole::Surface, AgentRole::SurfaceAlt);
        map
    }

    /// Build a map from edge pairs, validating each.
    pub fn from_edges(edges: impl IntoIterator<Item = (AgentRole, AgentRole)>) -> CoreResult<Self> {
        let mut map = Self::new();
        for (role, fallback) in edges {
            map.set_fallback(role, fallback)?;
        }
        Ok(map)
    }

    /// Add or replace the fallback for `role`.
    ///
    /// Rejects self-edges and any edge that would close a cycle.
    pub fn set_fallback(&mut self, role: AgentRole, fallback: AgentRole) -> CoreResult<()> {
        if role == fallback {
            return Err(CoreError::SelfFallback(role));
        }

        let mut visited = BTreeSet::new();
        let mut current = fallback;
        while let Some(next) = self.edges.get(&current).copied() {
            if next == role || !visited.insert(current) {
                return Err(CoreError::FallbackCycle { from: role, to: fallback });
            }
            current = next;
        }

        self.edges.insert(role, fallback);
        Ok(())
    }

    pub fn fallback_for(&self, role: AgentRole) -> Option<AgentRole> {
        self.edges.get(&role).copied()
    }

    pub fn edges(&self) -> Vec<(AgentRole, AgentRole)> {
        self.edges.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[derive(Debug, Default)]
struct RouterState {
    /// Stage role -> substitute acting for it
    active: BTreeMap<AgentRole, AgentRole>,
    /// Roles that have been replaced
    substituted: BTreeSet<AgentRole>,
    /// Fallbacks already spent
    used: BTreeSet<AgentRole>,
    history: Vec<(AgentRole, AgentRole)>,
}

/// Per-session recovery router.
#[derive(Debug)]
pub struct RecoveryRouter {
    policy: RecoveryPolicy,
    fallbacks: FallbackMap,
    limiter: Option<Arc<RateLimiter>>,
    state: Mutex<RouterState>,
}

impl RecoveryRouter {
    pub fn new(policy: RecoveryPolicy, fallbacks: FallbackMap) -> Self {
        Self {
            policy,
            fallbacks,
            limiter: None,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Stretch retry backoff to the limiter's wait for the failing role.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn fallbacks(&self) -> &FallbackMap {
        &self.fallbacks
    }

    /// Decide how to recover from `error`.
    pub fn handle(&self, error: &ErrorContext) -> RecoveryDecision {
        let decision = match error.kind {
            kind if kind.is_transient() => self.handle_transient(error),
            kind if kind.is_structural() => self.handle_structural(error),
            _ => RecoveryDecision::recovered(RecoveryAction::DeferToCritique),
        };

        match &decision.action {
            RecoveryAction::Abort => warn!("Recovery exhausted: {}", error),
            action => info!("Recovery for {}: {:?}", error.failing_role, action),
        }
        decision
    }

    fn handle_transient(&self, error: &ErrorContext) -> RecoveryDecision {
        if error.attempt >= self.policy.max_transient_retries {
            return RecoveryDecision::abort();
        }

        let mut backoff = self.policy.backoff(error.attempt);
        if let Some(limiter) = &self.limiter {
            backoff = backoff.max(limiter.wait_time(error.failing_role.as_str(), error.estimated_cost));
        }
        RecoveryDecision::recovered(RecoveryAction::Retry {
            role: error.failing_role,
            backoff,
        })
    }

    fn handle_structural(&self, error: &ErrorContext) -> RecoveryDecision {
        let role = error.failing_role;
        let mut state = self.state.lock();

        let is_substitute = state.active.values().any(|r| *r == role);
        if is_substitute || state.substituted.contains(&role) {
            return RecoveryDecision::abort();
        }

        let fallback = match self.fallbacks.fallback_for(role) {
            Some(fallback) if !state.used.contains(&fallback) => fallback,
            _ => return RecoveryDecision::abort(),
        };

        state.active.insert(role.stage_role(), fallback);
        state.substituted.insert(role);
        state.used.insert(fallback);
        state.history.push((role, fallback));

        RecoveryDecision::recovered(RecoveryAction::Substitute { from: role, to: fallback })
    }

    /// The role currently acting for `stage_role`.
    pub fn active_role(&self, stage_role: AgentRole) -> AgentRole {
        self.state
            .lock()
            .active
            .get(&stage_role)
            .copied()
            .unwrap_or(stage_role)
    }

    /// Substitutions made so far, in order.
    pub fn substitutions(&self) -> Vec<(AgentRole, AgentRole)> {
        self.state.lock().history.clone()
    }
}
