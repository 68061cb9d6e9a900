//! Pipeline configuration.
//!
//! [`PipelineConfig`] is the orchestrator-wide configuration, loaded from
//! YAML and overridable from `SCENEFORGE_*` environment variables.
//! [`GenerationOptions`] carries per-request overrides and resolves against
//! the config into [`ResolvedOptions`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use scene_agents::AgentRole;
use scene_runner::{RenderOptions, RenderTarget};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::rate_limit::RateLimitConfig;
use crate::recovery::{FallbackMap, RecoveryPolicy};

/// How a pass dispatches its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// One stage at a time, in ordinal order
    #[default]
    Sequential,
    /// Independent stages fan out as concurrent tasks
    Concurrent,
}

impl SchedulingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Concurrent => "concurrent",
        }
    }
}

impl std::str::FromStr for SchedulingMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(CoreError::InvalidConfig(format!("unknown scheduling mode: {}", other))),
        }
    }
}

/// Script execution and render settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Deadline for one script execution
    pub timeout_seconds: u64,
    /// Render the final scene
    pub render: bool,
    pub render_options: RenderOptions,
    /// Where scene files and renders are written
    pub output_dir: PathBuf,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 120,
            render: true,
            render_options: RenderOptions::default(),
            output_dir: PathBuf::from("output"),
        }
    }
}

/// One `failing role -> substitute` edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEdge {
    pub from: AgentRole,
    pub to: AgentRole,
}

fn default_fallbacks() -> Vec<FallbackEdge> {
    FallbackMap::default_edges()
        .edges()
        .into_iter()
        .map(|(from, to)| FallbackEdge { from, to })
        .collect()
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Provider identifier passed to generation capabilities
    pub provider: String,
    pub model: String,
    pub max_iterations: u32,
    pub enable_critique: bool,
    pub tokens_per_minute_limit: u64,
    pub min_delay_seconds: f64,
    pub scheduling: SchedulingMode,
    /// Deadline for one generation call
    pub generation_timeout_seconds: u64,
    /// Entries pulled from the context bus per prompt
    pub context_top_k: usize,
    pub subscriber_queue_capacity: usize,
    pub sink_timeout_ms: u64,
    /// Finished sessions older than this are purgeable
    pub session_ttl_seconds: u64,
    pub execution: ExecutionSettings,
    pub recovery: RecoveryPolicy,
    pub fallbacks: Vec<FallbackEdge>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provider: "template".to_string(),
            model: "deterministic".to_string(),
            max_iterations: 3,
            enable_critique: true,
            tokens_per_minute_limit: 40_000,
            min_delay_seconds: 0.5,
            scheduling: SchedulingMode::Sequential,
            generation_timeout_seconds: 120,
            context_top_k: 3,
            subscriber_queue_capacity: 64,
            sink_timeout_ms: 2_000,
            session_ttl_seconds: 3_600,
            execution: ExecutionSettings::default(),
            recovery: RecoveryPolicy::default(),
            fallbacks: default_fallbacks(),
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a YAML file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> CoreResult<Self> {
        serde_yaml::from_str(yaml).map_err(CoreError::from)
    }

    pub fn to_yaml(&self) -> CoreResult<String> {
        serde_yaml::to_string(self).map_err(CoreError::from)
    }

    /// Apply `SCENEFORGE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply `SCENEFORGE_*` overrides from `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(provider) = lookup("SCENEFORGE_PROVIDER") {
            self.provider = provider;
        }
        if let Some(model) = lookup("SCENEFORGE_MODEL") {
            self.model = model;
        }
        if let Some(value) = lookup("SCENEFORGE_MAX_ITERATIONS") {
            match value.parse() {
                Ok(n) => self.max_iterations = n,
                Err(_) => warn!("Ignoring SCENEFORGE_MAX_ITERATIONS={}", value),
            }
        }
        if let Some(value) = lookup("SCENEFORGE_TOKENS_PER_MINUTE") {
            match value.parse() {
                Ok(n) => self.tokens_per_minute_limit = n,
                Err(_) => warn!("Ignoring SCENEFORGE_TOKENS_PER_MINUTE={}", value),
            }
        }
        if let Some(value) = lookup("SCENEFORGE_MIN_DELAY_SECONDS") {
            match value.parse() {
                Ok(n) => self.min_delay_seconds = n,
                Err(_) => warn!("Ignoring SCENEFORGE_MIN_DELAY_SECONDS={}", value),
            }
        }
        if let Some(value) = lookup("SCENEFORGE_ENABLE_CRITIQUE") {
            self.enable_critique = value.to_lowercase() != "false";
        }
        if let Some(value) = lookup("SCENEFORGE_SCHEDULING") {
            match value.parse() {
                Ok(mode) => self.scheduling = mode,
                Err(_) => warn!("Ignoring SCENEFORGE_SCHEDULING={}", value),
            }
        }
        if let Some(dir) = lookup("SCENEFORGE_OUTPUT_DIR") {
            self.execution.output_dir = PathBuf::from(dir);
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_iterations == 0 {
            return Err(CoreError::InvalidConfig("max_iterations must be at least 1".into()));
        }
        if self.tokens_per_minute_limit == 0 {
            return Err(CoreError::InvalidConfig("tokens_per_minute_limit must be positive".into()));
        }
        if !(self.min_delay_seconds >= 0.0) {
            return Err(CoreError::InvalidConfig("min_delay_seconds must not be negative".into()));
        }
        if self.recovery.max_transient_retries == 0 {
            return Err(CoreError::InvalidConfig("max_transient_retries must be at least 1".into()));
        }
        if self.generation_timeout_seconds == 0
            || self.execution.timeout_seconds == 0
            || self.execution.render_options.timeout_seconds == 0
        {
            return Err(CoreError::InvalidConfig("timeouts must be positive".into()));
        }
        self.fallback_map()?;
        Ok(())
    }

    /// Validated fallback edges.
    pub fn fallback_map(&self) -> CoreResult<FallbackMap> {
        FallbackMap::from_edges(self.fallbacks.iter().map(|e| (e.from, e.to)))
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.tokens_per_minute_limit, self.min_delay_seconds)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_seconds)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.timeout_seconds)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

/// Per-request overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub max_iterations: Option<u32>,
    pub enable_critique: Option<bool>,
    pub scheduling: Option<SchedulingMode>,
    /// Add the motion stage
    pub animate: bool,
    /// Explicit agent set; `None` means the default set
    pub agents: Option<Vec<AgentRole>>,
    pub render: Option<bool>,
    pub render_target: Option<RenderTarget>,
    /// Roles whose failure does not abort a concurrent pass
    pub tolerated_roles: BTreeSet<AgentRole>,
    pub context_refs: Vec<String>,
}

impl GenerationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_critique(mut self, enabled: bool) -> Self {
        self.enable_critique = Some(enabled);
        self
    }

    pub fn with_scheduling(mut self, mode: SchedulingMode) -> Self {
        self.scheduling = Some(mode);
        self
    }

    pub fn with_animation(mut self, animate: bool) -> Self {
        self.animate = animate;
        self
    }

    pub fn with_agents(mut self, agents: Vec<AgentRole>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_render(mut self, render: bool) -> Self {
        self.render = Some(render);
        self
    }

    pub fn with_render_target(mut self, target: RenderTarget) -> Self {
        self.render_target = Some(target);
        self
    }

    pub fn with_tolerated(mut self, role: AgentRole) -> Self {
        self.tolerated_roles.insert(role.stage_role());
        self
    }

    pub fn with_context_ref(mut self, reference: impl Into<String>) -> Self {
        self.context_refs.push(reference.into());
        self
    }

    /// Merge with `config` into concrete settings.
    pub fn resolve(&self, config: &PipelineConfig) -> ResolvedOptions {
        let enable_critique = self.enable_critique.unwrap_or(config.enable_critique);

        let mut agents: BTreeSet<AgentRole> = match &self.agents {
            Some(explicit) => explicit.iter().map(|r| r.stage_role()).collect(),
            None => AgentRole::default_set().into_iter().collect(),
        };
        if self.animate {
            agents.insert(AgentRole::Motion);
        }
        if enable_critique {
            agents.insert(AgentRole::Critique);
        } else {
            agents.remove(&AgentRole::Critique);
        }

        ResolvedOptions {
            max_iterations: self.max_iterations.unwrap_or(config.max_iterations).max(1),
            enable_critique,
            scheduling: self.scheduling.unwrap_or(config.scheduling),
            animate: self.animate || agents.contains(&AgentRole::Motion),
            agents,
            render: self.render.unwrap_or(config.execution.render),
            render_target: self.render_target.clone(),
            render_options: config.execution.render_options.clone(),
            output_dir: config.execution.output_dir.clone(),
            tolerated_roles: self.tolerated_roles.clone(),
            context_refs: self.context_refs.clone(),
        }
    }
}

/// Options after merging request overrides with the config.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub max_iterations: u32,
    pub enable_critique: bool,
    pub scheduling: SchedulingMode,
    pub animate: bool,
    /// Stage roles to run
    pub agents: BTreeSet<AgentRole>,
    pub render: bool,
    pub render_target: Option<RenderTarget>,
    pub render_options: RenderOptions,
    pub output_dir: PathBuf,
    pub tolerated_roles: BTreeSet<AgentRole>,
    pub context_refs: Vec<String>,
}

impl ResolvedOptions {
    /// Render target for `scene_id`, defaulting into the output directory.
    pub fn render_target_for(&self, scene_id: &str) -> RenderTarget {
        match &self.render_target {
            Some(target) => target.clone(),
            None if self.animate => RenderTarget::animation(self.output_dir.join(format!("{}_", scene_id))),
            None => RenderTarget::still(self.output_dir.join(format!("{}.png", scene_id))),
        }
    }
}
