//! Stage driver.
//!
//! Runs one stage end to end: prompt, rate limit, generation, parsing,
//! script execution, publication. Failures go through the session's
//! [`RecoveryRouter`] until the stage succeeds or the router gives up.
//! Both the sequential pipeline and the concurrent graph drive stages
//! through this type.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use scene_agents::{
    build_prompt, parse_response, AgentRegistry, AgentRole, CritiqueVerdict, GenerationRequest,
    ParsedResponse, PromptInput,
};
use scene_runner::{RunnerError, SceneExecutor, SceneHandle, ScriptArtifact};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{PipelineConfig, ResolvedOptions};
use crate::context::{AssetValue, ContextBus, ContextType, EventType, PendingContext, Publication};
use crate::rate_limit::RateLimiter;
use crate::recovery::{ErrorContext, ErrorKind, RecoveryAction, RecoveryRouter};
use crate::registry::SessionRegistry;
use crate::stage::{PipelineState, StageRecord, StageStatus};
use crate::telemetry::Telemetry;

/// Tokens budgeted for a response on top of the prompt estimate.
const RESPONSE_TOKEN_ALLOWANCE: u64 = 512;

/// Longest context excerpt passed as a prompt hint.
const HINT_CHARS: usize = 240;

/// Name of the shared asset holding the scene file.
pub const SCENE_ASSET: &str = "scene";

/// Per-call settings taken from the pipeline config.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub provider: String,
    pub model: String,
    pub context_top_k: usize,
    pub generation_timeout: Duration,
    pub execution_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl DriverSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            model: config.model.clone(),
            context_top_k: config.context_top_k,
            generation_timeout: config.generation_timeout(),
            execution_timeout: config.execution_timeout(),
        }
    }
}

/// Output of a successful stage.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub role: AgentRole,
    pub acting_role: AgentRole,
    pub artifact: String,
    pub reasoning: String,
    pub verdict: Option<CritiqueVerdict>,
}

/// Everything one session needs to run its stages.
pub struct StageDriver {
    session_id: String,
    prompt: String,
    scene: SceneHandle,
    agents: AgentRegistry,
    executor: Arc<dyn SceneExecutor>,
    router: RecoveryRouter,
    limiter: Arc<RateLimiter>,
    bus: Arc<ContextBus>,
    sessions: Option<Arc<SessionRegistry>>,
    telemetry: Telemetry,
    settings: DriverSettings,
}

impl std::fmt::Debug for StageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDriver")
            .field("session_id", &self.session_id)
            .field("scene", &self.scene)
            .field("executor", &self.executor.name())
            .finish()
    }
}

impl StageDriver {
    pub fn new(
        session_id: impl Into<String>,
        prompt: impl Into<String>,
        scene: SceneHandle,
        agents: AgentRegistry,
        executor: Arc<dyn SceneExecutor>,
        router: RecoveryRouter,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let bus = Arc::new(ContextBus::with_clock(limiter.clock().clone()));
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            scene,
            agents,
            executor,
            router,
            limiter,
            bus,
            sessions: None,
            telemetry: Telemetry::disabled(),
            settings: DriverSettings::default(),
        }
    }

    pub fn with_bus(mut self, bus: Arc<ContextBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Report progress and dispatch claims to a session registry.
    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_settings(mut self, settings: DriverSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn scene(&self) -> &SceneHandle {
        &self.scene
    }

    pub fn bus(&self) -> &Arc<ContextBus> {
        &self.bus
    }

    pub fn router(&self) -> &RecoveryRouter {
        &self.router
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.limiter.clock()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// The session's agent set as currently registered.
    pub fn current_agents(&self) -> Option<BTreeSet<AgentRole>> {
        self.sessions
            .as_ref()
            .and_then(|sessions| sessions.get(&self.session_id))
            .map(|session| session.active_agents)
    }

    /// Atomically check that `role` is still wanted and mark it dispatched.
    pub fn claim_dispatch(&self, role: AgentRole) -> bool {
        match &self.sessions {
            Some(sessions) => sessions.claim_dispatch(&self.session_id, role).unwrap_or_else(|e| {
                warn!("Dispatch claim for {} failed: {}", role, e);
                false
            }),
            None => true,
        }
    }

    pub fn progress(&self, stage: &str, role: Option<AgentRole>, message: impl Into<String>) {
        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.append_progress(&self.session_id, stage, role, message) {
                debug!("Could not record progress: {}", e);
            }
        }
    }

    /// Mark a stage skipped.
    pub fn skip_stage(&self, record: &mut StageRecord, reason: &str) {
        if record.transition(StageStatus::Skipped, self.clock().now()).is_ok() {
            info!("Skipping {} stage: {}", record.role, reason);
            self.bus.log_event(EventType::StageSkipped, Some(record.role), reason);
            self.progress(PipelineState::for_role(record.role).as_str(), Some(record.role), "skipped");
        }
    }

    /// Run a stage until it succeeds or recovery gives up.
    ///
    /// Publications are buffered in `pending`; the caller commits them.
    pub async fn run_stage(
        &self,
        record: &mut StageRecord,
        feedback: Option<&str>,
        pending: &mut PendingContext,
    ) -> Result<StageOutcome, ErrorContext> {
        let stage = record.role;
        if let Err(e) = record.transition(StageStatus::Running, self.clock().now()) {
            return Err(ErrorContext::new(ErrorKind::AgentFailure, stage, e.to_string()));
        }
        info!("Starting {} stage (iteration {})", stage, record.iteration);
        self.bus.log_event(
            EventType::StageStarted,
            Some(stage),
            format!("iteration {}", record.iteration),
        );
        self.progress(PipelineState::for_role(stage).as_str(), Some(stage), "started");

        let mut attempt = 1;
        loop {
            let acting = self.router.active_role(stage);
            record.acting_role = acting;
            record.attempts += 1;

            let error = match self.attempt(acting, record.iteration, feedback, pending).await {
                Ok(parsed) => {
                    let _ = record.transition(StageStatus::Succeeded, self.clock().now());
                    info!("{} stage succeeded via {}", stage, acting);
                    self.bus.log_event(EventType::StageCompleted, Some(acting), parsed.role.as_str());
                    self.progress(PipelineState::for_role(stage).as_str(), Some(acting), "completed");
                    return Ok(StageOutcome {
                        role: stage,
                        acting_role: acting,
                        artifact: parsed.artifact,
                        reasoning: parsed.reasoning,
                        verdict: parsed.verdict,
                    });
                }
                Err(error) => error.with_attempt(attempt),
            };

            warn!("{}", error);
            match self.router.handle(&error).action {
                RecoveryAction::Retry { backoff, .. } => {
                    self.telemetry.retry();
                    self.bus.log_event(
                        EventType::Retry,
                        Some(acting),
                        format!("attempt {} after {:?}", attempt + 1, backoff),
                    );
                    self.clock().sleep(backoff).await;
                    attempt += 1;
                }
                RecoveryAction::Substitute { from, to } => {
                    self.telemetry.substitution();
                    self.bus.log_event(EventType::Substitution, Some(to), format!("{} -> {}", from, to));
                    self.progress(
                        PipelineState::for_role(stage).as_str(),
                        Some(to),
                        format!("substituted for {}", from),
                    );
                    attempt = 1;
                }
                RecoveryAction::DeferToCritique | RecoveryAction::Abort => {
                    record.error = Some(error.clone());
                    let _ = record.transition(StageStatus::Failed, self.clock().now());
                    self.bus.log_event(EventType::StageFailed, Some(acting), error.message.as_str());
                    self.progress(
                        PipelineState::for_role(stage).as_str(),
                        Some(acting),
                        format!("failed: {}", error.message),
                    );
                    return Err(error);
                }
            }
        }
    }

    async fn attempt(
        &self,
        role: AgentRole,
        iteration: u32,
        feedback: Option<&str>,
        pending: &mut PendingContext,
    ) -> Result<ParsedResponse, ErrorContext> {
        let stage = role.stage_role();
        let request = self.build_request(role, iteration, feedback);
        let estimate = request.estimated_prompt_tokens() + RESPONSE_TOKEN_ALLOWANCE;
        let fail = |kind: ErrorKind, message: String| {
            ErrorContext::new(kind, role, message).with_estimated_cost(estimate)
        };

        let agent = self
            .agents
            .get_required(role)
            .map_err(|e| ErrorContext::from_agent_error(role, &e).with_estimated_cost(estimate))?;

        let waited = self
            .limiter
            .acquire(role.as_str(), estimate)
            .await
            .map_err(|e| fail(ErrorKind::AgentFailure, e.to_string()))?;
        if !waited.is_zero() {
            debug!("{} waited {:?} for rate limit", role, waited);
        }

        self.telemetry.generation_call();
        let generation = match tokio::time::timeout(self.settings.generation_timeout, agent.generate(&request)).await {
            Ok(Ok(generation)) => {
                self.limiter
                    .record_usage(role.as_str(), generation.tokens_used().unwrap_or(estimate));
                generation
            }
            Ok(Err(e)) => {
                self.limiter.record_usage(role.as_str(), estimate);
                return Err(ErrorContext::from_agent_error(role, &e).with_estimated_cost(estimate));
            }
            Err(_) => {
                self.limiter.record_usage(role.as_str(), estimate);
                self.telemetry.timeout();
                return Err(fail(
                    ErrorKind::TimeoutError,
                    format!("generation exceeded {:?}", self.settings.generation_timeout),
                ));
            }
        };

        let parsed = parse_response(role, &generation)
            .map_err(|e| ErrorContext::from_agent_error(role, &e).with_estimated_cost(estimate))?;

        match stage {
            AgentRole::Concept => self.stage_concept(role, iteration, &parsed, pending),
            AgentRole::Critique => self.stage_critique(role, iteration, &parsed, pending),
            _ => self
                .stage_script(role, iteration, &parsed, pending)
                .await
                .map_err(|e| e.with_estimated_cost(estimate))?,
        }
        Ok(parsed)
    }

    fn build_request(&self, role: AgentRole, iteration: u32, feedback: Option<&str>) -> GenerationRequest {
        let stage = role.stage_role();
        let concept = match stage {
            AgentRole::Concept => None,
            _ => self
                .bus
                .latest(AgentRole::Concept, ContextType::Concept)
                .map(|e| e.content),
        };
        let hint_type = match stage {
            AgentRole::Critique => ContextType::Script,
            _ => ContextType::Reasoning,
        };
        let hints: Vec<String> = self
            .bus
            .related_context(role, hint_type, self.settings.context_top_k)
            .into_iter()
            .map(|e| format!("[{}] {}", e.source_role, e.content.chars().take(HINT_CHARS).collect::<String>()))
            .collect();

        let input = PromptInput::new(self.prompt.as_str())
            .with_concept(concept)
            .with_hints(hints.clone())
            .with_feedback(feedback.map(str::to_string))
            .with_iteration(iteration);

        GenerationRequest::new(role, build_prompt(role, &input))
            .with_hints(hints)
            .with_model(self.settings.provider.as_str(), self.settings.model.as_str())
            .with_iteration(iteration)
    }

    fn stage_concept(&self, role: AgentRole, iteration: u32, parsed: &ParsedResponse, pending: &mut PendingContext) {
        pending.publish(
            Publication::new(role, ContextType::Concept, parsed.artifact.as_str())
                .with_metadata("iteration", json!(iteration)),
        );
        if !parsed.reasoning.is_empty() {
            pending.publish(Publication::new(role, ContextType::Reasoning, parsed.reasoning.as_str()));
        }
        pending.set_insight(json!({ "iteration": iteration, "concept_chars": parsed.artifact.len() }));
    }

    fn stage_critique(&self, role: AgentRole, iteration: u32, parsed: &ParsedResponse, pending: &mut PendingContext) {
        let Some(verdict) = &parsed.verdict else {
            return;
        };
        pending.publish(
            Publication::new(role, ContextType::Critique, verdict.feedback.as_str())
                .with_confidence(verdict.rating / 10.0)
                .with_metadata("rating", json!(verdict.rating))
                .with_metadata("should_refine", json!(verdict.should_refine))
                .with_metadata("iteration", json!(iteration)),
        );
        pending.set_insight(json!({
            "rating": verdict.rating,
            "should_refine": verdict.should_refine,
            "targets": verdict.targets,
        }));
    }

    async fn stage_script(
        &self,
        role: AgentRole,
        iteration: u32,
        parsed: &ParsedResponse,
        pending: &mut PendingContext,
    ) -> Result<(), ErrorContext> {
        let artifact = ScriptArtifact::new(self.scene.clone(), role.as_str(), parsed.artifact.as_str())
            .with_iteration(iteration);
        let timeout = self.settings.execution_timeout;

        let report = match tokio::time::timeout(timeout, self.executor.execute(&artifact, timeout)).await {
            Ok(Ok(report)) if report.success => report,
            Ok(Ok(report)) => {
                return Err(ErrorContext::new(
                    ErrorKind::ExecutionError,
                    role,
                    format!("script failed: {}", report.failure_summary()),
                ))
            }
            Ok(Err(e)) => {
                if matches!(e, RunnerError::Timeout(_)) {
                    self.telemetry.timeout();
                }
                return Err(ErrorContext::from_runner_error(role, &e));
            }
            Err(_) => {
                self.telemetry.timeout();
                return Err(ErrorContext::new(
                    ErrorKind::TimeoutError,
                    role,
                    format!("execution exceeded {:?}", timeout),
                ));
            }
        };

        pending.publish(
            Publication::new(role, ContextType::Script, parsed.artifact.as_str())
                .with_metadata("iteration", json!(iteration))
                .with_tag(role.stage_role().as_str()),
        );
        let reasoning = if parsed.reasoning.is_empty() {
            format!("{} applied {} script lines", role, parsed.artifact.lines().count())
        } else {
            parsed.reasoning.clone()
        };
        pending.publish(Publication::new(role, ContextType::Reasoning, reasoning));
        if !report.stdout.trim().is_empty() {
            pending.publish(
                Publication::new(role, ContextType::Execution, report.stdout.trim())
                    .with_metadata("duration_ms", json!(report.duration_ms)),
            );
        }
        pending.set_shared_asset(SCENE_ASSET, AssetValue::Path(self.scene.path.clone()));
        pending.set_insight(json!({
            "iteration": iteration,
            "script_lines": parsed.artifact.lines().count(),
            "duration_ms": report.duration_ms,
        }));
        Ok(())
    }

    /// Start the scene file over before geometry is rebuilt.
    pub async fn reset_scene(&self) {
        if self.scene.exists() {
            match tokio::fs::remove_file(&self.scene.path).await {
                Ok(()) => debug!("Reset scene {}", self.scene.id),
                Err(e) => warn!("Could not reset scene {}: {}", self.scene.id, e),
            }
        }
    }

    /// Produce the artifact reference, rendering when enabled.
    ///
    /// Transient render failures are retried within the transient bound;
    /// any other failure is an execution error of the light/camera stage.
    pub async fn finalize(&self, options: &ResolvedOptions) -> Result<String, ErrorContext> {
        if !options.render {
            return Ok(self.scene.path.display().to_string());
        }

        let target = options.render_target_for(&self.scene.id);
        let render_timeout = options.render_options.deadline();
        let policy = self.router.policy();
        let role = AgentRole::LightCamera;

        let mut attempt = 1;
        loop {
            let call = self.executor.render(&self.scene, &target, &options.render_options);
            let outcome = match tokio::time::timeout(render_timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RunnerError::Timeout(render_timeout.as_millis() as u64)),
            };

            let error = match outcome {
                Ok(report) if report.success => {
                    info!("Rendered {} to {}", self.scene.id, report.output_path.display());
                    return Ok(report.output_path.display().to_string());
                }
                Ok(report) => ErrorContext::new(ErrorKind::ExecutionError, role, format!("render failed: {}", report.log)),
                Err(e) => ErrorContext::from_runner_error(role, &e),
            }
            .with_attempt(attempt);

            if error.kind.is_transient() && attempt < policy.max_transient_retries {
                let backoff = policy.backoff(attempt);
                warn!("{}; retrying render in {:?}", error, backoff);
                self.telemetry.retry();
                self.bus.log_event(EventType::Retry, Some(role), format!("render attempt {}", attempt + 1));
                self.clock().sleep(backoff).await;
                attempt += 1;
                continue;
            }

            return Err(ErrorContext {
                kind: ErrorKind::ExecutionError,
                ..error
            });
        }
    }
}
