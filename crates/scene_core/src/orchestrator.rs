//! Caller-facing orchestrator.
//!
//! Owns the state shared by every session: agents, executor, rate limiter,
//! session registry and telemetry. Each session gets its own context bus,
//! recovery router and scene file.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use scene_agents::{AgentRegistry, AgentRole};
use scene_runner::{SceneExecutor, SceneHandle};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::{GenerationOptions, PipelineConfig, ResolvedOptions};
use crate::context::ContextBus;
use crate::driver::{DriverSettings, StageDriver};
use crate::error::CoreResult;
use crate::persistence::GenerationSink;
use crate::pipeline::StagePipeline;
use crate::rate_limit::RateLimiter;
use crate::recovery::{ErrorContext, ErrorKind, FallbackMap, RecoveryRouter};
use crate::registry::{AgentAction, Session, SessionRegistry, SessionStatus};
use crate::result::GenerationResult;
use crate::stage::StageRecord;
use crate::telemetry::Telemetry;

/// Entry point for generating scenes.
pub struct SceneOrchestrator {
    config: PipelineConfig,
    agents: AgentRegistry,
    executor: Arc<dyn SceneExecutor>,
    fallbacks: FallbackMap,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    sessions: Arc<SessionRegistry>,
    sink: Option<Arc<dyn GenerationSink>>,
    telemetry: Telemetry,
}

impl std::fmt::Debug for SceneOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneOrchestrator")
            .field("provider", &self.config.provider)
            .field("executor", &self.executor.name())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl SceneOrchestrator {
    /// Validate `config` and build the shared state.
    pub fn new(config: PipelineConfig, agents: AgentRegistry, executor: Arc<dyn SceneExecutor>) -> CoreResult<Self> {
        config.validate()?;
        let fallbacks = config.fallback_map()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let limiter = Arc::new(RateLimiter::with_clock(config.rate_limit_config(), clock.clone()));
        let sessions = Arc::new(SessionRegistry::with_clock(clock.clone()));

        Ok(Self {
            config,
            agents,
            executor,
            fallbacks,
            clock,
            limiter,
            sessions,
            sink: None,
            telemetry: Telemetry::new("sceneforge"),
        })
    }

    /// Replace the clock. Resets the rate limiter and the session registry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.limiter = Arc::new(RateLimiter::with_clock(self.config.rate_limit_config(), clock.clone()));
        self.sessions = Arc::new(SessionRegistry::with_clock(clock.clone()));
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn GenerationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Generate a scene and wait for the result.
    ///
    /// Never fails: every error, including a panicking session task, ends up
    /// in the returned result.
    pub async fn create_scene(&self, prompt: &str, options: GenerationOptions) -> GenerationResult {
        let resolved = options.resolve(&self.config);
        match self.start_session(prompt, &resolved) {
            Ok(session_id) => self.run_session(session_id, prompt.to_string(), resolved).await,
            Err(e) => {
                warn!("Could not start session: {}", e);
                let error = ErrorContext::new(ErrorKind::AgentFailure, AgentRole::Concept, e.to_string());
                GenerationResult::failure(String::new(), error, 0)
            }
        }
    }

    /// Start a session in the background and return its id.
    pub fn submit(self: &Arc<Self>, prompt: &str, options: GenerationOptions) -> CoreResult<String> {
        let resolved = options.resolve(&self.config);
        let session_id = self.start_session(prompt, &resolved)?;

        let orchestrator = Arc::clone(self);
        let id = session_id.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            orchestrator.run_session(id, prompt, resolved).await;
        });
        Ok(session_id)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.get(id)
    }

    pub fn list_active_sessions(&self) -> Vec<Session> {
        self.sessions.list_active()
    }

    /// Add or remove roles of a running session. Dispatched roles are not
    /// affected.
    pub fn modify_agents(&self, id: &str, action: AgentAction, roles: &[AgentRole]) -> CoreResult<BTreeSet<AgentRole>> {
        self.sessions.modify_agents(id, action, roles)
    }

    /// Drop finished sessions older than the configured TTL.
    pub fn purge_sessions(&self) -> usize {
        self.sessions
            .purge_older_than(Duration::from_secs(self.config.session_ttl_seconds))
    }

    fn start_session(&self, prompt: &str, options: &ResolvedOptions) -> CoreResult<String> {
        let session = self.sessions.start(
            None,
            prompt,
            options.agents.iter().copied(),
            options.context_refs.clone(),
        )?;
        debug!("Session {} pending with {:?}", session.id, session.active_agents);
        Ok(session.id)
    }

    fn build_driver(&self, session_id: &str, prompt: &str, options: &ResolvedOptions) -> StageDriver {
        let router = RecoveryRouter::new(self.config.recovery.clone(), self.fallbacks.clone())
            .with_limiter(self.limiter.clone());
        let bus = ContextBus::with_clock(self.clock.clone())
            .with_queue_capacity(self.config.subscriber_queue_capacity)
            .with_telemetry(self.telemetry.clone());
        let scene = SceneHandle::in_dir(session_id, &options.output_dir);

        StageDriver::new(
            session_id,
            prompt,
            scene,
            self.agents.clone(),
            self.executor.clone(),
            router,
            self.limiter.clone(),
        )
        .with_bus(Arc::new(bus))
        .with_sessions(self.sessions.clone())
        .with_telemetry(self.telemetry.clone())
        .with_settings(DriverSettings::from_config(&self.config))
    }

    async fn run_session(&self, session_id: String, prompt: String, options: ResolvedOptions) -> GenerationResult {
        self.telemetry.session_started();
        if let Err(e) = self.sessions.update_status(&session_id, SessionStatus::Running, None) {
            warn!("Session {}: {}", session_id, e);
        }
        info!("Session {} running: {}", session_id, prompt);

        let driver = Arc::new(self.build_driver(&session_id, &prompt, &options));
        let pipeline = StagePipeline::new(driver, options);
        let span = info_span!(parent: self.telemetry.span(), "session", id = %session_id);

        let (result, stages) = match tokio::spawn(pipeline.run().instrument(span)).await {
            Ok(outcome) => (outcome.result, outcome.stages),
            Err(join_error) => {
                let role = self.last_active_role(&session_id);
                warn!("Session {} task failed: {}", session_id, join_error);
                let error = ErrorContext::new(
                    ErrorKind::AgentFailure,
                    role,
                    format!("session task failed: {}", join_error),
                );
                (GenerationResult::failure(&session_id, error, 1), Vec::new())
            }
        };

        if !result.success {
            self.telemetry.session_failed();
        }
        if let Err(e) = self.sessions.complete(&session_id, result.clone()) {
            warn!("Session {}: {}", session_id, e);
        }
        self.record(&session_id, &stages, &result).await;
        result
    }

    /// Role of the most recent progress entry, for failures that carry none.
    fn last_active_role(&self, session_id: &str) -> AgentRole {
        self.sessions
            .get(session_id)
            .and_then(|s| s.progress.iter().rev().find_map(|p| p.role))
            .unwrap_or(AgentRole::Concept)
    }

    async fn record(&self, session_id: &str, stages: &[StageRecord], result: &GenerationResult) {
        let Some(sink) = &self.sink else {
            return;
        };
        match tokio::time::timeout(self.config.sink_timeout(), sink.record_generation(session_id, stages, result)).await {
            Ok(Ok(())) => debug!("Recorded session {}", session_id),
            Ok(Err(e)) => warn!("Failed to record session {}: {}", session_id, e),
            Err(_) => warn!(
                "Recording session {} timed out after {:?}",
                session_id,
                self.config.sink_timeout()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::CoreError;
    use crate::persistence::MockGenerationSink;
    use scene_agents::TemplateAgent;
    use scene_runner::MockExecutor;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.min_delay_seconds = 0.0;
        config.execution.output_dir = temp.path().to_path_buf();
        config
    }

    fn orchestrator(temp: &TempDir) -> SceneOrchestrator {
        SceneOrchestrator::new(config(temp), TemplateAgent::registry(), Arc::new(MockExecutor::new()))
            .unwrap()
            .with_clock(ManualClock::at_minute_start().shared())
    }

    #[tokio::test]
    async fn test_create_scene_records_once() {
        let temp = TempDir::new().unwrap();
        let mut sink = MockGenerationSink::new();
        sink.expect_record_generation()
            .times(1)
            .returning(|_, stages, result| {
                assert!(!stages.is_empty());
                assert!(result.success);
                Ok(())
            });
        let orchestrator = orchestrator(&temp).with_sink(Arc::new(sink));

        let result = orchestrator
            .create_scene("a red cube", GenerationOptions::new().with_critique(false))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.iteration_count, 1);
        let session = orchestrator.get_session(&result.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(orchestrator.telemetry().snapshot().sessions_started, 1);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_change_outcome() {
        let temp = TempDir::new().unwrap();
        let mut sink = MockGenerationSink::new();
        sink.expect_record_generation()
            .returning(|_, _, _| Err(CoreError::Serialization("disk full".into())));
        let orchestrator = orchestrator(&temp).with_sink(Arc::new(sink));

        let result = orchestrator
            .create_scene("a red cube", GenerationOptions::new().with_critique(false))
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.max_iterations = 0;
        let result = SceneOrchestrator::new(config, TemplateAgent::registry(), Arc::new(MockExecutor::new()));
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_submit_runs_in_background() {
        let temp = TempDir::new().unwrap();
        let orchestrator = Arc::new(orchestrator(&temp));

        let id = orchestrator
            .submit("a blue sphere", GenerationOptions::new().with_critique(false))
            .unwrap();
        assert!(orchestrator.get_session(&id).is_some());

        for _ in 0..200 {
            if orchestrator.get_session(&id).map_or(false, |s| s.status.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let session = orchestrator.get_session(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(orchestrator.list_active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_modify_unknown_session() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp);
        let result = orchestrator.modify_agents("missing", AgentAction::Add, &[AgentRole::Motion]);
        assert!(matches!(result, Err(CoreError::SessionNotFound(_))));
    }
}
