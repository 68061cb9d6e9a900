//! Integration tests for sequential sessions.
//!
//! Generation runs on template and scripted agents and execution on the
//! mock executor, so no provider or Blender installation is required.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use scene_agents::{AgentRegistry, AgentRole, ScriptedAgent, ScriptedReply, TemplateAgent};
use scene_core::{
    AgentAction, CoreResult, ErrorKind, GenerationOptions, GenerationResult, GenerationSink, ManualClock,
    PipelineConfig, RateLimitConfig, RateLimiter, SceneOrchestrator, SessionStatus, StageRecord, StageStatus,
};
use scene_runner::{MockExecutor, MockResponse};

/// Sink keeping every recorded session in memory.
#[derive(Default)]
struct CapturingSink {
    records: Mutex<Vec<(String, Vec<StageRecord>, GenerationResult)>>,
}

impl CapturingSink {
    fn stages(&self) -> Vec<StageRecord> {
        self.records.lock().iter().flat_map(|(_, s, _)| s.clone()).collect()
    }

    fn count(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl GenerationSink for CapturingSink {
    async fn record_generation(
        &self,
        session_id: &str,
        stage_log: &[StageRecord],
        result: &GenerationResult,
    ) -> CoreResult<()> {
        self.records
            .lock()
            .push((session_id.to_string(), stage_log.to_vec(), result.clone()));
        Ok(())
    }
}

fn config(temp: &TempDir) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.min_delay_seconds = 0.0;
    config.execution.output_dir = temp.path().to_path_buf();
    config
}

fn orchestrator(
    temp: &TempDir,
    agents: AgentRegistry,
    executor: Arc<MockExecutor>,
) -> (SceneOrchestrator, Arc<CapturingSink>) {
    let sink = Arc::new(CapturingSink::default());
    let orchestrator = SceneOrchestrator::new(config(temp), agents, executor)
        .unwrap()
        .with_clock(ManualClock::at_minute_start().shared())
        .with_sink(sink.clone());
    (orchestrator, sink)
}

/// A red cube with critique disabled runs one pass and renders.
#[tokio::test]
async fn test_red_cube_without_critique() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(MockExecutor::new());
    let (orchestrator, sink) = orchestrator(&temp, TemplateAgent::registry(), executor.clone());

    let result = orchestrator
        .create_scene("a red cube", GenerationOptions::new().with_critique(false))
        .await;

    assert!(result.success, "failed: {:?}", result.error);
    assert_eq!(result.iteration_count, 1);
    assert!(result.final_rating.is_none());
    let reference = result.artifact_reference.clone().unwrap();
    assert!(reference.ends_with(&format!("{}.png", result.session_id)));

    assert_eq!(executor.executed_labels(), vec!["structure", "surface", "light_camera"]);
    assert_eq!(executor.get_method_calls("render").len(), 1);
    let structure = &executor.get_method_calls("execute")[0];
    assert!(structure.script.as_deref().unwrap().contains("primitive_cube_add"));

    let session = orchestrator.get_session(&result.session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.result, Some(result));
    assert_eq!(sink.count(), 1);
    assert!(sink.stages().iter().all(|s| s.status == StageStatus::Succeeded));
}

/// An unparseable structure reply hands the stage to its fallback.
#[tokio::test]
async fn test_parse_error_substitutes_structure_fallback() {
    let temp = TempDir::new().unwrap();
    let structure = ScriptedAgent::new(AgentRole::Structure)
        .reply(ScriptedReply::text("I would rather describe the cube in words."));
    let agents = TemplateAgent::registry().with(AgentRole::Structure, Arc::new(structure.clone()));
    let executor = Arc::new(MockExecutor::new());
    let (orchestrator, sink) = orchestrator(&temp, agents, executor.clone());

    let result = orchestrator
        .create_scene("a red cube", GenerationOptions::new().with_critique(false))
        .await;

    assert!(result.success, "failed: {:?}", result.error);
    assert_eq!(result.substitutions, vec![(AgentRole::Structure, AgentRole::StructureAlt)]);
    assert_eq!(structure.call_count(), 1);
    assert_eq!(executor.executed_labels()[0], "structure_alt");

    let stages = sink.stages();
    let record = stages.iter().find(|s| s.role == AgentRole::Structure).unwrap();
    assert_eq!(record.acting_role, AgentRole::StructureAlt);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.status, StageStatus::Succeeded);
}

/// A critique that always asks for refinement stops at the iteration limit.
#[tokio::test]
async fn test_always_refine_stops_at_max_iterations() {
    let temp = TempDir::new().unwrap();
    let concept = ScriptedAgent::new(AgentRole::Concept).reply(ScriptedReply::text("A red cube on a plane."));
    let critique = ScriptedAgent::new(AgentRole::Critique)
        .reply(ScriptedReply::verdict(8.0, true, "Add a bevel to the cube."));
    let agents = TemplateAgent::registry()
        .with(AgentRole::Concept, Arc::new(concept.clone()))
        .with(AgentRole::Critique, Arc::new(critique.clone()));
    let (orchestrator, sink) = orchestrator(&temp, agents, Arc::new(MockExecutor::new()));

    let result = orchestrator
        .create_scene("a red cube", GenerationOptions::new().with_max_iterations(3))
        .await;

    assert!(result.success, "failed: {:?}", result.error);
    assert_eq!(result.iteration_count, 3);
    assert_eq!(result.final_rating, Some(8.0));
    assert_eq!(critique.call_count(), 3);
    // Refinement never revisits the concept
    assert_eq!(concept.call_count(), 1);

    // The last critique belongs to the final iteration
    let last = critique.requests().pop().unwrap();
    assert_eq!(last.iteration, 3);
    let stages = sink.stages();
    assert_eq!(stages.iter().filter(|s| s.role == AgentRole::Structure).count(), 3);
}

/// A rating under the acceptability threshold forces refinement even when
/// the critique does not ask for it.
#[tokio::test]
async fn test_low_rating_forces_refine() {
    let temp = TempDir::new().unwrap();
    let critique = ScriptedAgent::new(AgentRole::Critique)
        .reply(ScriptedReply::verdict(3.0, false, "The cube is barely visible."))
        .reply(ScriptedReply::verdict(7.5, false, "Good."));
    let agents = TemplateAgent::registry().with(AgentRole::Critique, Arc::new(critique.clone()));
    let (orchestrator, _) = orchestrator(&temp, agents, Arc::new(MockExecutor::new()));

    let result = orchestrator.create_scene("a red cube", GenerationOptions::new()).await;

    assert!(result.success);
    assert_eq!(result.iteration_count, 2);
    assert_eq!(result.final_rating, Some(7.5));
}

/// Provider errors are retried with backoff before the stage gives up.
#[tokio::test]
async fn test_transient_errors_retry_then_succeed() {
    let temp = TempDir::new().unwrap();
    let surface = ScriptedAgent::new(AgentRole::Surface)
        .reply(ScriptedReply::ProviderError("503 overloaded".into()))
        .reply(ScriptedReply::Timeout)
        .reply(ScriptedReply::script("import bpy\nmat = bpy.data.materials.new('Red')"));
    let agents = TemplateAgent::registry().with(AgentRole::Surface, Arc::new(surface.clone()));
    let (orchestrator, _) = orchestrator(&temp, agents, Arc::new(MockExecutor::new()));

    let result = orchestrator
        .create_scene("a red cube", GenerationOptions::new().with_critique(false))
        .await;

    assert!(result.success, "failed: {:?}", result.error);
    assert_eq!(surface.call_count(), 3);
    assert!(orchestrator.telemetry().snapshot().retries >= 2);
}

/// Exhausted transient retries fail the session with the provider error.
#[tokio::test]
async fn test_exhausted_retries_fail_session() {
    let temp = TempDir::new().unwrap();
    let light = ScriptedAgent::new(AgentRole::LightCamera).reply(ScriptedReply::ProviderError("503".into()));
    let agents = TemplateAgent::registry().with(AgentRole::LightCamera, Arc::new(light.clone()));
    let executor = Arc::new(MockExecutor::new());
    let (orchestrator, sink) = orchestrator(&temp, agents, executor.clone());

    let result = orchestrator
        .create_scene("a red cube", GenerationOptions::new().with_critique(false))
        .await;

    assert!(!result.success);
    let error = result.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::ProviderError);
    assert_eq!(error.failing_role, AgentRole::LightCamera);
    assert_eq!(light.call_count(), 3);
    assert!(executor.get_method_calls("render").is_empty());

    let session = orchestrator.get_session(&result.session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.error.is_some());
    assert_eq!(sink.count(), 1);
}

/// A failed render is an execution error attributed to lighting and camera.
#[tokio::test]
async fn test_render_failure_attributed_to_light_camera() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(MockExecutor::new().add_render_response(MockResponse::failure("GPU out of memory")));
    let (orchestrator, _) = orchestrator(&temp, TemplateAgent::registry(), executor.clone());

    let result = orchestrator
        .create_scene("a red cube", GenerationOptions::new().with_critique(false))
        .await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ExecutionError);
    assert_eq!(error.failing_role, AgentRole::LightCamera);
    assert!(error.message.contains("GPU out of memory"));
}

/// A failing script counts as structural and moves to the fallback.
#[tokio::test]
async fn test_script_failure_uses_surface_fallback() {
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(
        MockExecutor::new()
            .add_response(MockResponse::success("structure ok"))
            .add_response(MockResponse::failure("NameError: name 'bpy_mat' is not defined")),
    );
    let (orchestrator, _) = orchestrator(&temp, TemplateAgent::registry(), executor.clone());

    let result = orchestrator
        .create_scene("a red cube", GenerationOptions::new().with_critique(false))
        .await;

    assert!(result.success, "failed: {:?}", result.error);
    assert_eq!(result.substitutions, vec![(AgentRole::Surface, AgentRole::SurfaceAlt)]);
    assert_eq!(
        executor.executed_labels(),
        vec!["structure", "surface", "surface_alt", "light_camera"]
    );
}

/// Roles removed before their turn are skipped; added roles join the pass.
#[tokio::test]
async fn test_modify_agents_during_session() {
    let temp = TempDir::new().unwrap();
    let concept = ScriptedAgent::new(AgentRole::Concept)
        .reply(ScriptedReply::text("A spinning red cube."))
        .with_delay(Duration::from_millis(100));
    let agents = TemplateAgent::registry().with(AgentRole::Concept, Arc::new(concept));
    let executor = Arc::new(MockExecutor::new());
    let (orchestrator, sink) = orchestrator(&temp, agents, executor.clone());
    let orchestrator = Arc::new(orchestrator);

    let id = orchestrator
        .submit("a red cube", GenerationOptions::new().with_critique(false))
        .unwrap();
    // Concept is still generating
    tokio::time::sleep(Duration::from_millis(20)).await;
    let agents = orchestrator
        .modify_agents(&id, AgentAction::Remove, &[AgentRole::Surface])
        .unwrap();
    assert!(!agents.contains(&AgentRole::Surface));
    orchestrator
        .modify_agents(&id, AgentAction::Add, &[AgentRole::Motion])
        .unwrap();

    for _ in 0..300 {
        if sink.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let session = orchestrator.get_session(&id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(executor.executed_labels(), vec!["structure", "light_camera", "motion"]);

    // Finished sessions reject changes
    let after = orchestrator.modify_agents(&id, AgentAction::Remove, &[AgentRole::Structure]);
    assert!(after.is_err());
}

/// Three 400-token calls from one caller against a 1000-token minute: the
/// third waits for the next minute.
#[tokio::test]
async fn test_rate_limit_spans_minutes() {
    let clock = ManualClock::at_minute_start().shared();
    let limiter = RateLimiter::with_clock(RateLimitConfig::new(1_000, 0.0), clock.clone());
    let caller = "structure";

    for _ in 0..2 {
        let waited = limiter.acquire(caller, 400).await.unwrap();
        assert!(waited.is_zero());
        limiter.record_usage(caller, 400);
    }
    assert!(!limiter.can_proceed(caller, 400));
    assert_eq!(limiter.wait_time(caller, 400), Duration::from_secs(60));

    let waited = limiter.acquire(caller, 400).await.unwrap();
    assert_eq!(waited, Duration::from_secs(60));
    limiter.record_usage(caller, 400);
    assert_eq!(limiter.current_usage(), 400);
}

/// Finished sessions are purged once their TTL has passed.
#[tokio::test]
async fn test_purge_finished_sessions() {
    let temp = TempDir::new().unwrap();
    let clock = ManualClock::at_minute_start().shared();
    let orchestrator = SceneOrchestrator::new(config(&temp), TemplateAgent::registry(), Arc::new(MockExecutor::new()))
        .unwrap()
        .with_clock(clock.clone());

    let result = orchestrator
        .create_scene("a red cube", GenerationOptions::new().with_critique(false))
        .await;
    assert!(result.success);
    assert_eq!(orchestrator.purge_sessions(), 0);

    clock.advance(Duration::from_secs(orchestrator.config().session_ttl_seconds + 1));
    assert_eq!(orchestrator.purge_sessions(), 1);
    assert!(orchestrator.get_session(&result.session_id).is_none());
}
