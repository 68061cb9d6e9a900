//! Mock scene executor for testing.
//!
//! Provides a configurable mock implementation of the SceneExecutor trait
//! for use in tests without requiring a Blender installation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::config::{RenderOptions, RenderTarget};
use crate::error::{RunnerError, RunnerResult};
use crate::locks::SceneLocks;
use crate::runner::{ExecutionReport, RenderReport, SceneExecutor, SceneHandle, ScriptArtifact};

/// Error a mock response should raise.
#[derive(Debug, Clone)]
pub enum MockFailure {
    Timeout,
    ExecutionFailed(String),
    RenderFailed(String),
    DependencyMissing(String),
}

impl MockFailure {
    fn into_error(self, timeout: Duration) -> RunnerError {
        match self {
            MockFailure::Timeout => RunnerError::Timeout(timeout.as_millis() as u64),
            MockFailure::ExecutionFailed(msg) => RunnerError::ExecutionFailed(msg),
            MockFailure::RenderFailed(msg) => RunnerError::RenderFailed(msg),
            MockFailure::DependencyMissing(msg) => RunnerError::DependencyMissing(msg),
        }
    }
}

/// Predefined mock response for an execute or render call.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub delay: Duration,
    pub failure: Option<MockFailure>,
}

impl MockResponse {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 10,
            delay: Duration::ZERO,
            failure: None,
        }
    }

    /// The script ran and failed.
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stderr: stderr.into(),
            ..Self::success("")
        }
    }

    pub fn timeout() -> Self {
        Self::error(MockFailure::Timeout)
    }

    /// The call itself errors.
    pub fn error(failure: MockFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::success("")
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub scene_id: String,
    pub label: Option<String>,
    pub script: Option<String>,
    pub iteration: Option<u32>,
}

/// Mock scene executor for testing.
///
/// Responses are consumed in order; once exhausted every call succeeds.
/// Calls against one scene are serialized like a real executor, and the
/// peak number of overlapping calls per scene is tracked.
#[derive(Clone)]
pub struct MockExecutor {
    available: Arc<RwLock<bool>>,
    responses: Arc<RwLock<Vec<MockResponse>>>,
    response_index: Arc<AtomicUsize>,
    render_responses: Arc<RwLock<Vec<MockResponse>>>,
    render_index: Arc<AtomicUsize>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    default_delay: Duration,
    locks: Arc<SceneLocks>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            available: Arc::new(RwLock::new(true)),
            responses: Arc::new(RwLock::new(Vec::new())),
            response_index: Arc::new(AtomicUsize::new(0)),
            render_responses: Arc::new(RwLock::new(Vec::new())),
            render_index: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            default_delay: Duration::ZERO,
            locks: Arc::new(SceneLocks::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_available(self, available: bool) -> Self {
        *self.available.write() = available;
        self
    }

    /// Add a response for the next execute call.
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.write().push(response);
        self
    }

    /// Add a response for the next render call.
    pub fn add_render_response(self, response: MockResponse) -> Self {
        self.render_responses.write().push(response);
        self
    }

    /// Delay applied to calls whose response has none.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Labels of executed scripts, in call order.
    pub fn executed_labels(&self) -> Vec<String> {
        self.get_method_calls("execute")
            .into_iter()
            .filter_map(|c| c.label)
            .collect()
    }

    /// Highest number of calls that overlapped at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record_call(&self, call: CapturedCall) {
        self.captured_calls.write().push(call);
    }

    fn next_from(queue: &RwLock<Vec<MockResponse>>, index: &AtomicUsize) -> MockResponse {
        let i = index.fetch_add(1, Ordering::SeqCst);
        queue
            .read()
            .get(i)
            .cloned()
            .unwrap_or_else(|| MockResponse::success(""))
    }

    async fn simulate(&self, scene_id: &str, response: &MockResponse, timeout: Duration) -> RunnerResult<()> {
        let lock = self.locks.for_scene(scene_id);
        let _guard = lock.lock().await;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        let delay = if response.delay.is_zero() {
            self.default_delay
        } else {
            response.delay
        };
        let timed_out = delay > timeout;
        tokio::time::sleep(if timed_out { timeout } else { delay }).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if timed_out {
            return Err(RunnerError::Timeout(timeout.as_millis() as u64));
        }
        if let Some(failure) = response.failure.clone() {
            return Err(failure.into_error(timeout));
        }
        Ok(())
    }
}

#[async_trait]
impl SceneExecutor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn is_available(&self) -> RunnerResult<bool> {
        Ok(*self.available.read())
    }

    async fn execute(
        &self,
        artifact: &ScriptArtifact,
        timeout: Duration,
    ) -> RunnerResult<ExecutionReport> {
        self.record_call(CapturedCall {
            method: "execute".to_string(),
            scene_id: artifact.scene.id.clone(),
            label: Some(artifact.label.clone()),
            script: Some(artifact.script.clone()),
            iteration: Some(artifact.iteration),
        });

        let response = Self::next_from(&self.responses, &self.response_index);
        let started_at = Utc::now();
        self.simulate(&artifact.scene.id, &response, timeout).await?;

        Ok(ExecutionReport {
            success: response.success,
            exit_code: if response.success { 0 } else { 1 },
            stdout: response.stdout,
            stderr: response.stderr,
            started_at,
            finished_at: Utc::now(),
            duration_ms: response.duration_ms,
        })
    }

    async fn render(
        &self,
        scene: &SceneHandle,
        target: &RenderTarget,
        options: &RenderOptions,
    ) -> RunnerResult<RenderReport> {
        self.record_call(CapturedCall {
            method: "render".to_string(),
            scene_id: scene.id.clone(),
            label: None,
            script: None,
            iteration: None,
        });

        let response = Self::next_from(&self.render_responses, &self.render_index);
        self.simulate(&scene.id, &response, options.deadline()).await?;

        Ok(RenderReport {
            success: response.success,
            output_path: target.output_path.clone(),
            duration_ms: response.duration_ms,
            log: if response.success { response.stdout } else { response.stderr },
        })
    }
}
