//! Scene executor trait and types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{RenderOptions, RenderTarget};
use crate::error::RunnerResult;

/// A scene file that scripts are applied to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneHandle {
    /// Stable identifier, usually the session id
    pub id: String,
    /// Path of the `.blend` file
    pub path: PathBuf,
}

impl SceneHandle {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Handle for `<dir>/<id>.blend`.
    pub fn in_dir(id: impl Into<String>, dir: &Path) -> Self {
        let id = id.into();
        let path = dir.join(format!("{}.blend", id));
        Self { id, path }
    }

    /// Handle with a fresh random id.
    pub fn generate(dir: &Path) -> Self {
        Self::in_dir(uuid::Uuid::new_v4().to_string(), dir)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl std::fmt::Display for SceneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// A script to apply to a scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptArtifact {
    /// Scene the script mutates
    pub scene: SceneHandle,
    /// Producer label (the agent role)
    pub label: String,
    /// Blender Python source
    pub script: String,
    /// Pipeline iteration the script belongs to
    pub iteration: u32,
}

impl ScriptArtifact {
    pub fn new(scene: SceneHandle, label: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            scene,
            label: label.into(),
            script: script.into(),
            iteration: 1,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }
}

/// Result of a script execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    /// Get combined output (stdout + stderr).
    pub fn combined_output(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Last non-empty line of stderr, used as a short failure message.
    pub fn failure_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }
}

/// Result of a render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderReport {
    pub success: bool,
    pub output_path: PathBuf,
    pub duration_ms: u64,
    pub log: String,
}

/// Applies scripts to scenes and renders them.
///
/// Implementations serialize calls against the same [`SceneHandle`]; calls
/// for different scenes may run concurrently.
#[async_trait]
pub trait SceneExecutor: Send + Sync {
    /// Executor name for logs.
    fn name(&self) -> &str;

    /// Check if the backing application is usable.
    async fn is_available(&self) -> RunnerResult<bool>;

    /// Apply a script to its scene within `timeout`.
    ///
    /// A script that runs but fails is `Ok` with `success == false`.
    async fn execute(
        &self,
        artifact: &ScriptArtifact,
        timeout: Duration,
    ) -> RunnerResult<ExecutionReport>;

    /// Render a scene to the target.
    async fn render(
        &self,
        scene: &SceneHandle,
        target: &RenderTarget,
        options: &RenderOptions,
    ) -> RunnerResult<RenderReport>;
}
