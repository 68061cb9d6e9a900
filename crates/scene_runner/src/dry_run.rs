//! Dry-run executor.
//!
//! Records every script instead of running it, optionally writing each one
//! to disk for inspection. Renders report success without producing output.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

use crate::config::{RenderOptions, RenderTarget};
use crate::error::RunnerResult;
use crate::runner::{ExecutionReport, RenderReport, SceneExecutor, SceneHandle, ScriptArtifact};

/// Executor that never touches Blender.
#[derive(Default)]
pub struct DryRunExecutor {
    output_dir: Option<PathBuf>,
    scripts: Mutex<Vec<ScriptArtifact>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write each recorded script to `dir`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// All scripts recorded so far, in execution order.
    pub fn scripts(&self) -> Vec<ScriptArtifact> {
        self.scripts.lock().clone()
    }

    /// Scripts recorded for one scene.
    pub fn scripts_for(&self, scene_id: &str) -> Vec<ScriptArtifact> {
        self.scripts
            .lock()
            .iter()
            .filter(|a| a.scene.id == scene_id)
            .cloned()
            .collect()
    }

    fn write_script(&self, index: usize, artifact: &ScriptArtifact) -> RunnerResult<Option<PathBuf>> {
        let Some(dir) = &self.output_dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}-{:02}-{}.py",
            artifact.scene.id, index, artifact.label
        ));
        std::fs::write(&path, &artifact.script)?;
        Ok(Some(path))
    }
}

#[async_trait]
impl SceneExecutor for DryRunExecutor {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn is_available(&self) -> RunnerResult<bool> {
        Ok(true)
    }

    async fn execute(
        &self,
        artifact: &ScriptArtifact,
        _timeout: Duration,
    ) -> RunnerResult<ExecutionReport> {
        let index = {
            let mut scripts = self.scripts.lock();
            scripts.push(artifact.clone());
            scripts.iter().filter(|a| a.scene.id == artifact.scene.id).count()
        };
        let written = self.write_script(index, artifact)?;

        let message = match &written {
            Some(path) => format!("[DRY-RUN] Wrote {} script to {}", artifact.label, path.display()),
            None => format!(
                "[DRY-RUN] Would execute {} script for scene {}",
                artifact.label, artifact.scene.id
            ),
        };
        info!("{}", message);

        let now = Utc::now();
        Ok(ExecutionReport {
            success: true,
            exit_code: 0,
            stdout: message,
            stderr: String::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        })
    }

    async fn render(
        &self,
        scene: &SceneHandle,
        target: &RenderTarget,
        _options: &RenderOptions,
    ) -> RunnerResult<RenderReport> {
        let message = format!(
            "[DRY-RUN] Would render scene {} to {}",
            scene.id,
            target.output_path.display()
        );
        info!("{}", message);

        Ok(RenderReport {
            success: true,
            output_path: target.output_path.clone(),
            duration_ms: 0,
            log: message,
        })
    }
}
