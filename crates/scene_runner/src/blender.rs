//! Blender subprocess executor.
//!
//! Scripts are written to a temporary file and applied with
//! `blender --background --python`. Each script opens the scene file (or
//! starts from an empty scene), runs, and saves the scene back, so
//! successive scripts build on each other.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ExecutorConfig, RenderOptions, RenderTarget};
use crate::error::{RunnerError, RunnerResult};
use crate::locks::SceneLocks;
use crate::runner::{ExecutionReport, RenderReport, SceneExecutor, SceneHandle, ScriptArtifact};

struct ProcessOutput {
    exit_code: i64,
    stdout: String,
    stderr: String,
    duration_ms: u64,
}

/// Executor backed by a local Blender installation.
pub struct BlenderExecutor {
    binary: PathBuf,
    config: ExecutorConfig,
    locks: SceneLocks,
}

impl BlenderExecutor {
    /// Create an executor, failing if the Blender binary cannot be found.
    pub fn new(config: ExecutorConfig) -> RunnerResult<Self> {
        let binary = Self::locate_binary(&config.blender_path)?;
        std::fs::create_dir_all(&config.work_dir)?;
        info!("Using Blender binary: {}", binary.display());

        Ok(Self {
            binary,
            config,
            locks: SceneLocks::new(),
        })
    }

    /// Resolve the configured binary to an existing file.
    ///
    /// Bare names are looked up on `PATH`.
    pub fn locate_binary(path: &Path) -> RunnerResult<PathBuf> {
        let found = if path.is_absolute() || path.components().count() > 1 {
            path.is_file().then(|| path.to_path_buf())
        } else {
            std::env::var_os("PATH").and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(path))
                    .find(|candidate| candidate.is_file())
            })
        };

        found.ok_or_else(|| {
            RunnerError::DependencyMissing(format!(
                "Blender binary '{}' not found; install Blender or pass its path",
                path.display()
            ))
        })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Wrap a stage script so it loads and saves the scene file.
    pub fn wrap_script(artifact: &ScriptArtifact) -> String {
        let scene_path = python_string(&artifact.scene.path);
        format!(
            "import os\nimport bpy\n\n\
             _scene_path = {scene_path}\n\
             if os.path.exists(_scene_path):\n    bpy.ops.wm.open_mainfile(filepath=_scene_path)\n\
             else:\n    bpy.ops.wm.read_factory_settings(use_empty=True)\n\n\
             # {label} (iteration {iteration})\n\
             {script}\n\n\
             bpy.ops.wm.save_as_mainfile(filepath=_scene_path)\n",
            scene_path = scene_path,
            label = artifact.label,
            iteration = artifact.iteration,
            script = artifact.script.trim_end(),
        )
    }

    /// Build the render script for a target.
    pub fn render_script(target: &RenderTarget, options: &RenderOptions) -> String {
        let mut script = String::from("import bpy\n\nscene = bpy.context.scene\n");
        script.push_str(&format!(
            "scene.render.engine = '{}'\n",
            options.engine.blender_id()
        ));
        script.push_str(&format!("scene.render.resolution_x = {}\n", options.resolution_x));
        script.push_str(&format!("scene.render.resolution_y = {}\n", options.resolution_y));
        script.push_str("if scene.render.engine == 'CYCLES':\n");
        script.push_str(&format!("    scene.cycles.samples = {}\n", options.samples));
        script.push_str(&format!(
            "scene.render.filepath = {}\n",
            python_string(&target.output_path)
        ));
        if target.animation {
            script.push_str("bpy.ops.render.render(animation=True)\n");
        } else {
            script.push_str("bpy.ops.render.render(write_still=True)\n");
        }
        script
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--background".to_string()];
        if self.config.factory_startup {
            args.push("--factory-startup".to_string());
        }
        args
    }

    fn write_temp_script(&self, source: &str) -> RunnerResult<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("sceneforge-")
            .suffix(".py")
            .tempfile_in(&self.config.work_dir)?;
        file.write_all(source.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    async fn run_process(&self, args: &[String], timeout: Duration) -> RunnerResult<ProcessOutput> {
        debug!("Executing: {} {}", self.binary.display(), args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RunnerError::ExecutionFailed(format!(
                    "Failed to spawn {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let start = Instant::now();
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!("Blender process exceeded {:?}, killed", timeout);
                return Err(RunnerError::Timeout(timeout.as_millis() as u64));
            }
        };

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1) as i64,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl SceneExecutor for BlenderExecutor {
    fn name(&self) -> &str {
        "blender"
    }

    async fn is_available(&self) -> RunnerResult<bool> {
        let args = vec!["--background".to_string(), "--version".to_string()];
        match self.run_process(&args, Duration::from_secs(30)).await {
            Ok(output) => Ok(output.exit_code == 0),
            Err(RunnerError::ExecutionFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        artifact: &ScriptArtifact,
        timeout: Duration,
    ) -> RunnerResult<ExecutionReport> {
        let lock = self.locks.for_scene(&artifact.scene.id);
        let _guard = lock.lock().await;

        if let Some(parent) = artifact.scene.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let script_file = self.write_temp_script(&Self::wrap_script(artifact))?;

        let mut args = self.base_args();
        args.push("--python-exit-code".to_string());
        args.push("1".to_string());
        args.push("--python".to_string());
        args.push(script_file.path().to_string_lossy().to_string());

        info!(
            "Applying {} script to scene {} (iteration {})",
            artifact.label, artifact.scene.id, artifact.iteration
        );
        let started_at = Utc::now();
        let output = self.run_process(&args, timeout).await?;
        let finished_at = Utc::now();

        let success = output.exit_code == 0;
        if !success {
            warn!(
                "{} script failed on scene {} with exit code {}",
                artifact.label, artifact.scene.id, output.exit_code
            );
        }

        Ok(ExecutionReport {
            success,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            started_at,
            finished_at,
            duration_ms: output.duration_ms,
        })
    }

    async fn render(
        &self,
        scene: &SceneHandle,
        target: &RenderTarget,
        options: &RenderOptions,
    ) -> RunnerResult<RenderReport> {
        let lock = self.locks.for_scene(&scene.id);
        let _guard = lock.lock().await;

        if !scene.exists() {
            return Err(RunnerError::SceneNotFound(scene.path.display().to_string()));
        }
        if let Some(parent) = target.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let script_file = self.write_temp_script(&Self::render_script(target, options))?;

        let mut args = self.base_args();
        args.push(scene.path.to_string_lossy().to_string());
        args.push("--python-exit-code".to_string());
        args.push("1".to_string());
        args.push("--python".to_string());
        args.push(script_file.path().to_string_lossy().to_string());

        info!("Rendering scene {} to {}", scene.id, target.output_path.display());
        let output = self.run_process(&args, options.deadline()).await?;

        let produced = target.animation || target.output_path.is_file();
        let success = output.exit_code == 0 && produced;
        if !success {
            warn!("Render of scene {} failed", scene.id);
        }

        Ok(RenderReport {
            success,
            output_path: target.output_path.clone(),
            duration_ms: output.duration_ms,
            log: if success { output.stdout } else { output.stderr },
        })
    }
}

/// Quote a path as a Python string literal.
fn python_string(path: &Path) -> String {
    serde_json::Value::String(path.to_string_lossy().to_string()).to_string()
}
