//! Executor and render configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Blender render engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderEngine {
    #[default]
    Eevee,
    Cycles,
    Workbench,
}

impl RenderEngine {
    /// Identifier Blender expects in `scene.render.engine`.
    pub fn blender_id(&self) -> &'static str {
        match self {
            Self::Eevee => "BLENDER_EEVEE",
            Self::Cycles => "CYCLES",
            Self::Workbench => "BLENDER_WORKBENCH",
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Blender binary, either a path or a name looked up on `PATH`
    pub blender_path: PathBuf,
    /// Directory for scene files and temporary scripts
    pub work_dir: PathBuf,
    /// Start Blender with factory settings, ignoring user preferences
    pub factory_startup: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            blender_path: PathBuf::from("blender"),
            work_dir: std::env::temp_dir().join("sceneforge"),
            factory_startup: true,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blender_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.blender_path = path.into();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }
}

/// Render settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub engine: RenderEngine,
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub samples: u32,
    /// Render deadline in seconds, always enforced
    pub timeout_seconds: u64,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            engine: RenderEngine::Eevee,
            resolution_x: 1280,
            resolution_y: 720,
            samples: 64,
            timeout_seconds: 600,
        }
    }
}

impl RenderOptions {
    pub fn engine(mut self, engine: RenderEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn resolution(mut self, x: u32, y: u32) -> Self {
        self.resolution_x = x;
        self.resolution_y = y;
        self
    }

    pub fn samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Where and what to render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderTarget {
    /// Output file (still) or output path prefix (animation)
    pub output_path: PathBuf,
    /// Render the frame range instead of a single still
    pub animation: bool,
}

impl RenderTarget {
    pub fn still(path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: path.into(),
            animation: false,
        }
    }

    pub fn animation(path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: path.into(),
            animation: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_options_builder() {
        let options = RenderOptions::default()
            .engine(RenderEngine::Cycles)
            .resolution(640, 480)
            .samples(16);

        assert_eq!(options.engine.blender_id(), "CYCLES");
        assert_eq!((options.resolution_x, options.resolution_y), (640, 480));
        assert_eq!(options.samples, 16);
    }

    #[test]
    fn test_executor_config_deserializes_partial() {
        let config: ExecutorConfig =
            serde_json::from_str(r#"{"blender_path": "/opt/blender/blender"}"#).unwrap();
        assert_eq!(config.blender_path, PathBuf::from("/opt/blender/blender"));
        assert!(config.factory_startup);
    }
}
