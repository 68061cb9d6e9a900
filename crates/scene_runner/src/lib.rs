//! # scene_runner
//!
//! Script execution and rendering for SceneForge.
//!
//! This crate applies generated Blender Python scripts to scene files and
//! renders the result, behind the [`SceneExecutor`] trait.
//!
//! # Features
//!
//! - **Blender Executor**: Runs scripts through a local Blender binary, with an
//!   explicit binary precondition check
//! - **Per-Scene Serialization**: Calls against one scene never overlap
//! - **Dry-Run Mode**: Record (and optionally write out) scripts without running them
//! - **Mock Executor**: For testing without a Blender installation
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use scene_runner::{BlenderExecutor, ExecutorConfig, SceneExecutor, SceneHandle, ScriptArtifact};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ExecutorConfig::new().work_dir("/tmp/sceneforge");
//!     let executor = BlenderExecutor::new(config.clone())?;
//!
//!     let scene = SceneHandle::generate(&config.work_dir);
//!     let script = ScriptArtifact::new(scene, "structure", "bpy.ops.mesh.primitive_cube_add()");
//!
//!     let report = executor.execute(&script, Duration::from_secs(60)).await?;
//!     println!("Success: {}", report.success);
//!
//!     Ok(())
//! }
//! ```

pub mod blender;
pub mod config;
pub mod dry_run;
pub mod error;
pub mod locks;
pub mod mock;
pub mod runner;

pub use blender::BlenderExecutor;
pub use config::{ExecutorConfig, RenderEngine, RenderOptions, RenderTarget};
pub use dry_run::DryRunExecutor;
pub use error::{RunnerError, RunnerResult};
pub use locks::SceneLocks;
pub use mock::{CapturedCall, MockExecutor, MockFailure, MockResponse};
pub use runner::{ExecutionReport, RenderReport, SceneExecutor, SceneHandle, ScriptArtifact};
