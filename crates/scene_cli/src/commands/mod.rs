//! CLI command definitions.
//!
//! This module defines the command structure for the SceneForge CLI.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scene_core::PipelineConfig;

pub mod config;
pub mod create;
pub mod roles;

/// SceneForge - prompt-to-scene generation pipeline
#[derive(Parser)]
#[command(name = "sceneforge")]
#[command(version, about = "SceneForge - turn a scene description into a Blender scene")]
#[command(long_about = r#"
SceneForge drives a team of specialist agents (concept, structure, surface,
lighting/camera, motion, critique) through a staged pipeline that builds a
Blender scene from a natural-language prompt.

COMMANDS:
  create   → Generate a scene from a prompt
  roles    → List agent roles, dependencies and fallbacks
  config   → Print the effective configuration

ENVIRONMENT:
  SCENEFORGE_PROVIDER, SCENEFORGE_MODEL, SCENEFORGE_MAX_ITERATIONS,
  SCENEFORGE_TOKENS_PER_MINUTE, SCENEFORGE_MIN_DELAY_SECONDS,
  SCENEFORGE_ENABLE_CRITIQUE, SCENEFORGE_SCHEDULING, SCENEFORGE_OUTPUT_DIR
  override the configuration file. RUST_LOG overrides log filtering.

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments or configuration
  3 - Generation failure
  4 - Missing dependency (Blender)
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit JSON logs and JSON results
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a scene from a prompt
    Create(create::CreateArgs),

    /// List agent roles
    Roles(roles::RolesArgs),

    /// Print the effective configuration as YAML
    Config(config::ConfigArgs),
}

/// A session finished without a scene.
#[derive(Debug, thiserror::Error)]
#[error("scene generation failed: {0}")]
pub struct GenerationFailed(pub String);

/// Load the configuration file if given, then apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.apply_env();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
