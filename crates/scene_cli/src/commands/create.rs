//! Create command - Generate a scene from a prompt.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use scene_agents::TemplateAgent;
use scene_core::{GenerationOptions, GenerationResult, JsonFileSink, SceneOrchestrator, SchedulingMode};
use scene_runner::{BlenderExecutor, DryRunExecutor, ExecutorConfig, SceneExecutor};

use super::{load_config, GenerationFailed};

#[derive(Args)]
pub struct CreateArgs {
    /// Description of the scene to generate
    prompt: String,

    /// Maximum critique iterations
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Skip the critique stage
    #[arg(long)]
    no_critique: bool,

    /// Run independent stages concurrently
    #[arg(long)]
    concurrent: bool,

    /// Add keyframed animation
    #[arg(long)]
    animate: bool,

    /// Save the scene without rendering it
    #[arg(long)]
    no_render: bool,

    /// Path to the Blender binary
    #[arg(long, env = "SCENEFORGE_BLENDER", value_name = "PATH")]
    blender: Option<PathBuf>,

    /// Write stage scripts instead of running Blender
    #[arg(long)]
    dry_run: bool,

    /// Pipeline configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for scenes, renders and session records
    #[arg(short, long)]
    output: Option<PathBuf>,
}

pub async fn execute(args: CreateArgs, json: bool) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(output) = &args.output {
        config.execution.output_dir = output.clone();
    }
    let output_dir = config.execution.output_dir.clone();

    let executor: Arc<dyn SceneExecutor> = if args.dry_run {
        info!("Dry run: scripts are written to {}", output_dir.join("scripts").display());
        Arc::new(DryRunExecutor::new().with_output_dir(output_dir.join("scripts")))
    } else {
        let mut executor_config = ExecutorConfig::new().work_dir(output_dir.join("work"));
        if let Some(blender) = &args.blender {
            executor_config = executor_config.blender_path(blender);
        }
        Arc::new(BlenderExecutor::new(executor_config).context("Blender is not available (use --dry-run to skip it)")?)
    };

    let orchestrator = SceneOrchestrator::new(config, TemplateAgent::registry(), executor)
        .context("Failed to set up the pipeline")?
        .with_sink(Arc::new(JsonFileSink::new(output_dir.join("sessions"))));

    let mut options = GenerationOptions::new().with_animation(args.animate);
    if let Some(n) = args.max_iterations {
        options = options.with_max_iterations(n);
    }
    if args.no_critique {
        options = options.with_critique(false);
    }
    if args.concurrent {
        options = options.with_scheduling(SchedulingMode::Concurrent);
    }
    if args.no_render {
        options = options.with_render(false);
    }

    info!("Generating scene: {}", args.prompt);
    let result = orchestrator.create_scene(&args.prompt, options).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    match &result.error {
        None if result.success => Ok(()),
        Some(error) => Err(GenerationFailed(error.to_string()).into()),
        None => Err(GenerationFailed("no artifact produced".to_string()).into()),
    }
}

fn print_result(result: &GenerationResult) {
    if result.success {
        println!("Scene generated in {} iteration(s)", result.iteration_count);
    } else {
        println!("Scene generation failed after {} iteration(s)", result.iteration_count);
    }
    println!();
    println!("Session:  {}", result.session_id);
    if let Some(reference) = &result.artifact_reference {
        println!("Artifact: {}", reference);
    }
    if let Some(rating) = result.final_rating {
        println!("Rating:   {:.1}/10", rating);
    }
    for (from, to) in &result.substitutions {
        println!("Fallback: {} -> {}", from, to);
    }
    println!("Elapsed:  {} ms", result.elapsed_ms);
}
