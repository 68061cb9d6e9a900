//! SceneForge CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments or configuration
//! - 3: Generation failure
//! - 4: Missing dependency (Blender)

use std::process::ExitCode;

use clap::Parser;
use scene_core::CoreError;
use scene_runner::RunnerError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands, GenerationFailed};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const GENERATION_FAILURE: u8 = 3;
    pub const DEPENDENCY_MISSING: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.json);

    let result = match cli.command {
        Commands::Create(args) => commands::create::execute(args, cli.json).await,
        Commands::Roles(args) => commands::roles::execute(args, cli.json),
        Commands::Config(args) => commands::config::execute(args),
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(categorize_error(&e))
        }
    }
}

fn init_logging(verbose: bool, quiet: bool, json: bool) {
    let default_level = match (verbose, quiet) {
        (true, _) => "sceneforge=debug,scene_core=debug,scene_runner=debug,scene_agents=debug",
        (_, true) => "warn",
        _ => "sceneforge=info,scene_core=info,scene_runner=info,warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr so JSON results on stdout stay parseable
    let log_result = if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    };

    if log_result.is_err() {
        // Logging already initialized, continue
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    if e.downcast_ref::<GenerationFailed>().is_some() {
        return ExitCodes::GENERATION_FAILURE;
    }
    if let Some(RunnerError::DependencyMissing(_)) = e.downcast_ref::<RunnerError>() {
        return ExitCodes::DEPENDENCY_MISSING;
    }
    match e.downcast_ref::<CoreError>() {
        Some(CoreError::InvalidConfig(_))
        | Some(CoreError::SelfFallback(_))
        | Some(CoreError::FallbackCycle { .. })
        | Some(CoreError::Yaml(_)) => ExitCodes::INVALID_ARGS,
        _ => ExitCodes::GENERAL_ERROR,
    }
}
