//! Config command - Print the effective configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use super::load_config;

#[derive(Args)]
pub struct ConfigArgs {
    /// Pipeline configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

pub fn execute(args: ConfigArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let yaml = config.to_yaml().context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}
