//! Roles command - List agent roles with their dependencies and fallbacks.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use scene_agents::AgentRole;
use scene_core::default_dependencies;

use super::load_config;

#[derive(Args)]
pub struct RolesArgs {
    /// Pipeline configuration file (YAML) to read fallbacks from
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Serialize)]
struct RoleInfo {
    role: AgentRole,
    description: &'static str,
    stage: AgentRole,
    depends_on: Vec<AgentRole>,
    fallback: Option<AgentRole>,
    default: bool,
}

pub fn execute(args: RolesArgs, json: bool) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let fallbacks = config.fallback_map()?;
    let default_set = AgentRole::default_set();

    let roles: Vec<RoleInfo> = AgentRole::all()
        .into_iter()
        .map(|role| RoleInfo {
            role,
            description: role.description(),
            stage: role.stage_role(),
            depends_on: if role.is_alternate() {
                Vec::new()
            } else {
                default_dependencies(role)
            },
            fallback: fallbacks.fallback_for(role),
            default: default_set.contains(&role),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&roles)?);
        return Ok(());
    }

    println!("{:<14} {:<14} {:<14} DESCRIPTION", "ROLE", "STAGE", "FALLBACK");
    for info in &roles {
        let fallback = info.fallback.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
        let marker = if info.default { "" } else { " (optional)" };
        println!(
            "{:<14} {:<14} {:<14} {}{}",
            info.role.as_str(),
            info.stage.as_str(),
            fallback,
            info.description,
            marker
        );
    }
    Ok(())
}
