//! `tern status`: show resolved configuration and workspace health.

use anyhow::Result;

use crate::config::{config_path, load_config};

/// Print a short status report.
pub fn run() -> Result<()> {
    let path = config_path();
    let config = load_config()?;
    let workspace = config.workspace_path();

    println!("Config: {} ({})", path.display(), if path.exists() { "present" } else { "missing, using defaults" });
    println!("Model: {}", config.agents.defaults.model);
    println!("Workspace: {} ({})", workspace.display(), if workspace.exists() { "present" } else { "missing, run `tern onboard`" });
    println!(
        "AGENTS.md: {}",
        if workspace.join("AGENTS.md").exists() { "present" } else { "missing (required)" }
    );

    let mut configured: Vec<&String> = config
        .providers
        .iter()
        .filter(|(_, p)| p.is_configured())
        .map(|(name, _)| name)
        .collect();
    configured.sort();
    if configured.is_empty() {
        println!("Providers: none configured");
    } else {
        println!(
            "Providers: {}",
            configured
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    println!(
        "Context: window={} reserve={} native_session={}",
        config.agents.defaults.context.window_tokens,
        config.agents.defaults.context.reserve_tokens,
        config.agents.defaults.context.enable_native_session,
    );
    Ok(())
}
