//! `tern onboard`: create the config file and workspace templates.

use anyhow::{Context, Result};

use tern_types::config::Config;

use crate::config::{config_path, load_config, save_config};

const AGENTS_TEMPLATE: &str = "# AGENTS.md\n\n\
You are a helpful assistant running in the tern agent runtime.\n\n\
## Ground rules\n\
- Be accurate and concise.\n\
- Use tools for anything that depends on live data or the filesystem.\n\
- Record durable facts about the user in memory/MEMORY.md.\n";

const MEMORY_TEMPLATE: &str = "# Long-term Memory\n\n(nothing recorded yet)\n";

/// Create the config and workspace, keeping existing files unless
/// `force` is set (config only; workspace templates are always safe).
pub fn run(force: bool) -> Result<()> {
    let path = config_path();
    if path.exists() && !force {
        println!("Config already exists at {} (use --force to overwrite)", path.display());
    } else {
        save_config(&Config::default())?;
        println!("Created config at {}", path.display());
    }

    let config = load_config()?;
    let workspace = config.workspace_path();
    if !workspace.exists() {
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
        println!("Created workspace at {}", workspace.display());
    }

    let agents = workspace.join("AGENTS.md");
    if !agents.exists() {
        std::fs::write(&agents, AGENTS_TEMPLATE)?;
        println!("Created AGENTS.md");
    }

    let memory_dir = workspace.join("memory");
    std::fs::create_dir_all(&memory_dir)?;
    let memory = memory_dir.join("MEMORY.md");
    if !memory.exists() {
        std::fs::write(&memory, MEMORY_TEMPLATE)?;
        println!("Created memory/MEMORY.md");
    }
    let history = memory_dir.join("HISTORY.md");
    if !history.exists() {
        std::fs::write(&history, "")?;
    }
    std::fs::create_dir_all(memory_dir.join("learnings"))?;
    std::fs::create_dir_all(workspace.join("skills"))?;

    println!("tern is ready. Set a provider api_key in the config, then try: tern agent -m \"hello\"");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onboard_creates_config_and_workspace() {
        let _guard = crate::config::env_lock();
        let dir = tempfile::TempDir::new().unwrap();
        let config_file = dir.path().join("config.json");
        std::env::set_var("TERN_CONFIG", config_file.display().to_string());

        // Point the workspace inside the temp dir via a pre-seeded config.
        let mut config = Config::default();
        config.agents.defaults.workspace = dir.path().join("workspace").display().to_string();
        save_config(&config).unwrap();

        run(false).unwrap();

        let workspace = dir.path().join("workspace");
        assert!(config_file.exists());
        assert!(workspace.join("AGENTS.md").exists());
        assert!(workspace.join("memory/MEMORY.md").exists());
        assert!(workspace.join("skills").is_dir());

        // Idempotent: does not clobber existing files.
        std::fs::write(workspace.join("AGENTS.md"), "customized").unwrap();
        run(false).unwrap();
        assert_eq!(
            std::fs::read_to_string(workspace.join("AGENTS.md")).unwrap(),
            "customized"
        );

        std::env::remove_var("TERN_CONFIG");
    }
}
