//! Config file loading and saving.
//!
//! The config lives at `~/.tern/config.json`; `TERN_CONFIG` overrides
//! the path. A missing file loads as defaults so `tern agent` works
//! out of the box once a provider key is present.

use std::path::PathBuf;

use anyhow::{Context, Result};

use tern_types::config::Config;

/// Path of the config file.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TERN_CONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tern")
        .join("config.json")
}

/// Load the config, defaulting when the file does not exist.
pub fn load_config() -> Result<Config> {
    let path = config_path();
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid config at {}", path.display()))
}

/// Save the config, creating parent directories.
pub fn save_config(config: &Config) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write config at {}", path.display()))
}

/// Serializes tests that mutate `TERN_CONFIG`.
#[cfg(test)]
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        let _guard = env_lock();
        let dir = tempfile::TempDir::new().unwrap();
        let custom = dir.path().join("custom.json");
        std::env::set_var("TERN_CONFIG", custom.display().to_string());
        assert_eq!(config_path(), custom);
        std::env::remove_var("TERN_CONFIG");
    }

    #[test]
    fn save_and_load_roundtrip() {
        let _guard = env_lock();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::env::set_var("TERN_CONFIG", path.display().to_string());

        let mut config = Config::default();
        config.agents.defaults.model = "deepseek-chat".into();
        save_config(&config).unwrap();

        let loaded = load_config().unwrap();
        assert_eq!(loaded.agents.defaults.model, "deepseek-chat");
        std::env::remove_var("TERN_CONFIG");
    }
}
