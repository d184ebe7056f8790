//! CLI subcommand implementations.

pub mod agent;
pub mod onboard;
pub mod run;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};

use tern_core::agent::{AgentLoop, AgentLoopOptions};
use tern_core::bus::MessageBus;
use tern_core::cron::CronService;
use tern_core::tools::registry::ToolRegistry;
use tern_llm::openai::{OpenAiCompatConfig, OpenAiCompatProvider};
use tern_llm::provider::ChatProvider;
use tern_types::config::{Config, ProviderConfig};

/// Known OpenAI-compatible endpoints by provider name.
fn default_api_base(name: &str) -> Option<&'static str> {
    match name {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "moonshot" => Some("https://api.moonshot.cn/v1"),
        "zhipu" => Some("https://open.bigmodel.cn/api/paas/v4"),
        "anthropic" => Some("https://api.anthropic.com/v1"),
        _ => None,
    }
}

/// Pick the provider for the configured model: longest-name keyword
/// match first, then the first configured provider.
fn resolve_provider(config: &Config) -> Result<(String, ProviderConfig)> {
    let model_lower = config.agents.defaults.model.to_lowercase();
    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort();

    for name in &names {
        let p = &config.providers[*name];
        if model_lower.contains(name.as_str()) && p.is_configured() {
            return Ok(((*name).clone(), p.clone()));
        }
    }
    for name in names {
        let p = &config.providers[name];
        if p.is_configured() {
            return Ok((name.clone(), p.clone()));
        }
    }
    bail!("no configured LLM provider; add an api_key under providers in the config")
}

/// Build the chat provider from configuration.
pub fn build_provider(config: &Config) -> Result<Arc<dyn ChatProvider>> {
    let (name, provider_config) = resolve_provider(config)?;
    let base_url = provider_config
        .api_base
        .clone()
        .or_else(|| default_api_base(&name).map(String::from));
    let Some(base_url) = base_url else {
        bail!("provider '{name}' needs an api_base in the config");
    };

    // Strip a "<provider>/" routing prefix off the model id.
    let model = config
        .agents
        .defaults
        .model
        .strip_prefix(&format!("{name}/"))
        .unwrap_or(&config.agents.defaults.model)
        .to_string();

    Ok(Arc::new(OpenAiCompatProvider::new(OpenAiCompatConfig {
        name,
        base_url,
        api_key: provider_config.api_key.clone(),
        default_model: model,
        extra_headers: provider_config.extra_headers.clone().unwrap_or_default(),
        proxy: provider_config.proxy.clone(),
        drop_params: provider_config.drop_params,
    })))
}

/// Directory holding runtime state (`~/.tern`).
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tern")
}

/// Assemble the agent loop from configuration.
pub fn build_agent_loop(
    config: &Config,
    bus: Arc<MessageBus>,
    cron_service: Option<Arc<CronService>>,
) -> Result<AgentLoop> {
    let provider = build_provider(config)?;
    let workspace = config.workspace_path();
    let defaults = &config.agents.defaults;

    let mut leaf_tools = ToolRegistry::new();
    tern_tools::register_all(&mut leaf_tools, workspace.clone(), &config.tools);

    let mut subagent_tools = ToolRegistry::new();
    tern_tools::register_all(&mut subagent_tools, workspace.clone(), &config.tools);

    let options = AgentLoopOptions {
        model: Some(defaults.model.clone()),
        max_iterations: defaults.max_tool_iterations,
        max_tokens: defaults.max_tokens,
        temperature: defaults.temperature,
        stream: defaults.stream,
        stream_min_chars: defaults.stream_min_chars,
        stream_min_interval_s: defaults.stream_min_interval_s,
        context: defaults.context.clone(),
        sessions_dir: Some(state_dir().join("sessions")),
        builtin_skills_dir: None,
    };

    Ok(AgentLoop::new(
        bus,
        provider,
        workspace,
        options,
        leaf_tools,
        Arc::new(subagent_tools),
        cron_service,
    )?)
}
