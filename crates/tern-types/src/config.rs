//! Configuration schema types.
//!
//! The root [`Config`] mirrors the on-disk `config.json`. All structs
//! supply defaults so a partial (or empty) config file loads cleanly,
//! and accept `camelCase` aliases for the fields channels tend to write.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ── Root config ──────────────────────────────────────────────────────────

/// Root configuration for the tern runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent defaults (model, workspace, context budget).
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Chat channel configurations.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// LLM provider credentials and settings, keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Tool configurations (web search, exec).
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Expanded workspace path (`~/` resolved against the home directory).
    pub fn workspace_path(&self) -> PathBuf {
        expand_home(&self.agents.defaults.workspace)
    }

    /// Provider config for the given model, by longest keyword match on
    /// the provider name, falling back to the first configured provider.
    pub fn provider_for_model(&self, model: &str) -> Option<&ProviderConfig> {
        let model_lower = model.to_lowercase();
        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort();
        for name in &names {
            if model_lower.contains(name.as_str()) && self.providers[*name].is_configured() {
                return self.providers.get(*name);
            }
        }
        names
            .into_iter()
            .find(|n| self.providers[*n].is_configured())
            .and_then(|n| self.providers.get(n))
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

// ── Agents ───────────────────────────────────────────────────────────────

/// Agent configuration container.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConfig {
    /// Default settings applied to all agents.
    #[serde(default)]
    pub defaults: AgentDefaults,
}

/// Default agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Working directory for agent file operations.
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Default LLM model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum tokens in a single LLM response.
    #[serde(default = "default_max_tokens", alias = "maxTokens")]
    pub max_tokens: u32,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Maximum tool-use iterations per turn.
    #[serde(default = "default_max_tool_iterations", alias = "maxToolIterations")]
    pub max_tool_iterations: usize,

    /// Stream text deltas to channels that support it.
    #[serde(default)]
    pub stream: bool,

    /// Minimum buffered characters before a streaming flush.
    #[serde(default = "default_stream_min_chars", alias = "streamMinChars")]
    pub stream_min_chars: usize,

    /// Minimum seconds between streaming flushes.
    #[serde(default = "default_stream_min_interval", alias = "streamMinIntervalS")]
    pub stream_min_interval_s: f64,

    /// Conversation context budget and summarization settings.
    #[serde(default)]
    pub context: ContextConfig,
}

fn default_workspace() -> String {
    "~/.tern/workspace".into()
}
fn default_model() -> String {
    "anthropic/claude-opus-4-5".into()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tool_iterations() -> usize {
    20
}
fn default_stream_min_chars() -> usize {
    120
}
fn default_stream_min_interval() -> f64 {
    0.5
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_tool_iterations: default_max_tool_iterations(),
            stream: false,
            stream_min_chars: default_stream_min_chars(),
            stream_min_interval_s: default_stream_min_interval(),
            context: ContextConfig::default(),
        }
    }
}

// ── Context ──────────────────────────────────────────────────────────────

/// Conversation context configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Model context window in tokens.
    #[serde(default = "default_window_tokens", alias = "windowTokens")]
    pub window_tokens: u64,

    /// Tokens reserved for the response.
    #[serde(default = "default_reserve_tokens", alias = "reserveTokens")]
    pub reserve_tokens: u64,

    /// Unsummarized-history ratio that triggers rolling summarization.
    #[serde(default = "default_summarize_threshold", alias = "summarizeThreshold")]
    pub summarize_threshold: f64,

    /// Context ratio that forces a native-session reset.
    #[serde(default = "default_hard_limit_threshold", alias = "hardLimitThreshold")]
    pub hard_limit_threshold: f64,

    /// Recent messages kept verbatim after the summary.
    #[serde(default = "default_recent_messages", alias = "recentMessages")]
    pub recent_messages: usize,

    /// Floor of recent messages retained by shrink-to-budget.
    #[serde(default = "default_min_recent_messages", alias = "minRecentMessages")]
    pub min_recent_messages: usize,

    /// Max tokens for the summarizer call.
    #[serde(default = "default_summary_max_tokens", alias = "summaryMaxTokens")]
    pub summary_max_tokens: u32,

    /// Model override for summarization (defaults to the agent model).
    #[serde(default, alias = "summaryModel")]
    pub summary_model: Option<String>,

    /// Use provider-side native sessions when supported.
    #[serde(default = "default_true", alias = "enableNativeSession")]
    pub enable_native_session: bool,

    /// Tool rounds allowed per turn for realtime-flagged skills (0 = off).
    #[serde(default = "default_skill_tool_round_limit", alias = "skillToolRoundLimit")]
    pub skill_tool_round_limit: usize,

    /// Rounds without a new tool-call signature before forcing a summary
    /// (0 = off).
    #[serde(
        default = "default_skill_tool_stagnation_limit",
        alias = "skillToolStagnationLimit"
    )]
    pub skill_tool_stagnation_limit: usize,
}

fn default_window_tokens() -> u64 {
    32000
}
fn default_reserve_tokens() -> u64 {
    1024
}
fn default_summarize_threshold() -> f64 {
    0.75
}
fn default_hard_limit_threshold() -> f64 {
    0.9
}
fn default_recent_messages() -> usize {
    20
}
fn default_min_recent_messages() -> usize {
    6
}
fn default_summary_max_tokens() -> u32 {
    1200
}
fn default_true() -> bool {
    true
}
fn default_skill_tool_round_limit() -> usize {
    6
}
fn default_skill_tool_stagnation_limit() -> usize {
    2
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_tokens: default_window_tokens(),
            reserve_tokens: default_reserve_tokens(),
            summarize_threshold: default_summarize_threshold(),
            hard_limit_threshold: default_hard_limit_threshold(),
            recent_messages: default_recent_messages(),
            min_recent_messages: default_min_recent_messages(),
            summary_max_tokens: default_summary_max_tokens(),
            summary_model: None,
            enable_native_session: default_true(),
            skill_tool_round_limit: default_skill_tool_round_limit(),
            skill_tool_stagnation_limit: default_skill_tool_stagnation_limit(),
        }
    }
}

// ── Channels ─────────────────────────────────────────────────────────────

/// Configuration for chat channels.
///
/// Transport internals are external collaborators; only enough surface is
/// kept here for the runtime to know what to start. Unknown channel
/// sections are preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    /// Local CLI channel.
    #[serde(default)]
    pub cli: CliChannelConfig,

    /// Browser PWA channel (HTTP/SSE).
    #[serde(default)]
    pub web: WebChannelConfig,

    /// Unrecognized channel sections, kept verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// CLI channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliChannelConfig {
    /// Whether the CLI channel starts with `tern run`.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CliChannelConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Web/PWA channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebChannelConfig {
    /// Whether the web channel starts with `tern run`.
    #[serde(default)]
    pub enabled: bool,

    /// Bind host.
    #[serde(default = "default_web_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_web_port")]
    pub port: u16,

    /// Allowed sender ids (empty = everyone).
    #[serde(default, alias = "allowFrom")]
    pub allow_from: Vec<String>,

    /// Requests per minute before 429 at the channel boundary.
    #[serde(default = "default_rate_limit_rpm", alias = "rateLimitRpm")]
    pub rate_limit_rpm: u32,
}

fn default_web_host() -> String {
    "0.0.0.0".into()
}
fn default_web_port() -> u16 {
    8080
}
fn default_rate_limit_rpm() -> u32 {
    20
}

impl Default for WebChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_web_host(),
            port: default_web_port(),
            allow_from: Vec::new(),
            rate_limit_rpm: default_rate_limit_rpm(),
        }
    }
}

// ── Providers ────────────────────────────────────────────────────────────

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// API key.
    #[serde(default, alias = "apiKey")]
    pub api_key: String,

    /// Base URL override.
    #[serde(default, alias = "apiBase")]
    pub api_base: Option<String>,

    /// Wire protocol variant (e.g. "openai-responses").
    #[serde(default, alias = "apiType")]
    pub api_type: Option<String>,

    /// "native", "stateless", or "auto" (default).
    #[serde(default, alias = "sessionMode")]
    pub session_mode: Option<String>,

    /// Extra headers for provider requests.
    #[serde(default, alias = "extraHeaders")]
    pub extra_headers: Option<HashMap<String, String>>,

    /// Optional proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Drop optional params for strict gateways.
    #[serde(default, alias = "dropParams")]
    pub drop_params: bool,
}

impl ProviderConfig {
    /// Whether this provider has enough configuration to be used.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() || self.api_base.is_some()
    }

    /// Normalized session mode; `None` means auto.
    pub fn session_mode(&self) -> Option<&str> {
        match self.session_mode.as_deref().map(str::trim) {
            Some("native") => Some("native"),
            Some("stateless") => Some("stateless"),
            _ => None,
        }
    }
}

// ── Tools ────────────────────────────────────────────────────────────────

/// Tools configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    /// Web tools.
    #[serde(default)]
    pub web: WebToolsConfig,

    /// Shell exec tool.
    #[serde(default)]
    pub exec: ExecToolConfig,

    /// Restrict file/shell tool access to the workspace directory.
    #[serde(default, alias = "restrictToWorkspace")]
    pub restrict_to_workspace: bool,
}

/// Web tools configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebToolsConfig {
    /// Search settings.
    #[serde(default)]
    pub search: WebSearchConfig,
}

/// Web search tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    /// Primary search provider ("brave", "duckduckgo").
    #[serde(default = "default_search_provider")]
    pub provider: String,

    /// Providers tried in order when the primary fails.
    #[serde(default, alias = "fallbackProviders")]
    pub fallback_providers: Vec<String>,

    /// API key for the primary provider (Brave).
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,

    /// Maximum results returned to the model.
    #[serde(default = "default_max_results", alias = "maxResults")]
    pub max_results: usize,

    /// Per-request timeout in seconds.
    #[serde(default = "default_search_timeout", alias = "timeoutSeconds")]
    pub timeout_seconds: u64,
}

fn default_search_provider() -> String {
    "brave".into()
}
fn default_max_results() -> usize {
    5
}
fn default_search_timeout() -> u64 {
    15
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            fallback_providers: vec!["duckduckgo".into()],
            api_key: None,
            max_results: default_max_results(),
            timeout_seconds: default_search_timeout(),
        }
    }
}

/// Shell exec tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecToolConfig {
    /// Subprocess timeout in seconds.
    #[serde(default = "default_exec_timeout")]
    pub timeout: u64,
}

fn default_exec_timeout() -> u64 {
    60
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self {
            timeout: default_exec_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_loads_with_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.agents.defaults.max_tool_iterations, 20);
        assert_eq!(config.agents.defaults.context.window_tokens, 32000);
        assert!(config.agents.defaults.context.enable_native_session);
        assert_eq!(config.tools.exec.timeout, 60);
        assert!(!config.tools.restrict_to_workspace);
    }

    #[test]
    fn camel_case_aliases_accepted() {
        let json = r#"{
            "agents": {"defaults": {
                "maxTokens": 1024,
                "streamMinChars": 50,
                "context": {"windowTokens": 9000, "enableNativeSession": false}
            }}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.agents.defaults.max_tokens, 1024);
        assert_eq!(config.agents.defaults.stream_min_chars, 50);
        assert_eq!(config.agents.defaults.context.window_tokens, 9000);
        assert!(!config.agents.defaults.context.enable_native_session);
    }

    #[test]
    fn provider_lookup_matches_model_keyword() {
        let json = r#"{
            "providers": {
                "openai": {"apiKey": "sk-a"},
                "deepseek": {"apiKey": "sk-b"}
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let p = config.provider_for_model("deepseek-chat").unwrap();
        assert_eq!(p.api_key, "sk-b");
    }

    #[test]
    fn provider_lookup_falls_back_to_first_configured() {
        let json = r#"{
            "providers": {
                "openai": {"apiKey": ""},
                "groq": {"apiKey": "sk-g"}
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let p = config.provider_for_model("mystery-model").unwrap();
        assert_eq!(p.api_key, "sk-g");
    }

    #[test]
    fn session_mode_normalization() {
        let mut p = ProviderConfig::default();
        assert!(p.session_mode().is_none());
        p.session_mode = Some("native".into());
        assert_eq!(p.session_mode(), Some("native"));
        p.session_mode = Some("auto".into());
        assert!(p.session_mode().is_none());
    }

    #[test]
    fn unknown_channel_sections_preserved() {
        let json = r#"{"channels": {"feishu": {"enabled": true, "app_id": "x"}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.channels.extra.contains_key("feishu"));
    }

    #[test]
    fn web_search_defaults_include_fallback() {
        let cfg = WebSearchConfig::default();
        assert_eq!(cfg.provider, "brave");
        assert_eq!(cfg.fallback_providers, vec!["duckduckgo".to_string()]);
    }
}
