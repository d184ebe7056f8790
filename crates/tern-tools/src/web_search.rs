//! Web search tool with provider fallback.
//!
//! Brave Search is the primary provider (API key required); the
//! DuckDuckGo HTML endpoint serves as a keyless fallback. Providers are
//! tried in configured order; the first that yields results wins.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};

use tern_core::tools::registry::{Tool, ToolError};
use tern_types::config::WebSearchConfig;

/// Search the web via the configured provider chain.
pub struct WebSearchTool {
    config: WebSearchConfig,
    http: reqwest::Client,
}

impl WebSearchTool {
    /// Create the tool from configuration.
    pub fn new(config: WebSearchConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn provider_chain(&self) -> Vec<String> {
        let mut chain = vec![self.config.provider.clone()];
        for fallback in &self.config.fallback_providers {
            if !chain.contains(fallback) {
                chain.push(fallback.clone());
            }
        }
        chain
    }

    async fn search_with(&self, provider: &str, query: &str, count: usize) -> Result<String, ToolError> {
        match provider {
            "brave" => self.search_brave(query, count).await,
            "duckduckgo" => self.search_duckduckgo(query, count).await,
            other => Err(ToolError::ExecutionFailed(format!(
                "unknown search provider '{other}'"
            ))),
        }
    }

    async fn search_brave(&self, query: &str, count: usize) -> Result<String, ToolError> {
        let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Err(ToolError::ExecutionFailed(
                "brave search api key not configured".into(),
            ));
        };

        let response = self
            .http
            .get("https://api.search.brave.com/res/v1/web/search")
            .header("X-Subscription-Token", api_key)
            .header("Accept", "application/json")
            .query(&[("q", query), ("count", &count.to_string())])
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("brave request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "brave returned HTTP {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("brave response invalid: {e}")))?;

        let results = body
            .get("web")
            .and_then(|w| w.get("results"))
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        if results.is_empty() {
            return Err(ToolError::ExecutionFailed("brave returned no results".into()));
        }

        let mut lines = vec![format!("Results for: {query} (provider: brave)")];
        for result in results.iter().take(count) {
            let title = result.get("title").and_then(|v| v.as_str()).unwrap_or("");
            let url = result.get("url").and_then(|v| v.as_str()).unwrap_or("");
            let desc = result
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            lines.push(format!("- {title}\n  {url}\n  {desc}"));
        }
        Ok(lines.join("\n"))
    }

    async fn search_duckduckgo(&self, query: &str, count: usize) -> Result<String, ToolError> {
        let response = self
            .http
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("duckduckgo request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "duckduckgo returned HTTP {}",
                response.status()
            )));
        }

        let html = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("duckduckgo body unreadable: {e}")))?;

        let results = parse_duckduckgo_results(&html, count);
        if results.is_empty() {
            return Err(ToolError::ExecutionFailed(
                "duckduckgo returned no results".into(),
            ));
        }

        let mut lines = vec![format!("Results for: {query} (provider: duckduckgo)")];
        for (title, url) in results {
            lines.push(format!("- {title}\n  {url}"));
        }
        Ok(lines.join("\n"))
    }
}

/// Pull `(title, url)` pairs out of the DuckDuckGo HTML results page.
fn parse_duckduckgo_results(html: &str, count: usize) -> Vec<(String, String)> {
    let re = Regex::new(r#"<a[^>]+class="result__a"[^>]+href="([^"]+)"[^>]*>(.*?)</a>"#)
        .expect("static pattern");
    let tag_re = Regex::new(r"<[^>]+>").expect("static pattern");
    re.captures_iter(html)
        .take(count)
        .map(|c| {
            let url = c[1].to_string();
            let title = tag_re.replace_all(&c[2], "").trim().to_string();
            (title, url)
        })
        .collect()
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return result titles, URLs, and snippets."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "count": {"type": "integer", "description": "Maximum results (optional)"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing required field: query".into()))?;
        let count = args
            .get("count")
            .and_then(|v| v.as_u64())
            .map(|c| c as usize)
            .unwrap_or(self.config.max_results)
            .clamp(1, 20);

        let mut last_error = String::new();
        for provider in self.provider_chain() {
            debug!(provider = %provider, query, "trying search provider");
            match self.search_with(&provider, query, count).await {
                Ok(results) => return Ok(results),
                Err(e) => {
                    warn!(provider = %provider, error = %e, "search provider failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(ToolError::ExecutionFailed(format!(
            "web_search failed: {last_error}"
        )))
    }
}
