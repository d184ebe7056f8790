//! Web fetch tool.
//!
//! Fetches a URL and returns readable text: script/style blocks are
//! stripped, remaining tags removed, whitespace collapsed. Responses
//! are size-capped and truncated with a marker.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::debug;

use tern_core::tools::registry::{Tool, ToolError};

/// Request timeout.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on the text returned to the model.
const MAX_CONTENT_CHARS: usize = 50_000;

/// Fetch a URL and return its content as text.
pub struct WebFetchTool {
    http: reqwest::Client,
}

impl WebFetchTool {
    /// Create the tool.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and return its content as readable text (HTML is stripped)."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "HTTP(S) URL to fetch"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing required field: url".into()))?;

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArgs(
                "url must start with http:// or https://".into(),
            ));
        }

        debug!(url, "fetching url");
        let response = self
            .http
            .get(url)
            .header("User-Agent", "tern-agent/0.3")
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "fetch returned HTTP {status}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("body unreadable: {e}")))?;

        let text = if content_type.contains("text/html") || looks_like_html(&body) {
            html_to_text(&body)
        } else {
            body
        };

        if text.chars().count() > MAX_CONTENT_CHARS {
            let truncated: String = text.chars().take(MAX_CONTENT_CHARS).collect();
            Ok(format!("{truncated}\n...(truncated)"))
        } else {
            Ok(text)
        }
    }
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start();
    head.starts_with("<!DOCTYPE") || head.starts_with("<!doctype") || head.starts_with("<html")
}

/// Naive HTML to text: drop script/style subtrees, strip tags, decode
/// the common entities, collapse blank runs.
fn html_to_text(html: &str) -> String {
    let script_re = Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>")
        .expect("static pattern");
    let tag_re = Regex::new(r"(?s)<[^>]+>").expect("static pattern");

    let without_scripts = script_re.replace_all(html, " ");
    let without_tags = tag_re.replace_all(&without_scripts, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_whitespace().collect::<Vec<_>>().join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
