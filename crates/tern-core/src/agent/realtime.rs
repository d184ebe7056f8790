//! Realtime-query classifier.
//!
//! A small keyword + language heuristic that flags messages demanding
//! live web data (news, weather, prices). Flagged turns start with
//! `tool_choice = "required"` and the tool list narrowed to the web
//! tools, so the model verifies before answering.

use std::sync::OnceLock;

use regex::Regex;

/// CJK keywords matched by substring.
const CJK_KEYWORDS: &[&str] = &[
    "搜索", "新闻", "天气", "最新", "今天", "明天", "现在", "实时", "股价", "汇率", "比分", "行情",
];

/// English keywords matched on word boundaries.
const EN_KEYWORDS: &[&str] = &[
    "news", "weather", "today", "tonight", "latest", "breaking", "forecast", "headlines",
];

/// English phrases matched by substring.
const EN_PHRASES: &[&str] = &["right now", "real-time", "stock price", "exchange rate", "search the web"];

fn en_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        EN_KEYWORDS
            .iter()
            .map(|kw| {
                Regex::new(&format!(r"(?i)(?:^|[^a-z0-9]){}(?:$|[^a-z0-9])", regex::escape(kw)))
                    .expect("static pattern")
            })
            .collect()
    })
}

/// Whether a message demands live external data.
pub fn is_realtime_query(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if CJK_KEYWORDS.iter().any(|kw| trimmed.contains(kw)) {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    if EN_PHRASES.iter().any(|p| lowered.contains(p)) {
        return true;
    }
    en_regexes().iter().any(|re| re.is_match(&lowered))
}

/// The web tools injected for a forced realtime turn.
pub const WEB_TOOL_NAMES: &[&str] = &["web_search", "web_fetch"];

/// Narrow a tool definition list to the web tools; falls back to the
/// full list when no web tool is registered.
pub fn narrow_to_web_tools(definitions: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
    let web: Vec<serde_json::Value> = definitions
        .iter()
        .filter(|d| {
            d.get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .map(|n| WEB_TOOL_NAMES.contains(&n))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if web.is_empty() {
        definitions
    } else {
        web
    }
}
