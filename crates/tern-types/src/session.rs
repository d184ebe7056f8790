//! Conversation session types.
//!
//! [`Session`] stores the ordered message history for a single chat.
//! Messages are kept as raw JSON objects so extra fields (media lists,
//! timestamps) round-trip losslessly through the JSONL store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rolling-summary state stored under `metadata.context`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextMeta {
    /// Compact summary of messages before `summary_index`.
    #[serde(default)]
    pub summary: String,

    /// Number of leading messages folded into the summary.
    #[serde(default)]
    pub summary_index: usize,

    /// When the summary was last updated (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_updated_at: Option<String>,
}

/// Native-session state stored under `metadata.llm_session`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSessionMeta {
    /// Server-side response id continuing a native session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,

    /// Provider conversation id, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    /// Fingerprint of the bootstrap files at the last native turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_fingerprint: Option<String>,

    /// Force a context reset on the next turn.
    #[serde(default)]
    pub pending_reset: bool,

    /// Prompt tokens observed on the last response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_context_tokens: Option<u64>,

    /// `last_context_tokens / effective_window` from the last response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_context_ratio: Option<f64>,

    /// Raw usage object from the last response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_usage: Option<serde_json::Value>,

    /// Model that produced the last response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// When the last forced reset happened (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reset_at: Option<String>,

    /// Token estimate of the locally built prompt on the last turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_local_tokens: Option<u64>,

    /// Local estimate ratio on the last turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_local_ratio: Option<f64>,
}

/// A conversation session.
///
/// Messages are append-only; the rolling summary and native-session
/// bookkeeping live in `metadata` under the `context` and `llm_session`
/// keys and survive save/load round trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session key: a base key or `base#yyyymmddHHMMSS` active key.
    pub key: String,

    /// Ordered list of messages (append-only).
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,

    /// When the session was first created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// When the session was last updated.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    /// Arbitrary session metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    /// Create a new empty session with the given key.
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Append a message.
    ///
    /// Extra fields (e.g. a `media` array) are merged into the record
    /// alongside `role`, `content`, and `timestamp`.
    pub fn add_message(
        &mut self,
        role: &str,
        content: &str,
        extras: Option<HashMap<String, serde_json::Value>>,
    ) {
        let mut msg = serde_json::json!({
            "role": role,
            "content": content,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(extras) = extras {
            if let Some(obj) = msg.as_object_mut() {
                for (k, v) in extras {
                    obj.insert(k, v);
                }
            }
        }
        self.messages.push(msg);
        self.updated_at = Utc::now();
    }

    /// Recent messages in LLM shape (`role` + `content` only).
    pub fn get_history(&self, max_messages: usize) -> Vec<serde_json::Value> {
        let start = self.messages.len().saturating_sub(max_messages);
        self.messages[start..]
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.get("role").and_then(|v| v.as_str()).unwrap_or("user"),
                    "content": m.get("content").and_then(|v| v.as_str()).unwrap_or(""),
                })
            })
            .collect()
    }

    /// Rolling-summary state, defaulting when absent or malformed.
    pub fn context_meta(&self) -> ContextMeta {
        self.metadata
            .get("context")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Store the rolling-summary state back into metadata.
    pub fn set_context_meta(&mut self, meta: &ContextMeta) {
        if let Ok(value) = serde_json::to_value(meta) {
            self.metadata.insert("context".into(), value);
        }
    }

    /// Native-session state, defaulting when absent or malformed.
    pub fn llm_meta(&self) -> LlmSessionMeta {
        self.metadata
            .get("llm_session")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Store the native-session state back into metadata.
    pub fn set_llm_meta(&mut self, meta: &LlmSessionMeta) {
        if let Ok(value) = serde_json::to_value(meta) {
            self.metadata.insert("llm_session".into(), value);
        }
    }

    /// Clear all messages.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_message_appends_in_order() {
        let mut s = Session::new("cli:direct");
        s.add_message("user", "one", None);
        s.add_message("assistant", "two", None);
        assert_eq!(s.messages.len(), 2);
        assert_eq!(s.messages[0]["role"], "user");
        assert_eq!(s.messages[1]["content"], "two");
    }

    #[test]
    fn add_message_merges_extras() {
        let mut s = Session::new("web:c");
        let mut extras = HashMap::new();
        extras.insert("media".to_string(), serde_json::json!(["/tmp/a.png"]));
        s.add_message("assistant", "here you go", Some(extras));
        assert_eq!(s.messages[0]["media"], serde_json::json!(["/tmp/a.png"]));
    }

    #[test]
    fn get_history_truncates_and_projects() {
        let mut s = Session::new("k");
        for i in 0..10 {
            s.add_message("user", &format!("m{i}"), None);
        }
        let hist = s.get_history(3);
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0]["content"], "m7");
        assert!(hist[0].get("timestamp").is_none());
    }

    #[test]
    fn context_meta_roundtrip() {
        let mut s = Session::new("k");
        let meta = ContextMeta {
            summary: "user likes terse answers".into(),
            summary_index: 4,
            summary_updated_at: Some("2026-01-01T00:00:00Z".into()),
        };
        s.set_context_meta(&meta);
        let loaded = s.context_meta();
        assert_eq!(loaded.summary, "user likes terse answers");
        assert_eq!(loaded.summary_index, 4);
    }

    #[test]
    fn llm_meta_defaults_when_absent() {
        let s = Session::new("k");
        let meta = s.llm_meta();
        assert!(meta.previous_response_id.is_none());
        assert!(!meta.pending_reset);
    }

    #[test]
    fn llm_meta_roundtrip_through_json() {
        let mut s = Session::new("k");
        let meta = LlmSessionMeta {
            previous_response_id: Some("resp_123".into()),
            pending_reset: true,
            last_context_ratio: Some(0.42),
            ..Default::default()
        };
        s.set_llm_meta(&meta);

        // Simulate a save/load cycle through serde.
        let json = serde_json::to_string(&s).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();
        let loaded = restored.llm_meta();
        assert_eq!(loaded.previous_response_id.as_deref(), Some("resp_123"));
        assert!(loaded.pending_reset);
        assert_eq!(loaded.last_context_ratio, Some(0.42));
    }
}
