//! Request and response types for LLM chat calls.
//!
//! These mirror the OpenAI chat-completion wire format. Message content
//! is a raw [`serde_json::Value`] so both plain strings and block arrays
//! (inline images) serialize without conversion.

use serde::{Deserialize, Serialize};

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// "system", "user", "assistant", or "tool".
    pub role: String,

    /// String content or an array of typed blocks (text / image_url).
    pub content: serde_json::Value,

    /// Tool name, on tool-result messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The tool call this message is a result of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool calls requested by the assistant in this message
    /// (OpenAI function-call objects, arguments as JSON strings).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,

    /// Thinking output some models require echoed back in history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChatMessage {
    /// Create a message with a plain-string content.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: serde_json::Value::String(content.into()),
            name: None,
            tool_call_id: None,
            tool_calls: None,
            reasoning_content: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Create a tool-result message tagged with the call id and tool name.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: serde_json::Value::String(content.into()),
            name: Some(tool_name.into()),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
            reasoning_content: None,
        }
    }

    /// Content as text when it is a plain string, empty otherwise.
    pub fn content_text(&self) -> &str {
        self.content.as_str().unwrap_or("")
    }
}

/// How the model is allowed to use tools.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Model decides freely.
    Auto,
    /// Model must call a tool.
    Required,
    /// Model must not call a tool.
    None,
}

/// A tool call requested by the model, with parsed arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Unique identifier for this call.
    pub id: String,

    /// The tool name.
    pub name: String,

    /// Parsed arguments. String JSON is parsed by the adapter; content
    /// that is not valid JSON arrives as `{"raw": "..."}`.
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    /// Canonical signature for de-duplication: name + sorted-key args.
    ///
    /// `serde_json::Value` maps preserve insertion order, so the args are
    /// re-serialized through a `BTreeMap` to normalize key order.
    pub fn signature(&self) -> String {
        fn canonical(value: &serde_json::Value) -> serde_json::Value {
            match value {
                serde_json::Value::Object(map) => {
                    let sorted: std::collections::BTreeMap<_, _> =
                        map.iter().map(|(k, v)| (k.clone(), canonical(v))).collect();
                    serde_json::to_value(sorted).unwrap_or_default()
                }
                serde_json::Value::Array(items) => {
                    serde_json::Value::Array(items.iter().map(canonical).collect())
                }
                other => other.clone(),
            }
        }
        format!(
            "{}:{}",
            self.name,
            serde_json::to_string(&canonical(&self.arguments)).unwrap_or_default()
        )
    }
}

/// Token usage for one request.
///
/// Accepts both the OpenAI (`prompt_tokens`) and responses-API
/// (`input_tokens`) field names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: u64,

    /// Tokens in the generated completion.
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: u64,

    /// Total tokens.
    #[serde(default)]
    pub total_tokens: u64,
}

/// Response from an LLM provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMResponse {
    /// Text content (may be empty when the model only called tools).
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the model.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,

    /// Why generation stopped ("stop", "tool_calls", "length", "error").
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,

    /// Token usage, when the provider reports it.
    #[serde(default)]
    pub usage: Option<TokenUsage>,

    /// Server-side response id (native sessions).
    #[serde(default)]
    pub response_id: Option<String>,

    /// Provider conversation id, when reported.
    #[serde(default)]
    pub conversation_id: Option<String>,

    /// Model that produced this response.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_finish_reason() -> String {
    "stop".into()
}

impl LLMResponse {
    /// A plain text response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish_reason: default_finish_reason(),
            ..Default::default()
        }
    }

    /// An error response, per the adapter contract.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            finish_reason: "error".into(),
            ..Default::default()
        }
    }

    /// Whether the response contains tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_helpers() {
        let sys = ChatMessage::system("You are helpful.");
        assert_eq!(sys.role, "system");
        assert_eq!(sys.content_text(), "You are helpful.");

        let tool = ChatMessage::tool_result("call_1", "web_search", "results");
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool.name.as_deref(), Some("web_search"));
    }

    #[test]
    fn chat_message_skips_none_fields() {
        let msg = ChatMessage::user("Hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("tool_call_id"));
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("reasoning_content"));
    }

    #[test]
    fn tool_choice_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ToolChoice::Required).unwrap(),
            "\"required\""
        );
    }

    #[test]
    fn signature_is_order_insensitive() {
        let a = ToolCallRequest {
            id: "1".into(),
            name: "web_search".into(),
            arguments: serde_json::json!({"query": "ai news", "count": 5}),
        };
        let b = ToolCallRequest {
            id: "2".into(),
            name: "web_search".into(),
            arguments: serde_json::json!({"count": 5, "query": "ai news"}),
        };
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn signature_differs_on_args() {
        let a = ToolCallRequest {
            id: "1".into(),
            name: "exec".into(),
            arguments: serde_json::json!({"command": "ls"}),
        };
        let b = ToolCallRequest {
            id: "2".into(),
            name: "exec".into(),
            arguments: serde_json::json!({"command": "pwd"}),
        };
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn usage_accepts_responses_api_aliases() {
        let usage: TokenUsage =
            serde_json::from_str(r#"{"input_tokens": 100, "output_tokens": 20}"#).unwrap();
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 20);
    }

    #[test]
    fn error_response_contract() {
        let resp = LLMResponse::error("HTTP 500: upstream down");
        assert_eq!(resp.finish_reason, "error");
        assert!(!resp.has_tool_calls());
        assert!(resp.content.contains("HTTP 500"));
    }
}
