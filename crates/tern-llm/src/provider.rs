//! The [`ChatProvider`] contract the agent loop depends on.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{ChatMessage, LLMResponse, ToolChoice};

/// A chat request, provider-shaped.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Conversation messages (system prompt included by the caller).
    pub messages: Vec<ChatMessage>,

    /// Tool descriptors in OpenAI function shape.
    pub tools: Vec<serde_json::Value>,

    /// Tool-choice constraint; `None` means provider default (auto).
    pub tool_choice: Option<ToolChoice>,

    /// Model identifier.
    pub model: String,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Sampling temperature.
    pub temperature: f64,

    /// Opaque native-session state, canonically
    /// `{"previous_response_id": "..."}`. `Some({})` clears server state.
    pub session_state: Option<serde_json::Value>,
}

impl ChatRequest {
    /// The `previous_response_id` carried in the session state, if any.
    pub fn previous_response_id(&self) -> Option<&str> {
        self.session_state
            .as_ref()
            .and_then(|s| s.get("previous_response_id"))
            .and_then(|v| v.as_str())
    }
}

/// An LLM provider the agent loop can call.
///
/// # Error contract
///
/// `chat` never fails at the type level: transport and provider errors
/// are returned as a response with `finish_reason = "error"` and the
/// error message as `content`. The loop recovers a first native-mode
/// error by resetting; any other error becomes a user-facing apology.
///
/// # Streaming
///
/// When `delta_tx` is supplied the provider MUST forward text deltas
/// through it as they arrive; tool calls are always returned whole in
/// the final [`LLMResponse`]. Dropping the receiver stops the stream
/// without error.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name ("openai", "deepseek", ...).
    fn name(&self) -> &str;

    /// Default model when the config does not name one.
    fn default_model(&self) -> &str;

    /// Whether `session_state.previous_response_id` is honored.
    fn supports_native_session(&self) -> bool {
        false
    }

    /// Execute a chat request.
    async fn chat(
        &self,
        request: ChatRequest,
        delta_tx: Option<mpsc::Sender<String>>,
    ) -> LLMResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_exposes_previous_response_id() {
        let req = ChatRequest {
            session_state: Some(serde_json::json!({"previous_response_id": "resp_9"})),
            ..Default::default()
        };
        assert_eq!(req.previous_response_id(), Some("resp_9"));

        let cleared = ChatRequest {
            session_state: Some(serde_json::json!({})),
            ..Default::default()
        };
        assert!(cleared.previous_response_id().is_none());

        let stateless = ChatRequest::default();
        assert!(stateless.previous_response_id().is_none());
    }
}
