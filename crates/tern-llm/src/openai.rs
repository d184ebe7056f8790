//! OpenAI-compatible provider.
//!
//! [`OpenAiCompatProvider`] speaks the `/chat/completions` wire format,
//! which most hosted providers and gateways accept. Streaming uses SSE;
//! tool calls are accumulated from deltas and returned whole.
//!
//! Per the adapter contract, `chat` never surfaces an error to the
//! caller: failures become a response with `finish_reason = "error"`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};
use crate::provider::{ChatProvider, ChatRequest};
use crate::retry::{with_retry, RetryConfig};
use crate::sse::{parse_arguments, parse_sse_line, StreamChunk, ToolCallAccumulator};
use crate::types::{LLMResponse, TokenUsage, ToolCallRequest};

/// Provider-side request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Configuration for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    /// Provider name for logging ("openai", "deepseek", ...).
    pub name: String,

    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,

    /// API key.
    pub api_key: String,

    /// Default model.
    pub default_model: String,

    /// Extra headers sent with every request.
    pub extra_headers: HashMap<String, String>,

    /// Optional proxy URL.
    pub proxy: Option<String>,

    /// Drop optional params (temperature, max_tokens) for strict gateways.
    pub drop_params: bool,
}

/// An LLM provider using the OpenAI chat-completion API.
pub struct OpenAiCompatProvider {
    config: OpenAiCompatConfig,
    http: reqwest::Client,
    retry: RetryConfig,
}

impl OpenAiCompatProvider {
    /// Create a provider from configuration.
    pub fn new(config: OpenAiCompatConfig) -> Self {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(ref proxy) = config.proxy {
            match reqwest::Proxy::all(proxy) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => warn!(proxy = %proxy, error = %e, "invalid proxy url, ignoring"),
            }
        }
        Self {
            config,
            http: builder.build().unwrap_or_default(),
            retry: RetryConfig::default(),
        }
    }

    fn completions_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
        });
        let obj = body.as_object_mut().expect("body is an object");
        if !self.config.drop_params {
            obj.insert("max_tokens".into(), serde_json::json!(request.max_tokens));
            obj.insert("temperature".into(), serde_json::json!(request.temperature));
        }
        if !request.tools.is_empty() {
            obj.insert("tools".into(), serde_json::json!(request.tools));
        }
        if let Some(choice) = request.tool_choice {
            obj.insert("tool_choice".into(), serde_json::json!(choice));
        }
        if stream {
            obj.insert("stream".into(), serde_json::json!(true));
        }
        body
    }

    fn post(&self, body: &serde_json::Value, sse: bool) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json");
        if sse {
            req = req.header("Accept", "text/event-stream");
        }
        for (k, v) in &self.config.extra_headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req.json(body)
    }

    async fn classify_failure(response: reqwest::Response) -> ProviderError {
        let status = response.status();
        if status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            // Some providers use 429 for exhausted credits, which no
            // amount of retrying fixes.
            if is_quota_exhausted(&body) {
                return ProviderError::RequestFailed(
                    extract_error_message(&body)
                        .unwrap_or_else(|| "credits exhausted or spending limit reached".into()),
                );
            }
            let retry_ms = parse_retry_after_ms(&body).unwrap_or(1000);
            return ProviderError::RateLimited {
                retry_after_ms: retry_ms,
            };
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return ProviderError::AuthFailed(body);
        }
        ProviderError::RequestFailed(format!("HTTP {status}: {body}"))
    }

    async fn complete_once(&self, request: &ChatRequest) -> Result<LLMResponse> {
        let body = self.build_body(request, false);
        let response = self.post(&body, false).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("bad completion body: {e}")))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments: parse_arguments(&tc.function.arguments),
            })
            .collect::<Vec<_>>();

        let finish_reason = choice.finish_reason.unwrap_or_else(|| {
            if tool_calls.is_empty() {
                "stop".into()
            } else {
                "tool_calls".into()
            }
        });

        Ok(LLMResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            finish_reason,
            usage: wire.usage,
            response_id: Some(wire.id),
            conversation_id: None,
            model: Some(wire.model),
        })
    }

    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        delta_tx: mpsc::Sender<String>,
    ) -> Result<LLMResponse> {
        let body = self.build_body(request, true);
        let response = self.post(&body, true).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut content = String::new();
        let mut acc = ToolCallAccumulator::new();
        let mut finish_reason: Option<String> = None;
        let mut usage: Option<TokenUsage> = None;

        while let Some(chunk_result) = byte_stream.next().await {
            let bytes = chunk_result
                .map_err(|e| ProviderError::RequestFailed(format!("stream read error: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].to_string();
                buffer.drain(..=newline_pos);

                let chunks = match parse_sse_line(&line) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(provider = %self.config.name, error = %e, "SSE parse error, skipping line");
                        continue;
                    }
                };
                for chunk in chunks {
                    match chunk {
                        StreamChunk::TextDelta { text } => {
                            content.push_str(&text);
                            // A dropped receiver just stops delta delivery.
                            let _ = delta_tx.send(text).await;
                        }
                        StreamChunk::ToolCallDelta {
                            index,
                            id,
                            name,
                            arguments,
                        } => acc.push(index, id, name, arguments),
                        StreamChunk::Done {
                            finish_reason: reason,
                            usage: u,
                        } => {
                            if reason.is_some() {
                                finish_reason = reason;
                            }
                            if u.is_some() {
                                usage = u;
                            }
                        }
                    }
                }
            }
        }

        let tool_calls = acc.finish();
        let finish_reason = finish_reason.unwrap_or_else(|| {
            if tool_calls.is_empty() {
                "stop".into()
            } else {
                "tool_calls".into()
            }
        });

        Ok(LLMResponse {
            content,
            tool_calls,
            finish_reason,
            usage,
            response_id: None,
            conversation_id: None,
            model: Some(request.model.clone()),
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    async fn chat(
        &self,
        request: ChatRequest,
        delta_tx: Option<mpsc::Sender<String>>,
    ) -> LLMResponse {
        if self.config.api_key.is_empty() {
            return LLMResponse::error(format!(
                "provider '{}' is not configured (missing API key)",
                self.config.name
            ));
        }

        debug!(
            provider = %self.config.name,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            streaming = delta_tx.is_some(),
            "sending chat completion request"
        );

        let result = match delta_tx {
            // Streaming runs a single attempt: once deltas have been
            // forwarded a retry would duplicate visible output.
            Some(tx) => self.complete_streaming(&request, tx).await,
            None => with_retry(&self.retry, || self.complete_once(&request)).await,
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                warn!(provider = %self.config.name, error = %err, "chat completion failed");
                LLMResponse::error(err.to_string())
            }
        }
    }
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.config.name)
            .field("base_url", &self.config.base_url)
            .field("api_key", &"***")
            .finish()
    }
}

// ── Wire shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

// ── 429 body helpers ─────────────────────────────────────────────────────

/// Whether a 429 body indicates permanent quota/credit exhaustion.
fn is_quota_exhausted(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("exhausted")
        || lower.contains("spending limit")
        || lower.contains("credits")
        || lower.contains("billing")
        || lower.contains("quota exceeded")
        || lower.contains("insufficient_quota")
}

/// Human-readable error message from a JSON error body.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("error").and_then(|v| {
        v.get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .or_else(|| v.as_str().map(String::from))
    })
}

/// Retry-after hint from a JSON error body, in milliseconds.
fn parse_retry_after_ms(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("retry_after_ms")
        .and_then(|v| v.as_u64())
        .or_else(|| {
            value
                .get("retry_after")
                .and_then(|v| v.as_f64())
                .map(|secs| (secs * 1000.0) as u64)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, ToolChoice};

    fn test_config() -> OpenAiCompatConfig {
        OpenAiCompatConfig {
            name: "test-provider".into(),
            base_url: "https://api.example.com/v1/".into(),
            api_key: "sk-test123".into(),
            default_model: "test-model".into(),
            extra_headers: HashMap::new(),
            proxy: None,
            drop_params: false,
        }
    }

    #[test]
    fn completions_url_strips_trailing_slash() {
        let provider = OpenAiCompatProvider::new(test_config());
        assert_eq!(
            provider.completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn body_includes_tools_and_choice() {
        let provider = OpenAiCompatProvider::new(test_config());
        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            tools: vec![serde_json::json!({"type": "function"})],
            tool_choice: Some(ToolChoice::Required),
            model: "test-model".into(),
            max_tokens: 256,
            temperature: 0.3,
            session_state: None,
        };
        let body = provider.build_body(&request, false);
        assert_eq!(body["tool_choice"], serde_json::json!("required"));
        assert_eq!(body["max_tokens"], serde_json::json!(256));
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn body_omits_empty_tools() {
        let provider = OpenAiCompatProvider::new(test_config());
        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            model: "test-model".into(),
            max_tokens: 256,
            temperature: 0.3,
            ..Default::default()
        };
        let body = provider.build_body(&request, true);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        assert_eq!(body["stream"], serde_json::json!(true));
    }

    #[test]
    fn drop_params_strips_optional_fields() {
        let mut config = test_config();
        config.drop_params = true;
        let provider = OpenAiCompatProvider::new(config);
        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            model: "m".into(),
            max_tokens: 100,
            temperature: 0.5,
            ..Default::default()
        };
        let body = provider.build_body(&request, false);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[tokio::test]
    async fn missing_api_key_returns_error_response() {
        let mut config = test_config();
        config.api_key = String::new();
        let provider = OpenAiCompatProvider::new(config);
        let response = provider.chat(ChatRequest::default(), None).await;
        assert_eq!(response.finish_reason, "error");
        assert!(response.content.contains("not configured"));
    }

    #[test]
    fn quota_exhaustion_detected() {
        assert!(is_quota_exhausted(
            r#"{"error": "Your credits are exhausted"}"#
        ));
        assert!(!is_quota_exhausted(r#"{"error": "slow down"}"#));
    }

    #[test]
    fn retry_after_parsed_from_body() {
        assert_eq!(
            parse_retry_after_ms(r#"{"retry_after_ms": 2500}"#),
            Some(2500)
        );
        assert_eq!(parse_retry_after_ms(r#"{"retry_after": 3.5}"#), Some(3500));
        assert_eq!(parse_retry_after_ms("not json"), None);
    }

    #[test]
    fn debug_hides_api_key() {
        let provider = OpenAiCompatProvider::new(test_config());
        let debug_str = format!("{provider:?}");
        assert!(!debug_str.contains("sk-test123"));
        assert!(debug_str.contains("***"));
    }

    #[test]
    fn wire_response_parses_tool_calls() {
        let json = r#"{
            "id": "chatcmpl-1",
            "model": "test-model",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "web_search", "arguments": "{\"query\":\"ai\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let wire: WireResponse = serde_json::from_str(json).unwrap();
        assert_eq!(wire.choices[0].message.tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(wire.usage.as_ref().unwrap().prompt_tokens, 10);
    }
}
