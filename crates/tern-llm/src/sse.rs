//! SSE line parser for OpenAI-compatible streaming.
//!
//! The streaming format sends `data:` lines carrying JSON deltas and a
//! final `data: [DONE]` sentinel:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hello"}}]}
//! data: {"choices":[{"delta":{"content":" world"},"finish_reason":"stop"}]}
//! data: [DONE]
//! ```

use serde::Deserialize;

use crate::error::{ProviderError, Result};
use crate::types::{TokenUsage, ToolCallRequest};

/// The sentinel marking end of stream.
const DONE_SENTINEL: &str = "[DONE]";

/// A parsed streaming event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A partial text delta.
    TextDelta {
        /// The partial text content.
        text: String,
    },

    /// A partial tool invocation.
    ToolCallDelta {
        /// Index in the tool_calls array.
        index: usize,
        /// Call id (first delta only).
        id: Option<String>,
        /// Function name (first delta only).
        name: Option<String>,
        /// Argument fragment.
        arguments: Option<String>,
    },

    /// Stream complete.
    Done {
        /// Finish reason from the last chunk.
        finish_reason: Option<String>,
        /// Usage, when the provider sends it in the final chunk.
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    choices: Vec<StreamDeltaChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamDeltaChoice {
    #[serde(default)]
    delta: StreamDeltaContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamDeltaToolCall>>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamDeltaToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamDeltaFunction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StreamDeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Parse a single SSE line into zero or more [`StreamChunk`]s.
///
/// Empty lines, comments, and non-`data:` field lines produce no chunks.
///
/// # Errors
///
/// Returns [`ProviderError::InvalidResponse`] when a `data:` payload is
/// not valid delta JSON.
pub fn parse_sse_line(line: &str) -> Result<Vec<StreamChunk>> {
    let line = line.trim_end();

    if line.is_empty() || line.starts_with(':') {
        return Ok(vec![]);
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        // event:, id:, retry: lines
        None => return Ok(vec![]),
    };

    if payload.is_empty() {
        return Ok(vec![]);
    }

    if payload == DONE_SENTINEL {
        return Ok(vec![StreamChunk::Done {
            finish_reason: None,
            usage: None,
        }]);
    }

    let delta: StreamDelta = serde_json::from_str(payload)
        .map_err(|e| ProviderError::InvalidResponse(format!("bad SSE delta: {e}")))?;

    let mut chunks = Vec::new();
    if let Some(choice) = delta.choices.first() {
        if let Some(ref text) = choice.delta.content {
            if !text.is_empty() {
                chunks.push(StreamChunk::TextDelta { text: text.clone() });
            }
        }

        if let Some(ref tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                let (name, arguments) = match &tc.function {
                    Some(f) => (f.name.clone(), f.arguments.clone()),
                    None => (None, None),
                };
                chunks.push(StreamChunk::ToolCallDelta {
                    index: tc.index,
                    id: tc.id.clone(),
                    name,
                    arguments,
                });
            }
        }

        if choice.finish_reason.is_some() {
            chunks.push(StreamChunk::Done {
                finish_reason: choice.finish_reason.clone(),
                usage: delta.usage,
            });
        }
    }

    Ok(chunks)
}

/// Accumulates [`StreamChunk::ToolCallDelta`] fragments into whole calls.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta into the accumulated state.
    pub fn push(&mut self, index: usize, id: Option<String>, name: Option<String>, arguments: Option<String>) {
        while self.calls.len() <= index {
            self.calls.push(PartialCall::default());
        }
        let call = &mut self.calls[index];
        if let Some(id) = id {
            call.id = id;
        }
        if let Some(name) = name {
            call.name = name;
        }
        if let Some(args) = arguments {
            call.arguments.push_str(&args);
        }
    }

    /// Whether any fragments have been accumulated.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finish accumulation, parsing each call's argument buffer.
    ///
    /// Argument text that is not valid JSON becomes `{"raw": "..."}`.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_iter()
            .filter(|c| !c.name.is_empty())
            .map(|c| ToolCallRequest {
                id: c.id,
                name: c.name,
                arguments: parse_arguments(&c.arguments),
            })
            .collect()
    }
}

/// Parse a tool-call argument string per the adapter contract.
pub fn parse_arguments(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) if value.is_object() => value,
        _ => serde_json::json!({ "raw": raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_returns_empty() {
        assert!(parse_sse_line("").unwrap().is_empty());
    }

    #[test]
    fn comment_line_returns_empty() {
        assert!(parse_sse_line(": keep-alive").unwrap().is_empty());
    }

    #[test]
    fn event_field_line_skipped() {
        assert!(parse_sse_line("event: message").unwrap().is_empty());
    }

    #[test]
    fn done_sentinel_yields_done() {
        let chunks = parse_sse_line("data: [DONE]").unwrap();
        assert_eq!(
            chunks,
            vec![StreamChunk::Done {
                finish_reason: None,
                usage: None
            }]
        );
    }

    #[test]
    fn text_delta_parsed() {
        let chunks =
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(
            chunks,
            vec![StreamChunk::TextDelta { text: "Hel".into() }]
        );
    }

    #[test]
    fn finish_reason_yields_done_with_usage() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#;
        let chunks = parse_sse_line(line).unwrap();
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            StreamChunk::Done {
                finish_reason,
                usage,
            } => {
                assert_eq!(finish_reason.as_deref(), Some("stop"));
                assert_eq!(usage.as_ref().unwrap().prompt_tokens, 12);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_error() {
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn tool_call_fragments_accumulate() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("call_1".into()), Some("web_search".into()), Some("{\"que".into()));
        acc.push(0, None, None, Some("ry\":\"ai\"}".into()));
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].arguments, serde_json::json!({"query": "ai"}));
    }

    #[test]
    fn multiple_indices_kept_separate() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("a".into()), Some("read_file".into()), Some("{}".into()));
        acc.push(1, Some("b".into()), Some("exec".into()), Some("{\"command\":\"ls\"}".into()));
        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "exec");
    }

    #[test]
    fn raw_fallback_for_invalid_arguments() {
        let args = parse_arguments("not json at all");
        assert_eq!(args, serde_json::json!({"raw": "not json at all"}));
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        assert_eq!(parse_arguments("  "), serde_json::json!({}));
    }
}
