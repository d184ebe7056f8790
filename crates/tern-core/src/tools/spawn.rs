//! Subagent spawning: background one-shot agents for long tasks.
//!
//! A subagent runs its own bounded tool loop on a background task and
//! announces completion by publishing an inbound `system` message whose
//! `chat_id` encodes the origin (`channel:chat_id`), so the main loop
//! processes the announce under the originating session and the reply
//! reaches the right chat.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use tern_llm::provider::{ChatProvider, ChatRequest};
use tern_llm::types::ChatMessage;
use tern_types::event::InboundMessage;

use crate::bus::MessageBus;
use crate::tools::registry::{Tool, ToolError, ToolRegistry};

/// Tool rounds a subagent may use before being cut off.
const SUBAGENT_MAX_ITERATIONS: usize = 8;

/// Spawns and tracks background subagents.
pub struct SubagentManager {
    provider: Arc<dyn ChatProvider>,
    bus: Arc<MessageBus>,
    tools: Arc<ToolRegistry>,
    model: String,
}

impl SubagentManager {
    /// Create a manager.
    ///
    /// `tools` is the registry subagents execute against; keep it to
    /// leaf tools (files, shell, web) so a subagent cannot spawn
    /// further subagents.
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        bus: Arc<MessageBus>,
        tools: Arc<ToolRegistry>,
        model: String,
    ) -> Self {
        Self {
            provider,
            bus,
            tools,
            model,
        }
    }

    /// Start a subagent for `task`, announcing back to the origin chat.
    ///
    /// Returns the subagent id immediately; the work happens on a
    /// background task.
    pub fn spawn(&self, task: String, label: String, origin_channel: String, origin_chat_id: String) -> String {
        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        info!(subagent = %id, label = %label, "spawning subagent");

        let provider = self.provider.clone();
        let bus = self.bus.clone();
        let tools = self.tools.clone();
        let model = self.model.clone();
        let announce_id = id.clone();

        tokio::spawn(async move {
            let result = run_subagent(provider, tools, model, &task).await;
            let announce = InboundMessage {
                channel: "system".into(),
                sender_id: format!("subagent:{announce_id}"),
                chat_id: format!("{origin_channel}:{origin_chat_id}"),
                content: format!("Subagent task '{label}' finished.\n\nResult:\n{result}"),
                timestamp: chrono::Utc::now(),
                media: Vec::new(),
                metadata: Default::default(),
            };
            if let Err(e) = bus.publish_inbound_async(announce).await {
                warn!(subagent = %announce_id, error = %e, "failed to announce subagent completion");
            }
        });

        id
    }
}

/// The subagent's own fixed-point loop: bounded, stateless, no
/// streaming.
async fn run_subagent(
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    model: String,
    task: &str,
) -> String {
    let mut messages = vec![
        ChatMessage::system(
            "You are a background subagent. Complete the assigned task using the \
             available tools, then reply with a concise result summary. Do not ask \
             questions; nobody will answer.",
        ),
        ChatMessage::user(task),
    ];

    for _ in 0..SUBAGENT_MAX_ITERATIONS {
        let request = ChatRequest {
            messages: messages.clone(),
            tools: tools.definitions(),
            tool_choice: None,
            model: model.clone(),
            max_tokens: 4096,
            temperature: 0.7,
            session_state: None,
        };
        let response = provider.chat(request, None).await;

        if response.finish_reason == "error" {
            return format!("Subagent failed: {}", response.content);
        }
        if !response.has_tool_calls() {
            return response.content;
        }

        let tool_call_values: Vec<serde_json::Value> = response
            .tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": serde_json::to_string(&tc.arguments).unwrap_or_default(),
                    }
                })
            })
            .collect();
        messages.push(ChatMessage {
            role: "assistant".into(),
            content: serde_json::Value::String(response.content.clone()),
            name: None,
            tool_call_id: None,
            tool_calls: Some(tool_call_values),
            reasoning_content: None,
        });

        for tc in &response.tool_calls {
            let result = tools.execute(&tc.name, tc.arguments.clone()).await;
            messages.push(ChatMessage::tool_result(&tc.id, &tc.name, result));
        }
    }

    "Subagent hit its iteration limit before finishing.".into()
}

/// Tool exposing subagent spawning to the model.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
    context: Mutex<Option<(String, String)>>,
}

impl SpawnTool {
    /// Create the tool over a manager.
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self {
            manager,
            context: Mutex::new(None),
        }
    }

    /// Point the tool at the current turn's channel and chat.
    pub fn set_context(&self, channel: &str, chat_id: &str) {
        *self.context.lock().unwrap() = Some((channel.to_string(), chat_id.to_string()));
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a background subagent for a long-running task. The subagent works \
         independently and reports back to this chat when done."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Full task description for the subagent"
                },
                "label": {
                    "type": "string",
                    "description": "Short label for progress reporting"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let task = args
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing required field: task".into()))?;
        let label = args
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or("background task")
            .to_string();

        let (channel, chat_id) = self
            .context
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ToolError::ExecutionFailed("no current conversation".into()))?;

        let id = self
            .manager
            .spawn(task.to_string(), label.clone(), channel, chat_id);
        Ok(format!(
            "Subagent {id} spawned for '{label}'. It will report back here when finished."
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ScriptedProvider {
        responses: Mutex<Vec<tern_llm::types::LLMResponse>>,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn default_model(&self) -> &str {
            "test-model"
        }
        async fn chat(
            &self,
            _request: ChatRequest,
            _delta_tx: Option<mpsc::Sender<String>>,
        ) -> tern_llm::types::LLMResponse {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                tern_llm::types::LLMResponse::error("exhausted")
            } else {
                responses.remove(0)
            }
        }
    }

    fn manager(responses: Vec<tern_llm::types::LLMResponse>) -> (Arc<MessageBus>, Arc<SubagentManager>) {
        let bus = Arc::new(MessageBus::new());
        let provider = Arc::new(ScriptedProvider {
            responses: Mutex::new(responses),
        });
        let manager = Arc::new(SubagentManager::new(
            provider,
            bus.clone(),
            Arc::new(ToolRegistry::new()),
            "test-model".into(),
        ));
        (bus, manager)
    }

    #[tokio::test]
    async fn subagent_announces_completion_to_origin() {
        let (bus, manager) = manager(vec![tern_llm::types::LLMResponse::text(
            "research complete",
        )]);
        manager.spawn(
            "research something".into(),
            "research".into(),
            "web".into(),
            "chat7".into(),
        );

        let announce = bus.consume_inbound().await.unwrap();
        assert_eq!(announce.channel, "system");
        assert_eq!(announce.chat_id, "web:chat7");
        assert!(announce.sender_id.starts_with("subagent:"));
        assert!(announce.content.contains("research complete"));
        assert!(announce.content.contains("'research' finished"));
    }

    #[tokio::test]
    async fn spawn_tool_requires_context() {
        let (_bus, manager) = manager(vec![]);
        let tool = SpawnTool::new(manager);
        let err = tool
            .execute(json!({"task": "do a thing"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn spawn_tool_returns_id_immediately() {
        let (bus, manager) = manager(vec![tern_llm::types::LLMResponse::text("done")]);
        let tool = SpawnTool::new(manager);
        tool.set_context("cli", "direct");
        let result = tool
            .execute(json!({"task": "long job", "label": "digger"}))
            .await
            .unwrap();
        assert!(result.contains("spawned for 'digger'"));

        // The background task still announces.
        let announce = bus.consume_inbound().await.unwrap();
        assert_eq!(announce.chat_id, "cli:direct");
    }

    #[tokio::test]
    async fn provider_error_is_reported_in_announce() {
        let (bus, manager) = manager(vec![tern_llm::types::LLMResponse::error("model offline")]);
        manager.spawn("task".into(), "x".into(), "web".into(), "c".into());
        let announce = bus.consume_inbound().await.unwrap();
        assert!(announce.content.contains("Subagent failed: model offline"));
    }
}
