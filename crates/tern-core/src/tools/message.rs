//! Message tool: lets the agent send messages (with attachments)
//! through the bus mid-turn.
//!
//! The loop points the tool at the current channel/chat before each
//! turn; explicit `channel`/`chat_id` arguments override that. Every
//! send is recorded so the loop can persist the messages into the
//! session and suppress a redundant final text ack.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use tern_types::event::OutboundMessage;

use crate::bus::MessageBus;
use crate::tools::registry::{Tool, ToolError};

/// A message the tool sent during the current turn.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Text content.
    pub content: String,
    /// Media paths/URLs attached.
    pub media: Vec<String>,
}

/// Tool for sending messages through the message bus.
pub struct MessageTool {
    bus: Arc<MessageBus>,
    context: Mutex<Option<(String, String)>>,
    sent: Mutex<Vec<SentMessage>>,
}

impl MessageTool {
    /// Create a message tool backed by the given bus.
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            context: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Point the tool at the current turn's channel and chat.
    pub fn set_context(&self, channel: &str, chat_id: &str) {
        *self.context.lock().unwrap() = Some((channel.to_string(), chat_id.to_string()));
    }

    /// Take the messages sent during this turn, clearing the record.
    pub fn drain_sent_messages(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user's chat. Use the media field to deliver files or images \
         (local paths or URLs). Optional channel/chat_id target another conversation."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Message text to send"
                },
                "media": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Local file paths or URLs to attach"
                },
                "channel": {
                    "type": "string",
                    "description": "Target channel (defaults to the current conversation)"
                },
                "chat_id": {
                    "type": "string",
                    "description": "Target chat ID (defaults to the current conversation)"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing required field: content".into()))?;

        let media: Vec<String> = args
            .get("media")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let (channel, chat_id) = match (
            args.get("channel").and_then(|v| v.as_str()),
            args.get("chat_id").and_then(|v| v.as_str()),
        ) {
            (Some(channel), Some(chat_id)) => (channel.to_string(), chat_id.to_string()),
            _ => self
                .context
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| {
                    ToolError::InvalidArgs(
                        "no current conversation; pass channel and chat_id".into(),
                    )
                })?,
        };

        debug!(
            channel = %channel,
            chat_id = %chat_id,
            media = media.len(),
            "sending message via tool"
        );

        let outbound = OutboundMessage {
            channel: channel.clone(),
            chat_id: chat_id.clone(),
            content: content.to_string(),
            reply_to: None,
            media: media.clone(),
            metadata: Default::default(),
        };
        self.bus
            .publish_outbound(outbound)
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to send message: {e}")))?;

        self.sent.lock().unwrap().push(SentMessage {
            content: content.to_string(),
            media: media.clone(),
        });

        if media.is_empty() {
            Ok(format!("Message sent to {channel}:{chat_id}"))
        } else {
            Ok(format!(
                "Message with {} attachment(s) sent to {channel}:{chat_id}",
                media.len()
            ))
        }
    }
}
