//! Message event types for the channel bus.
//!
//! [`InboundMessage`] represents user input arriving from a channel,
//! [`OutboundMessage`] represents agent responses heading back out.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key a channel may set to pin an exact session key
/// (including a `#timestamp` suffix), bypassing the active-pointer index.
pub const SESSION_KEY_META: &str = "session_key";

/// Metadata key marking a control reply that was already delivered by
/// another path; the dispatcher skips messages carrying it.
pub const SUPPRESS_OUTBOUND_META: &str = "_suppress_outbound";

/// An inbound message received from a chat channel.
///
/// Carries the raw user input plus channel-specific metadata. Use
/// [`session_key`](InboundMessage::session_key) to derive the session
/// identifier: a `metadata.session_key` pin wins, otherwise the stable
/// `"{channel}:{chat_id}"` base key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel name (e.g. "cli", "web", "feishu").
    pub channel: String,

    /// Sender identifier within the channel.
    pub sender_id: String,

    /// Chat / conversation identifier within the channel.
    pub chat_id: String,

    /// Message text content.
    pub content: String,

    /// When the message was received.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Local paths or URLs for attached media.
    #[serde(default)]
    pub media: Vec<String>,

    /// Arbitrary channel-specific metadata (`trace_id`, `session_key`, ...).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    /// Create a bare message with empty media and metadata.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Session key for this message: the `metadata.session_key` pin when
    /// present, otherwise `"{channel}:{chat_id}"`.
    pub fn session_key(&self) -> String {
        if let Some(pinned) = self
            .metadata
            .get(SESSION_KEY_META)
            .and_then(|v| v.as_str())
        {
            if !pinned.is_empty() {
                return pinned.to_string();
            }
        }
        format!("{}:{}", self.channel, self.chat_id)
    }

    /// Trace id from metadata, if the channel assigned one.
    pub fn trace_id(&self) -> Option<&str> {
        self.metadata.get("trace_id").and_then(|v| v.as_str())
    }
}

/// An outbound message to send to a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Target channel name.
    pub channel: String,

    /// Target chat / conversation identifier.
    pub chat_id: String,

    /// Message text content.
    pub content: String,

    /// Optional message ID to reply to.
    #[serde(default)]
    pub reply_to: Option<String>,

    /// Local paths or URLs for attached media.
    #[serde(default)]
    pub media: Vec<String>,

    /// Arbitrary metadata (trace id, stream markers, timing stats).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    /// Create a text-only outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Mark this message as a streaming delta chunk.
    ///
    /// Sets `metadata.stream = true`, the stream id, and the `final` flag
    /// that distinguishes the terminating chunk.
    pub fn mark_stream(&mut self, stream_id: &str, final_chunk: bool) {
        self.metadata
            .insert("stream".into(), serde_json::Value::Bool(true));
        self.metadata
            .insert("stream_id".into(), serde_json::Value::String(stream_id.into()));
        self.metadata
            .insert("final".into(), serde_json::Value::Bool(final_chunk));
    }

    /// Whether the dispatcher should skip delivering this message.
    pub fn is_suppressed(&self) -> bool {
        self.metadata
            .get(SUPPRESS_OUTBOUND_META)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
