//! Streaming delta buffering for outbound channels.
//!
//! Text deltas from the provider are buffered and flushed to the bus as
//! streaming chunks once both thresholds are met: buffered characters
//! and elapsed time since the last flush. The terminating chunk carries
//! `final = true`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tern_types::event::OutboundMessage;

use crate::bus::MessageBus;

/// Accumulates streaming deltas for one provider call.
pub struct StreamState {
    bus: Arc<MessageBus>,
    channel: String,
    chat_id: String,
    base_metadata: HashMap<String, serde_json::Value>,
    min_chars: usize,
    min_interval_s: f64,
    buffer: String,
    /// Whether any chunk has been flushed to the bus.
    pub sent_any: bool,
    last_flush: Option<Instant>,
    stream_id: String,
}

impl StreamState {
    /// Create a stream state for one call.
    pub fn new(
        bus: Arc<MessageBus>,
        channel: &str,
        chat_id: &str,
        base_metadata: &HashMap<String, serde_json::Value>,
        min_chars: usize,
        min_interval_s: f64,
    ) -> Self {
        let stamp = chrono::Utc::now().timestamp_millis();
        Self {
            bus,
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            base_metadata: base_metadata.clone(),
            min_chars,
            min_interval_s,
            buffer: String::new(),
            sent_any: false,
            last_flush: None,
            stream_id: format!("{channel}:{chat_id}:{stamp}"),
        }
    }

    /// Buffer a delta, flushing when both thresholds are met.
    pub async fn on_delta(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.buffer.push_str(delta);
        let elapsed_ok = match self.last_flush {
            None => true,
            Some(at) => at.elapsed().as_secs_f64() >= self.min_interval_s,
        };
        if self.buffer.len() >= self.min_chars && elapsed_ok {
            self.flush(false).await;
        }
    }

    /// Flush the buffer as one streaming chunk. A `final_chunk` flush of
    /// an empty buffer is a no-op, matching the suppressed-duplicate
    /// contract (nothing buffered means nothing left to terminate).
    pub async fn flush(&mut self, final_chunk: bool) {
        if self.buffer.is_empty() {
            return;
        }
        let mut msg = OutboundMessage {
            channel: self.channel.clone(),
            chat_id: self.chat_id.clone(),
            content: std::mem::take(&mut self.buffer),
            reply_to: None,
            media: Vec::new(),
            metadata: self.base_metadata.clone(),
        };
        msg.mark_stream(&self.stream_id, final_chunk);
        let _ = self.bus.publish_outbound_async(msg).await;
        self.sent_any = true;
        self.last_flush = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(bus: Arc<MessageBus>, min_chars: usize) -> StreamState {
        StreamState::new(bus, "web", "c1", &HashMap::new(), min_chars, 0.0)
    }

    #[tokio::test]
    async fn small_deltas_buffer_until_threshold() {
        let bus = Arc::new(MessageBus::new());
        let mut s = state(bus.clone(), 10);
        s.on_delta("abc").await;
        s.on_delta("def").await;
        assert_eq!(bus.outbound_len(), 0);
        s.on_delta("ghijk").await;
        assert_eq!(bus.outbound_len(), 1);

        let chunk = bus.consume_outbound().await.unwrap();
        assert_eq!(chunk.content, "abcdefghijk");
        assert_eq!(chunk.metadata["stream"], serde_json::json!(true));
        assert_eq!(chunk.metadata["final"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn final_flush_marks_terminal_chunk() {
        let bus = Arc::new(MessageBus::new());
        let mut s = state(bus.clone(), 1000);
        s.on_delta("partial answer").await;
        assert!(!s.sent_any);
        s.flush(true).await;
        assert!(s.sent_any);

        let chunk = bus.consume_outbound().await.unwrap();
        assert_eq!(chunk.content, "partial answer");
        assert_eq!(chunk.metadata["final"], serde_json::json!(true));
        assert!(chunk.metadata["stream_id"]
            .as_str()
            .unwrap()
            .starts_with("web:c1:"));
    }

    #[tokio::test]
    async fn empty_flush_is_noop() {
        let bus = Arc::new(MessageBus::new());
        let mut s = state(bus.clone(), 10);
        s.flush(true).await;
        assert!(!s.sent_any);
        assert_eq!(bus.outbound_len(), 0);
    }
}
