//! Message bus for async channel-agent communication.
//!
//! Two bounded MPSC queues decouple chat channels from the agent core:
//! channels publish to the inbound queue, the agent consumes it and
//! publishes responses to the outbound queue. A dispatcher task fans
//! outbound messages to per-channel subscriber callbacks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tern_types::error::TernError;
use tern_types::event::{InboundMessage, OutboundMessage};

/// Default capacity of the bounded queues.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Async callback a channel registers for its outbound messages.
pub type OutboundCallback = Arc<
    dyn Fn(OutboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// In-process message bus.
///
/// Enqueue operations stamp `metadata._enqueued_at` (unix millis) for
/// latency tracing. Within one channel the dispatcher is sequential; no
/// ordering is guaranteed across channels.
pub struct MessageBus {
    inbound_tx: tokio::sync::mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<tokio::sync::mpsc::Receiver<InboundMessage>>,
    outbound_tx: tokio::sync::mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<tokio::sync::mpsc::Receiver<OutboundMessage>>,
    subscribers: Mutex<HashMap<String, Vec<OutboundCallback>>>,
}

impl MessageBus {
    /// Create a bus with the default queue capacity (1024).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with a custom queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(capacity);
        debug!(capacity, "message bus created");
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn stamp_enqueued(metadata: &mut HashMap<String, serde_json::Value>) {
        metadata.entry("_enqueued_at".into()).or_insert_with(|| {
            serde_json::json!(chrono::Utc::now().timestamp_millis())
        });
    }

    /// Publish an inbound message without waiting.
    ///
    /// Fails when the queue is full (backpressure) or closed.
    pub fn publish_inbound(&self, mut msg: InboundMessage) -> Result<(), TernError> {
        Self::stamp_enqueued(&mut msg.metadata);
        debug!(channel = %msg.channel, chat_id = %msg.chat_id, "publishing inbound message");
        self.inbound_tx.try_send(msg).map_err(|e| match e {
            tokio::sync::mpsc::error::TrySendError::Full(_) => {
                TernError::Channel("inbound queue full (backpressure)".into())
            }
            tokio::sync::mpsc::error::TrySendError::Closed(_) => {
                TernError::Channel("inbound queue closed".into())
            }
        })
    }

    /// Publish an inbound message, waiting if the queue is full.
    pub async fn publish_inbound_async(&self, mut msg: InboundMessage) -> Result<(), TernError> {
        Self::stamp_enqueued(&mut msg.metadata);
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|e| TernError::Channel(format!("inbound queue closed: {e}")))
    }

    /// Consume the next inbound message.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    /// Publish an outbound message without waiting.
    pub fn publish_outbound(&self, mut msg: OutboundMessage) -> Result<(), TernError> {
        Self::stamp_enqueued(&mut msg.metadata);
        debug!(channel = %msg.channel, chat_id = %msg.chat_id, "publishing outbound message");
        self.outbound_tx.try_send(msg).map_err(|e| match e {
            tokio::sync::mpsc::error::TrySendError::Full(_) => {
                TernError::Channel("outbound queue full (backpressure)".into())
            }
            tokio::sync::mpsc::error::TrySendError::Closed(_) => {
                TernError::Channel("outbound queue closed".into())
            }
        })
    }

    /// Publish an outbound message, waiting if the queue is full.
    pub async fn publish_outbound_async(&self, mut msg: OutboundMessage) -> Result<(), TernError> {
        Self::stamp_enqueued(&mut msg.metadata);
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|e| TernError::Channel(format!("outbound queue closed: {e}")))
    }

    /// Consume the next outbound message.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        rx.recv().await
    }

    /// Pending inbound messages.
    pub fn inbound_len(&self) -> usize {
        self.inbound_tx.max_capacity() - self.inbound_tx.capacity()
    }

    /// Pending outbound messages.
    pub fn outbound_len(&self) -> usize {
        self.outbound_tx.max_capacity() - self.outbound_tx.capacity()
    }

    /// Cloneable sender for channel adapters.
    pub fn inbound_sender(&self) -> tokio::sync::mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Register a callback for outbound messages targeting `channel`.
    pub async fn subscribe_outbound(&self, channel: &str, callback: OutboundCallback) {
        let mut subs = self.subscribers.lock().await;
        let entry = subs.entry(channel.to_string()).or_default();
        entry.push(callback);
        debug!(channel, subscribers = entry.len(), "bus subscriber added");
    }

    /// Dispatch outbound messages to subscribers until cancelled.
    ///
    /// Run this as a background task. Subscriber failures are logged and
    /// skipped; messages flagged `_suppress_outbound` are dropped here.
    pub async fn run_dispatcher(&self, cancel: CancellationToken) {
        info!("bus outbound dispatcher started");
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("bus outbound dispatcher stopping");
                    break;
                }
                msg = self.consume_outbound() => msg,
            };
            let Some(msg) = msg else {
                info!("outbound queue closed, dispatcher exiting");
                break;
            };
            if msg.is_suppressed() {
                debug!(channel = %msg.channel, "skipping suppressed outbound message");
                continue;
            }
            let callbacks = {
                let subs = self.subscribers.lock().await;
                subs.get(&msg.channel).cloned().unwrap_or_default()
            };
            debug!(
                channel = %msg.channel,
                subscribers = callbacks.len(),
                "dispatching outbound message"
            );
            for callback in callbacks {
                // A panicking subscriber would take the dispatcher down;
                // isolate each callback in its own task and join it.
                let msg_clone = msg.clone();
                let handle = tokio::spawn(async move { callback(msg_clone).await });
                if let Err(e) = handle.await {
                    error!(channel = %msg.channel, error = %e, "outbound subscriber failed");
                }
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_inbound(content: &str) -> InboundMessage {
        InboundMessage::new("test", "user1", "chat1", content)
    }

    fn make_outbound(content: &str) -> OutboundMessage {
        OutboundMessage::new("test", "chat1", content)
    }

    #[tokio::test]
    async fn publish_and_consume_inbound() {
        let bus = MessageBus::new();
        bus.publish_inbound(make_inbound("hello")).unwrap();
        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.content, "hello");
        assert!(received.metadata.contains_key("_enqueued_at"));
    }

    #[tokio::test]
    async fn messages_preserve_order() {
        let bus = MessageBus::new();
        for i in 0..5 {
            bus.publish_outbound(make_outbound(&format!("out-{i}"))).unwrap();
        }
        assert_eq!(bus.outbound_len(), 5);
        for i in 0..5 {
            let msg = bus.consume_outbound().await.unwrap();
            assert_eq!(msg.content, format!("out-{i}"));
        }
        assert_eq!(bus.outbound_len(), 0);
    }

    #[tokio::test]
    async fn capacity_backpressure_rejects() {
        let bus = MessageBus::with_capacity(2);
        bus.publish_inbound(make_inbound("a")).unwrap();
        bus.publish_inbound(make_inbound("b")).unwrap();
        let err = bus.publish_inbound(make_inbound("c")).unwrap_err();
        assert!(err.to_string().contains("backpressure"));
    }

    #[tokio::test]
    async fn async_publish_waits_for_space() {
        let bus = Arc::new(MessageBus::with_capacity(1));
        bus.publish_inbound(make_inbound("a")).unwrap();

        let bus_producer = bus.clone();
        let producer = tokio::spawn(async move {
            bus_producer
                .publish_inbound_async(make_inbound("b"))
                .await
                .unwrap();
        });

        tokio::task::yield_now().await;
        assert_eq!(bus.consume_inbound().await.unwrap().content, "a");
        producer.await.unwrap();
        assert_eq!(bus.consume_inbound().await.unwrap().content, "b");
    }

    #[tokio::test]
    async fn dispatcher_fans_out_to_channel_subscribers() {
        let bus = Arc::new(MessageBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        bus.subscribe_outbound(
            "test",
            Arc::new(move |msg| {
                let count = count_clone.clone();
                Box::pin(async move {
                    assert_eq!(msg.content, "broadcast");
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        // Subscriber for another channel must not fire.
        let other = Arc::new(AtomicUsize::new(0));
        let other_clone = other.clone();
        bus.subscribe_outbound(
            "web",
            Arc::new(move |_msg| {
                let other = other_clone.clone();
                Box::pin(async move {
                    other.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        let cancel = CancellationToken::new();
        let dispatcher_bus = bus.clone();
        let dispatcher_cancel = cancel.clone();
        let dispatcher =
            tokio::spawn(async move { dispatcher_bus.run_dispatcher(dispatcher_cancel).await });

        bus.publish_outbound(make_outbound("broadcast")).unwrap();

        // Give the dispatcher a moment to deliver.
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        dispatcher.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatcher_skips_failing_subscriber() {
        let bus = Arc::new(MessageBus::new());
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe_outbound(
            "test",
            Arc::new(|_msg| Box::pin(async { panic!("subscriber blew up") })),
        )
        .await;
        let delivered_clone = delivered.clone();
        bus.subscribe_outbound(
            "test",
            Arc::new(move |_msg| {
                let delivered = delivered_clone.clone();
                Box::pin(async move {
                    delivered.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        let cancel = CancellationToken::new();
        let dispatcher_bus = bus.clone();
        let dispatcher_cancel = cancel.clone();
        let dispatcher =
            tokio::spawn(async move { dispatcher_bus.run_dispatcher(dispatcher_cancel).await });

        bus.publish_outbound(make_outbound("x")).unwrap();
        for _ in 0..50 {
            if delivered.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        dispatcher.await.unwrap();

        // The second subscriber still got the message.
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatcher_drops_suppressed_messages() {
        let bus = Arc::new(MessageBus::new());
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = delivered.clone();
        bus.subscribe_outbound(
            "test",
            Arc::new(move |_msg| {
                let delivered = delivered_clone.clone();
                Box::pin(async move {
                    delivered.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        let cancel = CancellationToken::new();
        let dispatcher_bus = bus.clone();
        let dispatcher_cancel = cancel.clone();
        let dispatcher =
            tokio::spawn(async move { dispatcher_bus.run_dispatcher(dispatcher_cancel).await });

        let mut suppressed = make_outbound("hidden");
        suppressed.metadata.insert(
            tern_types::event::SUPPRESS_OUTBOUND_META.into(),
            serde_json::json!(true),
        );
        bus.publish_outbound(suppressed).unwrap();
        bus.publish_outbound(make_outbound("visible")).unwrap();

        for _ in 0..50 {
            if delivered.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        dispatcher.await.unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn message_bus_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MessageBus>();
    }
}
