//! Local CLI channel: stdin in, stdout out.
//!
//! Reads lines from stdin and publishes them as inbound messages; the
//! agent's replies are printed. The loop never streams to this channel,
//! so every reply arrives as one message.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tern_core::bus::MessageBus;
use tern_types::error::ChannelError;
use tern_types::event::{InboundMessage, OutboundMessage};

use crate::traits::Channel;

/// Chat id used for the single local conversation.
const CLI_CHAT_ID: &str = "direct";

/// The local terminal channel.
pub struct CliChannel {
    bus: Arc<MessageBus>,
}

impl CliChannel {
    /// Create the channel over the shared bus.
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), ChannelError> {
        info!("cli channel started, reading stdin");
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return Err(ChannelError::ReceiveFailed(e.to_string())),
            };
            let content = line.trim();
            if content.is_empty() {
                continue;
            }
            debug!(content, "cli inbound line");
            let msg = InboundMessage::new("cli", "user", CLI_CHAT_ID, content);
            self.bus
                .publish_inbound_async(msg)
                .await
                .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        }

        info!("cli channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        println!("{}", msg.content);
        for media in &msg.media {
            println!("[attachment] {media}");
        }
        Ok(())
    }
}
