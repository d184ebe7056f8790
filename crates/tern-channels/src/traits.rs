//! Channel adapter contract.
//!
//! A channel translates external events into [`InboundMessage`]s
//! published on the bus, and delivers [`OutboundMessage`]s back to its
//! transport. The host drives the lifecycle:
//!
//! 1. `start` runs long-lived until the [`CancellationToken`] fires.
//! 2. The bus dispatcher calls [`send`](Channel::send) for each
//!    outbound message targeting the channel.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tern_types::error::ChannelError;
use tern_types::event::OutboundMessage;

/// The trait every channel adapter implements.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique channel identifier (e.g. "cli", "web").
    fn name(&self) -> &str;

    /// Whether a sender may interact with this channel. Empty
    /// allow-lists mean everyone.
    fn is_allowed(&self, _sender_id: &str) -> bool {
        true
    }

    /// Start receiving messages; runs until `cancel` fires.
    async fn start(&self, cancel: CancellationToken) -> Result<(), ChannelError>;

    /// Deliver an outbound message through this channel.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;
}

/// Session-key forms channels use when publishing inbound messages.
///
/// - group chats: `"<channel>:group:<groupId>"`
/// - direct chats: `"<channel>:p2p:<stableUserId>"`
/// - web sessions pin the exact active key (`"web:<chatId>:<name>#<ts>"`)
///   in `metadata.session_key` so no active-pointer lookup races the
///   turn.
pub mod session_key {
    /// Group-chat base key.
    pub fn group(channel: &str, group_id: &str) -> String {
        format!("{channel}:group:{group_id}")
    }

    /// Direct-chat base key.
    pub fn p2p(channel: &str, user_id: &str) -> String {
        format!("{channel}:p2p:{user_id}")
    }

    /// Pinned web session key including the timestamp suffix.
    pub fn web(chat_id: &str, session_name: &str, stamp: &str) -> String {
        format!("web:{chat_id}:{session_name}#{stamp}")
    }
}
