//! Channel adapters for agentbridge.
//!
//! Adapters are pure I/O: they convert platform updates to/from
//! `InboundMessage` / `OutboundMessage`.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    ActionButton, Attachment, ChannelId, ConversationId, InboundMessage, InboundMessageKind,
    MessageId, OutboundMessage, SenderId,
};
