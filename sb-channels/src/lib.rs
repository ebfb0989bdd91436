//! Channel boundary for salonbot.
//!
//! Adapters are pure I/O: they convert platform messages to/from
//! `InboundMessage` / `OutboundMessage`. Conversation identity lives in
//! [`ConversationKey`].

mod key;
mod log;
mod traits;
mod types;
mod whatsapp;

pub use key::{ConversationKey, NumberingPlan, normalize_subscriber};
pub use log::LogChannelAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, InboundMessage, InboundMessageKind, MessageId, OutboundMessage, SenderId,
    SubscriberId, TenantId,
};
pub use whatsapp::WhatsAppCloudAdapter;
