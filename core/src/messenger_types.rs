/// Shared types for the UI-facing layer of the store
use crate::message::{Message, ServerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Profile data the UI attaches to a contact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: Option<String>,
    pub about: Option<String>,
    pub avatar_url: Option<String>,
}

/// Summary of one conversation thread (for the contact list).
///
/// Derived from the message log on every mutation; never edited directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// The other party's user id
    pub peer_id: String,
    /// Profile name if known, otherwise derived from the id
    pub display_name: String,
    pub initials: String,
    pub last_message: Message,
    pub last_message_at: DateTime<Utc>,
    /// Inbound messages from the peer not yet read
    pub unread_count: usize,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

/// Realtime link status as seen by the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    /// Waiting before reconnect attempt `attempt`
    Reconnecting { attempt: u32 },
    /// Reconnects gave up; only the poller keeps the store fresh
    PollingOnly,
}

/// Change notifications broadcast to observers.
///
/// Emitted only after derived summaries have been recomputed, so a reader
/// reacting to an event always sees log and summaries in agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// Entries of one conversation changed
    MessagesChanged { peer_id: String, revision: u64 },
    /// The summary list changed without a single owning conversation (bulk fetch)
    ConversationsChanged { revision: u64 },
    TypingChanged { peer_id: String, typing: bool },
    PresenceChanged { peer_id: String, online: bool },
    /// A send was rolled back
    SendFailed { peer_id: String, content: String, reason: String },
    /// A read batch was reverted to unread
    ReadSyncFailed { ids: Vec<ServerId>, reason: String },
    ConnectionChanged { connection: ConnectionState },
}

/// Consistent view of summaries plus one conversation, taken under one lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub conversations: Vec<ConversationSummary>,
    pub peer_id: Option<String>,
    pub messages: Vec<Message>,
    pub typing: bool,
}
