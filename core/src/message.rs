/// Message representation shared by the log, the send tracker and the wire codec
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned message id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally generated id for a send that the server has not confirmed yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisionalId(pub Uuid);

impl ProvisionalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProvisionalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Identity of a log entry.
///
/// Ordering puts confirmed ids before provisional ones so that a pending send
/// sharing a timestamp with server data sorts after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    Confirmed(ServerId),
    Provisional(ProvisionalId),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Confirmed(id) => write!(f, "{}", id),
            MessageId::Provisional(id) => write!(f, "{}", id),
        }
    }
}

/// Which path delivered the current copy of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    /// Bulk pull from the fetcher
    Fetch,
    /// Realtime channel push
    Push,
    /// Response to our own send request
    SendResponse,
    /// Optimistic local entry
    Local,
}

/// Message as the backend returns it (fetch, send response, push payload)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: ServerId,
    #[serde(alias = "sender_email", alias = "senderId")]
    pub sender_id: String,
    #[serde(alias = "receiver_email", alias = "receiverId")]
    pub receiver_id: String,
    pub content: String,
    #[serde(alias = "sentAt")]
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    /// Echo of the provisional id the sender attached to the request
    #[serde(
        default,
        alias = "clientProvisionalId",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_provisional_id: Option<ProvisionalId>,
}

/// One entry of the conversation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
    pub source: MessageSource,
}

impl Message {
    /// Authoritative entry built from a server payload
    pub fn confirmed(msg: ServerMessage, source: MessageSource) -> Self {
        Self {
            id: MessageId::Confirmed(msg.id),
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            content: msg.content,
            sent_at: msg.sent_at,
            read: msg.read,
            source,
        }
    }

    /// Optimistic entry for a send in flight
    pub fn provisional(
        id: ProvisionalId,
        sender_id: String,
        receiver_id: String,
        content: String,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::Provisional(id),
            sender_id,
            receiver_id,
            content,
            sent_at,
            read: false,
            source: MessageSource::Local,
        }
    }

    pub fn server_id(&self) -> Option<ServerId> {
        match self.id {
            MessageId::Confirmed(id) => Some(id),
            MessageId::Provisional(_) => None,
        }
    }

    pub fn provisional_id(&self) -> Option<ProvisionalId> {
        match self.id {
            MessageId::Provisional(id) => Some(id),
            MessageId::Confirmed(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.id, MessageId::Provisional(_))
    }

    /// Total order inside a conversation
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.sent_at, self.id)
    }
}
