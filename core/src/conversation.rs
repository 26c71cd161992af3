/// Conversation keys: the unordered pair {local user, peer}
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical key for a direct conversation.
///
/// Both members are stored sorted so `(a, b)` and `(b, a)` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    low: String,
    high: String,
}

impl ConversationKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                low: a.to_string(),
                high: b.to_string(),
            }
        } else {
            Self {
                low: b.to_string(),
                high: a.to_string(),
            }
        }
    }

    /// Key of the conversation a message belongs to
    pub fn for_message(msg: &Message) -> Self {
        Self::new(&msg.sender_id, &msg.receiver_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The member that is not `local_user_id`.
    ///
    /// Returns `None` when the local user is not a member. A note-to-self
    /// conversation yields the local user.
    pub fn peer_of(&self, local_user_id: &str) -> Option<&str> {
        if self.low == local_user_id {
            Some(&self.high)
        } else if self.high == local_user_id {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dm:{}:{}", self.low, self.high)
    }
}
