/// WireWave - client-side message sync engine
///
/// Keeps a local view of direct-message conversations consistent with a
/// backend while sends are optimistic, read receipts are batched and
/// realtime pushes race with periodic fetches.

pub mod error;
pub mod config;
pub mod message;
pub mod conversation;
pub mod message_log;
pub mod send_tracker;
pub mod read_receipts;
pub mod typing;
pub mod messenger_types;
pub mod contacts;
pub mod api;
pub mod realtime;
pub mod store;
pub mod memory_backend;

pub use error::{Result, SyncError};
pub use config::Config;
pub use conversation::ConversationKey;
pub use message::{Message, MessageId, MessageSource, ProvisionalId, ServerId, ServerMessage};
pub use messenger_types::{ConnectionState, ConversationSummary, Profile, StoreEvent, StoreSnapshot};
pub use store::{spawn_poller, ConversationStore};
