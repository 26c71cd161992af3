/// Error types for the conversation sync engine
use crate::message::ServerId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Bad local input; never reaches the network
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limited: retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A send that was rolled back. Carries the input so the caller can retry.
    #[error("Failed to send message to {peer_id}: {source}")]
    SendFailed {
        peer_id: String,
        content: String,
        retry_count: u32,
        #[source]
        source: Box<SyncError>,
    },

    /// A read-receipt batch that was reverted to unread
    #[error("Failed to mark {} message(s) read: {source}", ids.len())]
    ReadSyncFailed {
        ids: Vec<ServerId>,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Whether re-invoking the same command may succeed without user action
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::RateLimited { .. } => true,
            SyncError::SendFailed { source, .. } | SyncError::ReadSyncFailed { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
