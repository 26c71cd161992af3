/// Collaborator interfaces the store consumes
///
/// The backend (REST for commands, bulk pull for history) sits behind these
/// traits; transport details are up to the implementation.
use crate::error::Result;
use crate::message::{ProvisionalId, ServerId, ServerMessage};
use async_trait::async_trait;

/// Bulk pull of all messages visible to the local user
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<ServerMessage>>;
}

/// Outgoing commands.
///
/// Implementations report failures as `SyncError::Network`,
/// `SyncError::Validation`, `SyncError::Server` or `SyncError::NotFound`.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send one message. `provisional_id` should be echoed back on the
    /// realtime push of the same message so the sender can match it.
    async fn send(
        &self,
        peer_id: &str,
        content: &str,
        provisional_id: ProvisionalId,
    ) -> Result<ServerMessage>;

    async fn delete(&self, id: ServerId) -> Result<()>;

    /// Delete every message exchanged with `peer_id`
    async fn clear_conversation(&self, peer_id: &str) -> Result<()>;

    /// Confirm a batch of read messages in one call
    async fn mark_read(&self, ids: &[ServerId]) -> Result<()>;

    /// Tell `peer_id` the local user is typing (`user:typing`)
    async fn notify_typing(&self, _peer_id: &str) -> Result<()> {
        Ok(())
    }

    /// Tell `peer_id` the local user stopped typing (`user:stop_typing`)
    async fn notify_stop_typing(&self, _peer_id: &str) -> Result<()> {
        Ok(())
    }
}
