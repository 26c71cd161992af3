/// In-memory backend implementing the collaborator traits
///
/// Plays the server side for the console client and for tests: assigns ids,
/// keeps history, echoes sends over a realtime channel and can be switched
/// offline or told to fail.
use crate::api::{MessageFetcher, MessageSender};
use crate::error::{Result, SyncError};
use crate::message::{ProvisionalId, ServerId, ServerMessage};
use crate::realtime::{self, MpscChannel, RealtimeConnector, RealtimeEvent};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Failure injected into the next send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Network,
    Server,
    Validation,
}

/// Calls received, per command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch: u64,
    pub send: u64,
    pub delete: u64,
    pub clear: u64,
    pub mark_read: u64,
    pub connect: u64,
    pub typing_notices: u64,
}

#[derive(Default)]
struct ServerState {
    next_id: u64,
    messages: BTreeMap<ServerId, ServerMessage>,
    offline: bool,
    fail_next_send: Option<FailMode>,
    fail_mark_read: bool,
    latency: Duration,
    calls: CallCounts,
}

pub struct MemoryBackend {
    user_id: String,
    state: Mutex<ServerState>,
    push: Mutex<Option<mpsc::Sender<RealtimeEvent>>>,
}

impl MemoryBackend {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            state: Mutex::new(ServerState {
                next_id: 1,
                ..Default::default()
            }),
            push: Mutex::new(None),
        }
    }

    /// Echo sends and deliveries to `push`
    pub fn with_push(mut self, push: mpsc::Sender<RealtimeEvent>) -> Self {
        self.push = Mutex::new(Some(push));
        self
    }

    /// Drop the current push link, closing the client's channel
    pub async fn disconnect_push(&self) -> bool {
        self.push.lock().await.take().is_some()
    }

    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    pub async fn fail_next_send(&self, mode: FailMode) {
        self.state.lock().await.fail_next_send = Some(mode);
    }

    pub async fn fail_mark_read(&self, fail: bool) {
        self.state.lock().await.fail_mark_read = fail;
    }

    /// Delay applied to every send and read receipt
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    pub async fn stored(&self, id: ServerId) -> Option<ServerMessage> {
        self.state.lock().await.messages.get(&id).cloned()
    }

    /// A peer sends a message to the local user
    pub async fn deliver(&self, from: &str, content: &str) -> ServerMessage {
        let msg = {
            let mut st = self.state.lock().await;
            let id = ServerId(st.next_id);
            st.next_id += 1;
            let msg = ServerMessage {
                id,
                sender_id: from.to_string(),
                receiver_id: self.user_id.clone(),
                content: content.to_string(),
                sent_at: Utc::now(),
                read: false,
                client_provisional_id: None,
            };
            st.messages.insert(id, msg.clone());
            msg
        };
        self.publish(RealtimeEvent::NewMessage(msg.clone())).await;
        msg
    }

    /// Best-effort push; a full or closed channel drops the event
    async fn publish(&self, event: RealtimeEvent) {
        if let Some(push) = self.push.lock().await.as_ref() {
            if let Err(e) = push.try_send(event) {
                debug!("Realtime push skipped: {}", e);
            }
        }
    }

    async fn latency(&self) -> Duration {
        self.state.lock().await.latency
    }

    async fn typing_notice(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.offline {
            return Err(SyncError::Network("backend unreachable".to_string()));
        }
        st.calls.typing_notices += 1;
        Ok(())
    }

    fn involves_user(&self, msg: &ServerMessage) -> bool {
        msg.sender_id == self.user_id || msg.receiver_id == self.user_id
    }
}

#[async_trait]
impl MessageFetcher for MemoryBackend {
    async fn fetch_all(&self) -> Result<Vec<ServerMessage>> {
        let mut st = self.state.lock().await;
        st.calls.fetch += 1;
        if st.offline {
            return Err(SyncError::Network("backend unreachable".to_string()));
        }
        Ok(st
            .messages
            .values()
            .filter(|m| self.involves_user(m))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageSender for MemoryBackend {
    async fn send(
        &self,
        peer_id: &str,
        content: &str,
        provisional_id: ProvisionalId,
    ) -> Result<ServerMessage> {
        let latency = {
            let mut st = self.state.lock().await;
            st.calls.send += 1;
            st.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let msg = {
            let mut st = self.state.lock().await;
            if st.offline {
                return Err(SyncError::Network("backend unreachable".to_string()));
            }
            match st.fail_next_send.take() {
                Some(FailMode::Network) => {
                    return Err(SyncError::Network("connection reset".to_string()))
                }
                Some(FailMode::Server) => {
                    return Err(SyncError::Server("internal server error".to_string()))
                }
                Some(FailMode::Validation) => {
                    return Err(SyncError::Validation("rejected by server".to_string()))
                }
                None => {}
            }
            let id = ServerId(st.next_id);
            st.next_id += 1;
            let msg = ServerMessage {
                id,
                sender_id: self.user_id.clone(),
                receiver_id: peer_id.to_string(),
                content: content.to_string(),
                sent_at: Utc::now(),
                read: false,
                client_provisional_id: Some(provisional_id),
            };
            st.messages.insert(id, msg.clone());
            msg
        };
        self.publish(RealtimeEvent::NewMessage(msg.clone())).await;
        Ok(msg)
    }

    async fn delete(&self, id: ServerId) -> Result<()> {
        let mut st = self.state.lock().await;
        st.calls.delete += 1;
        if st.offline {
            return Err(SyncError::Network("backend unreachable".to_string()));
        }
        match st.messages.remove(&id) {
            Some(_) => Ok(()),
            None => Err(SyncError::NotFound(format!("message {}", id))),
        }
    }

    async fn clear_conversation(&self, peer_id: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        st.calls.clear += 1;
        if st.offline {
            return Err(SyncError::Network("backend unreachable".to_string()));
        }
        let user = self.user_id.as_str();
        st.messages.retain(|_, m| {
            !((m.sender_id == user && m.receiver_id == peer_id)
                || (m.sender_id == peer_id && m.receiver_id == user))
        });
        Ok(())
    }

    async fn mark_read(&self, ids: &[ServerId]) -> Result<()> {
        let latency = self.latency().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut st = self.state.lock().await;
        st.calls.mark_read += 1;
        if st.offline {
            return Err(SyncError::Network("backend unreachable".to_string()));
        }
        if st.fail_mark_read {
            return Err(SyncError::Server("read receipts unavailable".to_string()));
        }
        for id in ids {
            if let Some(m) = st.messages.get_mut(id) {
                m.read = true;
            }
        }
        Ok(())
    }

    async fn notify_typing(&self, _peer_id: &str) -> Result<()> {
        self.typing_notice().await
    }

    async fn notify_stop_typing(&self, _peer_id: &str) -> Result<()> {
        self.typing_notice().await
    }
}

#[async_trait]
impl RealtimeConnector for MemoryBackend {
    type Channel = MpscChannel;

    /// Each connect replaces the previous push link
    async fn connect(&self) -> Result<MpscChannel> {
        {
            let mut st = self.state.lock().await;
            st.calls.connect += 1;
            if st.offline {
                return Err(SyncError::Network("backend unreachable".to_string()));
            }
        }
        let (tx, channel) = realtime::channel(64);
        *self.push.lock().await = Some(tx);
        Ok(channel)
    }
}
