/// Realtime push channel: wire events, channel abstraction and the pump task
use crate::error::Result;
use crate::message::{ServerId, ServerMessage};
use crate::messenger_types::ConnectionState;
use crate::store::ConversationStore;
use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Events pushed by the backend socket.
///
/// Frames look like `{"event": "message:new", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RealtimeEvent {
    #[serde(rename = "message:new")]
    NewMessage(ServerMessage),

    #[serde(rename = "message:read")]
    MessageRead {
        #[serde(rename = "messageId", alias = "message_id")]
        message_id: ServerId,
    },

    #[serde(rename = "user:typing")]
    Typing { email: String },

    #[serde(rename = "user:stop_typing")]
    StopTyping { email: String },

    #[serde(rename = "user:online")]
    Online { email: String },

    #[serde(rename = "user:offline")]
    Offline { email: String },
}

impl RealtimeEvent {
    pub fn decode(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Source of push events. Delivery is at most once; duplicates are tolerated.
#[async_trait]
pub trait RealtimeChannel: Send {
    /// Next event, or `None` once the channel is closed
    async fn next_event(&mut self) -> Option<RealtimeEvent>;
}

/// In-process channel fed through an mpsc sender
pub struct MpscChannel {
    rx: mpsc::Receiver<RealtimeEvent>,
}

/// Create a connected sender / channel pair
pub fn channel(buffer: usize) -> (mpsc::Sender<RealtimeEvent>, MpscChannel) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, MpscChannel { rx })
}

#[async_trait]
impl RealtimeChannel for MpscChannel {
    async fn next_event(&mut self) -> Option<RealtimeEvent> {
        self.rx.recv().await
    }
}

/// Channel over a stream of raw JSON text frames (e.g. a websocket reader).
///
/// Frames that fail to decode are logged and skipped.
pub struct FrameChannel<S> {
    frames: S,
}

impl<S> FrameChannel<S>
where
    S: Stream<Item = String> + Unpin + Send,
{
    pub fn new(frames: S) -> Self {
        Self { frames }
    }
}

#[async_trait]
impl<S> RealtimeChannel for FrameChannel<S>
where
    S: Stream<Item = String> + Unpin + Send,
{
    async fn next_event(&mut self) -> Option<RealtimeEvent> {
        while let Some(frame) = self.frames.next().await {
            match RealtimeEvent::decode(&frame) {
                Ok(event) => return Some(event),
                Err(e) => warn!("Dropping undecodable realtime frame: {}", e),
            }
        }
        None
    }
}

/// Opens realtime channels; asked again after every drop
#[async_trait]
pub trait RealtimeConnector: Send + Sync + 'static {
    type Channel: RealtimeChannel + 'static;

    async fn connect(&self) -> Result<Self::Channel>;
}

#[async_trait]
impl<T: RealtimeConnector> RealtimeConnector for Arc<T> {
    type Channel = T::Channel;

    async fn connect(&self) -> Result<Self::Channel> {
        (**self).connect().await
    }
}

/// Delay before reconnect attempt `attempt` (1-based): base, 2x, 4x, ...
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp)
}

async fn drain<C: RealtimeChannel>(store: &ConversationStore, channel: &mut C) -> u64 {
    let mut applied = 0u64;
    while let Some(event) = channel.next_event().await {
        debug!("Realtime event: {:?}", event);
        store.apply_event(event).await;
        applied += 1;
    }
    applied
}

/// Feed every event from `channel` into `store` until the channel closes
pub fn spawn_pump<C>(store: ConversationStore, mut channel: C) -> JoinHandle<()>
where
    C: RealtimeChannel + 'static,
{
    tokio::spawn(async move {
        let applied = drain(&store, &mut channel).await;
        info!("Realtime channel closed after {} event(s)", applied);
    })
}

/// Keep a realtime link open through `connector`.
///
/// A failed connect or a dropped channel schedules a reconnect with
/// exponential backoff from `Config::reconnect_base_delay`. A successful
/// connect resets the attempt count. Once `reconnect_max_attempts` is used
/// up the store is marked `PollingOnly` and the task ends.
pub fn spawn_reconnecting_pump<K>(store: ConversationStore, connector: K) -> JoinHandle<()>
where
    K: RealtimeConnector,
{
    tokio::spawn(async move {
        let base = store.config().reconnect_base_delay;
        let max_attempts = store.config().reconnect_max_attempts;
        let mut attempt = 0u32;
        loop {
            match connector.connect().await {
                Ok(mut channel) => {
                    attempt = 0;
                    store.on_connection_changed(ConnectionState::Connected).await;
                    let applied = drain(&store, &mut channel).await;
                    info!("Realtime channel dropped after {} event(s)", applied);
                }
                Err(e) => warn!("Realtime connect failed: {}", e),
            }

            if attempt >= max_attempts {
                warn!("Max reconnection attempts reached, switching to polling mode");
                store.on_connection_changed(ConnectionState::PollingOnly).await;
                return;
            }
            attempt += 1;
            let delay = backoff_delay(base, attempt);
            store
                .on_connection_changed(ConnectionState::Reconnecting { attempt })
                .await;
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            sleep(delay).await;
        }
    })
}
