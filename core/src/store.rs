/// Conversation store: the single surface UI layers read from and command
///
/// All mutations go through the methods below and run under one write lock.
/// Network calls happen with the lock released; their completions take the
/// lock again to apply results, so no partial state is ever observable.
use crate::api::{MessageFetcher, MessageSender};
use crate::config::Config;
use crate::contacts::{self, SortMode, DEFAULT_PREVIEW_LEN};
use crate::conversation::ConversationKey;
use crate::error::{Result, SyncError};
use crate::message::{Message, MessageSource, ServerId, ServerMessage};
use crate::message_log::{MessageLog, ReconcileOutcome};
use crate::messenger_types::{ConnectionState, ConversationSummary, Profile, StoreEvent, StoreSnapshot};
use crate::read_receipts::ReadReceiptCoordinator;
use crate::realtime::RealtimeEvent;
use crate::send_tracker::{OptimisticSendTracker, RateLimiter};
use crate::typing::TypingPresenceTracker;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

struct StoreState {
    log: MessageLog,
    sends: OptimisticSendTracker,
    receipts: ReadReceiptCoordinator,
    presence: TypingPresenceTracker,
    profiles: HashMap<String, Profile>,
    connection: ConnectionState,
    /// Derived from `log`; rebuilt by `commit`
    summaries: Vec<ConversationSummary>,
    revision: u64,
}

#[derive(Clone)]
pub struct ConversationStore {
    config: Arc<Config>,
    state: Arc<RwLock<StoreState>>,
    fetcher: Arc<dyn MessageFetcher>,
    sender: Arc<dyn MessageSender>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConversationStore {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn MessageFetcher>,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Self> {
        config.validate()?;
        let local = config.local_user_id.clone();
        let state = StoreState {
            log: MessageLog::new(),
            sends: OptimisticSendTracker::new(
                local.clone(),
                config.max_content_len,
                RateLimiter::new(config.rate_limit_max_sends, config.rate_limit_window),
            ),
            receipts: ReadReceiptCoordinator::new(local.clone()),
            presence: TypingPresenceTracker::new(config.typing_window),
            profiles: HashMap::new(),
            connection: ConnectionState::Disconnected,
            summaries: Vec::new(),
            revision: 0,
        };
        let (events, _) = broadcast::channel(config.event_buffer);
        info!("Conversation store created for {}", local);
        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(state)),
            fetcher,
            sender,
            events,
        })
    }

    pub fn local_user_id(&self) -> &str {
        &self.config.local_user_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Observe store changes
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn key_for(&self, peer_id: &str) -> ConversationKey {
        ConversationKey::new(&self.config.local_user_id, peer_id)
    }

    /// The member of `msg`'s conversation that is not us
    fn peer_for<'a>(&self, msg: &'a ServerMessage) -> Option<&'a str> {
        let local = self.config.local_user_id.as_str();
        if msg.sender_id == local {
            Some(&msg.receiver_id)
        } else if msg.receiver_id == local {
            Some(&msg.sender_id)
        } else {
            None
        }
    }

    /// Ordered messages exchanged with `peer_id`, provisional entries included
    pub async fn get_conversation(&self, peer_id: &str) -> Vec<Message> {
        let st = self.state.read().await;
        st.log.conversation(&self.key_for(peer_id)).to_vec()
    }

    /// Summaries sorted by last message time, most recent first
    pub async fn list_conversations(&self) -> Vec<ConversationSummary> {
        self.state.read().await.summaries.clone()
    }

    /// Contact list filtered by `query` and ordered by `mode`
    pub async fn list_contacts(&self, query: &str, mode: SortMode) -> Vec<ConversationSummary> {
        let st = self.state.read().await;
        let mut found: Vec<ConversationSummary> = contacts::search(&st.summaries, query)
            .into_iter()
            .cloned()
            .collect();
        contacts::sort_summaries(&mut found, mode);
        found
    }

    pub async fn unread_count(&self, peer_id: &str) -> usize {
        let st = self.state.read().await;
        st.summaries
            .iter()
            .find(|s| s.peer_id == peer_id)
            .map(|s| s.unread_count)
            .unwrap_or(0)
    }

    pub async fn total_unread(&self) -> usize {
        let st = self.state.read().await;
        st.summaries.iter().map(|s| s.unread_count).sum()
    }

    pub async fn preview(&self, peer_id: &str) -> Option<String> {
        let st = self.state.read().await;
        st.summaries
            .iter()
            .find(|s| s.peer_id == peer_id)
            .map(|s| contacts::conversation_preview(&s.last_message, self.local_user_id(), DEFAULT_PREVIEW_LEN))
    }

    /// Summaries and one conversation read under the same lock
    pub async fn snapshot(&self, peer_id: Option<&str>) -> StoreSnapshot {
        let st = self.state.read().await;
        let now = Instant::now();
        StoreSnapshot {
            revision: st.revision,
            conversations: st.summaries.clone(),
            peer_id: peer_id.map(str::to_string),
            messages: peer_id
                .map(|p| st.log.conversation(&self.key_for(p)).to_vec())
                .unwrap_or_default(),
            typing: peer_id
                .map(|p| st.presence.is_typing(p, now))
                .unwrap_or(false),
        }
    }

    pub async fn is_typing(&self, peer_id: &str) -> bool {
        self.state.read().await.presence.is_typing(peer_id, Instant::now())
    }

    pub async fn typing_peers(&self) -> Vec<String> {
        self.state.read().await.presence.typing_peers(Instant::now())
    }

    pub async fn is_online(&self, peer_id: &str) -> bool {
        self.state.read().await.presence.is_online(peer_id)
    }

    /// Peers currently online, sorted
    pub async fn online_peers(&self) -> Vec<String> {
        self.state.read().await.presence.online_peers()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.connection
    }

    /// Whether the realtime link is up
    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    pub async fn pending_sends(&self) -> usize {
        self.state.read().await.sends.pending_count()
    }

    pub async fn revision(&self) -> u64 {
        self.state.read().await.revision
    }

    /// Send `content` to `peer_id`.
    ///
    /// The provisional entry is visible before this future resolves. On
    /// failure it is removed and `SyncError::SendFailed` carries the content.
    pub async fn send(&self, peer_id: &str, content: &str) -> Result<Message> {
        self.send_attempt(peer_id, content, 0).await
    }

    /// Re-send the content of a failed send
    pub async fn retry(&self, failed: &SyncError) -> Result<Message> {
        match failed {
            SyncError::SendFailed {
                peer_id,
                content,
                retry_count,
                ..
            } => self.send_attempt(peer_id, content, retry_count + 1).await,
            other => Err(SyncError::Validation(format!(
                "Only failed sends can be retried: {}",
                other
            ))),
        }
    }

    async fn send_attempt(&self, peer_id: &str, content: &str, retry_count: u32) -> Result<Message> {
        let pending = {
            let mut guard = self.state.write().await;
            let st = &mut *guard;
            let pending = st
                .sends
                .begin(&mut st.log, peer_id, content, retry_count, Instant::now())?;
            self.commit(st, [pending.peer_id.clone()]);
            pending
        };
        let pid = pending.provisional_id;

        let result = with_timeout(
            self.config.send_timeout,
            "send",
            self.sender.send(&pending.peer_id, &pending.content, pid),
        )
        .await;

        let mut guard = self.state.write().await;
        let st = &mut *guard;
        match result {
            Ok(server_msg) => {
                st.sends.take_echoed(pid);
                let confirmed = st.sends.complete(
                    &mut st.log,
                    pid,
                    server_msg.clone(),
                    MessageSource::SendResponse,
                );
                self.commit(st, [pending.peer_id.clone()]);
                info!("Message {} to {} confirmed", server_msg.id, pending.peer_id);
                Ok(confirmed.unwrap_or_else(|| Message::confirmed(server_msg, MessageSource::SendResponse)))
            }
            Err(e) => {
                if let Some(id) = st.sends.take_echoed(pid) {
                    if let Some(msg) = st.log.get(id) {
                        debug!("Send {} failed after its echo confirmed it as {}", pid, id);
                        return Ok(msg.clone());
                    }
                }
                let err = st.sends.fail(&mut st.log, pid, e);
                self.commit(st, [pending.peer_id.clone()]);
                self.emit(StoreEvent::SendFailed {
                    peer_id: pending.peer_id.clone(),
                    content: pending.content.clone(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Mark messages read and confirm them to the server in one batch.
    ///
    /// Returns how many messages the batch covered (0 means no network call).
    pub async fn mark_read<I>(&self, ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = ServerId> + Send,
    {
        let batch = {
            let mut guard = self.state.write().await;
            let st = &mut *guard;
            let Some(batch) = st.receipts.prepare(&mut st.log, ids) else {
                return Ok(0);
            };
            debug!("Read batch #{} covers {} message(s)", st.receipts.batches_sent(), batch.ids.len());
            let peers = self.peers_of(&st.log, &batch.ids);
            self.commit(st, peers);
            batch
        };

        let result = with_timeout(
            self.config.send_timeout,
            "mark_read",
            self.sender.mark_read(&batch.ids),
        )
        .await;

        let mut guard = self.state.write().await;
        let st = &mut *guard;
        match result {
            Ok(()) => {
                st.receipts.confirm(&batch);
                Ok(batch.ids.len())
            }
            Err(e) => {
                let peers = self.peers_of(&st.log, &batch.ids);
                let err = st.receipts.revert(&mut st.log, batch, e);
                self.commit(st, peers);
                if let SyncError::ReadSyncFailed { ids, .. } = &err {
                    self.emit(StoreEvent::ReadSyncFailed {
                        ids: ids.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    /// Mark every unread inbound message from `peer_id` read
    pub async fn mark_conversation_read(&self, peer_id: &str) -> Result<usize> {
        let ids = {
            let st = self.state.read().await;
            st.receipts.unread_in(&st.log, &self.key_for(peer_id))
        };
        self.mark_read(ids).await
    }

    /// Delete one message. Deleting an unknown id succeeds.
    pub async fn delete(&self, id: ServerId) -> Result<()> {
        match with_timeout(self.config.send_timeout, "delete", self.sender.delete(id)).await {
            Ok(()) => {}
            Err(SyncError::NotFound(_)) => debug!("Message {} already gone on server", id),
            Err(e) => return Err(e),
        }

        let mut guard = self.state.write().await;
        let st = &mut *guard;
        if let Some(removed) = st.log.remove(id) {
            let key = ConversationKey::for_message(&removed);
            let peer = key.peer_of(self.local_user_id()).map(str::to_string);
            self.commit(st, peer);
            info!("Deleted message {}", id);
        }
        Ok(())
    }

    /// Remove the whole conversation with `peer_id`, provisional entries included.
    /// Returns the number of entries removed locally.
    pub async fn clear(&self, peer_id: &str) -> Result<usize> {
        match with_timeout(
            self.config.send_timeout,
            "clear",
            self.sender.clear_conversation(peer_id),
        )
        .await
        {
            Ok(()) => {}
            Err(SyncError::NotFound(_)) => debug!("Conversation with {} already empty on server", peer_id),
            Err(e) => return Err(e),
        }

        let mut guard = self.state.write().await;
        let st = &mut *guard;
        let cleared = st.log.clear_conversation(&self.key_for(peer_id));
        st.sends.discard(&cleared.provisional_ids());
        let removed = cleared.removed.len();
        self.commit(st, [peer_id.to_string()]);
        info!("Cleared {} message(s) with {}", removed, peer_id);
        Ok(removed)
    }

    /// Tell `peer_id` we are typing. Returns `false` when nothing was sent
    /// because the realtime link is down.
    pub async fn notify_typing(&self, peer_id: &str) -> Result<bool> {
        if !self.typing_target_ok(peer_id).await {
            return Ok(false);
        }
        with_timeout(
            self.config.send_timeout,
            "notify_typing",
            self.sender.notify_typing(peer_id),
        )
        .await?;
        Ok(true)
    }

    pub async fn notify_stop_typing(&self, peer_id: &str) -> Result<bool> {
        if !self.typing_target_ok(peer_id).await {
            return Ok(false);
        }
        with_timeout(
            self.config.send_timeout,
            "notify_stop_typing",
            self.sender.notify_stop_typing(peer_id),
        )
        .await?;
        Ok(true)
    }

    async fn typing_target_ok(&self, peer_id: &str) -> bool {
        if peer_id.trim().is_empty() || peer_id == self.local_user_id() {
            return false;
        }
        if !self.is_connected().await {
            debug!("Not connected, typing notice for {} skipped", peer_id);
            return false;
        }
        true
    }

    /// Attach profile data to a contact
    pub async fn set_profile(&self, peer_id: &str, profile: Profile) {
        let mut guard = self.state.write().await;
        let st = &mut *guard;
        st.profiles.insert(peer_id.to_string(), profile);
        self.commit(st, [peer_id.to_string()]);
    }

    /// Realtime `message:new`
    pub async fn on_message_push(&self, msg: ServerMessage) {
        let Some(peer_id) = self.peer_for(&msg).map(str::to_string) else {
            warn!("Ignoring pushed message {} not addressed to us", msg.id);
            return;
        };
        let inbound = msg.sender_id == peer_id;

        let mut guard = self.state.write().await;
        let st = &mut *guard;
        let pending = msg
            .client_provisional_id
            .filter(|pid| st.sends.is_pending(*pid));
        match pending {
            Some(pid) => {
                debug!("Push echo {} confirms pending send {}", msg.id, pid);
                st.sends.complete(&mut st.log, pid, msg, MessageSource::Push);
            }
            None => {
                st.log.reconcile(vec![Message::confirmed(msg, MessageSource::Push)]);
            }
        }
        let stopped = inbound && st.presence.on_stop_typing(&peer_id, Instant::now());
        self.commit(st, [peer_id.clone()]);
        if stopped {
            self.emit(StoreEvent::TypingChanged {
                peer_id,
                typing: false,
            });
        }
    }

    /// Realtime `message:read`
    pub async fn on_read_push(&self, id: ServerId) {
        let mut guard = self.state.write().await;
        let st = &mut *guard;
        if st.receipts.on_remote_read(&mut st.log, id) {
            let peers = self.peers_of(&st.log, &[id]);
            self.commit(st, peers);
        }
    }

    pub async fn on_typing(&self, peer_id: &str) {
        if peer_id == self.local_user_id() {
            return;
        }
        let started = self
            .state
            .write()
            .await
            .presence
            .on_typing(peer_id, Instant::now());
        if started {
            self.emit(StoreEvent::TypingChanged {
                peer_id: peer_id.to_string(),
                typing: true,
            });
        }
    }

    pub async fn on_stop_typing(&self, peer_id: &str) {
        let stopped = self
            .state
            .write()
            .await
            .presence
            .on_stop_typing(peer_id, Instant::now());
        if stopped {
            self.emit(StoreEvent::TypingChanged {
                peer_id: peer_id.to_string(),
                typing: false,
            });
        }
    }

    pub async fn on_presence(&self, peer_id: &str, online: bool) {
        let mut guard = self.state.write().await;
        let st = &mut *guard;
        if st.presence.set_online(peer_id, online) {
            self.commit(st, None::<String>);
            self.emit(StoreEvent::PresenceChanged {
                peer_id: peer_id.to_string(),
                online,
            });
        }
    }

    /// Realtime link status reported by the pump
    pub async fn on_connection_changed(&self, connection: ConnectionState) {
        let mut guard = self.state.write().await;
        if guard.connection == connection {
            return;
        }
        guard.connection = connection;
        drop(guard);
        info!("Realtime link: {:?}", connection);
        self.emit(StoreEvent::ConnectionChanged { connection });
    }

    /// Drop expired typing entries; returns how many were removed
    pub async fn prune_typing(&self) -> usize {
        self.state.write().await.presence.prune(Instant::now())
    }

    /// Full reconciliation pass with a fetcher result
    pub async fn on_periodic_fetch(&self, batch: Vec<ServerMessage>) -> ReconcileOutcome {
        let mut guard = self.state.write().await;
        let st = &mut *guard;
        let outcome = st.log.reconcile_full(
            batch
                .into_iter()
                .map(|m| Message::confirmed(m, MessageSource::Fetch))
                .collect(),
        );
        debug!(
            "Fetch {} reconciled: {} new, {} updated, {} suppressed",
            st.log.generation(),
            outcome.inserted,
            outcome.updated,
            outcome.suppressed
        );
        if !outcome.is_empty() {
            self.recompute(st);
            self.emit(StoreEvent::ConversationsChanged {
                revision: st.revision,
            });
        }
        outcome
    }

    /// Pull everything from the fetcher and reconcile it
    pub async fn refresh(&self) -> Result<ReconcileOutcome> {
        let batch = with_timeout(self.config.fetch_timeout, "fetch", self.fetcher.fetch_all()).await?;
        Ok(self.on_periodic_fetch(batch).await)
    }

    /// Dispatch one realtime event
    pub async fn apply_event(&self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::NewMessage(msg) => self.on_message_push(msg).await,
            RealtimeEvent::MessageRead { message_id } => self.on_read_push(message_id).await,
            RealtimeEvent::Typing { email } => self.on_typing(&email).await,
            RealtimeEvent::StopTyping { email } => self.on_stop_typing(&email).await,
            RealtimeEvent::Online { email } => self.on_presence(&email, true).await,
            RealtimeEvent::Offline { email } => self.on_presence(&email, false).await,
        }
    }

    fn recompute(&self, st: &mut StoreState) {
        st.summaries = contacts::derive_summaries(
            &st.log,
            &self.config.local_user_id,
            &st.profiles,
            &st.presence,
        );
        st.revision += 1;
    }

    /// Rebuild summaries, then notify about the touched conversations
    fn commit<I>(&self, st: &mut StoreState, peers: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.recompute(st);
        for peer_id in peers {
            self.emit(StoreEvent::MessagesChanged {
                peer_id,
                revision: st.revision,
            });
        }
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn peers_of(&self, log: &MessageLog, ids: &[ServerId]) -> Vec<String> {
        let mut peers: Vec<String> = ids
            .iter()
            .filter_map(|id| log.get(*id))
            .filter_map(|m| {
                ConversationKey::for_message(m)
                    .peer_of(self.local_user_id())
                    .map(str::to_string)
            })
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }
}

async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(format!("{} timed out after {:?}", what, limit))),
    }
}

/// Refresh the store every `period` until the returned task is aborted
pub fn spawn_poller(store: ConversationStore, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = store.refresh().await {
                warn!("Periodic fetch failed: {}", e);
            }
            store.prune_typing().await;
        }
    })
}
