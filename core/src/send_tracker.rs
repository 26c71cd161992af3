/// Optimistic send tracking with rollback, plus the client-side send throttle
use crate::conversation::ConversationKey;
use crate::error::{Result, SyncError};
use crate::message::{Message, MessageSource, ProvisionalId, ServerId, ServerMessage};
use crate::message_log::MessageLog;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Sliding-window send counter.
///
/// Keeps the timestamp of every accepted send inside the window; timestamps
/// older than the window are evicted on each check.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_sends: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_sends: usize, window: Duration) -> Self {
        Self {
            max_sends,
            window,
            sent: VecDeque::with_capacity(max_sends),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.sent.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a send at `now`, or reject it if the window is full
    pub fn check(&mut self, now: Instant) -> Result<()> {
        self.evict(now);
        if self.sent.len() >= self.max_sends {
            let retry_after = self
                .sent
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            return Err(SyncError::RateLimited { retry_after });
        }
        self.sent.push_back(now);
        Ok(())
    }

    /// Sends counted against the current window
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.sent.len()
    }
}

/// A locally originated send awaiting server confirmation
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub provisional_id: ProvisionalId,
    pub peer_id: String,
    pub key: ConversationKey,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

pub struct OptimisticSendTracker {
    local_user_id: String,
    max_content_len: usize,
    limiter: RateLimiter,
    pending: HashMap<ProvisionalId, PendingSend>,
    /// Pending sends whose conversation was cleared while in flight
    discarded: HashSet<ProvisionalId>,
    /// Sends confirmed by their push echo before the request returned
    echoed: HashMap<ProvisionalId, ServerId>,
}

impl OptimisticSendTracker {
    pub fn new(local_user_id: String, max_content_len: usize, limiter: RateLimiter) -> Self {
        Self {
            local_user_id,
            max_content_len,
            limiter,
            pending: HashMap::new(),
            discarded: HashSet::new(),
            echoed: HashMap::new(),
        }
    }

    /// Trim and check outgoing content
    pub fn validate(&self, peer_id: &str, content: &str) -> Result<String> {
        if peer_id.trim().is_empty() {
            return Err(SyncError::Validation("Recipient is required.".to_string()));
        }
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Validation(
                "Message content cannot be empty.".to_string(),
            ));
        }
        if trimmed.chars().count() > self.max_content_len {
            return Err(SyncError::Validation(format!(
                "Message is too long (max {} characters).",
                self.max_content_len
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Validate, throttle and insert the provisional entry.
    ///
    /// Nothing touches the log unless every local check passes.
    pub fn begin(
        &mut self,
        log: &mut MessageLog,
        peer_id: &str,
        content: &str,
        retry_count: u32,
        now: Instant,
    ) -> Result<PendingSend> {
        let content = self.validate(peer_id, content)?;
        if let Err(e) = self.limiter.check(now) {
            warn!("Send to {} throttled: {}", peer_id, e);
            return Err(e);
        }

        let provisional_id = ProvisionalId::new();
        let created_at = Utc::now();
        let msg = Message::provisional(
            provisional_id,
            self.local_user_id.clone(),
            peer_id.to_string(),
            content.clone(),
            created_at,
        );
        let key = log
            .insert_provisional(msg)
            .unwrap_or_else(|| ConversationKey::new(&self.local_user_id, peer_id));

        let pending = PendingSend {
            provisional_id,
            peer_id: peer_id.to_string(),
            key,
            content,
            created_at,
            retry_count,
        };
        debug!("Pending send {} to {} (retry {})", provisional_id, peer_id, retry_count);
        self.pending.insert(provisional_id, pending.clone());
        Ok(pending)
    }

    /// Apply the server's copy of a pending send.
    ///
    /// Returns the confirmed entry, or `None` when the send was discarded
    /// because its conversation was cleared meanwhile. Calling this twice
    /// for the same id (push echo, then request response) leaves one entry.
    pub fn complete(
        &mut self,
        log: &mut MessageLog,
        provisional_id: ProvisionalId,
        confirmed: ServerMessage,
        source: MessageSource,
    ) -> Option<Message> {
        let was_pending = self.pending.remove(&provisional_id).is_some();
        if self.discarded.remove(&provisional_id) {
            info!("Send {} completed after its conversation was cleared", provisional_id);
            log.suppress(confirmed.id);
            return None;
        }
        if log.is_tombstoned(confirmed.id) {
            log.remove_provisional(provisional_id);
            return None;
        }
        if source == MessageSource::Push && was_pending {
            self.echoed.insert(provisional_id, confirmed.id);
        }
        let msg = Message::confirmed(confirmed, source);
        log.confirm_provisional(provisional_id, msg.clone());
        Some(msg)
    }

    /// Server id of a send already confirmed by its push echo
    pub fn take_echoed(&mut self, provisional_id: ProvisionalId) -> Option<ServerId> {
        self.echoed.remove(&provisional_id)
    }

    /// Roll back a failed send and hand its input back to the caller
    pub fn fail(
        &mut self,
        log: &mut MessageLog,
        provisional_id: ProvisionalId,
        cause: SyncError,
    ) -> SyncError {
        log.remove_provisional(provisional_id);
        self.discarded.remove(&provisional_id);
        match self.pending.remove(&provisional_id) {
            Some(p) => {
                warn!("Send {} to {} failed: {}", provisional_id, p.peer_id, cause);
                SyncError::SendFailed {
                    peer_id: p.peer_id,
                    content: p.content,
                    retry_count: p.retry_count,
                    source: Box::new(cause),
                }
            }
            None => cause,
        }
    }

    /// Mark in-flight sends whose provisional entries were cleared
    pub fn discard(&mut self, ids: &[ProvisionalId]) {
        for id in ids {
            if self.pending.contains_key(id) {
                self.discarded.insert(*id);
            }
        }
    }

    pub fn is_pending(&self, id: ProvisionalId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_for<'a>(&'a self, peer_id: &'a str) -> impl Iterator<Item = &'a PendingSend> + 'a {
        self.pending.values().filter(move |p| p.peer_id == peer_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn sends_in_window(&mut self, now: Instant) -> usize {
        self.limiter.in_window(now)
    }
}
