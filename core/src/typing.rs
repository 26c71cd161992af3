/// Typing indicators and online presence
///
/// Typing entries expire lazily: every query compares against the stored
/// deadline, so no timer has to fire before a query sees the right answer.
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

pub struct TypingPresenceTracker {
    window: Duration,
    /// peer -> expiry deadline
    typing: HashMap<String, Instant>,
    online: HashSet<String>,
}

impl TypingPresenceTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            typing: HashMap::new(),
            online: HashSet::new(),
        }
    }

    /// Insert or refresh the single deadline for `peer_id`.
    /// Returns `true` if the peer was not already shown as typing.
    pub fn on_typing(&mut self, peer_id: &str, now: Instant) -> bool {
        let was_typing = self.is_typing(peer_id, now);
        self.typing.insert(peer_id.to_string(), now + self.window);
        !was_typing
    }

    /// Returns `true` if an unexpired entry was removed
    pub fn on_stop_typing(&mut self, peer_id: &str, now: Instant) -> bool {
        match self.typing.remove(peer_id) {
            Some(deadline) => deadline > now,
            None => false,
        }
    }

    pub fn is_typing(&self, peer_id: &str, now: Instant) -> bool {
        self.typing
            .get(peer_id)
            .map(|deadline| *deadline > now)
            .unwrap_or(false)
    }

    /// Peers currently typing, sorted
    pub fn typing_peers(&self, now: Instant) -> Vec<String> {
        let mut peers: Vec<String> = self
            .typing
            .iter()
            .filter(|(_, deadline)| **deadline > now)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Drop expired entries; queries never depend on this running
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.typing.len();
        self.typing.retain(|_, deadline| *deadline > now);
        before - self.typing.len()
    }

    /// Returns `true` if the presence state changed
    pub fn set_online(&mut self, peer_id: &str, online: bool) -> bool {
        if online {
            self.online.insert(peer_id.to_string())
        } else {
            self.typing.remove(peer_id);
            self.online.remove(peer_id)
        }
    }

    pub fn is_online(&self, peer_id: &str) -> bool {
        self.online.contains(peer_id)
    }

    pub fn online_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.online.iter().cloned().collect();
        peers.sort();
        peers
    }
}
