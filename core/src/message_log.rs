/// Ordered, deduplicated message log per conversation
///
/// Every source of messages (bulk fetch, push, send response) goes through
/// `reconcile`, so a server id has at most one live entry no matter which
/// source delivered it first.
use crate::conversation::ConversationKey;
use crate::message::{Message, MessageId, ProvisionalId, ServerId};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// What a reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Entries dropped because their id was deleted locally
    pub suppressed: usize,
    /// Tombstones retired because the server no longer returns the id
    pub retired_tombstones: usize,
    pub touched: BTreeSet<ConversationKey>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0
    }
}

/// Entries removed by `clear_conversation`
#[derive(Debug, Clone, Default)]
pub struct ClearOutcome {
    pub removed: Vec<Message>,
}

impl ClearOutcome {
    pub fn provisional_ids(&self) -> Vec<ProvisionalId> {
        self.removed.iter().filter_map(Message::provisional_id).collect()
    }
}

#[derive(Debug, Default)]
pub struct MessageLog {
    /// Sorted by `Message::sort_key`
    conversations: HashMap<ConversationKey, Vec<Message>>,
    confirmed: HashMap<ServerId, ConversationKey>,
    provisional: HashMap<ProvisionalId, ConversationKey>,
    /// Deleted ids, with the fetch generation that recorded them
    tombstones: HashMap<ServerId, u64>,
    generation: u64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge authoritative entries: insert new ids, overwrite known ones.
    ///
    /// Provisional entries in `batch` are ignored; they enter through
    /// `insert_provisional`.
    pub fn reconcile(&mut self, batch: Vec<Message>) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for msg in batch {
            let Some(id) = msg.server_id() else {
                warn!("Ignoring provisional entry {} in reconcile batch", msg.id);
                continue;
            };
            if self.tombstones.contains_key(&id) {
                debug!("Suppressing deleted message {}", id);
                outcome.suppressed += 1;
                continue;
            }
            let key = ConversationKey::for_message(&msg);
            if self.upsert(msg) {
                outcome.updated += 1;
            } else {
                outcome.inserted += 1;
            }
            outcome.touched.insert(key);
        }
        outcome
    }

    /// Full pass from the fetcher.
    ///
    /// Starts a new generation. A tombstoned id missing from `batch` means the
    /// server has applied the deletion, so its tombstone is retired; one still
    /// present is stale data and stays suppressed.
    pub fn reconcile_full(&mut self, batch: Vec<Message>) -> ReconcileOutcome {
        self.generation += 1;
        let present: HashSet<ServerId> = batch.iter().filter_map(Message::server_id).collect();
        let before = self.tombstones.len();
        self.tombstones.retain(|id, _| present.contains(id));
        let retired = before - self.tombstones.len();
        if retired > 0 {
            debug!("Retired {} tombstone(s) at generation {}", retired, self.generation);
        }

        let mut outcome = self.reconcile(batch);
        outcome.retired_tombstones = retired;
        outcome
    }

    /// Add an optimistic entry for a send in flight
    pub fn insert_provisional(&mut self, msg: Message) -> Option<ConversationKey> {
        let Some(pid) = msg.provisional_id() else {
            warn!("insert_provisional called with confirmed message {}", msg.id);
            return None;
        };
        let key = ConversationKey::for_message(&msg);
        self.provisional.insert(pid, key.clone());
        insert_sorted(self.conversations.entry(key.clone()).or_default(), msg);
        Some(key)
    }

    /// Swap a provisional entry for its confirmed counterpart in one step.
    ///
    /// When the confirmed entry sorts into the slot the provisional one
    /// occupied, it is replaced in place. Returns `false` if the provisional
    /// entry was no longer present; the confirmed entry is still upserted.
    pub fn confirm_provisional(&mut self, pid: ProvisionalId, confirmed: Message) -> bool {
        let Some(sid) = confirmed.server_id() else {
            warn!("confirm_provisional called with provisional message {}", confirmed.id);
            return false;
        };
        let Some(key) = self.provisional.remove(&pid) else {
            self.reconcile(vec![confirmed]);
            return false;
        };

        let suppressed = self.tombstones.contains_key(&sid);
        let already_known = self.confirmed.contains_key(&sid);
        let same_conversation = ConversationKey::for_message(&confirmed) == key;

        if suppressed || already_known || !same_conversation {
            self.remove_entry(&key, MessageId::Provisional(pid));
            if !suppressed {
                self.upsert(confirmed);
            }
            return true;
        }

        let Some(entries) = self.conversations.get_mut(&key) else {
            return false;
        };
        let Some(idx) = entries.iter().position(|m| m.id == MessageId::Provisional(pid)) else {
            self.upsert(confirmed);
            return false;
        };

        let target_key = confirmed.sort_key();
        let mut target = entries.partition_point(|m| m.sort_key() < target_key);
        if entries[idx].sort_key() < target_key {
            target -= 1;
        }
        if target == idx {
            entries[idx] = confirmed;
        } else {
            entries.remove(idx);
            entries.insert(target, confirmed);
        }
        self.confirmed.insert(sid, key);
        true
    }

    /// Drop a provisional entry after a failed send
    pub fn remove_provisional(&mut self, pid: ProvisionalId) -> Option<Message> {
        let key = self.provisional.remove(&pid)?;
        self.remove_entry(&key, MessageId::Provisional(pid))
    }

    /// Permanently delete a confirmed message.
    ///
    /// The id is tombstoned so stale fetch or push data cannot bring it back
    /// before the server confirms the deletion. Unknown ids are a no-op.
    pub fn remove(&mut self, id: ServerId) -> Option<Message> {
        self.tombstones.insert(id, self.generation);
        let key = self.confirmed.remove(&id)?;
        self.remove_entry(&key, MessageId::Confirmed(id))
    }

    /// Remove every entry of a conversation, confirmed and provisional
    pub fn clear_conversation(&mut self, key: &ConversationKey) -> ClearOutcome {
        let Some(removed) = self.conversations.remove(key) else {
            return ClearOutcome::default();
        };
        for msg in &removed {
            match msg.id {
                MessageId::Confirmed(id) => {
                    self.confirmed.remove(&id);
                    self.tombstones.insert(id, self.generation);
                }
                MessageId::Provisional(pid) => {
                    self.provisional.remove(&pid);
                }
            }
        }
        ClearOutcome { removed }
    }

    /// Tombstone an id without touching the log (e.g. a send completing after its conversation was cleared)
    pub fn suppress(&mut self, id: ServerId) {
        self.tombstones.insert(id, self.generation);
    }

    /// Set the read flag; returns the ids whose flag actually changed
    pub fn set_read(&mut self, ids: &[ServerId], read: bool) -> Vec<ServerId> {
        let mut changed = Vec::new();
        for id in ids {
            if let Some(msg) = self.get_mut(*id) {
                if msg.read != read {
                    msg.read = read;
                    changed.push(*id);
                }
            }
        }
        changed
    }

    pub fn get(&self, id: ServerId) -> Option<&Message> {
        let key = self.confirmed.get(&id)?;
        self.conversations
            .get(key)?
            .iter()
            .find(|m| m.id == MessageId::Confirmed(id))
    }

    fn get_mut(&mut self, id: ServerId) -> Option<&mut Message> {
        let key = self.confirmed.get(&id)?;
        self.conversations
            .get_mut(key)?
            .iter_mut()
            .find(|m| m.id == MessageId::Confirmed(id))
    }

    pub fn get_provisional(&self, pid: ProvisionalId) -> Option<&Message> {
        let key = self.provisional.get(&pid)?;
        self.conversations
            .get(key)?
            .iter()
            .find(|m| m.id == MessageId::Provisional(pid))
    }

    /// Ordered entries of one conversation
    pub fn conversation(&self, key: &ConversationKey) -> &[Message] {
        self.conversations.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn conversations(&self) -> impl Iterator<Item = (&ConversationKey, &[Message])> {
        self.conversations
            .iter()
            .filter(|(_, msgs)| !msgs.is_empty())
            .map(|(k, v)| (k, v.as_slice()))
    }

    pub fn is_tombstoned(&self, id: ServerId) -> bool {
        self.tombstones.contains_key(&id)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of live entries, provisional included
    pub fn len(&self) -> usize {
        self.conversations.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if an existing entry was overwritten.
    ///
    /// Fields are replaced by the incoming copy except `read`, which only
    /// moves from false to true here; `set_read` is the only way back.
    fn upsert(&mut self, mut msg: Message) -> bool {
        let Some(id) = msg.server_id() else {
            return false;
        };
        if self.get(id).map(|m| m.read).unwrap_or(false) {
            msg.read = true;
        }
        let key = ConversationKey::for_message(&msg);

        if let Some(old_key) = self.confirmed.get(&id).cloned() {
            if old_key == key {
                if let Some(entries) = self.conversations.get_mut(&key) {
                    if let Some(idx) = entries.iter().position(|m| m.id == msg.id) {
                        if entries[idx].sent_at == msg.sent_at {
                            entries[idx] = msg;
                        } else {
                            entries.remove(idx);
                            insert_sorted(entries, msg);
                        }
                        return true;
                    }
                }
            }
            self.remove_entry(&old_key, MessageId::Confirmed(id));
            self.confirmed.insert(id, key.clone());
            insert_sorted(self.conversations.entry(key).or_default(), msg);
            return true;
        }

        self.confirmed.insert(id, key.clone());
        insert_sorted(self.conversations.entry(key).or_default(), msg);
        false
    }

    fn remove_entry(&mut self, key: &ConversationKey, id: MessageId) -> Option<Message> {
        let entries = self.conversations.get_mut(key)?;
        let idx = entries.iter().position(|m| m.id == id)?;
        let removed = entries.remove(idx);
        if entries.is_empty() {
            self.conversations.remove(key);
        }
        Some(removed)
    }
}

fn insert_sorted(entries: &mut Vec<Message>, msg: Message) {
    let key = msg.sort_key();
    let pos = entries.partition_point(|m| m.sort_key() < key);
    entries.insert(pos, msg);
}
