/// Read-receipt coordination: dedup, optimistic update, one network call per batch
use crate::conversation::ConversationKey;
use crate::error::SyncError;
use crate::message::ServerId;
use crate::message_log::MessageLog;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

/// Ids sent to the server in one confirmation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub ids: Vec<ServerId>,
}

pub struct ReadReceiptCoordinator {
    local_user_id: String,
    in_flight: HashSet<ServerId>,
    batches_sent: u64,
}

impl ReadReceiptCoordinator {
    pub fn new(local_user_id: String) -> Self {
        Self {
            local_user_id,
            in_flight: HashSet::new(),
            batches_sent: 0,
        }
    }

    /// Flip eligible messages to read and return the batch to confirm.
    ///
    /// Eligible means: present in the log, confirmed, addressed to the local
    /// user, still unread and not already part of an in-flight batch.
    /// Returns `None` when nothing needs a network call.
    pub fn prepare<I>(&mut self, log: &mut MessageLog, ids: I) -> Option<ReadBatch>
    where
        I: IntoIterator<Item = ServerId>,
    {
        let requested: BTreeSet<ServerId> = ids.into_iter().collect();
        let eligible: Vec<ServerId> = requested
            .into_iter()
            .filter(|id| !self.in_flight.contains(id))
            .filter(|id| {
                log.get(*id)
                    .map(|m| !m.read && m.receiver_id == self.local_user_id)
                    .unwrap_or(false)
            })
            .collect();
        if eligible.is_empty() {
            return None;
        }

        log.set_read(&eligible, true);
        self.in_flight.extend(eligible.iter().copied());
        self.batches_sent += 1;
        debug!("Read batch of {} message(s)", eligible.len());
        Some(ReadBatch { ids: eligible })
    }

    /// Server accepted the batch
    pub fn confirm(&mut self, batch: &ReadBatch) {
        for id in &batch.ids {
            self.in_flight.remove(id);
        }
    }

    /// Server rejected the batch: put the affected entries back to unread.
    ///
    /// Ids that a remote read receipt confirmed meanwhile stay read.
    pub fn revert(&mut self, log: &mut MessageLog, batch: ReadBatch, cause: SyncError) -> SyncError {
        let reverted: Vec<ServerId> = batch
            .ids
            .into_iter()
            .filter(|id| self.in_flight.remove(id))
            .collect();
        log.set_read(&reverted, false);
        warn!("Reverted {} read mark(s): {}", reverted.len(), cause);
        SyncError::ReadSyncFailed {
            ids: reverted,
            source: Box::new(cause),
        }
    }

    /// Read receipt pushed by the server
    pub fn on_remote_read(&mut self, log: &mut MessageLog, id: ServerId) -> bool {
        self.in_flight.remove(&id);
        !log.set_read(&[id], true).is_empty()
    }

    /// Unread inbound ids of one conversation
    pub fn unread_in(&self, log: &MessageLog, key: &ConversationKey) -> Vec<ServerId> {
        log.conversation(key)
            .iter()
            .filter(|m| !m.read && m.receiver_id == self.local_user_id)
            .filter_map(|m| m.server_id())
            .collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Batches handed out since construction
    pub fn batches_sent(&self) -> u64 {
        self.batches_sent
    }
}
