//! Correlation table: request id -> single-use reply slot.
//!
//! An entry is removed from the map before its slot is resolved, so an id
//! can never be resolved twice.

use crate::engine::channel::{Failure, Reply};
use crate::error::{Result, VaasError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};

pub type ReplySlot = oneshot::Receiver<Reply>;

#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    idle: Notify,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
        // No code path panics while holding the lock; recover anyway
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a reply slot for `id`.
    pub fn register(&self, id: &str) -> Result<ReplySlot> {
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(VaasError::InvalidOperation(format!(
                "request id {} is already pending",
                id
            )));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Deliver `reply` to the entry for `id`. Returns false when there is no
    /// such entry (late, duplicate or cancelled).
    pub fn resolve(&self, id: &str, reply: Reply) -> bool {
        let Some(slot) = self.take(id) else {
            return false;
        };
        if slot.send(reply).is_err() {
            tracing::debug!(guid = %id, "caller stopped waiting before its reply arrived");
        }
        true
    }

    /// Remove the entry for `id` without resolving it.
    pub fn cancel(&self, id: &str) -> bool {
        self.take(id).is_some()
    }

    /// Resolve every outstanding entry with `failure`. Returns how many
    /// entries were failed.
    pub fn fail_all(&self, failure: Failure) -> usize {
        let drained: Vec<_> = {
            let mut entries = self.entries();
            entries.drain().collect()
        };
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.send(Reply::Failed(failure.clone()));
        }
        if count > 0 {
            self.idle.notify_waiters();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    /// Wait until no entry is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn take(&self, id: &str) -> Option<oneshot::Sender<Reply>> {
        let (slot, now_empty) = {
            let mut entries = self.entries();
            let slot = entries.remove(id);
            (slot, entries.is_empty())
        };
        if slot.is_some() && now_empty {
            self.idle.notify_waiters();
        }
        slot
    }
}

// =============================================================================
// Tests
// =============================================================================
