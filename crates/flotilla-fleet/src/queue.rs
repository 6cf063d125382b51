use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::backend::BackendLease;

/// A waiter parked until a backend for its model reaches Ready.
pub(crate) struct QueueEntry {
    pub(crate) id: u64,
    pub(crate) model: String,
    pub(crate) enqueued_at: Instant,
    pub(crate) tx: oneshot::Sender<BackendLease>,
}

/// Bounded FIFO of waiters across all models.
///
/// Guarded by its own mutex in the manager; the fleet lock may be taken
/// around it only in the drain path (fixed state → queue order).
pub(crate) struct WaitQueue {
    entries: VecDeque<QueueEntry>,
    next_id: u64,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Park a waiter. Fails fast when the queue is at capacity, after
    /// first purging entries whose waiter has already given up.
    pub(crate) fn push(
        &mut self,
        model: &str,
        max_size: usize,
    ) -> Result<(u64, oneshot::Receiver<BackendLease>), usize> {
        if self.entries.len() >= max_size {
            self.entries.retain(|e| !e.tx.is_closed());
        }
        if self.entries.len() >= max_size {
            return Err(self.entries.len());
        }

        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.entries.push_back(QueueEntry {
            id,
            model: model.to_string(),
            enqueued_at: Instant::now(),
            tx,
        });
        Ok((id, rx))
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.entries.retain(|e| e.id != id);
    }

    /// Pull every live waiter for `model`, oldest first. Abandoned
    /// entries (closed receivers) are dropped along the way.
    pub(crate) fn take_for_model(&mut self, model: &str) -> Vec<QueueEntry> {
        let mut taken = Vec::new();
        let mut rest = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.tx.is_closed() {
                continue;
            }
            if entry.model == model {
                taken.push(entry);
            } else {
                rest.push_back(entry);
            }
        }
        self.entries = rest;
        taken.sort_by_key(|e| e.enqueued_at);
        taken
    }

    /// Distinct queued model names in FIFO order of first appearance.
    pub(crate) fn pending_models(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for entry in &self.entries {
            if entry.tx.is_closed() {
                continue;
            }
            if !out.iter().any(|m| m == &entry.model) {
                out.push(entry.model.clone());
            }
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
