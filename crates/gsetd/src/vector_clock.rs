//! Vector clock of per-node log lengths
//!
//! Entry `n` counts how many values node `n` has appended to its own log, as
//! far as this node knows. Only the local entry is ever incremented; remote
//! entries move by max-merge. Each entry is an atomic so merges for
//! different nodes never contend and merges for the same node never lose an
//! update; the map lock is only taken to look up or add entries.
//!
//! With durable storage attached, the local entry is written through on
//! every increment and restored on open. It counts only values this node
//! accepted, which is less than the log length once pulls have merged
//! history.

use crate::storage::{Storage, StorageError};
use gset_core::{ClockSnapshot, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Thread-safe vector clock
pub struct VectorClock {
    local: NodeId,
    entries: RwLock<HashMap<NodeId, Arc<AtomicU64>>>,
    storage: Option<Arc<Storage>>,
}

/// Outcome of a remote merge that moved an entry forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub from: u64,
    pub to: u64,
}

impl VectorClock {
    /// Create a clock holding only the local entry, at zero
    pub fn new(local: NodeId) -> Self {
        let mut entries = HashMap::new();
        entries.insert(local.clone(), Arc::new(AtomicU64::new(0)));
        Self {
            local,
            entries: RwLock::new(entries),
            storage: None,
        }
    }

    /// Create a clock whose local entry is persisted, resuming from the
    /// last stored count
    pub fn with_storage(local: NodeId, storage: Arc<Storage>) -> Result<Self, StorageError> {
        let restored = storage.load_counter(&local)?;
        let mut clock = Self::new(local);
        clock.restore_self(restored);
        clock.storage = Some(storage);
        Ok(clock)
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Look up an entry, inserting it at zero on first mention
    fn entry(&self, node: &NodeId) -> Arc<AtomicU64> {
        if let Some(counter) = self.entries.read().get(node) {
            return Arc::clone(counter);
        }
        // re-check under the write lock; another thread may have inserted it
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(node.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    /// Make sure `node` has an entry, without changing its value
    pub fn ensure(&self, node: &NodeId) {
        self.entry(node);
    }

    pub fn get(&self, node: &NodeId) -> u64 {
        self.entries
            .read()
            .get(node)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Record one more value in the local log; returns the new count
    pub fn increment_self(&self) -> u64 {
        let counter = self.entry(&self.local).fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.raise_counter(&self.local, counter) {
                warn!("Failed to persist clock entry {}: {}", counter, e);
            }
        }
        counter
    }

    /// Max-merge a remote counter. Returns the advance when it moved.
    pub fn merge_remote(&self, node: &NodeId, counter: u64) -> Option<Advance> {
        let previous = self.entry(node).fetch_max(counter, Ordering::AcqRel);
        (counter > previous).then_some(Advance {
            from: previous,
            to: counter,
        })
    }

    /// Raise the local entry to a previously persisted count
    pub fn restore_self(&self, counter: u64) {
        self.entry(&self.local).fetch_max(counter, Ordering::AcqRel);
    }

    /// Copy of every entry, as attached to outgoing broadcasts
    pub fn snapshot(&self) -> ClockSnapshot {
        self.entries
            .read()
            .iter()
            .map(|(node, c)| (node.clone(), c.load(Ordering::Acquire)))
            .collect()
    }

    /// Number of nodes tracked
    pub fn node_count(&self) -> usize {
        self.entries.read().len()
    }
}
