//! Replicated grow-only set store
//!
//! Values are kept twice: in a log that records local insertion order (the
//! sequence peers pull deltas from) and in a hash set for membership tests.
//! Both live behind one lock so they never disagree.

use crate::storage::{Storage, StorageError};
use gset_core::canonical::set_digest;
use gset_core::Value;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

#[derive(Default)]
struct SetState {
    log: Vec<Value>,
    members: HashSet<Value>,
}

impl SetState {
    /// Returns the log index of `value` when it was newly inserted
    fn insert(&mut self, value: Value) -> Option<u64> {
        if !self.members.insert(value) {
            return None;
        }
        self.log.push(value);
        Some(self.log.len() as u64 - 1)
    }
}

/// Append-only, deduplicated value set (G-Set)
pub struct Store {
    state: RwLock<SetState>,
    storage: Option<Arc<Storage>>,
}

impl Store {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SetState::default()),
            storage: None,
        }
    }

    /// Create a store backed by a durable log, reloading what it holds
    pub fn with_storage(storage: Arc<Storage>) -> Result<Self, StorageError> {
        let mut state = SetState::default();
        for value in storage.load_log()? {
            state.insert(value);
        }
        Ok(Self {
            state: RwLock::new(state),
            storage: Some(storage),
        })
    }

    /// Insert a value; returns whether it was new
    pub fn add(&self, value: Value) -> bool {
        let mut state = self.state.write();
        match state.insert(value) {
            Some(index) => {
                self.persist(index, value);
                true
            }
            None => false,
        }
    }

    /// Union a batch of values into the set; returns how many were new
    pub fn merge(&self, values: impl IntoIterator<Item = Value>) -> usize {
        let mut state = self.state.write();
        let mut added = 0;
        for value in values {
            if let Some(index) = state.insert(value) {
                self.persist(index, value);
                added += 1;
            }
        }
        added
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.state.read().members.contains(value)
    }

    /// Current log in local insertion order
    pub fn snapshot(&self) -> Vec<Value> {
        self.state.read().log.clone()
    }

    /// Log entries at positions `index..`; empty past the end
    pub fn since(&self, index: u64) -> Vec<Value> {
        let state = self.state.read();
        usize::try_from(index)
            .ok()
            .and_then(|start| state.log.get(start..))
            .map(<[Value]>::to_vec)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.read().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Order-independent digest of the current membership
    pub fn digest(&self) -> String {
        let state = self.state.read();
        match set_digest(&state.log) {
            Ok(digest) => digest,
            Err(e) => {
                warn!("Digest encoding failed: {}", e);
                String::new()
            }
        }
    }

    /// Flush the durable log, if any
    pub fn flush(&self) -> Result<(), StorageError> {
        match &self.storage {
            Some(storage) => storage.flush(),
            None => Ok(()),
        }
    }

    fn persist(&self, index: u64, value: Value) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.put_value(index, value) {
                warn!("Failed to persist value {} at {}: {}", value, index, e);
            }
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
