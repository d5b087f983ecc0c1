//! Durable value log using sled

use gset_core::{NodeId, Value};
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Log gap at index {0}")]
    Gap(u64),
}

/// Storage backend for the replicated set
pub struct Storage {
    db: Db,
    /// Value log tree: big-endian log index -> Value
    values: sled::Tree,
    /// Clock tree: node id -> big-endian counter
    clock: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let values = db.open_tree("values")?;
        let clock = db.open_tree("clock")?;
        Ok(Self { db, values, clock })
    }

    /// Record the value at a log position
    pub fn put_value(&self, index: u64, value: Value) -> Result<(), StorageError> {
        let bytes = postcard::to_allocvec(&value)?;
        self.values.insert(index.to_be_bytes(), bytes)?;
        Ok(())
    }

    /// Load the whole log in index order
    pub fn load_log(&self) -> Result<Vec<Value>, StorageError> {
        let mut log = Vec::with_capacity(self.values.len());
        for result in self.values.iter() {
            let (key, bytes) = result?;
            let index = u64::from_be_bytes(key.as_ref().try_into().unwrap_or([0xff; 8]));
            if index != log.len() as u64 {
                return Err(StorageError::Gap(log.len() as u64));
            }
            log.push(postcard::from_bytes(&bytes)?);
        }
        Ok(log)
    }

    /// Raise a stored clock counter; never lowers it
    pub fn raise_counter(&self, node: &NodeId, counter: u64) -> Result<(), StorageError> {
        self.clock.fetch_and_update(node.as_str().as_bytes(), |old| {
            let current = old.map(decode_counter).unwrap_or(0);
            Some(current.max(counter).to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    /// Stored clock counter for `node`, zero when never written
    pub fn load_counter(&self, node: &NodeId) -> Result<u64, StorageError> {
        Ok(self
            .clock
            .get(node.as_str().as_bytes())?
            .map(|bytes| decode_counter(&bytes))
            .unwrap_or(0))
    }

    /// Number of persisted values
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_counter(bytes: &[u8]) -> u64 {
    bytes.try_into().map(u64::from_be_bytes).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_storage_log_order() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        // sled iterates keys lexicographically; big-endian keeps index order
        for (i, v) in [10, 20, 300, 4000].into_iter().enumerate() {
            storage.put_value(i as u64, Value(v)).unwrap();
        }

        let log = storage.load_log().unwrap();
        assert_eq!(log, vec![Value(10), Value(20), Value(300), Value(4000)]);
        assert_eq!(storage.value_count(), 4);
    }

    #[test]
    fn test_storage_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.put_value(0, Value(-7)).unwrap();
            storage.flush().unwrap();
        }

        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.load_log().unwrap(), vec![Value(-7)]);
    }

    #[test]
    fn test_storage_gap_detected() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.put_value(0, Value(1)).unwrap();
        storage.put_value(2, Value(3)).unwrap();

        assert!(matches!(storage.load_log(), Err(StorageError::Gap(1))));
    }

    #[test]
    fn test_counter_only_rises() {
        let dir = tempdir().unwrap();
        let n1 = NodeId::from("n1");
        {
            let storage = Storage::open(dir.path()).unwrap();
            assert_eq!(storage.load_counter(&n1).unwrap(), 0);
            storage.raise_counter(&n1, 3).unwrap();
            storage.raise_counter(&n1, 2).unwrap();
            storage.flush().unwrap();
        }

        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.load_counter(&n1).unwrap(), 3);
        assert_eq!(storage.load_counter(&NodeId::from("n2")).unwrap(), 0);
    }
}
