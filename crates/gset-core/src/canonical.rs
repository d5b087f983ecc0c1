//! Canonical digests of a value set
//!
//! Two replicas holding the same set must produce the same digest no matter
//! in which order they learned the values, so the digest is taken over the
//! sorted, deduplicated sequence:
//! - Values are sorted ascending and deduped
//! - The sequence is encoded with postcard
//! - The bytes are hashed with BLAKE3 under a domain tag and hex-encoded

use crate::error::{Error, Result};
use crate::types::Value;
use blake3::Hasher;
use serde::Serialize;

/// Domain separation tag for set digests
const SET_DIGEST_TAG: &[u8] = b"gset-digest-v1:";

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Sort and dedup a value sequence into its canonical form.
pub fn canonical_set(values: &[Value]) -> Vec<Value> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

/// Order-independent digest of a value set, hex-encoded.
pub fn set_digest(values: &[Value]) -> Result<String> {
    let bytes = canonical_bytes(&canonical_set(values))?;
    let mut hasher = Hasher::new();
    hasher.update(SET_DIGEST_TAG);
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(raw: &[i64]) -> Vec<Value> {
        raw.iter().copied().map(Value).collect()
    }

    #[test]
    fn test_digest_ignores_insertion_order() {
        let a = set_digest(&values(&[3, 1, 2])).unwrap();
        let b = set_digest(&values(&[1, 2, 3])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_detects_divergence() {
        let a = set_digest(&values(&[1, 2, 3])).unwrap();
        let b = set_digest(&values(&[1, 2])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_digest_is_stable() {
        let a = set_digest(&[]).unwrap();
        assert_eq!(a, set_digest(&[]).unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_canonical_set_dedups() {
        assert_eq!(canonical_set(&values(&[5, 1, 5, 1])), values(&[1, 5]));
    }
}
