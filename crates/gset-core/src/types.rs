//! Core gset types
//!
//! Values are opaque integers; nodes are named by stable strings. Both are
//! plain newtypes so they serialize as bare JSON scalars on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// VALUES
// =============================================================================

/// A replicated value. Only equality matters to replication; ordering is
/// used to build canonical digests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(pub i64);

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// NODES
// =============================================================================

/// Identifier of a node or client, stable for the process lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Client-class senders are addressed `c<N>`; cluster nodes `n<N>`.
    pub fn is_client(&self) -> bool {
        self.0.starts_with('c')
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// CLOCKS & TOPOLOGY
// =============================================================================

/// Point-in-time copy of a vector clock, as carried on broadcasts.
pub type ClockSnapshot = BTreeMap<NodeId, u64>;

/// Cluster-wide adjacency description delivered by the `topology` message.
pub type Adjacency = BTreeMap<NodeId, Vec<NodeId>>;

/// Which anti-entropy policy a node runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Vector-clock driven delta pulls
    #[default]
    Pull,
    /// Digest heartbeats with full-state syn exchange
    Checksum,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pull" => Ok(Self::Pull),
            "checksum" => Ok(Self::Checksum),
            other => Err(format!("unknown strategy '{other}' (expected pull or checksum)")),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pull => f.write_str("pull"),
            Self::Checksum => f.write_str("checksum"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_addressing() {
        assert!(NodeId::from("c1").is_client());
        assert!(NodeId::from("c42").is_client());
        assert!(!NodeId::from("n1").is_client());
        assert!(!NodeId::from("").is_client());
    }

    #[test]
    fn test_scalar_json() {
        let json = serde_json::to_string(&Value(7)).unwrap();
        assert_eq!(json, "7");

        let id: NodeId = serde_json::from_str("\"n3\"").unwrap();
        assert_eq!(id.as_str(), "n3");
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("pull".parse::<Strategy>().unwrap(), Strategy::Pull);
        assert_eq!("checksum".parse::<Strategy>().unwrap(), Strategy::Checksum);
        assert!("flood".parse::<Strategy>().is_err());
    }
}
