//! Topology manager: this node's peer set
//!
//! The cluster hands every node the full adjacency map once; each node keeps
//! only its own neighbour list. Until that happens the node is
//! `Uninitialized` and the periodic loops have nothing to do.

use crate::vector_clock::VectorClock;
use gset_core::{Adjacency, NodeId};
use parking_lot::RwLock;
use tracing::{info, warn};

/// Process-level lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// No topology yet; handlers answer but loops idle
    Uninitialized,
    /// Peer set known; gossip and anti-entropy running
    Active,
}

struct PeerSet {
    state: NodeState,
    peers: Vec<NodeId>,
}

/// Holds the peer set delivered by the `topology` message
pub struct Topology {
    local: NodeId,
    inner: RwLock<PeerSet>,
}

impl Topology {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            inner: RwLock::new(PeerSet {
                state: NodeState::Uninitialized,
                peers: Vec::new(),
            }),
        }
    }

    /// Adopt this node's neighbours from `adjacency`, replacing any prior
    /// peer set, and seed a zero clock entry for each of them and for self.
    /// Returns the new peer set.
    pub fn set_topology(&self, adjacency: &Adjacency, clock: &VectorClock) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = match adjacency.get(&self.local) {
            Some(neighbours) => neighbours
                .iter()
                .filter(|n| **n != self.local)
                .cloned()
                .collect(),
            None => {
                warn!("Topology does not mention {}; running without peers", self.local);
                Vec::new()
            }
        };
        peers.sort();
        peers.dedup();

        clock.ensure(&self.local);
        for peer in &peers {
            clock.ensure(peer);
        }

        let mut inner = self.inner.write();
        if inner.state == NodeState::Active && inner.peers == peers {
            return peers;
        }
        inner.state = NodeState::Active;
        inner.peers = peers.clone();
        info!("Topology set: {} peers {:?}", peers.len(), peers);
        peers
    }

    pub fn state(&self) -> NodeState {
        self.inner.read().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == NodeState::Active
    }

    /// Current peer set (empty until topology arrives)
    pub fn peers(&self) -> Vec<NodeId> {
        self.inner.read().peers.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.read().peers.len()
    }
}
