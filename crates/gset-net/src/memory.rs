//! In-process network
//!
//! Connects any number of nodes and clients inside one process. Messages
//! between cluster nodes can be lost at random or blocked by partitions;
//! traffic to and from clients is always delivered, the way a test harness
//! sits outside the faulty network.

use crate::transport::{PendingReplies, Transport, TransportError};
use gset_core::{Envelope, NodeId};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

struct Endpoint {
    inbox: mpsc::Sender<Envelope>,
    pending: Arc<PendingReplies>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: RwLock<HashMap<NodeId, Endpoint>>,
    /// Directed pairs whose traffic is dropped
    partitions: RwLock<HashSet<(NodeId, NodeId)>>,
    /// Probability of dropping a node-to-node message (0.0 - 1.0)
    drop_rate: RwLock<f64>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Shared in-memory network; cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

/// Delivery counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint and return its transport and inbox.
    pub fn join(
        &self,
        id: impl Into<NodeId>,
        inbox_capacity: usize,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<Envelope>) {
        let node_id = id.into();
        let (tx, rx) = mpsc::channel(inbox_capacity);
        let pending = PendingReplies::new();

        self.inner.endpoints.write().insert(
            node_id.clone(),
            Endpoint {
                inbox: tx,
                pending: Arc::clone(&pending),
            },
        );

        let transport = Arc::new(MemoryTransport {
            node_id,
            network: self.clone(),
            pending,
        });
        (transport, rx)
    }

    /// Block all traffic between the two sides, in both directions.
    pub fn partition(&self, side_a: &[NodeId], side_b: &[NodeId]) {
        let mut partitions = self.inner.partitions.write();
        for a in side_a {
            for b in side_b {
                partitions.insert((a.clone(), b.clone()));
                partitions.insert((b.clone(), a.clone()));
            }
        }
    }

    /// Remove every partition.
    pub fn heal(&self) {
        self.inner.partitions.write().clear();
    }

    /// Set the random loss probability for node-to-node messages.
    pub fn set_drop_rate(&self, rate: f64) {
        *self.inner.drop_rate.write() = rate.clamp(0.0, 1.0);
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    fn is_blocked(&self, src: &NodeId, dest: &NodeId) -> bool {
        if src.is_client() || dest.is_client() {
            return false;
        }
        if self
            .inner
            .partitions
            .read()
            .contains(&(src.clone(), dest.clone()))
        {
            return true;
        }
        let rate = *self.inner.drop_rate.read();
        rate > 0.0 && rand::thread_rng().gen::<f64>() < rate
    }

    fn drop_message(&self, envelope: &Envelope, reason: &str) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Dropped {} {} -> {} ({})",
            envelope.payload().kind(),
            envelope.src,
            envelope.dest,
            reason
        );
    }

    fn route(&self, envelope: Envelope) {
        if self.is_blocked(&envelope.src, &envelope.dest) {
            self.drop_message(&envelope, "fault");
            return;
        }

        let target = self
            .inner
            .endpoints
            .read()
            .get(&envelope.dest)
            .map(|ep| (ep.inbox.clone(), Arc::clone(&ep.pending)));
        let Some((inbox, pending)) = target else {
            self.drop_message(&envelope, "unknown destination");
            return;
        };

        let Some(envelope) = pending.resolve(envelope) else {
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match inbox.try_send(envelope) {
            Ok(()) => {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(env))
            | Err(mpsc::error::TrySendError::Closed(env)) => {
                self.drop_message(&env, "inbox unavailable");
            }
        }
    }
}

/// One endpoint's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    node_id: NodeId,
    network: MemoryNetwork,
    pending: Arc<PendingReplies>,
}

impl Transport for MemoryTransport {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn pending(&self) -> &Arc<PendingReplies> {
        &self.pending
    }

    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.network.route(envelope);
        Ok(())
    }
}
