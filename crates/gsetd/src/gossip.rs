//! Gossip disseminator
//!
//! Newly accepted values wait in a pending batch until the next gossip tick.
//! Each tick drains the batch and sends every value to a random half of the
//! peer set, together with the local vector clock. The hop budget carried on
//! each broadcast bounds how far a value travels by gossip alone; the
//! anti-entropy reconciler fills in whatever gossip misses.

use crate::store::Store;
use crate::topology::Topology;
use crate::vector_clock::VectorClock;
use gset_core::{NodeId, Payload, Value};
use gset_net::Transport;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A value waiting for the next gossip round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingValue {
    pub value: Value,
    /// Hop budget to attach when sending
    pub hops: u32,
}

/// Number of peers each value is sent to: half the peer set, at least one.
pub fn fanout(peer_count: usize) -> usize {
    if peer_count == 0 {
        0
    } else {
        (peer_count / 2).max(1)
    }
}

/// Hop budget left for a value after it arrives.
///
/// Peers decrement the budget they received; values without a budget, and
/// values submitted by clients, start from `origin_hops`.
pub fn remaining_hops(heartbeat: Option<u32>, from: &NodeId, origin_hops: u32) -> u32 {
    match heartbeat {
        Some(hops) if !from.is_client() => hops.saturating_sub(1),
        Some(hops) => hops,
        None => origin_hops,
    }
}

/// Gossip statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct GossipStats {
    pub rounds: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub pending: usize,
}

/// Batched, randomized fan-out of accepted values
pub struct Gossip {
    transport: Arc<dyn Transport>,
    store: Arc<Store>,
    clock: Arc<VectorClock>,
    topology: Arc<Topology>,
    pending: Mutex<Vec<PendingValue>>,
    rounds: AtomicU64,
    sent: AtomicU64,
    failures: AtomicU64,
}

impl Gossip {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<Store>,
        clock: Arc<VectorClock>,
        topology: Arc<Topology>,
    ) -> Self {
        Self {
            transport,
            store,
            clock,
            topology,
            pending: Mutex::new(Vec::new()),
            rounds: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Take in a value from a client or a peer broadcast.
    ///
    /// A value seen for the first time grows the local log, so the local
    /// clock entry moves by one; it is queued for gossip while it still has
    /// hops left. Returns whether the value was new.
    pub fn accept(&self, value: Value, hops: u32) -> bool {
        if !self.store.add(value) {
            return false;
        }
        self.clock.increment_self();
        self.enqueue(value, hops);
        true
    }

    /// Queue a value for the next round
    pub fn enqueue(&self, value: Value, hops: u32) {
        if hops == 0 {
            return;
        }
        self.pending.lock().push(PendingValue { value, hops });
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drain the pending batch and send each value to a random subset of
    /// peers. Returns the number of messages handed to the transport.
    pub fn tick(&self) -> usize {
        if !self.topology.is_active() {
            return 0;
        }

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return 0;
        }

        let peers = self.topology.peers();
        if peers.is_empty() {
            debug!("No peers; discarding {} pending values", batch.len());
            return 0;
        }

        let clock = self.clock.snapshot();
        let width = fanout(peers.len());
        let mut rng = rand::thread_rng();
        let mut sent = 0;

        for item in &batch {
            for peer in peers.choose_multiple(&mut rng, width) {
                let payload = Payload::Broadcast {
                    message: item.value,
                    heartbeat: Some(item.hops),
                    clock: Some(clock.clone()),
                    store: None,
                };
                match self.transport.send(peer, payload) {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        warn!("Gossip of {} to {} failed: {}", item.value, peer, e);
                    }
                }
            }
        }

        self.rounds.fetch_add(1, Ordering::Relaxed);
        self.sent.fetch_add(sent as u64, Ordering::Relaxed);
        debug!(
            "Gossip round: {} values, fanout {}, {} messages",
            batch.len(),
            width,
            sent
        );
        sent
    }

    pub fn stats(&self) -> GossipStats {
        GossipStats {
            rounds: self.rounds.load(Ordering::Relaxed),
            messages_sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.failures.load(Ordering::Relaxed),
            pending: self.pending_len(),
        }
    }
}
