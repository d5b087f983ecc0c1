//! Anti-entropy reconciliation
//!
//! One interface, two strategies:
//! - [`PullReconciler`] (default): vector-clock driven delta pulls. A clock
//!   advance learned from a broadcast triggers a pull from the node whose
//!   log grew; a periodic round pulls from every peer to repair anything
//!   gossip or an earlier pull lost.
//! - [`ChecksumReconciler`]: periodic digest heartbeats; a mismatch starts a
//!   full-state `syn` exchange after which both sides hold the union.
//!
//! Every exchange is fire-and-forget from the caller's point of view: the
//! request goes out immediately and a spawned continuation merges the reply,
//! or gives up after the RPC timeout and waits for the next round.

use crate::store::Store;
use crate::vector_clock::{Advance, VectorClock};
use gset_core::{NodeId, Payload, Strategy, Value};
use gset_net::{PendingReply, Transport};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Anti-entropy policy
pub trait Reconciler: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// Digest of the local replica
    fn digest(&self) -> String;

    /// Start one repair exchange with `peer`; never blocks on the reply
    fn reconcile_with(&self, peer: &NodeId);

    /// One proactive round over the peer set
    fn run_round(&self, peers: &[NodeId]) {
        for peer in peers {
            self.reconcile_with(peer);
        }
    }

    /// A broadcast showed `node`'s log grew beyond what we knew
    fn on_clock_advance(&self, _node: &NodeId, _advance: Advance) {}

    /// A peer advertised the digest of its replica
    fn on_heartbeat(&self, from: &NodeId, _checksum: &str) {
        trace!("Ignoring heartbeat from {} ({} strategy)", from, self.strategy());
    }

    fn stats(&self) -> SyncStats;
}

/// Build the configured reconciler
pub fn reconciler(
    strategy: Strategy,
    transport: Arc<dyn Transport>,
    store: Arc<Store>,
    clock: Arc<VectorClock>,
    rpc_timeout: Duration,
) -> Arc<dyn Reconciler> {
    let ctx = SyncContext::new(transport, store, rpc_timeout);
    match strategy {
        Strategy::Pull => Arc::new(PullReconciler::new(ctx, clock)),
        Strategy::Checksum => Arc::new(ChecksumReconciler::new(ctx)),
    }
}

/// Sync statistics
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub strategy: Strategy,
    pub peer_count: usize,
    pub requests: u64,
    pub completed: u64,
    pub failures: u64,
    pub values_merged: u64,
}

#[derive(Default)]
struct SyncCounters {
    requests: AtomicU64,
    completed: AtomicU64,
    failures: AtomicU64,
    values_merged: AtomicU64,
}

/// What every strategy needs to talk to peers and merge replies
#[derive(Clone)]
struct SyncContext {
    transport: Arc<dyn Transport>,
    store: Arc<Store>,
    rpc_timeout: Duration,
    counters: Arc<SyncCounters>,
}

impl SyncContext {
    fn new(transport: Arc<dyn Transport>, store: Arc<Store>, rpc_timeout: Duration) -> Self {
        Self {
            transport,
            store,
            rpc_timeout,
            counters: Arc::new(SyncCounters::default()),
        }
    }

    /// Issue a request, counting it; `None` when it could not be sent
    fn request(&self, peer: &NodeId, payload: Payload) -> Option<PendingReply> {
        let kind = payload.kind();
        match self.transport.rpc(peer, payload) {
            Ok(pending) => {
                self.counters.requests.fetch_add(1, Ordering::Relaxed);
                Some(pending)
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to send {} to {}: {}", kind, peer, e);
                None
            }
        }
    }

    /// Union remote history into the store without touching any clock entry
    fn merge_history(&self, values: Vec<Value>) -> usize {
        let merged = self.store.merge(values);
        self.counters
            .values_merged
            .fetch_add(merged as u64, Ordering::Relaxed);
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        merged
    }

    fn fail(&self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self, strategy: Strategy, peer_count: usize) -> SyncStats {
        SyncStats {
            strategy,
            peer_count,
            requests: self.counters.requests.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            values_merged: self.counters.values_merged.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// PULL STRATEGY
// =============================================================================

/// Sync progress for one peer
#[derive(Debug, Clone, Default)]
pub struct PeerSyncState {
    /// Length of the prefix of the peer's log we have integrated
    pub pulled: u64,
    /// Last successful exchange
    pub last_sync: Option<Instant>,
    /// Number of successful exchanges
    pub sync_count: u64,
    /// Consecutive failures
    pub failures: u32,
}

type PeerStates = Arc<RwLock<HashMap<NodeId, PeerSyncState>>>;

/// Delta pulls driven by vector clock gaps
pub struct PullReconciler {
    ctx: SyncContext,
    clock: Arc<VectorClock>,
    peers: PeerStates,
}

impl PullReconciler {
    fn new(ctx: SyncContext, clock: Arc<VectorClock>) -> Self {
        Self {
            ctx,
            clock,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Integrated prefix length for `peer`
    pub fn pulled(&self, peer: &NodeId) -> u64 {
        self.peers.read().get(peer).map(|s| s.pulled).unwrap_or(0)
    }

    /// Ask `peer` for `log[since..]` and merge the answer when it comes
    pub fn pull(&self, peer: &NodeId, since: u64) {
        let Some(pending) = self.ctx.request(peer, Payload::Pull { version: since }) else {
            mark_failure(&self.peers, peer);
            return;
        };
        trace!("Pulling from {} since {}", peer, since);

        let ctx = self.ctx.clone();
        let peers = Arc::clone(&self.peers);
        let peer = peer.clone();
        tokio::spawn(async move {
            match pending.wait(ctx.rpc_timeout).await {
                Ok(reply) => match reply.body.payload {
                    Payload::PullOk { message } => {
                        let received = message.len() as u64;
                        let merged = ctx.merge_history(message);
                        record_pull(&peers, &peer, since, received);
                        if merged > 0 {
                            debug!("Pulled {} new values from {} (since {})", merged, peer, since);
                        }
                    }
                    Payload::Error { code, text } => {
                        ctx.fail();
                        mark_failure(&peers, &peer);
                        warn!("Pull from {} rejected ({}): {}", peer, code, text);
                    }
                    other => {
                        ctx.fail();
                        mark_failure(&peers, &peer);
                        warn!("Unexpected {} in reply to pull from {}", other.kind(), peer);
                    }
                },
                Err(e) => {
                    ctx.fail();
                    mark_failure(&peers, &peer);
                    debug!("Pull from {} abandoned: {}", peer, e);
                }
            }
        });
    }
}

fn record_pull(peers: &PeerStates, peer: &NodeId, since: u64, received: u64) {
    let mut peers = peers.write();
    let state = peers.entry(peer.clone()).or_default();
    // only a reply that starts inside the integrated prefix extends it
    if since <= state.pulled {
        state.pulled = state.pulled.max(since + received);
    }
    state.last_sync = Some(Instant::now());
    state.sync_count += 1;
    state.failures = 0;
}

fn record_syn(peers: &PeerStates, peer: &NodeId) {
    let mut peers = peers.write();
    let state = peers.entry(peer.clone()).or_default();
    state.last_sync = Some(Instant::now());
    state.sync_count += 1;
    state.failures = 0;
}

fn mark_failure(peers: &PeerStates, peer: &NodeId) {
    let mut peers = peers.write();
    peers.entry(peer.clone()).or_default().failures += 1;
}

impl Reconciler for PullReconciler {
    fn strategy(&self) -> Strategy {
        Strategy::Pull
    }

    fn digest(&self) -> String {
        self.ctx.store.digest()
    }

    /// Pull everything past the integrated prefix. In steady state this is
    /// the peer's advertised clock entry; after a lost pull it is lower.
    fn reconcile_with(&self, peer: &NodeId) {
        let since = self.pulled(peer);
        if since < self.clock.get(peer) {
            debug!(
                "Repairing gap with {}: integrated {} of advertised {}",
                peer,
                since,
                self.clock.get(peer)
            );
        }
        self.pull(peer, since);
    }

    fn on_clock_advance(&self, node: &NodeId, advance: Advance) {
        trace!("{} advanced {} -> {}", node, advance.from, advance.to);
        self.pull(node, advance.from);
    }

    fn stats(&self) -> SyncStats {
        self.ctx.stats(Strategy::Pull, self.peers.read().len())
    }
}

// =============================================================================
// CHECKSUM STRATEGY
// =============================================================================

/// Digest heartbeats with full-state `syn` exchange on mismatch
pub struct ChecksumReconciler {
    ctx: SyncContext,
    /// Peers we have exchanged heartbeats with; `pulled` stays unused
    peers: PeerStates,
}

impl ChecksumReconciler {
    fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sync progress for `peer`, if we have heard from or written to it
    pub fn peer_state(&self, peer: &NodeId) -> Option<PeerSyncState> {
        self.peers.read().get(peer).cloned()
    }

    fn track(&self, peer: &NodeId) {
        if !self.peers.read().contains_key(peer) {
            self.peers.write().entry(peer.clone()).or_default();
        }
    }

    /// Send our full value list to `peer` and merge the list it answers with
    pub fn syn(&self, peer: &NodeId) {
        let store = self.ctx.store.snapshot();
        let Some(pending) = self.ctx.request(peer, Payload::Syn { store }) else {
            mark_failure(&self.peers, peer);
            return;
        };

        let ctx = self.ctx.clone();
        let peers = Arc::clone(&self.peers);
        let peer = peer.clone();
        tokio::spawn(async move {
            match pending.wait(ctx.rpc_timeout).await {
                Ok(reply) => match reply.body.payload {
                    Payload::SynOk { store } => {
                        let merged = ctx.merge_history(store);
                        record_syn(&peers, &peer);
                        if merged > 0 {
                            debug!("Syn with {} merged {} values", peer, merged);
                        }
                    }
                    other => {
                        ctx.fail();
                        mark_failure(&peers, &peer);
                        warn!("Unexpected {} in reply to syn from {}", other.kind(), peer);
                    }
                },
                Err(e) => {
                    ctx.fail();
                    mark_failure(&peers, &peer);
                    debug!("Syn with {} abandoned: {}", peer, e);
                }
            }
        });
    }

    fn heartbeat(&self, peer: &NodeId, checksum: String) {
        self.track(peer);
        if let Err(e) = self.ctx.transport.send(peer, Payload::Heartbeat { checksum }) {
            self.ctx.fail();
            warn!("Heartbeat to {} failed: {}", peer, e);
        }
    }
}

impl Reconciler for ChecksumReconciler {
    fn strategy(&self) -> Strategy {
        Strategy::Checksum
    }

    fn digest(&self) -> String {
        self.ctx.store.digest()
    }

    fn reconcile_with(&self, peer: &NodeId) {
        self.heartbeat(peer, self.digest());
    }

    fn run_round(&self, peers: &[NodeId]) {
        let checksum = self.digest();
        for peer in peers {
            self.heartbeat(peer, checksum.clone());
        }
    }

    fn on_heartbeat(&self, from: &NodeId, checksum: &str) {
        self.track(from);
        if checksum == self.digest() {
            return;
        }
        debug!("Digest mismatch with {}; starting syn", from);
        self.syn(from);
    }

    fn stats(&self) -> SyncStats {
        self.ctx.stats(Strategy::Checksum, self.peers.read().len())
    }
}
