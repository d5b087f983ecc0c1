//! gsetd node - message dispatch and periodic loops

use crate::config::Config;
use crate::gossip::{remaining_hops, Gossip, GossipStats};
use crate::storage::{Storage, StorageError};
use crate::store::Store;
use crate::sync::{reconciler, Reconciler, SyncStats};
use crate::topology::{NodeState, Topology};
use crate::vector_clock::VectorClock;
use gset_core::message::error_code;
use gset_core::{ClockSnapshot, Envelope, NodeId, Payload, Value};
use gset_net::{Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// One replica of the grow-only set
pub struct Node {
    config: Config,
    transport: Arc<dyn Transport>,
    store: Arc<Store>,
    clock: Arc<VectorClock>,
    topology: Arc<Topology>,
    gossip: Arc<Gossip>,
    reconciler: Arc<dyn Reconciler>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Create a node speaking through `transport`.
    ///
    /// With a data directory configured the value log is reopened from
    /// `<data_dir>/<node_id>` and the local clock entry resumes at the
    /// number of values this node had accepted.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, ServerError> {
        let local = transport.node_id().clone();

        let (store, clock) = match &config.data_dir {
            Some(dir) => {
                let storage = Arc::new(Storage::open(dir.join(local.as_str()))?);
                let store = Store::with_storage(Arc::clone(&storage))?;
                let clock = VectorClock::with_storage(local.clone(), storage)?;
                if !store.is_empty() {
                    info!(
                        "Recovered {} values from durable log ({} accepted locally)",
                        store.len(),
                        clock.get(&local)
                    );
                }
                (store, clock)
            }
            None => (Store::new(), VectorClock::new(local.clone())),
        };
        let store = Arc::new(store);
        let clock = Arc::new(clock);

        let topology = Arc::new(Topology::new(local));
        let gossip = Arc::new(Gossip::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&topology),
        ));
        let reconciler = reconciler(
            config.strategy,
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&clock),
            config.rpc_timeout(),
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            transport,
            store,
            clock,
            topology,
            gossip,
            reconciler,
            shutdown_tx,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        self.transport.node_id()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<VectorClock> {
        &self.clock
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Serve `inbox` until it closes or shutdown is requested.
    ///
    /// Each inbound message is handled on its own task; the gossip and
    /// reconcile timers run alongside.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Envelope>) -> Result<(), ServerError> {
        info!(
            "Starting node {} (strategy: {}, gossip every {:?}, reconcile every {:?})",
            self.node_id(),
            self.config.strategy,
            self.config.gossip_interval(),
            self.config.reconcile_interval()
        );

        let gossip_handle = self.spawn_gossip_task();
        let reconcile_handle = self.spawn_reconcile_task();

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                received = inbox.recv() => {
                    match received {
                        Some(envelope) => {
                            let node = Arc::clone(&self);
                            tokio::spawn(async move { node.handle(envelope) });
                        }
                        None => {
                            info!("Inbox closed");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        // stop the timers when we left because the inbox closed
        self.shutdown();
        for handle in [gossip_handle, reconcile_handle] {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.store.flush()?;
        Ok(())
    }

    fn spawn_gossip_task(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let period = self.config.gossip_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = ticker(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        node.gossip_tick();
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    fn spawn_reconcile_task(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let period = self.config.reconcile_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = ticker(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        node.reconcile_tick();
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Flush pending values to a random half of the peers
    pub fn gossip_tick(&self) -> usize {
        self.gossip.tick()
    }

    /// One anti-entropy round over the peer set
    pub fn reconcile_tick(&self) {
        if !self.topology.is_active() {
            return;
        }
        let peers = self.topology.peers();
        if peers.is_empty() {
            return;
        }
        trace!("Reconcile round over {} peers", peers.len());
        self.reconciler.run_round(&peers);
    }

    /// Handle one inbound message. Failures are logged, never propagated.
    pub fn handle(&self, envelope: Envelope) {
        let kind = envelope.payload().kind();
        if let Err(e) = self.dispatch(&envelope) {
            warn!("Failed to handle {} from {}: {}", kind, envelope.src, e);
        }
    }

    fn dispatch(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let from = &envelope.src;
        match envelope.payload() {
            Payload::Init { .. } => {
                debug!("Repeated init from {}", from);
                self.transport.reply(envelope, Payload::InitOk)
            }
            Payload::Echo { echo } => self.transport.reply(
                envelope,
                Payload::EchoOk {
                    echo: echo.clone(),
                },
            ),
            Payload::Topology { topology } => {
                self.topology.set_topology(topology, &self.clock);
                self.transport.reply(envelope, Payload::TopologyOk)
            }
            Payload::Broadcast {
                message,
                heartbeat,
                clock,
                store,
            } => {
                self.on_broadcast(from, *message, *heartbeat, clock.as_ref(), store.as_deref());
                if from.is_client() && envelope.body.msg_id.is_some() {
                    self.transport.reply(envelope, Payload::BroadcastOk)
                } else {
                    Ok(())
                }
            }
            Payload::Read => self.transport.reply(
                envelope,
                Payload::ReadOk {
                    messages: self.store.snapshot(),
                },
            ),
            Payload::Pull { version } => self.transport.reply(
                envelope,
                Payload::PullOk {
                    message: self.store.since(*version),
                },
            ),
            Payload::Syn { store } => {
                let merged = self.store.merge(store.iter().copied());
                if merged > 0 {
                    debug!("Syn from {} merged {} values", from, merged);
                }
                self.transport.reply(
                    envelope,
                    Payload::SynOk {
                        store: self.store.snapshot(),
                    },
                )
            }
            Payload::Heartbeat { checksum } => {
                self.reconciler.on_heartbeat(from, checksum);
                Ok(())
            }
            Payload::Reconcile { store } => {
                let merged = self.store.merge(store.iter().copied());
                if merged > 0 {
                    debug!("Reconcile from {} merged {} values", from, merged);
                }
                Ok(())
            }
            Payload::Error { code, text } => {
                warn!("Error {} from {}: {}", code, from, text);
                Ok(())
            }
            Payload::InitOk
            | Payload::EchoOk { .. }
            | Payload::TopologyOk
            | Payload::BroadcastOk
            | Payload::ReadOk { .. }
            | Payload::PullOk { .. }
            | Payload::SynOk { .. } => {
                // late reply whose request already timed out
                debug!("Unsolicited {} from {}", envelope.payload().kind(), from);
                Ok(())
            }
            Payload::Unknown => {
                if envelope.body.msg_id.is_none() {
                    debug!("Ignoring unknown message from {}", from);
                    return Ok(());
                }
                self.transport.reply(
                    envelope,
                    Payload::error(error_code::NOT_SUPPORTED, "message type not supported"),
                )
            }
        }
    }

    fn on_broadcast(
        &self,
        from: &NodeId,
        value: Value,
        heartbeat: Option<u32>,
        clock: Option<&ClockSnapshot>,
        history: Option<&[Value]>,
    ) {
        if let Some(remote) = clock {
            for (node, counter) in remote {
                // our own entry only ever moves by local appends
                if node == self.node_id() {
                    continue;
                }
                if let Some(advance) = self.clock.merge_remote(node, *counter) {
                    self.reconciler.on_clock_advance(node, advance);
                }
            }
        }

        let hops = remaining_hops(heartbeat, from, self.config.gossip_hops);
        if self.gossip.accept(value, hops) {
            trace!("Accepted {} from {} ({} hops left)", value, from, hops);
        }

        if let Some(history) = history {
            self.store.merge(history.iter().copied());
        }
    }

    /// Request shutdown of the run loop and timers
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Node statistics
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            node_id: self.node_id().clone(),
            state: self.topology.state(),
            peer_count: self.topology.peer_count(),
            value_count: self.store.len(),
            clock: self.clock.snapshot(),
            gossip: self.gossip.stats(),
            sync: self.reconciler.stats(),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub state: NodeState,
    pub peer_count: usize,
    pub value_count: usize,
    pub clock: ClockSnapshot,
    pub gossip: GossipStats,
    pub sync: SyncStats,
}
