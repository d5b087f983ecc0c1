//! Multi-node behaviour over the in-memory network.
//!
//! Timers are set far apart so every test drives gossip and reconcile rounds
//! by hand; nodes still handle inbound messages on their own tasks.

use clap::Parser;
use gset_core::{Adjacency, Envelope, NodeId, Payload, Value};
use gset_net::{MemoryNetwork, MemoryTransport, Transport};
use gsetd::{Config, Node};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn id(s: &str) -> NodeId {
    NodeId::from(s)
}

fn config(strategy: &str) -> Config {
    Config::parse_from([
        "gsetd",
        "--gossip-interval-ms",
        "3600000",
        "--reconcile-interval-ms",
        "3600000",
        "--rpc-timeout-ms",
        "200",
        "--strategy",
        strategy,
    ])
}

struct Cluster {
    net: MemoryNetwork,
    nodes: Vec<Arc<Node>>,
    client: Arc<MemoryTransport>,
    _client_inbox: mpsc::Receiver<Envelope>,
}

impl Cluster {
    /// Start `size` fully meshed nodes named n1..nN plus client c1
    async fn mesh(size: usize, strategy: &str) -> Self {
        let net = MemoryNetwork::new();
        let names: Vec<NodeId> = (1..=size).map(|i| id(&format!("n{i}"))).collect();

        let mut nodes = Vec::new();
        for name in &names {
            let (transport, inbox) = net.join(name.clone(), 1024);
            let node = Arc::new(Node::new(config(strategy), transport).unwrap());
            tokio::spawn(Arc::clone(&node).run(inbox));
            nodes.push(node);
        }
        let (client, client_inbox) = net.join("c1", 64);

        let cluster = Self {
            net,
            nodes,
            client,
            _client_inbox: client_inbox,
        };

        let mut topology = Adjacency::new();
        for name in &names {
            let others = names.iter().filter(|n| *n != name).cloned().collect();
            topology.insert(name.clone(), others);
        }
        for name in &names {
            let reply = cluster
                .call(name.as_str(), Payload::Topology { topology: topology.clone() })
                .await;
            assert_eq!(reply.payload(), &Payload::TopologyOk);
        }
        cluster
    }

    async fn call(&self, dest: &str, payload: Payload) -> Envelope {
        self.client
            .rpc(&id(dest), payload)
            .unwrap()
            .wait(Duration::from_secs(2))
            .await
            .unwrap()
    }

    async fn broadcast(&self, dest: &str, value: i64) {
        let reply = self.call(dest, Payload::broadcast(Value(value))).await;
        assert_eq!(reply.payload(), &Payload::BroadcastOk);
    }

    async fn read(&self, dest: &str) -> BTreeSet<i64> {
        match self.call(dest, Payload::Read).await.body.payload {
            Payload::ReadOk { messages } => messages.into_iter().map(|v| v.0).collect(),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn gossip_round(&self) {
        for node in &self.nodes {
            node.gossip_tick();
        }
    }

    fn reconcile_round(&self) {
        for node in &self.nodes {
            node.reconcile_tick();
        }
    }

    fn converged_on(&self, expected: &BTreeSet<i64>) -> bool {
        self.nodes.iter().all(|node| {
            let held: BTreeSet<i64> = node.store().snapshot().into_iter().map(|v| v.0).collect();
            &held == expected
        })
    }

    /// Wait for in-flight messages and replies without starting new rounds
    async fn quiesce_on(&self, expected: &BTreeSet<i64>) {
        for _ in 0..100 {
            if self.converged_on(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let held: Vec<_> = self.nodes.iter().map(|n| n.store().snapshot()).collect();
        panic!("not converged on {expected:?} without further rounds: {held:?}");
    }

    /// Run gossip and reconcile rounds until every node holds `expected`
    async fn settle(&self, expected: &BTreeSet<i64>, max_rounds: usize) {
        for _ in 0..max_rounds {
            self.gossip_round();
            self.reconcile_round();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.converged_on(expected) {
                return;
            }
        }
        let held: Vec<_> = self.nodes.iter().map(|n| n.store().snapshot()).collect();
        panic!("no convergence on {expected:?}: {held:?}");
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

fn set(values: &[i64]) -> BTreeSet<i64> {
    values.iter().copied().collect()
}

#[tokio::test]
async fn test_single_value_reaches_every_node() {
    let cluster = Cluster::mesh(3, "pull").await;

    cluster.broadcast("n1", 5).await;
    cluster.gossip_round();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.reconcile_round();
    cluster.quiesce_on(&set(&[5])).await;

    for name in ["n1", "n2", "n3"] {
        assert_eq!(cluster.read(name).await, set(&[5]));
    }
    cluster.shutdown();
}

#[tokio::test]
async fn test_partition_then_heal() {
    let cluster = Cluster::mesh(3, "pull").await;
    cluster
        .net
        .partition(&[id("n1")], &[id("n2"), id("n3")]);

    cluster.broadcast("n1", 1).await;
    cluster.broadcast("n2", 2).await;
    cluster.broadcast("n3", 3).await;

    for _ in 0..5 {
        cluster.gossip_round();
        cluster.reconcile_round();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // n1 is cut off
    assert_eq!(cluster.read("n1").await, set(&[1]));

    cluster.net.heal();
    // a single reconcile cycle repairs everything
    cluster.reconcile_round();
    cluster.quiesce_on(&set(&[1, 2, 3])).await;
    for name in ["n1", "n2", "n3"] {
        assert_eq!(cluster.read(name).await, set(&[1, 2, 3]));
    }
    cluster.shutdown();
}

#[tokio::test]
async fn test_duplicate_broadcast_is_idempotent() {
    let cluster = Cluster::mesh(3, "pull").await;

    cluster.broadcast("n1", 5).await;
    cluster.broadcast("n1", 5).await;
    cluster.broadcast("n2", 5).await;
    cluster.settle(&set(&[5]), 50).await;

    for node in &cluster.nodes {
        assert_eq!(node.store().snapshot(), vec![Value(5)]);
    }
    assert_eq!(cluster.nodes[0].clock().get(&id("n1")), 1);
    cluster.shutdown();
}

#[tokio::test]
async fn test_pull_returns_log_suffix() {
    let cluster = Cluster::mesh(2, "pull").await;
    for value in [10, 20, 30, 40] {
        cluster.broadcast("n1", value).await;
    }

    let reply = cluster.call("n1", Payload::Pull { version: 2 }).await;
    assert_eq!(
        reply.payload(),
        &Payload::PullOk {
            message: vec![Value(30), Value(40)]
        }
    );
    let reply = cluster.call("n1", Payload::Pull { version: 4 }).await;
    assert_eq!(reply.payload(), &Payload::PullOk { message: vec![] });
    cluster.shutdown();
}

#[tokio::test]
async fn test_read_your_writes() {
    let cluster = Cluster::mesh(3, "pull").await;
    for value in 0..10 {
        cluster.broadcast("n2", value).await;
        assert!(cluster.read("n2").await.contains(&value));
    }
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_converges_under_message_loss() {
    let cluster = Cluster::mesh(5, "pull").await;
    cluster.net.set_drop_rate(0.3);

    let mut expected = BTreeSet::new();
    for value in 0..25i64 {
        let dest = format!("n{}", value % 5 + 1);
        cluster.broadcast(&dest, value).await;
        expected.insert(value);
        if value % 5 == 0 {
            cluster.gossip_round();
        }
    }

    cluster.settle(&expected, 200).await;
    assert!(cluster.net.stats().dropped > 0);

    // clock entries never exceed what their owner appended
    for node in &cluster.nodes {
        for (owner, counter) in node.clock().snapshot() {
            let index = owner.as_str()[1..].parse::<usize>().unwrap() - 1;
            assert!(counter <= cluster.nodes[index].clock().get(&owner));
        }
    }
    cluster.shutdown();
}

#[tokio::test]
async fn test_checksum_strategy_converges() {
    let cluster = Cluster::mesh(3, "checksum").await;
    cluster
        .net
        .partition(&[id("n3")], &[id("n1"), id("n2")]);

    cluster.broadcast("n1", 1).await;
    cluster.broadcast("n3", 3).await;
    cluster.gossip_round();

    cluster.net.heal();
    cluster.settle(&set(&[1, 3]), 50).await;

    let digests: BTreeSet<String> = cluster
        .nodes
        .iter()
        .map(|n| n.store().digest())
        .collect();
    assert_eq!(digests.len(), 1);
    cluster.shutdown();
}

#[tokio::test]
async fn test_echo_and_unsupported_types() {
    let cluster = Cluster::mesh(1, "pull").await;

    let reply = cluster
        .call("n1", Payload::Echo { echo: serde_json::json!({"k": [1, 2]}) })
        .await;
    assert_eq!(
        reply.payload(),
        &Payload::EchoOk { echo: serde_json::json!({"k": [1, 2]}) }
    );

    match cluster.call("n1", Payload::Unknown).await.body.payload {
        Payload::Error { code, .. } => assert_eq!(code, 10),
        other => panic!("unexpected reply {other:?}"),
    }
    cluster.shutdown();
}
