//! gsetd - replicated grow-only set node
//!
//! This daemon provides:
//! - A deduplicated, append-only value log with optional durable storage
//! - Vector clocks of per-node log lengths
//! - Randomized, hop-bounded gossip of new values
//! - Anti-entropy repair by delta pulls or checksum heartbeats

pub mod config;
pub mod gossip;
pub mod server;
pub mod storage;
pub mod store;
pub mod sync;
pub mod topology;
pub mod vector_clock;

pub use config::Config;
pub use gossip::Gossip;
pub use server::{Node, NodeStats};
pub use storage::Storage;
pub use store::Store;
pub use sync::{ChecksumReconciler, PullReconciler, Reconciler};
pub use topology::Topology;
pub use vector_clock::VectorClock;
