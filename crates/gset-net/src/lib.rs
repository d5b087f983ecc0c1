//! Networking primitives for gset nodes
//!
//! This crate provides:
//! - The [`Transport`] seam the replication engine is written against
//! - Request/response correlation for fire-and-forget RPCs
//! - Newline-delimited JSON framing over stdin/stdout (Maelstrom protocol)
//! - An in-process network with partitions and loss, for cluster tests

pub mod framing;
pub mod memory;
pub mod stdio;
pub mod transport;

pub use framing::{EnvelopeCodec, FrameError};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use stdio::StdioTransport;
pub use transport::{PendingReplies, PendingReply, Transport, TransportError};
