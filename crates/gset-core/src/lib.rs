//! gset Core Library
//!
//! Shared vocabulary for the gset replicated grow-only set: node and value
//! identifiers, the typed message envelope spoken between nodes and clients,
//! and the canonical digest used to compare replicas.
//!
//! # Modules
//!
//! - [`types`]: Value, NodeId, clock snapshots
//! - [`message`]: Envelope, Body and the closed set of payload variants
//! - [`canonical`]: Order-independent digest of a value set
//! - [`error`]: Error types

pub mod canonical;
pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{Body, Envelope, Payload};
pub use types::*;
