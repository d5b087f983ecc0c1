//! Transport seam between the replication engine and the wire
//!
//! The engine only ever needs four things from a transport: its own
//! identifier, a one-way `send`, a `reply` to a received request, and an
//! `rpc` whose answer is picked up later by a continuation. Implementations
//! provide the identifier, the correlation table, and `deliver`; the rest is
//! shared here.

use crate::framing::FrameError;
use gset_core::{Body, Envelope, NodeId, Payload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Wire error: {0}")]
    Wire(#[from] gset_core::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request {0} timed out")]
    Timeout(u64),
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Message transport as seen by a node.
pub trait Transport: Send + Sync {
    /// This node's identifier
    fn node_id(&self) -> &NodeId;

    /// Correlation table for outstanding requests
    fn pending(&self) -> &Arc<PendingReplies>;

    /// Hand a fully addressed envelope to the wire
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Fire-and-forget message; no reply is expected.
    fn send(&self, dest: &NodeId, payload: Payload) -> Result<(), TransportError> {
        self.deliver(Envelope::new(
            self.node_id().clone(),
            dest.clone(),
            Body::oneway(payload),
        ))
    }

    /// Answer a request received earlier.
    fn reply(&self, request: &Envelope, payload: Payload) -> Result<(), TransportError> {
        let in_reply_to = request.reply_id()?;
        let msg_id = self.pending().next_msg_id();
        self.deliver(Envelope::new(
            self.node_id().clone(),
            request.src.clone(),
            Body::reply(msg_id, in_reply_to, payload),
        ))
    }

    /// Send a request and return a handle that resolves with the reply.
    ///
    /// The caller never blocks here; awaiting the handle is the continuation.
    fn rpc(&self, dest: &NodeId, payload: Payload) -> Result<PendingReply, TransportError> {
        let msg_id = self.pending().next_msg_id();
        let pending = self.pending().register(msg_id);
        self.deliver(Envelope::new(
            self.node_id().clone(),
            dest.clone(),
            Body::request(msg_id, payload),
        ))?;
        Ok(pending)
    }
}

/// Outstanding requests keyed by `msg_id`
pub struct PendingReplies {
    next_msg_id: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
}

impl PendingReplies {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_msg_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate a fresh message id
    pub fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start waiting for the reply to `msg_id`
    pub fn register(self: &Arc<Self>, msg_id: u64) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(msg_id, tx);
        PendingReply {
            msg_id,
            rx,
            owner: Arc::clone(self),
        }
    }

    /// Complete a waiting request with this envelope.
    ///
    /// Returns the envelope back when nobody is waiting for it, so the
    /// caller can dispatch it as an ordinary message.
    pub fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        let Some(in_reply_to) = envelope.body.in_reply_to else {
            return Some(envelope);
        };
        let waiter = self.waiting.lock().remove(&in_reply_to);
        match waiter {
            Some(tx) => match tx.send(envelope) {
                Ok(()) => None,
                // receiver gave up between removal and send
                Err(envelope) => Some(envelope),
            },
            None => Some(envelope),
        }
    }

    fn cancel(&self, msg_id: u64) {
        if self.waiting.lock().remove(&msg_id).is_some() {
            trace!("Released request slot {}", msg_id);
        }
    }

    /// Number of requests still waiting for a reply
    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to an in-flight request. Dropping it releases the slot.
pub struct PendingReply {
    msg_id: u64,
    rx: oneshot::Receiver<Envelope>,
    owner: Arc<PendingReplies>,
}

impl PendingReply {
    pub fn msg_id(&self) -> u64 {
        self.msg_id
    }

    /// Wait for the reply, giving up after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Envelope, TransportError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::Timeout(self.msg_id)),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.owner.cancel(self.msg_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gset_core::Value;

    fn reply_to(msg_id: u64) -> Envelope {
        Envelope::new(
            "n2".into(),
            "n1".into(),
            Body::reply(99, msg_id, Payload::PullOk { message: vec![Value(1)] }),
        )
    }

    #[tokio::test]
    async fn test_resolve_completes_waiter() {
        let pending = PendingReplies::new();
        let id = pending.next_msg_id();
        let handle = pending.register(id);

        assert!(pending.resolve(reply_to(id)).is_none());
        let env = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(env.body.in_reply_to, Some(id));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_releases_slot() {
        let pending = PendingReplies::new();
        let handle = pending.register(pending.next_msg_id());
        assert_eq!(pending.len(), 1);

        let result = handle.wait(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unmatched_reply_is_returned() {
        let pending = PendingReplies::new();
        let late = reply_to(42);
        assert_eq!(pending.resolve(late.clone()), Some(late));

        let request = Envelope::new("c1".into(), "n1".into(), Body::request(1, Payload::Read));
        assert!(pending.resolve(request).is_some());
    }

    #[test]
    fn test_msg_ids_are_unique() {
        let pending = PendingReplies::new();
        let a = pending.next_msg_id();
        let b = pending.next_msg_id();
        assert_ne!(a, b);
    }
}
