//! stdin/stdout transport (Maelstrom protocol)
//!
//! The node learns its own identifier from the first `init` message, answers
//! it, and from then on reads envelopes from stdin and writes envelopes to
//! stdout. Replies to our own requests are routed to their waiting
//! continuation; everything else goes to the node's inbox.

use crate::framing::{EnvelopeCodec, FrameError};
use crate::transport::{PendingReplies, Transport, TransportError};
use futures::{SinkExt, StreamExt};
use gset_core::message::error_code;
use gset_core::{Envelope, NodeId, Payload};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// Transport speaking newline-delimited JSON over a byte stream pair
pub struct StdioTransport {
    node_id: NodeId,
    /// Every node in the cluster, as announced by `init`
    node_ids: Vec<NodeId>,
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: Arc<PendingReplies>,
}

impl StdioTransport {
    /// Perform the `init` handshake on stdin/stdout and start I/O tasks.
    pub async fn bootstrap(
        inbox_capacity: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Envelope>), TransportError> {
        Self::bootstrap_with(tokio::io::stdin(), tokio::io::stdout(), inbox_capacity).await
    }

    /// Same as [`StdioTransport::bootstrap`] over arbitrary streams.
    pub async fn bootstrap_with<R, W>(
        reader: R,
        writer: W,
        inbox_capacity: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Envelope>), TransportError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut frames = FramedRead::new(reader, EnvelopeCodec::new());

        let (init, node_id, node_ids) = loop {
            match frames.next().await {
                Some(Ok(Ok(env))) => {
                    if let Payload::Init { node_id, node_ids } = env.payload() {
                        let (node_id, node_ids) = (node_id.clone(), node_ids.clone());
                        break (env, node_id, node_ids);
                    }
                    warn!("Ignoring {} from {} before init", env.payload().kind(), env.src);
                }
                Some(Ok(Err(e))) => warn!("Dropping malformed message before init: {}", e),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(TransportError::Handshake(
                        "input closed before init".into(),
                    ))
                }
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(FramedWrite::new(writer, EnvelopeCodec::new()), outbound_rx));

        let transport = Arc::new(Self {
            node_id,
            node_ids,
            outbound,
            pending: PendingReplies::new(),
        });
        transport.reply(&init, Payload::InitOk)?;
        info!(
            "Initialized as {} ({} nodes in cluster)",
            transport.node_id,
            transport.node_ids.len()
        );

        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity);
        tokio::spawn(read_loop(frames, Arc::clone(&transport), inbox_tx));

        Ok((transport, inbox_rx))
    }

    /// Every node in the cluster
    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }
}

impl Transport for StdioTransport {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn pending(&self) -> &Arc<PendingReplies> {
        &self.pending
    }

    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.outbound
            .send(envelope)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, EnvelopeCodec>,
    transport: Arc<StdioTransport>,
    inbox: mpsc::Sender<Envelope>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(item) = frames.next().await {
        match item {
            Ok(Ok(env)) => {
                if let Some(env) = transport.pending.resolve(env) {
                    if inbox.send(env).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Err(FrameError::Malformed {
                source,
                request: Some(request),
            })) => {
                warn!("Rejecting malformed request from {}: {}", request.src, source);
                let rejection = Payload::error(error_code::MALFORMED_REQUEST, source.to_string());
                if let Err(e) = transport.reply(&request, rejection) {
                    warn!("Failed to reject request from {}: {}", request.src, e);
                }
            }
            Ok(Err(e)) => warn!("Dropping malformed message: {}", e),
            Err(e) => {
                error!("Input stream failed: {}", e);
                break;
            }
        }
    }
    debug!("Input closed");
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, EnvelopeCodec>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(env) = outbound.recv().await {
        if let Err(e) = sink.send(env).await {
            error!("Output stream failed: {}", e);
            break;
        }
    }
}
