//! Wire messages
//!
//! Every message is an [`Envelope`] carrying a [`Body`]; the body's `type`
//! field selects one variant of the closed [`Payload`] enum. Bodies are
//! validated once, when the envelope is decoded, so handlers only ever match
//! on typed variants.
//!
//! Wire format (one JSON object per line):
//!
//! ```text
//! {"src":"c1","dest":"n1","body":{"type":"broadcast","msg_id":1,"message":5}}
//! ```

use crate::error::{Error, Result};
use crate::types::{Adjacency, ClockSnapshot, NodeId, Value};
use serde::{Deserialize, Serialize};

/// Maelstrom error codes used by this node.
pub mod error_code {
    /// Message type is not handled by this node
    pub const NOT_SUPPORTED: u32 = 10;
    /// Message body could not be interpreted
    pub const MALFORMED_REQUEST: u32 = 12;
}

/// Addressed message as it travels between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

/// Message body: correlation ids plus the typed payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Body {
    /// Sender-assigned id, present on anything that expects a reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    /// Id of the request this body answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Closed set of message variants understood by a gset node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Echo {
        echo: serde_json::Value,
    },
    EchoOk {
        echo: serde_json::Value,
    },
    Topology {
        topology: Adjacency,
    },
    TopologyOk,
    Broadcast {
        message: Value,
        /// Remaining hop budget
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat: Option<u32>,
        /// Sender's vector clock at send time
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clock: Option<ClockSnapshot>,
        /// Extra history to merge alongside the value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store: Option<Vec<Value>>,
    },
    BroadcastOk,
    Read,
    ReadOk {
        messages: Vec<Value>,
    },
    Pull {
        version: u64,
    },
    PullOk {
        message: Vec<Value>,
    },
    Syn {
        store: Vec<Value>,
    },
    #[serde(alias = "refresh")]
    SynOk {
        store: Vec<Value>,
    },
    Heartbeat {
        checksum: String,
    },
    Reconcile {
        store: Vec<Value>,
    },
    Error {
        code: u32,
        #[serde(default)]
        text: String,
    },
    /// Any `type` this node does not know
    #[serde(other)]
    Unknown,
}

impl Payload {
    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::InitOk => "init_ok",
            Self::Echo { .. } => "echo",
            Self::EchoOk { .. } => "echo_ok",
            Self::Topology { .. } => "topology",
            Self::TopologyOk => "topology_ok",
            Self::Broadcast { .. } => "broadcast",
            Self::BroadcastOk => "broadcast_ok",
            Self::Read => "read",
            Self::ReadOk { .. } => "read_ok",
            Self::Pull { .. } => "pull",
            Self::PullOk { .. } => "pull_ok",
            Self::Syn { .. } => "syn",
            Self::SynOk { .. } => "syn_ok",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Reconcile { .. } => "reconcile",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Plain value broadcast, as a client would send it.
    pub fn broadcast(message: Value) -> Self {
        Self::Broadcast {
            message,
            heartbeat: None,
            clock: None,
            store: None,
        }
    }

    pub fn error(code: u32, text: impl Into<String>) -> Self {
        Self::Error {
            code,
            text: text.into(),
        }
    }
}

impl Body {
    /// Body that does not take part in request/response correlation.
    pub fn oneway(payload: Payload) -> Self {
        Self {
            msg_id: None,
            in_reply_to: None,
            payload,
        }
    }

    pub fn request(msg_id: u64, payload: Payload) -> Self {
        Self {
            msg_id: Some(msg_id),
            in_reply_to: None,
            payload,
        }
    }

    pub fn reply(msg_id: u64, in_reply_to: u64, payload: Payload) -> Self {
        Self {
            msg_id: Some(msg_id),
            in_reply_to: Some(in_reply_to),
            payload,
        }
    }
}

impl Envelope {
    pub fn new(src: NodeId, dest: NodeId, body: Body) -> Self {
        Self { src, dest, body }
    }

    /// Decode one line of wire JSON.
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(Error::from)
    }

    /// Encode as a single line of wire JSON (no trailing newline).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    /// The request id a reply to this envelope must reference.
    pub fn reply_id(&self) -> Result<u64> {
        self.body
            .msg_id
            .ok_or_else(|| Error::MissingField("msg_id".into()))
    }

    pub fn payload(&self) -> &Payload {
        &self.body.payload
    }

    /// Recover the addressing of a line whose body failed to decode.
    ///
    /// Yields a stand-in request carrying the original `src`, `dest` and
    /// `msg_id`, so the sender can be told its request was rejected. `None`
    /// when the line is not a JSON object with those fields.
    pub fn salvage(line: &str) -> Option<Self> {
        let raw: serde_json::Value = serde_json::from_str(line).ok()?;
        let src = raw.get("src")?.as_str()?;
        let dest = raw.get("dest")?.as_str()?;
        let msg_id = raw.get("body")?.get("msg_id")?.as_u64()?;
        Some(Self::new(
            src.into(),
            dest.into(),
            Body::request(msg_id, Payload::Unknown),
        ))
    }
}
