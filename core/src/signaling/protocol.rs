// Relay wire protocol: JSON frames of the form {"type": ..., "payload": ...}

use crate::identity::PeerId;
use crate::message::PeerPacket;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame type names.
pub mod kinds {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const SIGNAL: &str = "signal";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ACK: &str = "message-ack";
    pub const PRESENCE: &str = "presence";
    pub const ERROR: &str = "error";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Negotiation message kinds carried in `signal` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// A negotiation message to or from a peer. The body is opaque here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub peer: PeerId,
    pub kind: SignalKind,
    pub body: String,
}

impl SignalEnvelope {
    pub fn new(peer: PeerId, kind: SignalKind, body: impl Into<String>) -> Self {
        Self {
            peer,
            kind,
            body: body.into(),
        }
    }
}

/// Client -> relay `signal` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundSignal {
    pub recipient: PeerId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: String,
}

/// Relay -> client `signal` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSignal {
    pub sender: PeerId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: String,
}

impl From<&SignalEnvelope> for OutboundSignal {
    fn from(envelope: &SignalEnvelope) -> Self {
        Self {
            recipient: envelope.peer,
            kind: envelope.kind,
            data: envelope.body.clone(),
        }
    }
}

impl From<InboundSignal> for SignalEnvelope {
    fn from(signal: InboundSignal) -> Self {
        Self {
            peer: signal.sender,
            kind: signal.kind,
            body: signal.data,
        }
    }
}

/// Client -> relay `message` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub recipient: PeerId,
    pub packet: PeerPacket,
}

/// Relay -> client `message` payload. The relay stamps its own id on
/// message packets it stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender: PeerId,
    pub packet: PeerPacket,
    #[serde(default)]
    pub id: Option<u64>,
}

/// Relay -> client `message-ack`: the id the relay gave one of our messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAck {
    pub recipient: PeerId,
    pub timestamp: u64,
    pub id: u64,
}

/// Relay -> client `error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorNotice {
    #[serde(default)]
    pub message: String,
}
