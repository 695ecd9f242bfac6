//! Direct-channel engine abstraction
//!
//! The session layer never touches ICE, DTLS or SCTP. An engine hands out
//! links that can produce and consume opaque offer/answer/candidate bodies,
//! and reports channel lifecycle and data through [`LinkEvents`].

use crate::identity::PeerId;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Direct channels are not available on this platform")]
    Unavailable,
    #[error("Invalid negotiation message: {0}")]
    InvalidSignal(String),
    #[error("Channel is not open")]
    NotOpen,
    #[error("Engine failure: {0}")]
    Failed(String),
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A local ICE candidate to forward to the peer
    LocalCandidate(String),
    ChannelOpen,
    ChannelClosed,
    Data(Vec<u8>),
}

/// Input for the peer transport's processing loop.
#[derive(Debug)]
pub(crate) enum PeerInput {
    Link {
        peer: PeerId,
        link_id: u64,
        event: LinkEvent,
    },
    Signal(crate::signaling::SignalEnvelope),
}

/// Where a link reports its events. Tagged with the link it belongs to, so
/// events from a discarded link are recognisable.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    peer: PeerId,
    link_id: u64,
    tx: mpsc::UnboundedSender<PeerInput>,
}

impl LinkEvents {
    pub(crate) fn new(peer: PeerId, link_id: u64, tx: mpsc::UnboundedSender<PeerInput>) -> Self {
        Self { peer, link_id, tx }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(PeerInput::Link {
            peer: self.peer,
            link_id: self.link_id,
            event,
        });
    }
}

/// One attempt at a direct channel with one peer.
#[async_trait]
pub trait DirectLink: Send + Sync {
    /// Produce a local offer.
    async fn create_offer(&self) -> Result<String, EngineError>;

    /// Apply a remote offer and produce the answer.
    async fn accept_offer(&self, offer: &str) -> Result<String, EngineError>;

    /// Apply the remote answer to our offer.
    async fn accept_answer(&self, answer: &str) -> Result<(), EngineError>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), EngineError>;

    async fn send(&self, data: &[u8]) -> Result<(), EngineError>;

    /// Tear the link down. Does not emit `ChannelClosed` to our own events.
    fn close(&self);
}

pub trait DirectEngine: Send + Sync {
    fn create_link(&self, peer: PeerId, events: LinkEvents) -> Result<Arc<dyn DirectLink>, EngineError>;
}

/// Engine for platforms without direct channels. Every negotiation fails
/// and traffic stays on the relay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDirectEngine;

impl DirectEngine for NoDirectEngine {
    fn create_link(&self, _peer: PeerId, _events: LinkEvents) -> Result<Arc<dyn DirectLink>, EngineError> {
        Err(EngineError::Unavailable)
    }
}
