// In-process relay: routes frames between connectors the way the relay
// server does. Used by tests and local demos.

use super::protocol::{
    kinds, ErrorNotice, Frame, InboundMessage, InboundSignal, MessageAck, OutboundMessage,
    OutboundSignal,
};
use super::{RelayConnector, RelayLink, SignalingError};
use crate::directory::BacklogMessage;
use crate::identity::PeerId;
use crate::message::PeerPacket;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

struct Client {
    connection: u64,
    to_client: mpsc::UnboundedSender<String>,
}

pub struct MemoryRelay {
    clients: Mutex<HashMap<PeerId, Client>>,
    unreachable: Mutex<HashSet<PeerId>>,
    received: Mutex<Vec<(PeerId, Frame)>>,
    stored: Mutex<HashMap<PeerId, Vec<BacklogMessage>>>,
    next_connection: AtomicU64,
    next_message_id: AtomicU64,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            received: Mutex::new(Vec::new()),
            stored: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
        })
    }

    /// A connector that authenticates as `peer`.
    pub fn connector(self: &Arc<Self>, peer: PeerId) -> MemoryConnector {
        MemoryConnector {
            relay: Arc::clone(self),
            peer,
        }
    }

    /// Close `peer`'s connection from the server side.
    pub fn drop_client(&self, peer: PeerId) -> bool {
        self.clients.lock().remove(&peer).is_some()
    }

    /// Refuse (or accept again) new connections from `peer`.
    pub fn set_reachable(&self, peer: PeerId, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(&peer);
        } else {
            unreachable.insert(peer);
        }
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.clients.lock().contains_key(&peer)
    }

    /// Every frame received from `peer`, in order.
    pub fn frames_from(&self, peer: PeerId) -> Vec<Frame> {
        self.received
            .lock()
            .iter()
            .filter(|(from, _)| *from == peer)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Messages held for `peer` because it was offline.
    pub fn stored_for(&self, peer: PeerId) -> Vec<BacklogMessage> {
        self.stored.lock().get(&peer).cloned().unwrap_or_default()
    }

    fn deliver<T: Serialize>(&self, to: PeerId, kind: &str, payload: &T) -> bool {
        let Ok(payload) = serde_json::to_value(payload) else {
            return false;
        };
        let Ok(text) = Frame::new(kind, payload).to_text() else {
            return false;
        };
        match self.clients.lock().get(&to) {
            Some(client) => client.to_client.send(text).is_ok(),
            None => false,
        }
    }

    fn is_current(&self, peer: PeerId, connection: u64) -> bool {
        self.clients
            .lock()
            .get(&peer)
            .map(|c| c.connection == connection)
            .unwrap_or(false)
    }

    fn handle(&self, from: PeerId, connection: u64, text: &str) {
        if !self.is_current(from, connection) {
            return;
        }
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Relay dropped malformed frame from {}: {}", from, e);
                return;
            }
        };
        self.received.lock().push((from, frame.clone()));

        match frame.kind.as_str() {
            kinds::CONNECT | kinds::PRESENCE => {}
            kinds::DISCONNECT => {
                self.clients.lock().remove(&from);
            }
            kinds::SIGNAL => {
                let Ok(signal) = serde_json::from_value::<OutboundSignal>(frame.payload) else {
                    return;
                };
                let inbound = InboundSignal {
                    sender: from,
                    kind: signal.kind,
                    data: signal.data,
                };
                if !self.deliver(signal.recipient, kinds::SIGNAL, &inbound) {
                    self.deliver(
                        from,
                        kinds::ERROR,
                        &ErrorNotice {
                            message: format!("peer {} is offline", signal.recipient),
                        },
                    );
                }
            }
            kinds::MESSAGE => {
                let Ok(outbound) = serde_json::from_value::<OutboundMessage>(frame.payload) else {
                    return;
                };
                self.route_message(from, outbound);
            }
            other => debug!("Relay ignoring '{}' frame", other),
        }
    }

    fn route_message(&self, from: PeerId, outbound: OutboundMessage) {
        let recipient = outbound.recipient;
        let stamped = match &outbound.packet {
            PeerPacket::Message {
                content, timestamp, ..
            } => Some((
                self.next_message_id.fetch_add(1, Ordering::Relaxed),
                content.clone(),
                *timestamp,
            )),
            PeerPacket::Receipt { .. } => None,
        };

        let inbound = InboundMessage {
            sender: from,
            packet: outbound.packet,
            id: stamped.as_ref().map(|(id, _, _)| *id),
        };
        let delivered = self.deliver(recipient, kinds::MESSAGE, &inbound);

        if let Some((id, content, timestamp)) = stamped {
            if !delivered {
                self.stored
                    .lock()
                    .entry(recipient)
                    .or_default()
                    .push(BacklogMessage {
                        id,
                        sender: from,
                        content,
                        timestamp,
                    });
            }
            self.deliver(
                from,
                kinds::MESSAGE_ACK,
                &MessageAck {
                    recipient,
                    timestamp,
                    id,
                },
            );
        }
    }
}

/// Connector bound to one user of a [`MemoryRelay`].
pub struct MemoryConnector {
    relay: Arc<MemoryRelay>,
    peer: PeerId,
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn open(&self, _url: &str) -> Result<RelayLink, SignalingError> {
        if self.relay.unreachable.lock().contains(&self.peer) {
            return Err(SignalingError::ConnectionFailed(
                "relay unreachable".to_string(),
            ));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_client) = mpsc::unbounded_channel::<String>();
        let connection = self.relay.next_connection.fetch_add(1, Ordering::Relaxed);

        self.relay.clients.lock().insert(
            self.peer,
            Client {
                connection,
                to_client,
            },
        );

        let relay = Arc::clone(&self.relay);
        let peer = self.peer;
        tokio::spawn(async move {
            while let Some(text) = from_client.recv().await {
                relay.handle(peer, connection, &text);
            }
            let mut clients = relay.clients.lock();
            if clients.get(&peer).map(|c| c.connection) == Some(connection) {
                clients.remove(&peer);
            }
        });

        Ok(RelayLink { outbound, inbound })
    }
}
