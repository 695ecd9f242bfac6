// Signaling channel: one authenticated connection to the relay server
//
// Carries three kinds of traffic: negotiation messages for direct channels,
// relayed peer packets, and relay bookkeeping (acks, presence, errors).
// Frames are dispatched to registered handlers in arrival order. An
// unexpected close triggers reconnection with exponential backoff.

pub mod memory;
pub mod protocol;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryRelay};
pub use protocol::{kinds, Frame, SignalEnvelope, SignalKind};
pub use websocket::WebSocketConnector;

use crate::config::SignalingConfig;
use crate::identity::PeerId;
use crate::message::PeerPacket;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use protocol::{OutboundMessage, OutboundSignal};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Not connected to the relay")]
    Disconnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("No credential available; connect first")]
    NoCredential,
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A raw text link to the relay. Dropping `outbound` closes the link; the
/// link is gone once `inbound` yields `None`.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the relay.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<RelayLink, SignalingError>;
}

/// Relay connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Closed,
    Connecting,
    Open,
    /// Waiting for or performing automatic reconnect attempt `attempt` (1-based)
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type FrameHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct LinkSlot {
    outbound: Option<mpsc::UnboundedSender<String>>,
    credential: Option<String>,
    /// Bumped for every new link and on explicit disconnect
    generation: u64,
    closing: bool,
}

pub struct SignalingChannel {
    config: SignalingConfig,
    connector: Arc<dyn RelayConnector>,
    link: Mutex<LinkSlot>,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, FrameHandler)>>>,
    next_handler: AtomicU64,
    connectivity: watch::Sender<Connectivity>,
}

impl SignalingChannel {
    pub fn new(config: SignalingConfig, connector: Arc<dyn RelayConnector>) -> Arc<Self> {
        let (connectivity, _) = watch::channel(Connectivity::Closed);
        Arc::new(Self {
            config,
            connector,
            link: Mutex::new(LinkSlot {
                outbound: None,
                credential: None,
                generation: 0,
                closing: false,
            }),
            handlers: RwLock::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            connectivity,
        })
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.connectivity() == Connectivity::Open
    }

    /// Subscribe to connectivity changes.
    pub fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    fn set_connectivity(&self, next: Connectivity) {
        let changed = self.connectivity.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!("Relay connectivity: {:?}", next);
        }
    }

    /// Open the relay connection and authenticate with `credential`.
    /// Completes once the link is ready to send.
    pub async fn connect(self: &Arc<Self>, credential: &str) -> Result<(), SignalingError> {
        match self.connectivity() {
            Connectivity::Open => return Ok(()),
            Connectivity::Connecting | Connectivity::Reconnecting { .. } => {
                return Err(SignalingError::AlreadyConnecting)
            }
            Connectivity::Closed => {}
        }

        {
            let mut slot = self.link.lock();
            slot.credential = Some(credential.to_string());
            slot.closing = false;
        }
        self.set_connectivity(Connectivity::Connecting);

        match self.open_link(credential).await {
            Ok((inbound, generation)) => {
                info!("Connected to relay {}", self.config.relay_url);
                tokio::spawn(Arc::clone(self).supervise(inbound, generation));
                Ok(())
            }
            Err(e) => {
                warn!("Relay connection failed: {}", e);
                self.set_connectivity(Connectivity::Closed);
                Err(e)
            }
        }
    }

    /// Reconnect with the last credential after the channel went Closed.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), SignalingError> {
        let credential = self
            .link
            .lock()
            .credential
            .clone()
            .ok_or(SignalingError::NoCredential)?;
        self.connect(&credential).await
    }

    /// Close the connection. No automatic reconnect follows.
    pub fn disconnect(&self) {
        let mut slot = self.link.lock();
        slot.closing = true;
        slot.generation += 1;
        if let Some(outbound) = slot.outbound.take() {
            if let Ok(text) = Frame::new(kinds::DISCONNECT, Value::Null).to_text() {
                let _ = outbound.send(text);
            }
        }
        drop(slot);
        self.set_connectivity(Connectivity::Closed);
        info!("Disconnected from relay");
    }

    /// Open and authenticate a new link. A `disconnect` that lands while
    /// the connector is still opening wins: the new link is closed and
    /// connectivity is left alone.
    async fn open_link(
        &self,
        credential: &str,
    ) -> Result<(mpsc::UnboundedReceiver<String>, u64), SignalingError> {
        let started = self.link.lock().generation;
        let link = self.connector.open(&self.config.relay_url).await?;

        let auth = Frame::new(kinds::CONNECT, serde_json::json!({ "token": credential }))
            .to_text()
            .map_err(|e| SignalingError::Serialization(e.to_string()))?;

        let mut slot = self.link.lock();
        if slot.closing || slot.generation != started {
            drop(slot);
            if let Ok(text) = Frame::new(kinds::DISCONNECT, Value::Null).to_text() {
                let _ = link.outbound.send(text);
            }
            debug!("Discarding relay link opened after disconnect");
            return Err(SignalingError::Disconnected);
        }

        link.outbound.send(auth).map_err(|_| {
            SignalingError::ConnectionFailed("link closed during authentication".to_string())
        })?;
        slot.generation += 1;
        slot.outbound = Some(link.outbound);
        let generation = slot.generation;
        // Published under the lock so a racing disconnect lands after it
        self.set_connectivity(Connectivity::Open);
        drop(slot);
        Ok((link.inbound, generation))
    }

    /// Read frames until the link drops, then reconnect unless the drop was
    /// requested.
    async fn supervise(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>, mut generation: u64) {
        loop {
            while let Some(text) = inbound.recv().await {
                self.dispatch_text(&text);
            }

            let unexpected = {
                let mut slot = self.link.lock();
                if slot.generation != generation || slot.closing {
                    false
                } else {
                    slot.outbound = None;
                    true
                }
            };
            if !unexpected {
                return;
            }

            warn!("Relay connection lost");
            match self.reconnect_with_backoff().await {
                Some((next_inbound, next_generation)) => {
                    info!("Reconnected to relay");
                    inbound = next_inbound;
                    generation = next_generation;
                }
                None => return,
            }
        }
    }

    async fn reconnect_with_backoff(&self) -> Option<(mpsc::UnboundedReceiver<String>, u64)> {
        let credential = self.link.lock().credential.clone()?;

        for attempt in 0..self.config.max_reconnect_attempts {
            {
                let slot = self.link.lock();
                if slot.closing {
                    return None;
                }
                self.set_connectivity(Connectivity::Reconnecting {
                    attempt: attempt + 1,
                });
            }
            tokio::time::sleep(self.config.backoff_duration(attempt)).await;

            if self.link.lock().closing {
                return None;
            }

            match self.open_link(&credential).await {
                Ok(link) => return Some(link),
                Err(_) if self.link.lock().closing => return None,
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempt + 1, e),
            }
        }

        warn!(
            "Giving up on relay after {} reconnect attempts",
            self.config.max_reconnect_attempts
        );
        self.set_connectivity(Connectivity::Closed);
        None
    }

    fn dispatch_text(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping malformed relay frame: {}", e);
                return;
            }
        };

        let handlers: Vec<FrameHandler> = self
            .handlers
            .read()
            .get(&frame.kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("No handler for '{}' frame", frame.kind);
            return;
        }
        for handler in handlers {
            handler(&frame.payload);
        }
    }

    /// Register a handler for frames of type `kind`. Handlers run in
    /// registration order.
    pub fn on<F>(&self, kind: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Send a frame. Fails immediately when the channel is not open.
    pub fn send(&self, kind: &str, payload: Value) -> Result<(), SignalingError> {
        let text = Frame::new(kind, payload)
            .to_text()
            .map_err(|e| SignalingError::Serialization(e.to_string()))?;

        let slot = self.link.lock();
        if !self.is_open() {
            return Err(SignalingError::Disconnected);
        }
        let outbound = slot.outbound.as_ref().ok_or(SignalingError::Disconnected)?;
        outbound.send(text).map_err(|_| SignalingError::Disconnected)
    }

    pub fn send_signal(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        let payload = serde_json::to_value(OutboundSignal::from(envelope))
            .map_err(|e| SignalingError::Serialization(e.to_string()))?;
        self.send(kinds::SIGNAL, payload)
    }

    /// Hand a peer packet to the relay for forwarding.
    pub fn send_packet(&self, recipient: PeerId, packet: &PeerPacket) -> Result<(), SignalingError> {
        let payload = serde_json::to_value(OutboundMessage {
            recipient,
            packet: packet.clone(),
        })
        .map_err(|e| SignalingError::Serialization(e.to_string()))?;
        self.send(kinds::MESSAGE, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn channel_for(relay: &Arc<MemoryRelay>, peer: u64) -> Arc<SignalingChannel> {
        SignalingChannel::new(
            SignalingConfig::default(),
            Arc::new(relay.connector(PeerId(peer))),
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_closed() {
        let relay = MemoryRelay::new();
        let channel = channel_for(&relay, 1);
        assert_eq!(channel.connectivity(), Connectivity::Closed);
        assert_eq!(
            channel.send(kinds::PRESENCE, Value::Null),
            Err(SignalingError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_connect_sends_auth_frame() {
        let relay = MemoryRelay::new();
        let channel = channel_for(&relay, 1);
        channel.connect("secret-token").await.unwrap();
        settle().await;

        assert!(channel.is_open());
        let frames = relay.frames_from(PeerId(1));
        assert_eq!(frames[0].kind, kinds::CONNECT);
        assert_eq!(frames[0].payload["token"], "secret-token");
    }

    #[tokio::test]
    async fn test_connect_failure_reports_closed() {
        let relay = MemoryRelay::new();
        relay.set_reachable(PeerId(1), false);
        let channel = channel_for(&relay, 1);
        assert!(matches!(
            channel.connect("t").await,
            Err(SignalingError::ConnectionFailed(_))
        ));
        assert_eq!(channel.connectivity(), Connectivity::Closed);
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let relay = MemoryRelay::new();
        let alice = channel_for(&relay, 1);
        let bob = channel_for(&relay, 2);
        alice.connect("a").await.unwrap();
        bob.connect("b").await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        bob.on(kinds::SIGNAL, move |_| first.lock().push("first"));
        let second = Arc::clone(&order);
        bob.on(kinds::SIGNAL, move |_| second.lock().push("second"));

        alice
            .send_signal(&SignalEnvelope::new(PeerId(2), SignalKind::Offer, "sdp"))
            .unwrap();
        settle().await;

        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_off_removes_handler() {
        let relay = MemoryRelay::new();
        let alice = channel_for(&relay, 1);
        let bob = channel_for(&relay, 2);
        alice.connect("a").await.unwrap();
        bob.connect("b").await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = bob.on(kinds::SIGNAL, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bob.off(id));
        assert!(!bob.off(id));

        alice
            .send_signal(&SignalEnvelope::new(PeerId(2), SignalKind::Offer, "sdp"))
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_does_not_reconnect() {
        let relay = MemoryRelay::new();
        let channel = channel_for(&relay, 1);
        channel.connect("t").await.unwrap();
        channel.disconnect();
        settle().await;

        assert_eq!(channel.connectivity(), Connectivity::Closed);
        assert!(!relay.is_connected(PeerId(1)));
        assert_eq!(
            channel.send(kinds::PRESENCE, Value::Null),
            Err(SignalingError::Disconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_unexpected_close() {
        let relay = MemoryRelay::new();
        let channel = channel_for(&relay, 1);
        channel.connect("t").await.unwrap();
        let mut watch = channel.watch_connectivity();

        relay.drop_client(PeerId(1));
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow(), Connectivity::Reconnecting { attempt: 1 });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(channel.is_open());
        assert!(relay.is_connected(PeerId(1)));

        // The new link authenticated again with the same credential
        let auths: Vec<Frame> = relay
            .frames_from(PeerId(1))
            .into_iter()
            .filter(|f| f.kind == kinds::CONNECT)
            .collect();
        assert_eq!(auths.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let relay = MemoryRelay::new();
        let channel = channel_for(&relay, 1);
        channel.connect("t").await.unwrap();

        relay.set_reachable(PeerId(1), false);
        relay.drop_client(PeerId(1));

        // 1s + 2s + 4s + 8s + 16s of backoff
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(channel.connectivity(), Connectivity::Closed);

        relay.set_reachable(PeerId(1), true);
        channel.reconnect().await.unwrap();
        assert!(channel.is_open());
    }

    /// Takes `delay` to open each link.
    struct SlowConnector {
        inner: MemoryConnector,
        delay: Duration,
    }

    #[async_trait]
    impl RelayConnector for SlowConnector {
        async fn open(&self, url: &str) -> Result<RelayLink, SignalingError> {
            tokio::time::sleep(self.delay).await;
            self.inner.open(url).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_reconnect_sticks() {
        let relay = MemoryRelay::new();
        let channel = SignalingChannel::new(
            SignalingConfig::default(),
            Arc::new(SlowConnector {
                inner: relay.connector(PeerId(1)),
                delay: Duration::from_millis(500),
            }),
        );
        channel.connect("t").await.unwrap();

        // 1s backoff, then the connector is busy until 1.5s
        relay.drop_client(PeerId(1));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(channel.connectivity(), Connectivity::Reconnecting { attempt: 1 });

        channel.disconnect();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(channel.connectivity(), Connectivity::Closed);
        assert!(!relay.is_connected(PeerId(1)));
        assert_eq!(
            channel.send(kinds::PRESENCE, Value::Null),
            Err(SignalingError::Disconnected)
        );
        // Only the first link authenticated
        let auths = relay
            .frames_from(PeerId(1))
            .into_iter()
            .filter(|f| f.kind == kinds::CONNECT)
            .count();
        assert_eq!(auths, 1);
    }

    #[tokio::test]
    async fn test_reconnect_without_credential() {
        let relay = MemoryRelay::new();
        let channel = channel_for(&relay, 1);
        assert_eq!(channel.reconnect().await, Err(SignalingError::NoCredential));
    }
}
