//! Transport router: picks the path for each outbound packet
//!
//! Direct is preferred whenever the peer's channel is open. A direct send
//! that fails or stalls falls back to the relay within the same call, under
//! a per-peer lock, so a packet leaves by at most one path.

use super::peer::{LinkNoticeKind, PeerTransport};
use super::TransportState;
use crate::config::RouterConfig;
use crate::events::{CoreEvent, EventBus};
use crate::identity::PeerId;
use crate::message::{encode_packet, PacketError, PeerPacket};
use crate::signaling::SignalingChannel;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Direct,
    Relayed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("No route to peer {0}")]
    NoRouteAvailable(PeerId),
    #[error("Packet encoding failed: {0}")]
    Encoding(#[from] PacketError),
}

pub struct TransportRouter {
    config: RouterConfig,
    peers: Arc<PeerTransport>,
    signaling: Arc<SignalingChannel>,
    events: Arc<EventBus<CoreEvent>>,
    /// Last state published per tracked peer
    observed: RwLock<HashMap<PeerId, TransportState>>,
    send_locks: Mutex<HashMap<PeerId, Arc<AsyncMutex<()>>>>,
}

impl TransportRouter {
    pub fn new(
        config: RouterConfig,
        peers: Arc<PeerTransport>,
        signaling: Arc<SignalingChannel>,
        events: Arc<EventBus<CoreEvent>>,
    ) -> Self {
        Self {
            config,
            peers,
            signaling,
            events,
            observed: RwLock::new(HashMap::new()),
            send_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Current path for `peer`, evaluated live.
    pub fn route(&self, peer: PeerId) -> Result<Route, RouteError> {
        if self.peers.is_direct(peer) {
            Ok(Route::Direct)
        } else if self.signaling.is_open() {
            Ok(Route::Relayed)
        } else {
            Err(RouteError::NoRouteAvailable(peer))
        }
    }

    /// Combined state as the application sees it: the direct channel's
    /// state while it is open or negotiating, otherwise Relayed when the
    /// relay is up.
    pub fn state(&self, peer: PeerId) -> TransportState {
        match self.peers.state(peer) {
            state @ (TransportState::Direct | TransportState::Negotiating) => state,
            _ if self.signaling.is_open() => TransportState::Relayed,
            state => state,
        }
    }

    fn send_lock(&self, peer: PeerId) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.send_locks.lock().entry(peer).or_default())
    }

    /// Send `packet` to `peer`, direct first, relay second.
    pub async fn send(&self, peer: PeerId, packet: &PeerPacket) -> Result<Route, RouteError> {
        let bytes = encode_packet(packet)?;

        let lock = self.send_lock(peer);
        let _guard = lock.lock().await;

        if let Some(link) = self.peers.direct_link(peer) {
            match tokio::time::timeout(self.config.direct_send_timeout(), link.send(&bytes)).await {
                Ok(Ok(())) => {
                    debug!("Sent {} bytes to {} over direct channel", bytes.len(), peer);
                    return Ok(Route::Direct);
                }
                Ok(Err(e)) => warn!("Direct send to {} failed, using relay: {}", peer, e),
                Err(_) => warn!("Direct send to {} timed out, using relay", peer),
            }
        }

        match self.signaling.send_packet(peer, packet) {
            Ok(()) => {
                debug!("Sent packet to {} via relay", peer);
                Ok(Route::Relayed)
            }
            Err(e) => {
                debug!("Relay send to {} failed: {}", peer, e);
                Err(RouteError::NoRouteAvailable(peer))
            }
        }
    }

    /// Start reporting `peer`'s state changes.
    pub fn track(&self, peer: PeerId) -> TransportState {
        self.recheck_peer(peer)
    }

    /// Recompute a peer's state and publish `TransportChanged` if it moved.
    pub fn recheck_peer(&self, peer: PeerId) -> TransportState {
        let state = self.state(peer);
        let changed = self.observed.write().insert(peer, state) != Some(state);
        if changed {
            debug!("Transport to {} is now {:?}", peer, state);
            self.events.publish(CoreEvent::TransportChanged { peer, state });
        }
        state
    }

    /// Stop tracking `peer` and release its send lock unless a send is
    /// in progress.
    pub fn forget(&self, peer: PeerId) {
        self.observed.write().remove(&peer);
        let mut locks = self.send_locks.lock();
        if locks.get(&peer).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&peer);
        }
    }

    pub fn recheck(&self) {
        let mut peers: Vec<PeerId> = self.observed.read().keys().copied().collect();
        for peer in self.peers.known_peers() {
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        for peer in peers {
            self.recheck_peer(peer);
        }
    }

    /// Recheck on every direct-channel notice, every relay connectivity
    /// change and every health tick.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);

        for kind in [
            LinkNoticeKind::ChannelOpen,
            LinkNoticeKind::ChannelLost,
            LinkNoticeKind::NegotiationFailed,
        ] {
            let weak = weak.clone();
            self.peers.notices().subscribe(kind, move |notice| {
                if let Some(router) = weak.upgrade() {
                    router.recheck_peer(notice.peer());
                }
            });
        }

        let mut connectivity = self.signaling.watch_connectivity();
        let mut ticker = tokio::time::interval(self.config.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let Some(router) = weak.upgrade() else {
                    break;
                };
                router.recheck();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NegotiationConfig, SignalingConfig};
    use crate::events::CoreEventKind;
    use crate::signaling::{kinds, MemoryRelay};
    use crate::transport::loopback::LoopbackNetwork;
    use crate::transport::peer::{LinkNotice, LinkNoticeKind};
    use std::time::Duration;

    struct Node {
        signaling: Arc<SignalingChannel>,
        peers: Arc<PeerTransport>,
        router: Arc<TransportRouter>,
        events: Arc<EventBus<CoreEvent>>,
    }

    async fn node(relay: &Arc<MemoryRelay>, network: &Arc<LoopbackNetwork>, id: u64) -> Node {
        let signaling = SignalingChannel::new(
            SignalingConfig::default(),
            Arc::new(relay.connector(PeerId(id))),
        );
        signaling.connect("token").await.unwrap();
        let peers = PeerTransport::new(
            PeerId(id),
            NegotiationConfig::default(),
            Arc::clone(&signaling),
            Arc::new(network.engine(PeerId(id))),
        );
        peers.start();
        let events = Arc::new(EventBus::new());
        let router = Arc::new(TransportRouter::new(
            RouterConfig::default(),
            Arc::clone(&peers),
            Arc::clone(&signaling),
            Arc::clone(&events),
        ));
        Node {
            signaling,
            peers,
            router,
            events,
        }
    }

    fn text(content: &str) -> PeerPacket {
        PeerPacket::Message {
            content: content.to_string(),
            timestamp: 1,
            encrypted: true,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn relayed_messages(relay: &MemoryRelay, from: u64) -> usize {
        relay
            .frames_from(PeerId(from))
            .iter()
            .filter(|f| f.kind == kinds::MESSAGE)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_precedence() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        let _bob = node(&relay, &network, 2).await;

        assert_eq!(alice.router.route(PeerId(2)), Ok(Route::Relayed));

        alice.peers.negotiate(PeerId(2)).await.unwrap();
        settle().await;
        assert_eq!(alice.router.route(PeerId(2)), Ok(Route::Direct));

        // Direct wins even with the relay down
        alice.signaling.disconnect();
        assert_eq!(alice.router.route(PeerId(2)), Ok(Route::Direct));

        alice.peers.teardown(PeerId(2)).await;
        assert_eq!(
            alice.router.route(PeerId(2)),
            Err(RouteError::NoRouteAvailable(PeerId(2)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_prefers_direct() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        let bob = node(&relay, &network, 2).await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        bob.peers.notices().subscribe(LinkNoticeKind::Data, move |n| {
            if let LinkNotice::Data { bytes, .. } = n {
                sink.lock().push(bytes.clone());
            }
        });

        assert_eq!(alice.router.send(PeerId(2), &text("one")).await, Ok(Route::Relayed));
        assert_eq!(relayed_messages(&relay, 1), 1);

        alice.peers.negotiate(PeerId(2)).await.unwrap();
        settle().await;
        assert_eq!(alice.router.send(PeerId(2), &text("two")).await, Ok(Route::Direct));
        settle().await;

        assert_eq!(relayed_messages(&relay, 1), 1);
        assert_eq!(received.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_direct_falls_back_to_relay() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        let _bob = node(&relay, &network, 2).await;

        alice.peers.negotiate(PeerId(2)).await.unwrap();
        settle().await;
        network.set_stalled(PeerId(1), PeerId(2), true);

        assert_eq!(alice.router.send(PeerId(2), &text("late")).await, Ok(Route::Relayed));
        assert_eq!(relayed_messages(&relay, 1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_any_route() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        alice.signaling.disconnect();

        assert_eq!(
            alice.router.send(PeerId(2), &text("nowhere")).await,
            Err(RouteError::NoRouteAvailable(PeerId(2)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_packet_rejected_before_sending() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;

        let huge = text(&"x".repeat(crate::message::MAX_PACKET_SIZE + 1));
        assert!(matches!(
            alice.router.send(PeerId(2), &huge).await,
            Err(RouteError::Encoding(_))
        ));
        assert_eq!(relayed_messages(&relay, 1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_publishes_changes() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        let _bob = node(&relay, &network, 2).await;

        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        alice.events.subscribe(CoreEventKind::TransportChanged, move |e| {
            if let CoreEvent::TransportChanged { state, .. } = e {
                sink.lock().push(*state);
            }
        });
        alice.router.spawn_health_monitor();
        settle().await;
        assert_eq!(alice.router.track(PeerId(2)), TransportState::Relayed);

        alice.peers.negotiate(PeerId(2)).await.unwrap();
        settle().await;
        alice.peers.teardown(PeerId(2)).await;
        alice.signaling.disconnect();
        settle().await;

        assert_eq!(
            *states.lock(),
            vec![
                TransportState::Relayed,
                TransportState::Direct,
                TransportState::Relayed,
                TransportState::Idle,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_releases_peer_state() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;

        assert_eq!(alice.router.send(PeerId(2), &text("one")).await, Ok(Route::Relayed));
        assert_eq!(alice.router.track(PeerId(2)), TransportState::Relayed);
        assert!(alice.router.send_locks.lock().contains_key(&PeerId(2)));

        alice.router.forget(PeerId(2));
        assert!(alice.router.send_locks.lock().is_empty());
        assert!(alice.router.observed.read().is_empty());

        // A forgotten peer is still routable on demand
        assert_eq!(alice.router.send(PeerId(2), &text("two")).await, Ok(Route::Relayed));
    }
}
