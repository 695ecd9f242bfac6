//! Direct channels between sessions: glare, dual-path delivery, fallback
//!
//! Run with: cargo test --test integration_glare

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::directory::MemoryDirectory;
use tandem_core::message::PeerPacket;
use tandem_core::signaling::{kinds, MemoryRelay};
use tandem_core::transport::LoopbackNetwork;
use tandem_core::{
    Collaborators, CoreEvent, CoreEventKind, MessageStatus, PeerId, Session, SessionConfig,
    TransportState,
};

const LOW: PeerId = PeerId(3);
const HIGH: PeerId = PeerId(7);

struct World {
    relay: Arc<MemoryRelay>,
    network: Arc<LoopbackNetwork>,
    directory: Arc<MemoryDirectory>,
}

impl World {
    fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
            directory: Arc::new(MemoryDirectory::new()),
        }
    }

    async fn session(&self, id: PeerId) -> Arc<Session> {
        let session = Session::new(
            id,
            SessionConfig::default(),
            Collaborators {
                directory: self.directory.clone(),
                connector: Arc::new(self.relay.connector(id)),
                engine: Arc::new(self.network.engine(id)),
                backlog: None,
            },
        );
        session.initialize_keys().await.expect("keys");
        session.start("token").await.expect("relay connect");
        session
    }

    fn signals_from(&self, peer: PeerId, kind: &str) -> usize {
        self.relay
            .frames_from(peer)
            .iter()
            .filter(|f| f.kind == kinds::SIGNAL && f.payload["type"] == kind)
            .count()
    }

    fn relayed_messages_from(&self, peer: PeerId) -> usize {
        self.relay
            .frames_from(peer)
            .iter()
            .filter(|f| f.kind == kinds::MESSAGE && f.payload["packet"]["type"] == "message")
            .count()
    }
}

fn transport_states(session: &Session) -> Arc<Mutex<Vec<TransportState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session
        .events()
        .subscribe(CoreEventKind::TransportChanged, move |e| {
            if let CoreEvent::TransportChanged { state, .. } = e {
                sink.lock().push(*state);
            }
        });
    seen
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_glare_lower_id_wins() {
    let world = World::new();
    let low = world.session(LOW).await;
    let high = world.session(HIGH).await;
    let low_states = transport_states(&low);
    let high_states = transport_states(&high);

    // Both sides offer at once
    let (a, b) = tokio::join!(low.negotiate(HIGH), high.negotiate(LOW));
    a.expect("low negotiates");
    b.expect("high negotiates");

    eventually("both sides direct", || {
        low.transport_state(HIGH) == TransportState::Direct
            && high.transport_state(LOW) == TransportState::Direct
    })
    .await;

    assert_eq!(world.signals_from(LOW, "offer"), 1);
    assert_eq!(world.signals_from(HIGH, "offer"), 1);
    // Only the higher id answered
    assert_eq!(world.signals_from(LOW, "answer"), 0);
    assert_eq!(world.signals_from(HIGH, "answer"), 1);

    let opened = |states: &Arc<Mutex<Vec<TransportState>>>| {
        states
            .lock()
            .iter()
            .filter(|s| **s == TransportState::Direct)
            .count()
    };
    assert_eq!(opened(&low_states), 1);
    assert_eq!(opened(&high_states), 1);
}

#[tokio::test]
async fn test_direct_messages_skip_the_relay() {
    let world = World::new();
    let alice = world.session(LOW).await;
    let bob = world.session(HIGH).await;
    alice.establish_secret(HIGH).await.expect("alice key");
    bob.establish_secret(LOW).await.expect("bob key");

    alice.negotiate(HIGH).await.expect("negotiate");
    eventually("direct channel", || {
        alice.transport_state(HIGH) == TransportState::Direct
            && bob.transport_state(LOW) == TransportState::Direct
    })
    .await;

    let sent = alice.send_plaintext(HIGH, "peer to peer").await.expect("send");
    eventually("bob to receive", || bob.conversation(LOW).len() == 1).await;
    assert_eq!(
        bob.open_message(&bob.conversation(LOW)[0].key())
            .expect("bob decrypts"),
        "peer to peer"
    );

    // Bob's receipt came back over the same channel
    eventually("alice to see delivered", || {
        alice.conversation(HIGH)[0].status == MessageStatus::Delivered
    })
    .await;

    assert_eq!(world.relayed_messages_from(LOW), 0);
    assert_eq!(world.relay.frames_from(HIGH).iter().filter(|f| f.kind == kinds::MESSAGE).count(), 0);
    // Direct messages have no relay id
    assert_eq!(sent.id, None);
}

#[tokio::test]
async fn test_same_message_on_both_routes_is_one_entry() {
    let world = World::new();
    let alice = world.session(LOW).await;
    let bob = world.session(HIGH).await;
    alice.establish_secret(HIGH).await.expect("alice key");
    bob.establish_secret(LOW).await.expect("bob key");

    let received = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&received);
    bob.events()
        .subscribe(CoreEventKind::MessageReceived, move |_| *counter.lock() += 1);

    alice.negotiate(HIGH).await.expect("negotiate");
    eventually("direct channel", || alice.transport_state(HIGH) == TransportState::Direct).await;

    let sent = alice.send_plaintext(HIGH, "twice").await.expect("send");
    eventually("direct delivery", || bob.conversation(LOW).len() == 1).await;

    // A retry path pushes the same packet through the relay as well
    let packet = PeerPacket::Message {
        content: sent.content.clone(),
        timestamp: sent.timestamp,
        encrypted: true,
    };
    alice
        .signaling()
        .send_packet(HIGH, &packet)
        .expect("relay accepts");

    // The relayed copy brings the relay id to the existing entry
    eventually("relay id adopted", || bob.conversation(LOW)[0].id.is_some()).await;
    assert_eq!(bob.conversation(LOW).len(), 1);
    assert_eq!(*received.lock(), 1);
}

#[tokio::test]
async fn test_stalled_channel_falls_back_to_relay() {
    let world = World::new();
    let mut config = SessionConfig::default();
    config.router.direct_send_timeout_ms = 100;

    let alice = Session::new(
        LOW,
        config,
        Collaborators {
            directory: world.directory.clone(),
            connector: Arc::new(world.relay.connector(LOW)),
            engine: Arc::new(world.network.engine(LOW)),
            backlog: None,
        },
    );
    alice.initialize_keys().await.expect("keys");
    alice.start("token").await.expect("relay connect");
    let bob = world.session(HIGH).await;
    alice.establish_secret(HIGH).await.expect("alice key");
    bob.establish_secret(LOW).await.expect("bob key");

    alice.negotiate(HIGH).await.expect("negotiate");
    eventually("direct channel", || alice.transport_state(HIGH) == TransportState::Direct).await;
    world.network.set_stalled(LOW, HIGH, true);

    alice.send_plaintext(HIGH, "slow path").await.expect("falls back");
    assert_eq!(world.relayed_messages_from(LOW), 1);

    eventually("bob to receive", || bob.conversation(LOW).len() == 1).await;
    assert!(bob.conversation(LOW)[0].id.is_some());
}

#[tokio::test]
async fn test_lost_channel_is_renegotiated() {
    let world = World::new();
    let alice = world.session(LOW).await;
    let bob = world.session(HIGH).await;

    alice.negotiate(HIGH).await.expect("negotiate");
    eventually("direct channel", || alice.transport_state(HIGH) == TransportState::Direct).await;
    let states = transport_states(&alice);

    world.network.sever(LOW, HIGH);
    eventually("channel restored", || {
        alice.transport_state(HIGH) == TransportState::Direct
            && bob.transport_state(LOW) == TransportState::Direct
            && world.network.is_open(LOW, HIGH)
    })
    .await;

    // Observers saw the drop before the recovery
    let seen = states.lock().clone();
    assert_eq!(seen.last(), Some(&TransportState::Direct));
    assert!(seen.len() >= 2);
}
