// Tandem Core: session and transport layer of an end-to-end encrypted messenger
//
// A conversation with a peer moves over a direct channel when one can be
// negotiated and over the relay server otherwise. Payloads are sealed with
// a key derived from both sides' published agreement keys, and every
// message lands in one ordered, deduplicated history whichever route
// carried it.

pub mod config;
pub mod crypto;
pub mod directory;
pub mod events;
pub mod identity;
pub mod message;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{DirectoryConfig, NegotiationConfig, RouterConfig, SessionConfig, SignalingConfig};
pub use crypto::{decrypt, encrypt, CryptoError, SharedSecret, SymmetricKey};
pub use directory::{Directory, DirectoryError, HttpDirectory, MemoryDirectory, OfflineBacklog};
pub use events::{CoreEvent, CoreEventKind, EventBus, IntegrityWarning, SubscriptionToken};
pub use identity::{fingerprint, KeyError, KeyExchangeManager, KeyKind, PeerId, PeerKeyRecord, Trust};
pub use message::{Message, MessageKey, MessageLedger, MessageStatus};
pub use session::{Collaborators, Session, SessionError};
pub use signaling::{Connectivity, SignalingChannel, SignalingError, WebSocketConnector};
pub use transport::{Route, RouteError, TransportState};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` wins over
/// `default_filter`. Later calls are no-ops.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();
}
