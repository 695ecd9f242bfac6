// Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relay connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the relay server
    pub relay_url: String,
    /// Automatic reconnect attempts after an unexpected close
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt
    pub reconnect_base_delay_ms: u64,
    /// Upper bound for a single reconnect delay
    pub reconnect_max_delay_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:3000/ws".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl SignalingConfig {
    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff_ms = self
            .reconnect_base_delay_ms
            .saturating_mul(2u64.pow(std::cmp::min(attempt, 5)));
        Duration::from_millis(std::cmp::min(backoff_ms, self.reconnect_max_delay_ms))
    }
}

/// Direct-channel negotiation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// A negotiation that hasn't opened a channel by now has failed
    pub timeout_ms: u64,
    /// Automatic retries after a failure before staying Failed
    pub auto_retries: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            auto_retries: 1,
        }
    }
}

impl NegotiationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Route selection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How often route health is re-evaluated
    pub health_interval_ms: u64,
    /// A direct send slower than this falls back to the relay
    pub direct_send_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 5_000,
            direct_send_timeout_ms: 5_000,
        }
    }
}

impl RouterConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn direct_send_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_send_timeout_ms)
    }
}

/// Key directory settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the relay server's REST API
    pub base_url: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
        }
    }
}

/// Everything a session needs to know up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub signaling: SignalingConfig,
    pub negotiation: NegotiationConfig,
    pub router: RouterConfig,
    pub directory: DirectoryConfig,
    /// Default `tracing` filter when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            negotiation: NegotiationConfig::default(),
            router: RouterConfig::default(),
            directory: DirectoryConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.signaling.relay_url = url.into();
        self
    }
}
