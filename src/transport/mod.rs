//! Transport layer for meshconn.
//!
//! A [`Transport`] is one physical or logical medium to a single peer. LAN and
//! relay links are WebSockets ([`WebSocketTransport`]); BLE, Wi-Fi Direct and
//! Matter drivers are supplied by the platform through [`TransportFactory`].
//!
//! Expected failures (not connected, write error) come back as `false` /
//! `None` rather than errors, and every send or ping records a sample into the
//! transport's own [`TransportMetrics`].

mod memory;
mod websocket;

pub use memory::MemoryTransport;
pub use websocket::{WebSocketFactory, WebSocketTransport};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metrics::TransportMetrics;
use crate::types::{unix_millis, TransportState, TransportType};

/// Callback invoked for every inbound application payload.
pub type MessageHandler = Arc<dyn Fn(TransportType, Vec<u8>) + Send + Sync>;

/// Prefix of the payload sent by the default [`Transport::ping`].
pub const PING_MAGIC: &[u8; 4] = b"MCPI";

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connection timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long a protocol-native ping waits for its pong.
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Largest payload accepted by `send`.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Path appended to bare WebSocket addresses.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(8)
}
fn default_ping_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_max_frame_size() -> usize {
    1024 * 1024
} // 1 MB
fn default_ws_path() -> String {
    crate::protocol::DEFAULT_WS_PATH.into()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            ping_timeout: default_ping_timeout(),
            max_frame_size: default_max_frame_size(),
            ws_path: default_ws_path(),
        }
    }
}

/// One medium to one peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Medium this transport runs over.
    fn transport_type(&self) -> TransportType;

    /// Current connection state.
    fn state(&self) -> TransportState;

    /// Address of the last successful `connect`.
    fn address(&self) -> Option<String>;

    /// Statistics owned by this transport.
    fn metrics(&self) -> &TransportMetrics;

    /// Connect to `address`. Returns `true` immediately if already connected.
    async fn connect(&self, address: &str) -> bool;

    /// Tear down the link. Safe to call in any state.
    async fn disconnect(&self);

    /// Send one payload. Records success or failure into the metrics.
    async fn send(&self, data: &[u8]) -> bool;

    /// Install the inbound payload callback.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Measure round-trip latency.
    ///
    /// The default sends a ping payload and times the send; implementations
    /// with a native ping should override this.
    async fn ping(&self) -> Option<Duration> {
        let payload = ping_payload();
        let start = Instant::now();
        if self.send(&payload).await {
            let rtt = start.elapsed();
            self.metrics().record_sample(rtt);
            Some(rtt)
        } else {
            None
        }
    }

    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Connected with fewer than three consecutive failures.
    fn is_healthy(&self) -> bool {
        self.metrics().is_healthy(self.state())
    }

    /// Selection score; zero for unhealthy transports.
    fn score(&self) -> f64 {
        self.metrics().effective_score(self.state())
    }
}

/// Creates transports for one medium.
///
/// Platform radio drivers (BLE, Wi-Fi Direct, Matter) are plugged into the
/// resilient manager through this trait.
pub trait TransportFactory: Send + Sync {
    fn create(&self, transport_type: TransportType, config: &TransportConfig)
        -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(TransportType, &TransportConfig) -> Arc<dyn Transport> + Send + Sync,
{
    fn create(
        &self,
        transport_type: TransportType,
        config: &TransportConfig,
    ) -> Arc<dyn Transport> {
        self(transport_type, config)
    }
}

/// Payload used by the default ping: magic followed by a millisecond timestamp.
pub fn ping_payload() -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(PING_MAGIC);
    payload.extend_from_slice(&unix_millis().to_be_bytes());
    payload
}

/// Whether an inbound payload is a default-ping probe rather than data.
pub fn is_ping_payload(data: &[u8]) -> bool {
    data.len() == 12 && data.starts_with(PING_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_payload_shape() {
        let payload = ping_payload();
        assert!(is_ping_payload(&payload));
        assert!(!is_ping_payload(b"MCPI"));
        assert!(!is_ping_payload(b"hello world!"));
    }

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(8));
        assert_eq!(config.ping_timeout, Duration::from_secs(5));
        assert_eq!(config.ws_path, "/api/ws");
    }

    #[tokio::test]
    async fn test_default_ping_records_sample() {
        let (a, _b) = MemoryTransport::pair(TransportType::WifiDirect);
        assert!(a.ping().await.is_some());
        assert_eq!(a.metrics().sample_count(), 1);
        assert_eq!(a.metrics().consecutive_failures(), 0);
    }
}
