//! Core types used throughout meshconn.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Identifier of a remote mesh peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Physical or logical medium used to reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// WebSocket over the local network.
    Lan,
    /// Wi-Fi Direct link.
    WifiDirect,
    /// Bluetooth Low Energy mesh.
    Ble,
    /// Matter fabric.
    Matter,
    /// WebSocket through a cloud relay.
    Relay,
}

impl TransportType {
    pub const ALL: [Self; 5] = [
        Self::Lan,
        Self::WifiDirect,
        Self::Ble,
        Self::Matter,
        Self::Relay,
    ];

    /// Static fallback rank (lower = tried first).
    pub fn priority(self) -> u8 {
        match self {
            Self::Lan => 0,
            Self::WifiDirect => 1,
            Self::Ble => 2,
            Self::Matter => 3,
            Self::Relay => 4,
        }
    }

    /// Assumed battery cost in `[0, 1]`.
    pub fn battery_cost(self) -> f64 {
        match self {
            Self::Lan => 0.1,
            Self::WifiDirect => 0.3,
            Self::Ble => 0.2,
            Self::Matter => 0.25,
            Self::Relay => 0.4,
        }
    }

    /// Whether the medium is carried over a WebSocket.
    pub fn is_websocket(self) -> bool {
        matches!(self, Self::Lan | Self::Relay)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lan => write!(f, "lan"),
            Self::WifiDirect => write!(f, "wifi_direct"),
            Self::Ble => write!(f, "ble"),
            Self::Matter => write!(f, "matter"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

impl FromStr for TransportType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lan" => Ok(Self::Lan),
            "wifi_direct" | "wifi-direct" | "wifidirect" => Ok(Self::WifiDirect),
            "ble" | "ble_mesh" => Ok(Self::Ble),
            "matter" => Ok(Self::Matter),
            "relay" => Ok(Self::Relay),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown transport type: {other}"
            ))),
        }
    }
}

/// Candidate endpoint slot raced by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Local,
    Public,
    Relay,
    Ble,
}

impl EndpointKind {
    /// Tie-break rank when two probes report the same latency (higher wins).
    pub fn probe_priority(self) -> u32 {
        match self {
            Self::Local => 100,
            Self::Relay => 80,
            Self::Public => 60,
            Self::Ble => 40,
        }
    }

    /// BLE cannot be probed actively; it waits for a discovery event.
    pub fn is_passive(self) -> bool {
        matches!(self, Self::Ble)
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Public => write!(f, "public"),
            Self::Relay => write!(f, "relay"),
            Self::Ble => write!(f, "ble"),
        }
    }
}

/// Per-endpoint / per-transport availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Registered but never checked
    #[default]
    Unknown,
    /// Probe in flight
    Probing,
    /// Probe succeeded, not promoted
    Available,
    /// Carrying traffic
    Connected,
    /// Last probe or connect attempt failed
    Failed,
}

impl TransportState {
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Available | Self::Connected)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Probing => write!(f, "probing"),
            Self::Available => write!(f, "available"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Mesh session (WebSocket link) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Initial state, not yet connected
    #[default]
    Disconnected,
    /// Socket opening or join handshake in flight
    Connecting,
    /// Join confirmed
    Connected,
    /// Owner is rebuilding the session
    Reconnecting,
    /// Socket failure or join rejection
    Failed,
}

impl LinkState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status record for one (peer, transport) pair.
///
/// `K` is [`TransportType`] for the resilient manager and [`EndpointKind`]
/// for the prober.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportStatus<K> {
    pub kind: K,
    pub state: TransportState,
    pub latency_ms: Option<u64>,
    pub last_check_time: Option<SystemTime>,
    pub error: Option<String>,
    pub address: String,
}

impl<K: Copy> TransportStatus<K> {
    pub fn new(kind: K, address: impl Into<String>) -> Self {
        Self {
            kind,
            state: TransportState::Unknown,
            latency_ms: None,
            last_check_time: None,
            error: None,
            address: address.into(),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.state.is_usable()
    }

    pub fn mark(&mut self, state: TransportState) {
        self.state = state;
        self.last_check_time = Some(SystemTime::now());
        if state != TransportState::Failed {
            self.error = None;
        }
    }

    pub fn mark_available(&mut self, latency: Duration) {
        self.mark(TransportState::Available);
        self.latency_ms = Some(duration_ms(latency));
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.mark(TransportState::Failed);
        self.error = Some(error.into());
    }

    /// Back to UNKNOWN, keeping the address.
    pub fn reset(&mut self) {
        self.state = TransportState::Unknown;
        self.latency_ms = None;
        self.error = None;
        self.last_check_time = Some(SystemTime::now());
    }
}

/// Whole milliseconds, saturating.
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, duration_ms)
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
