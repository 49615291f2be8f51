//! Error types for meshconn.

use std::collections::BTreeMap;
use std::io;

use thiserror::Error;

/// Result type alias for meshconn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for meshconn.
#[derive(Error, Debug)]
pub enum Error {
    // Authentication errors
    #[error("join rejected by server: {0}")]
    AuthRejected(String),

    #[error("mesh token expired")]
    TokenExpired,

    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("not connected")]
    NotConnected,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Pool / orchestration errors
    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("no healthy transport available")]
    NoHealthyTransport,

    #[error("all transports failed")]
    AllTransportsFailed,

    #[error("peer {peer} unreachable: {}", format_errors(.errors))]
    PeerUnreachable {
        peer: String,
        errors: BTreeMap<String, String>,
    },

    #[error("reconnect budget exhausted for {transport} on {peer} after {attempts} attempts")]
    ReconnectExhausted {
        peer: String,
        transport: String,
        attempts: u32,
    },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_errors(errors: &BTreeMap<String, String>) -> String {
    if errors.is_empty() {
        return "no endpoints configured".into();
    }
    errors
        .iter()
        .map(|(kind, err)| format!("{kind}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("no transport factory registered for {0}")]
    NoFactory(String),
}

/// Wire protocol parsing and handling errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no type discriminator")]
    MissingType,

    #[error("malformed {kind} frame: {reason}")]
    MalformedFrame { kind: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(ProtocolError::Deserialization(e.to_string()))
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Transport(TransportError::InvalidAddress(e.to_string()))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(TransportError::WebSocket(e.to_string()))
    }
}

impl Error {
    /// Check if error indicates the session should be rebuilt.
    ///
    /// Auth failures are excluded; the caller must supply a fresh token.
    pub fn should_reconnect(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::ConnectionTimeout
                | Error::ConnectionFailed { .. }
                | Error::Transport(TransportError::WebSocket(_))
        )
    }

    /// Check if error is an authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::AuthRejected(_) | Error::TokenExpired)
    }
}
