//! Mesh session over one WebSocket endpoint.
//!
//! A [`MeshLink`] opens the socket, performs the join handshake, then runs a
//! reader task that answers pings, resolves pending requests and publishes
//! everything else as [`LinkEvent`]s.
//!
//! ```text
//! Disconnected ─connect()─▶ Connecting ─joined─▶ Connected
//!       ▲                        │                   │
//!       │                  socket error /      socket error / close
//!       │                  auth rejection            │
//!       │                        ▼                   ▼
//!       └──────disconnect()──── Failed ◀──────────────┘
//! ```
//!
//! `Reconnecting` is set by the owning prober when it notices the session is
//! gone and re-races; a link never retries on its own. A switch to another endpoint
//! builds a new link and drops the old one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result, TransportError};
use crate::protocol::{
    normalize_ws_url, JoinToken, MeshEndpoints, MeshMessage, MeshToken, DEFAULT_WS_PATH,
    ENDPOINT_TOPICS, ENDPOINT_UPDATE_TOPIC,
};
use crate::types::LinkState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Socket open timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Time allowed between sending `join` and receiving `joined`.
    #[serde(default = "default_join_timeout", with = "humantime_serde")]
    pub join_timeout: Duration,

    /// Path appended to bare endpoint addresses.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Event channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Largest outbound frame, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(8)
}
fn default_join_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_ws_path() -> String {
    DEFAULT_WS_PATH.into()
}
fn default_event_capacity() -> usize {
    256
}
fn default_max_frame_size() -> usize {
    1024 * 1024
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            join_timeout: default_join_timeout(),
            ws_path: default_ws_path(),
            event_capacity: default_event_capacity(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Who we are on the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Node identifier announced in `join`.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Human readable name.
    #[serde(default)]
    pub name: Option<String>,

    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4().simple())
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            name: None,
            capabilities: Vec::new(),
        }
    }
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            name: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Credentials presented in `join`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LinkCredentials {
    /// No token.
    #[default]
    Anonymous,
    /// Shared secret, re-wrapped with a fresh nonce per attempt.
    Legacy(String),
    /// Token signed by the identity service.
    Signed(MeshToken),
}

impl LinkCredentials {
    /// Token for one connection attempt. Never cache the result.
    pub fn fresh_join_token(&self) -> Result<Option<JoinToken>> {
        match self {
            Self::Anonymous => Ok(None),
            Self::Legacy(token) => Ok(Some(JoinToken::legacy(token.clone()))),
            Self::Signed(token) if token.is_expired() => Err(Error::TokenExpired),
            Self::Signed(token) => Ok(Some(JoinToken::Signed(token.clone()))),
        }
    }
}

/// Events published by a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(LinkState),
    /// Join accepted; carries the server's mesh description.
    Joined { mesh: Value },
    /// Application-level frame (relay envelopes already unwrapped).
    Message {
        from: Option<String>,
        message: MeshMessage,
    },
    /// A peer gossiped its own endpoint set.
    EndpointsAnnounced {
        from: Option<String>,
        endpoints: MeshEndpoints,
    },
    /// Frame with an unrecognised `type`.
    Unknown { kind: String, raw: Value },
    /// Socket went away underneath us.
    Closed { reason: String },
}

/// Receiver side of an in-flight `llm_request`.
///
/// The link never times requests out; wrap [`response`](Self::response) in
/// the caller's own timeout.
#[derive(Debug)]
pub struct PendingRequest {
    pub request_id: String,
    rx: oneshot::Receiver<Result<MeshMessage>>,
}

impl PendingRequest {
    pub async fn response(self) -> Result<MeshMessage> {
        self.rx
            .await
            .map_err(|_| Error::Internal(format!("request {} cancelled", self.request_id)))?
    }
}

struct Shared {
    endpoint: String,
    state: watch::Sender<LinkState>,
    events: broadcast::Sender<LinkEvent>,
    sink: AsyncMutex<Option<WsSink>>,
    pending: DashMap<String, oneshot::Sender<Result<MeshMessage>>>,
    mesh: RwLock<Option<Value>>,
    max_frame_size: usize,
}

impl Shared {
    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(endpoint = %self.endpoint, from = %previous, to = %state, "Link state changed");
            let _ = self.events.send(LinkEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    async fn send_frame(&self, message: &MeshMessage) -> Result<()> {
        let text = message.to_json()?;
        if text.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_size,
            }
            .into());
        }
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::NotConnected)?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close_sink(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }

    /// Resolve every pending request with an error.
    fn fail_pending(&self, reason: &str) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(Error::ConnectionFailed {
                    endpoint: self.endpoint.clone(),
                    reason: reason.to_string(),
                }));
            }
        }
    }

    /// Handle one decoded text frame. Malformed frames are logged and dropped.
    async fn handle_text(&self, text: &str) {
        let message = match MeshMessage::parse(text).and_then(MeshMessage::unwrap_relay) {
            Ok(relayed) => relayed,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Dropping malformed frame");
                return;
            }
        };
        self.dispatch(message.from, message.message).await;
    }

    async fn dispatch(&self, from: Option<String>, message: MeshMessage) {
        match message {
            MeshMessage::Ping { timestamp } => {
                trace!(endpoint = %self.endpoint, timestamp, "Answering ping");
                if let Err(e) = self.send_frame(&MeshMessage::Pong { timestamp }).await {
                    debug!(endpoint = %self.endpoint, error = %e, "Failed to send pong");
                }
            }
            MeshMessage::Pong { .. } => {}
            MeshMessage::Joined { mesh } => {
                *self.mesh.write() = Some(mesh.clone());
                self.emit(LinkEvent::Joined { mesh });
            }
            MeshMessage::LlmResponse { ref request_id, .. } => {
                if let Some((_, tx)) = self.pending.remove(request_id) {
                    let _ = tx.send(Ok(message));
                } else {
                    debug!(endpoint = %self.endpoint, request_id = %request_id, "Response without pending request");
                    self.emit(LinkEvent::Message { from, message });
                }
            }
            MeshMessage::Gossip { ref topic, ref data } if ENDPOINT_TOPICS.contains(&topic.as_str()) => {
                match serde_json::from_value::<MeshEndpoints>(data.clone()) {
                    Ok(endpoints) => self.emit(LinkEvent::EndpointsAnnounced { from, endpoints }),
                    Err(e) => {
                        warn!(endpoint = %self.endpoint, topic = %topic, error = %e, "Bad endpoint gossip");
                        self.emit(LinkEvent::Message { from, message });
                    }
                }
            }
            MeshMessage::Unknown { kind, raw } => {
                debug!(endpoint = %self.endpoint, kind = %kind, "Unknown frame type");
                self.emit(LinkEvent::Unknown { kind, raw });
            }
            other => self.emit(LinkEvent::Message { from, message: other }),
        }
    }

    /// Read until `joined`. Frames that arrive earlier are dispatched as usual.
    async fn await_joined(&self, stream: &mut SplitStream<WsStream>) -> Result<Value> {
        loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(Error::ConnectionClosed),
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Err(Error::ConnectionClosed),
                _ => continue,
            };

            let relayed = match MeshMessage::parse(&text).and_then(MeshMessage::unwrap_relay) {
                Ok(relayed) => relayed,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "Dropping malformed frame during join");
                    continue;
                }
            };

            match relayed.message {
                MeshMessage::Joined { mesh } => return Ok(mesh),
                MeshMessage::Error { message, code } => {
                    let reason = code.map_or_else(|| message.clone(), |c| format!("{c}: {message}"));
                    return Err(Error::AuthRejected(reason));
                }
                other => self.dispatch(relayed.from, other).await,
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        let reason = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => self.handle_text(&text).await,
                    Err(_) => debug!(endpoint = %self.endpoint, "Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(|| "closed by server".to_string(), |f| f.reason.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            }
        };

        if self.state() == LinkState::Disconnected {
            return;
        }

        warn!(endpoint = %self.endpoint, reason = %reason, "Mesh link lost");
        self.sink.lock().await.take();
        self.fail_pending(&reason);
        self.set_state(LinkState::Failed);
        self.emit(LinkEvent::Closed { reason });
    }
}

/// One authenticated session against one endpoint.
pub struct MeshLink {
    shared: Arc<Shared>,
    identity: NodeIdentity,
    credentials: LinkCredentials,
    config: LinkConfig,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_request: AtomicU64,
}

impl MeshLink {
    /// Build a link; `address` is normalised to a WebSocket URL here.
    pub fn new(
        address: &str,
        identity: NodeIdentity,
        credentials: LinkCredentials,
        config: LinkConfig,
    ) -> Result<Self> {
        let endpoint = normalize_ws_url(address, &config.ws_path)?;
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(Self {
            shared: Arc::new(Shared {
                endpoint,
                state,
                events,
                sink: AsyncMutex::new(None),
                pending: DashMap::new(),
                mesh: RwLock::new(None),
                max_frame_size: config.max_frame_size,
            }),
            identity,
            credentials,
            config,
            reader: Mutex::new(None),
            next_request: AtomicU64::new(0),
        })
    }

    /// Normalised WebSocket URL.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// State updates; the current state is visible immediately.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Event stream (no replay).
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Mesh description from the last `joined`.
    pub fn mesh_info(&self) -> Option<Value> {
        self.shared.mesh.read().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Open the socket and run the join handshake.
    ///
    /// A fresh join token is generated for every call. Returns immediately if
    /// already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let token = match self.credentials.fresh_join_token() {
            Ok(token) => token,
            Err(e) => {
                warn!(endpoint = %self.endpoint(), error = %e, "Refusing to connect");
                self.shared.set_state(LinkState::Failed);
                return Err(e);
            }
        };

        self.stop_reader();
        self.shared.close_sink().await;
        self.shared.set_state(LinkState::Connecting);

        match self.handshake(token).await {
            Ok((mesh, stream)) => {
                *self.shared.mesh.write() = Some(mesh.clone());
                self.shared.set_state(LinkState::Connected);
                self.shared.emit(LinkEvent::Joined { mesh });
                let handle = tokio::spawn(self.shared.clone().read_loop(stream));
                *self.reader.lock() = Some(handle);
                info!(endpoint = %self.endpoint(), node_id = %self.identity.node_id, "Joined mesh");
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint(), error = %e, "Mesh connect failed");
                self.shared.close_sink().await;
                self.shared.set_state(LinkState::Failed);
                Err(e)
            }
        }
    }

    async fn handshake(&self, token: Option<JoinToken>) -> Result<(Value, SplitStream<WsStream>)> {
        let endpoint = self.endpoint().to_string();
        let (ws, _response) = timeout(self.config.connect_timeout, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
            .map_err(|e| Error::ConnectionFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let (sink, mut stream) = ws.split();
        *self.shared.sink.lock().await = Some(sink);

        let join = MeshMessage::Join {
            node_id: self.identity.node_id.clone(),
            token,
            capabilities: self.identity.capabilities.clone(),
            name: self.identity.name.clone(),
        };
        self.shared.send_frame(&join).await?;
        debug!(endpoint = %endpoint, "Join sent");

        let mesh = timeout(self.config.join_timeout, self.shared.await_joined(&mut stream))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;
        Ok((mesh, stream))
    }

    fn stop_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }

    /// Tear the session down. Pending requests fail; valid from any state.
    ///
    /// A connected link says `leave` to the mesh before closing the socket.
    pub async fn disconnect(&self) {
        let was_connected = self.is_connected();
        self.shared.set_state(LinkState::Disconnected);
        self.stop_reader();
        if was_connected {
            if let Err(e) = self.shared.send_frame(&MeshMessage::Leave { reason: None }).await {
                debug!(endpoint = %self.endpoint(), error = %e, "Leave not delivered");
            }
        }
        self.shared.close_sink().await;
        self.shared.fail_pending("disconnected");
        debug!(endpoint = %self.endpoint(), "Mesh link disconnected");
    }

    /// Mark the link as being rebuilt by its owner.
    pub fn set_reconnecting(&self) {
        if matches!(self.state(), LinkState::Connected | LinkState::Failed) {
            self.shared.set_state(LinkState::Reconnecting);
        }
    }

    /// Send an arbitrary frame.
    pub async fn send(&self, message: &MeshMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.shared.send_frame(message).await
    }

    /// Issue an `llm_request` with a fresh `req-<n>` id.
    pub async fn send_request(
        &self,
        prompt: impl Into<String>,
        model: Option<String>,
    ) -> Result<PendingRequest> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let request_id = format!("req-{}", self.next_request.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(request_id.clone(), tx);

        let request = MeshMessage::LlmRequest {
            request_id: request_id.clone(),
            prompt: prompt.into(),
            model,
            from: Some(self.identity.node_id.clone()),
        };
        if let Err(e) = self.shared.send_frame(&request).await {
            self.shared.pending.remove(&request_id);
            return Err(e);
        }

        Ok(PendingRequest { request_id, rx })
    }

    /// Drop a pending request slot. Returns whether it existed.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        self.shared.pending.remove(request_id).is_some()
    }

    /// Gossip our own endpoint set so peers can try a more direct path.
    pub async fn announce_endpoints(&self, endpoints: &MeshEndpoints) -> Result<()> {
        let data = serde_json::to_value(endpoints)?;
        self.send(&MeshMessage::Gossip {
            topic: ENDPOINT_UPDATE_TOPIC.into(),
            data,
        })
        .await
    }
}

impl Drop for MeshLink {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for MeshLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshLink")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_normalised() {
        let link = MeshLink::new(
            "http://192.168.1.4:8080",
            NodeIdentity::new("n1"),
            LinkCredentials::Anonymous,
            LinkConfig::default(),
        )
        .unwrap();
        assert_eq!(link.endpoint(), "ws://192.168.1.4:8080/api/ws");
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_expired_signed_token_is_refused() {
        let creds = LinkCredentials::Signed(MeshToken {
            mesh_id: "m".into(),
            node_id: None,
            issued_at: 0,
            expires_at: 1,
            capabilities: vec![],
            issuer_id: "i".into(),
            nonce: "n".into(),
            signature: "s".into(),
        });
        assert!(matches!(creds.fresh_join_token(), Err(Error::TokenExpired)));
    }

    #[test]
    fn test_legacy_credentials_refresh_each_time() {
        let creds = LinkCredentials::Legacy("secret".into());
        let a = creds.fresh_join_token().unwrap().unwrap();
        let b = creds.fresh_join_token().unwrap().unwrap();
        assert_ne!(a.nonce(), b.nonce());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let link = MeshLink::new(
            "ws://127.0.0.1:1",
            NodeIdentity::new("n1"),
            LinkCredentials::Anonymous,
            LinkConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            link.send_request("hi", None).await,
            Err(Error::NotConnected)
        ));
        assert!(!link.cancel_request("req-1"));
    }

    #[tokio::test]
    async fn test_connection_refused_sets_failed() {
        let link = MeshLink::new(
            "ws://127.0.0.1:1",
            NodeIdentity::new("n1"),
            LinkCredentials::Anonymous,
            LinkConfig::default(),
        )
        .unwrap();
        assert!(link.connect().await.is_err());
        assert_eq!(link.state(), LinkState::Failed);
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }
}
