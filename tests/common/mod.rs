//! Shared test infrastructure: scripted transports and connectors, and an
//! in-process mesh WebSocket server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use meshconn::error::{Error, Result};
use meshconn::metrics::TransportMetrics;
use meshconn::probe::EndpointConnector;
use meshconn::transport::{MessageHandler, Transport, TransportConfig, TransportFactory};
use meshconn::types::{EndpointKind, TransportState, TransportType};

// ============================================================================
// Mock transport
// ============================================================================

/// Transport whose connect, ping and send outcomes are switched by the test.
pub struct MockTransport {
    ty: TransportType,
    state: Mutex<TransportState>,
    address: Mutex<Option<String>>,
    metrics: TransportMetrics,
    connect_ok: AtomicBool,
    ping_ok: AtomicBool,
    send_ok: AtomicBool,
    connects: AtomicU32,
    sent: Mutex<Vec<Vec<u8>>>,
    handler: Mutex<Option<MessageHandler>>,
}

impl MockTransport {
    pub fn new(ty: TransportType) -> Arc<Self> {
        Arc::new(Self {
            ty,
            state: Mutex::new(TransportState::Unknown),
            address: Mutex::new(None),
            metrics: TransportMetrics::new(ty),
            connect_ok: AtomicBool::new(true),
            ping_ok: AtomicBool::new(true),
            send_ok: AtomicBool::new(true),
            connects: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        })
    }

    /// A transport whose connect attempts always fail.
    pub fn unreachable(ty: TransportType) -> Arc<Self> {
        let transport = Self::new(ty);
        transport.set_connect_ok(false);
        transport
    }

    pub fn set_connect_ok(&self, ok: bool) {
        self.connect_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_send_ok(&self, ok: bool) {
        self.send_ok.store(ok, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Feed an inbound payload to the installed handler.
    pub fn inject(&self, data: &[u8]) -> bool {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler(self.ty, data.to_vec());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> TransportType {
        self.ty
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn address(&self) -> Option<String> {
        self.address.lock().clone()
    }

    fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    async fn connect(&self, address: &str) -> bool {
        if self.is_connected() {
            return true;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_ok.load(Ordering::SeqCst) {
            *self.state.lock() = TransportState::Connected;
            *self.address.lock() = Some(address.to_string());
            self.metrics.record_latency(Duration::from_millis(10));
            true
        } else {
            *self.state.lock() = TransportState::Failed;
            self.metrics.record_failure();
            false
        }
    }

    async fn disconnect(&self) {
        *self.state.lock() = TransportState::Unknown;
    }

    async fn send(&self, data: &[u8]) -> bool {
        if self.is_connected() && self.send_ok.load(Ordering::SeqCst) {
            self.sent.lock().push(data.to_vec());
            self.metrics.record_success();
            true
        } else {
            self.metrics.record_failure();
            false
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn ping(&self) -> Option<Duration> {
        if self.is_connected() && self.ping_ok.load(Ordering::SeqCst) {
            let rtt = Duration::from_millis(10);
            self.metrics.record_latency(rtt);
            Some(rtt)
        } else {
            self.metrics.record_failure();
            None
        }
    }
}

/// Factory handing out pre-built mocks, so tests keep a handle on each one.
#[derive(Default)]
pub struct MockFactory {
    transports: Mutex<HashMap<TransportType, Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn provide(&self, transport: Arc<MockTransport>) {
        self.transports
            .lock()
            .insert(transport.transport_type(), transport);
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, ty: TransportType, _config: &TransportConfig) -> Arc<dyn Transport> {
        let transport = self
            .transports
            .lock()
            .entry(ty)
            .or_insert_with(|| MockTransport::unreachable(ty))
            .clone();
        transport
    }
}

// ============================================================================
// Scripted connector
// ============================================================================

/// Outcome of one scripted probe.
#[derive(Debug, Clone)]
pub enum ProbeScript {
    /// Finish after `delay` reporting `latency`.
    Ok { delay: Duration, latency: Duration },
    /// Fail after `delay`.
    Fail { delay: Duration, reason: String },
}

impl ProbeScript {
    /// Finish after `latency` and report it.
    pub fn ok_ms(ms: u64) -> Self {
        let d = Duration::from_millis(ms);
        Self::Ok { delay: d, latency: d }
    }

    pub fn fail(reason: &str) -> Self {
        Self::Fail {
            delay: Duration::from_millis(5),
            reason: reason.to_string(),
        }
    }
}

/// Session handed out by [`ScriptedConnector`].
#[derive(Debug, Clone)]
pub struct FakeSession {
    pub kind: EndpointKind,
    pub id: u32,
    alive: Arc<AtomicBool>,
    reconnecting: Arc<AtomicBool>,
}

impl FakeSession {
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn was_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Script {
    probes: Mutex<HashMap<EndpointKind, ProbeScript>>,
    establish_fails: Mutex<HashMap<EndpointKind, String>>,
    probe_calls: Mutex<Vec<EndpointKind>>,
    established: Mutex<Vec<FakeSession>>,
    torn_down: Mutex<Vec<EndpointKind>>,
    next_id: AtomicU32,
}

/// Connector whose probe and establish results are scripted per endpoint.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, kind: EndpointKind, probe: ProbeScript) -> &Self {
        self.script.probes.lock().insert(kind, probe);
        self
    }

    pub fn fail_establish(&self, kind: EndpointKind, reason: &str) -> &Self {
        self.script
            .establish_fails
            .lock()
            .insert(kind, reason.to_string());
        self
    }

    pub fn probe_calls(&self) -> Vec<EndpointKind> {
        self.script.probe_calls.lock().clone()
    }

    pub fn established(&self) -> Vec<FakeSession> {
        self.script.established.lock().clone()
    }

    pub fn torn_down(&self) -> Vec<EndpointKind> {
        self.script.torn_down.lock().clone()
    }
}

#[async_trait]
impl EndpointConnector for ScriptedConnector {
    type Session = FakeSession;

    async fn probe(&self, kind: EndpointKind, address: &str) -> Result<Duration> {
        self.script.probe_calls.lock().push(kind);
        let script = self.script.probes.lock().get(&kind).cloned();
        match script {
            Some(ProbeScript::Ok { delay, latency }) => {
                tokio::time::sleep(delay).await;
                Ok(latency)
            }
            Some(ProbeScript::Fail { delay, reason }) => {
                tokio::time::sleep(delay).await;
                Err(Error::ConnectionFailed {
                    endpoint: address.to_string(),
                    reason,
                })
            }
            None => Err(Error::ConnectionFailed {
                endpoint: address.to_string(),
                reason: "unscripted".into(),
            }),
        }
    }

    async fn establish(&self, kind: EndpointKind, address: &str) -> Result<FakeSession> {
        if let Some(reason) = self.script.establish_fails.lock().get(&kind).cloned() {
            return Err(Error::AuthRejected(format!("{address}: {reason}")));
        }
        let session = FakeSession {
            kind,
            id: self.script.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            alive: Arc::new(AtomicBool::new(true)),
            reconnecting: Arc::new(AtomicBool::new(false)),
        };
        self.script.established.lock().push(session.clone());
        Ok(session)
    }

    async fn teardown(&self, session: FakeSession) {
        session.kill();
        self.script.torn_down.lock().push(session.kind);
    }

    fn is_alive(&self, session: &FakeSession) -> bool {
        session.is_alive()
    }

    fn mark_reconnecting(&self, session: &FakeSession) {
        session.reconnecting.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Mesh WebSocket server
// ============================================================================

/// Server side of one accepted mesh session.
pub struct ServerConn {
    /// The client's `join` frame.
    pub join: Value,
    to_client: mpsc::UnboundedSender<Message>,
    from_client: mpsc::UnboundedReceiver<Value>,
}

impl ServerConn {
    pub fn send_json(&self, value: Value) {
        let _ = self.to_client.send(Message::Text(value.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Message::Text(text.to_string()));
    }

    /// Close the socket from the server side.
    pub fn close(&self) {
        let _ = self.to_client.send(Message::Close(None));
    }

    /// Next JSON frame from the client.
    pub async fn recv(&mut self) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .ok()
            .flatten()
    }
}

/// In-process mesh server: accepts sockets, reads `join`, answers `joined`
/// (or an `error` frame when rejecting), then hands the session to the test.
pub struct MeshServer {
    pub addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<ServerConn>,
    reject: Arc<Mutex<Option<String>>>,
}

impl MeshServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();
        let reject = Arc::new(Mutex::new(None));

        let reject_mode = reject.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let reject = reject_mode.lock().clone();
                tokio::spawn(serve(stream, reject, tx.clone()));
            }
        });

        Self { addr, conns, reject }
    }

    /// `ws://` URL of the default mesh path.
    pub fn url(&self) -> String {
        format!("ws://{}/api/ws", self.addr)
    }

    /// Reject every following join with an `error` frame.
    pub fn reject_joins(&self, reason: &str) {
        *self.reject.lock() = Some(reason.to_string());
    }

    pub async fn next_conn(&mut self) -> ServerConn {
        tokio::time::timeout(Duration::from_secs(5), self.conns.recv())
            .await
            .expect("no connection within 5s")
            .expect("server stopped")
    }
}

async fn serve(stream: TcpStream, reject: Option<String>, conns: mpsc::UnboundedSender<ServerConn>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    // Probes close right after the handshake and never send a join.
    let join = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => break value,
                Err(_) => continue,
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };

    let (to_client, mut outbound) = mpsc::unbounded_channel::<Message>();
    let (inbound, from_client) = mpsc::unbounded_channel::<Value>();

    if let Some(reason) = reject {
        let frame = json!({ "type": "error", "message": reason, "code": "auth" });
        let _ = ws.send(Message::Text(frame.to_string())).await;
        let _ = conns.send(ServerConn {
            join,
            to_client,
            from_client,
        });
        let _ = ws.close(None).await;
        return;
    }

    let joined = json!({ "type": "joined", "mesh": { "name": "home", "peers": 2 } });
    if ws.send(Message::Text(joined.to_string())).await.is_err() {
        return;
    }
    let _ = conns.send(ServerConn {
        join,
        to_client,
        from_client,
    });

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = inbound.send(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            out = outbound.recv() => match out {
                Some(Message::Close(frame)) => {
                    let _ = ws.close(frame).await;
                    break;
                }
                Some(message) => {
                    if ws.send(message).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
        }
    }
}

/// A local address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
