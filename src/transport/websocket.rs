//! WebSocket transport used for LAN and relay links.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{is_ping_payload, MessageHandler, Transport, TransportConfig, TransportFactory};
use crate::metrics::TransportMetrics;
use crate::protocol::normalize_ws_url;
use crate::types::{TransportState, TransportType};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// State shared with the reader task.
struct Shared {
    transport_type: TransportType,
    state: RwLock<TransportState>,
    handler: RwLock<Option<MessageHandler>>,
    /// Outstanding native pings, keyed by the id carried in the payload.
    pongs: DashMap<u64, oneshot::Sender<Instant>>,
}

/// Binary-frame WebSocket link to one peer.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    config: TransportConfig,
    metrics: TransportMetrics,
    address: RwLock<Option<String>>,
    sink: AsyncMutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_ping: AtomicU64,
}

impl WebSocketTransport {
    pub fn new(transport_type: TransportType, config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport_type,
                state: RwLock::new(TransportState::Unknown),
                handler: RwLock::new(None),
                pongs: DashMap::new(),
            }),
            config,
            metrics: TransportMetrics::new(transport_type),
            address: RwLock::new(None),
            sink: AsyncMutex::new(None),
            reader: Mutex::new(None),
            next_ping: AtomicU64::new(1),
        }
    }

    fn set_state(&self, state: TransportState) {
        *self.shared.state.write() = state;
    }

    fn stop_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.shared.pongs.clear();
    }

    async fn close_sink(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }

    async fn read_loop(shared: Arc<Shared>, mut stream: SplitStream<WsStream>) {
        let ty = shared.transport_type;
        let reason = loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if is_ping_payload(&data) {
                        continue;
                    }
                    let handler = shared.handler.read().clone();
                    if let Some(handler) = handler {
                        handler(ty, data);
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    let handler = shared.handler.read().clone();
                    if let Some(handler) = handler {
                        handler(ty, text.into_bytes());
                    }
                }
                Some(Ok(Message::Pong(payload))) => {
                    if let Ok(bytes) = <[u8; 8]>::try_from(payload.as_slice()) {
                        let id = u64::from_be_bytes(bytes);
                        if let Some((_, tx)) = shared.pongs.remove(&id) {
                            let _ = tx.send(Instant::now());
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(|| "closed by peer".to_string(), |f| f.reason.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            }
        };

        warn!(transport = %ty, reason = %reason, "WebSocket transport lost");
        *shared.state.write() = TransportState::Failed;
        shared.pongs.clear();
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn transport_type(&self) -> TransportType {
        self.shared.transport_type
    }

    fn state(&self) -> TransportState {
        *self.shared.state.read()
    }

    fn address(&self) -> Option<String> {
        self.address.read().clone()
    }

    fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    async fn connect(&self, address: &str) -> bool {
        if self.is_connected() {
            return true;
        }

        let ty = self.shared.transport_type;
        let url = match normalize_ws_url(address, &self.config.ws_path) {
            Ok(url) => url,
            Err(e) => {
                warn!(transport = %ty, address, error = %e, "Invalid WebSocket address");
                self.set_state(TransportState::Failed);
                self.metrics.record_failure();
                return false;
            }
        };

        self.stop_reader();
        self.close_sink().await;
        self.set_state(TransportState::Probing);
        let start = Instant::now();

        let ws = match timeout(self.config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                debug!(transport = %ty, url = %url, error = %e, "WebSocket connect failed");
                self.set_state(TransportState::Failed);
                self.metrics.record_failure();
                return false;
            }
            Err(_) => {
                debug!(transport = %ty, url = %url, "WebSocket connect timed out");
                self.set_state(TransportState::Failed);
                self.metrics.record_failure();
                return false;
            }
        };

        let latency = start.elapsed();
        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.address.write() = Some(url.clone());
        self.set_state(TransportState::Connected);
        self.metrics.record_latency(latency);

        let handle = tokio::spawn(Self::read_loop(self.shared.clone(), stream));
        *self.reader.lock() = Some(handle);

        info!(transport = %ty, url = %url, latency_ms = latency.as_millis() as u64, "WebSocket transport connected");
        true
    }

    async fn disconnect(&self) {
        self.stop_reader();
        self.close_sink().await;
        self.set_state(TransportState::Unknown);
    }

    async fn send(&self, data: &[u8]) -> bool {
        if data.len() > self.config.max_frame_size {
            warn!(
                transport = %self.shared.transport_type,
                size = data.len(),
                max = self.config.max_frame_size,
                "Payload exceeds max frame size"
            );
            self.metrics.record_failure();
            return false;
        }
        if !self.is_connected() {
            self.metrics.record_failure();
            return false;
        }

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            self.metrics.record_failure();
            return false;
        };

        match sink.send(Message::Binary(data.to_vec())).await {
            Ok(()) => {
                self.metrics.record_success();
                true
            }
            Err(e) => {
                debug!(transport = %self.shared.transport_type, error = %e, "WebSocket send failed");
                self.metrics.record_failure();
                false
            }
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.shared.handler.write() = Some(handler);
    }

    /// Native WebSocket ping, timed until the matching pong arrives.
    async fn ping(&self) -> Option<Duration> {
        if !self.is_connected() {
            self.metrics.record_failure();
            return None;
        }

        let id = self.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pongs.insert(id, tx);

        let start = Instant::now();
        let sent = {
            let mut guard = self.sink.lock().await;
            match guard.as_mut() {
                Some(sink) => sink.send(Message::Ping(id.to_be_bytes().to_vec())).await.is_ok(),
                None => false,
            }
        };
        if !sent {
            self.shared.pongs.remove(&id);
            self.metrics.record_failure();
            return None;
        }

        match timeout(self.config.ping_timeout, rx).await {
            Ok(Ok(at)) => {
                let rtt = at.saturating_duration_since(start);
                self.metrics.record_latency(rtt);
                Some(rtt)
            }
            _ => {
                self.shared.pongs.remove(&id);
                self.metrics.record_failure();
                None
            }
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

/// Factory producing [`WebSocketTransport`]s for LAN and relay links.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketFactory;

impl TransportFactory for WebSocketFactory {
    fn create(
        &self,
        transport_type: TransportType,
        config: &TransportConfig,
    ) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(transport_type, config.clone()))
    }
}
