//! In-process transport pair for simulation and tests.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{is_ping_payload, MessageHandler, Transport};
use crate::metrics::TransportMetrics;
use crate::types::{TransportState, TransportType};

/// One end of an in-memory link.
///
/// Payloads written to one end are handed to the other end's message handler.
/// Latency and send failures can be injected to exercise scoring and failover.
pub struct MemoryTransport {
    transport_type: TransportType,
    state: RwLock<TransportState>,
    address: RwLock<Option<String>>,
    metrics: TransportMetrics,
    peer: RwLock<Weak<MemoryTransport>>,
    handler: RwLock<Option<MessageHandler>>,
    latency: RwLock<Duration>,
    fail_sends: RwLock<bool>,
}

impl MemoryTransport {
    fn new(transport_type: TransportType) -> Self {
        Self {
            transport_type,
            state: RwLock::new(TransportState::Unknown),
            address: RwLock::new(None),
            metrics: TransportMetrics::new(transport_type),
            peer: RwLock::new(Weak::new()),
            handler: RwLock::new(None),
            latency: RwLock::new(Duration::ZERO),
            fail_sends: RwLock::new(false),
        }
    }

    /// Two connected ends of the same medium.
    pub fn pair(transport_type: TransportType) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new(transport_type));
        let b = Arc::new(Self::new(transport_type));
        *a.peer.write() = Arc::downgrade(&b);
        *b.peer.write() = Arc::downgrade(&a);
        *a.state.write() = TransportState::Connected;
        *b.state.write() = TransportState::Connected;
        *a.address.write() = Some("memory://b".into());
        *b.address.write() = Some("memory://a".into());
        (a, b)
    }

    /// Delay applied to every send.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Make every subsequent send fail (simulated link loss).
    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.write() = fail;
    }

    fn deliver(&self, data: Vec<u8>) {
        if is_ping_payload(&data) {
            return;
        }
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(self.transport_type, data);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    fn state(&self) -> TransportState {
        *self.state.read()
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
        if self.peer.read().upgrade().is_none() {
            *self.state.write() = TransportState::Failed;
            self.metrics.record_failure();
            return false;
        }
        *self.state.write() = TransportState::Connected;
        *self.address.write() = Some(address.to_string());
        self.metrics.record_success();
        true
    }

    async fn disconnect(&self) {
        *self.state.write() = TransportState::Unknown;
    }

    async fn send(&self, data: &[u8]) -> bool {
        let peer = self.peer.read().upgrade();
        let peer = match peer {
            Some(peer) if self.is_connected() && !*self.fail_sends.read() => peer,
            _ => {
                self.metrics.record_failure();
                return false;
            }
        };

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        peer.deliver(data.to_vec());
        self.metrics.record_success();
        true
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.write() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_pair_delivers_to_other_end() {
        let (a, b) = MemoryTransport::pair(TransportType::Ble);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        b.set_message_handler(Arc::new(move |ty, data| sink.lock().push((ty, data))));

        assert!(a.send(b"hello").await);
        assert_eq!(
            received.lock().as_slice(),
            &[(TransportType::Ble, b"hello".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_injected_failure_counts() {
        let (a, _b) = MemoryTransport::pair(TransportType::Lan);
        a.set_fail_sends(true);
        for _ in 0..3 {
            assert!(!a.send(b"x").await);
        }
        assert!(!a.is_healthy());
        assert_eq!(a.score(), 0.0);

        a.set_fail_sends(false);
        assert!(a.send(b"x").await);
        assert!(a.is_healthy());
    }

    #[tokio::test]
    async fn test_connect_fails_once_peer_dropped() {
        let (a, b) = MemoryTransport::pair(TransportType::Lan);
        a.disconnect().await;
        drop(b);
        assert!(!a.connect("memory://b").await);
        assert_eq!(a.state(), TransportState::Failed);
    }
}
