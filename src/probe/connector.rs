//! Endpoint connectors used by the prober.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tracing::debug;

use crate::error::{Error, Result, TransportError};
use crate::link::{LinkConfig, LinkCredentials, MeshLink, NodeIdentity};
use crate::protocol::normalize_ws_url;
use crate::types::EndpointKind;

/// How the prober reaches an endpoint.
///
/// `probe` is a throwaway connection whose only output is its latency;
/// `establish` builds the session that gets promoted.
#[async_trait]
pub trait EndpointConnector: Send + Sync + 'static {
    type Session: Clone + Send + Sync + 'static;

    /// Open a connection, tear it down, and report how long opening took.
    async fn probe(&self, kind: EndpointKind, address: &str) -> Result<Duration>;

    /// Open the full session for a promoted endpoint.
    async fn establish(&self, kind: EndpointKind, address: &str) -> Result<Self::Session>;

    /// Close a session that has been superseded or dropped.
    async fn teardown(&self, session: Self::Session);

    /// Whether an established session is still usable.
    fn is_alive(&self, _session: &Self::Session) -> bool {
        true
    }

    /// Flag a lost session as being rebuilt.
    fn mark_reconnecting(&self, _session: &Self::Session) {}
}

/// Connector that probes with a bare WebSocket handshake and promotes to a
/// joined [`MeshLink`].
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    identity: NodeIdentity,
    credentials: LinkCredentials,
    config: LinkConfig,
}

impl WebSocketConnector {
    pub fn new(identity: NodeIdentity, credentials: LinkCredentials, config: LinkConfig) -> Self {
        Self {
            identity,
            credentials,
            config,
        }
    }
}

#[async_trait]
impl EndpointConnector for WebSocketConnector {
    type Session = Arc<MeshLink>;

    async fn probe(&self, kind: EndpointKind, address: &str) -> Result<Duration> {
        if kind.is_passive() {
            return Err(TransportError::NoFactory(kind.to_string()).into());
        }
        let url = normalize_ws_url(address, &self.config.ws_path)?;
        let start = Instant::now();
        let (mut ws, _response) = timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
            .map_err(|e| Error::ConnectionFailed {
                endpoint: url.clone(),
                reason: e.to_string(),
            })?;
        let latency = start.elapsed();
        let _ = ws.close(None).await;
        debug!(endpoint = %kind, url = %url, latency_ms = latency.as_millis() as u64, "Probe connected");
        Ok(latency)
    }

    async fn establish(&self, kind: EndpointKind, address: &str) -> Result<Self::Session> {
        if kind.is_passive() {
            return Err(TransportError::NoFactory(kind.to_string()).into());
        }
        let link = MeshLink::new(
            address,
            self.identity.clone(),
            self.credentials.clone(),
            self.config.clone(),
        )?;
        link.connect().await?;
        Ok(Arc::new(link))
    }

    async fn teardown(&self, session: Self::Session) {
        session.disconnect().await;
    }

    fn is_alive(&self, session: &Self::Session) -> bool {
        session.is_connected()
    }

    fn mark_reconnecting(&self, session: &Self::Session) {
        session.set_reconnecting();
    }
}
