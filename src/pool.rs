//! Per-peer connection pool.
//!
//! Holds every live [`Transport`] to one peer plus a single "preferred"
//! pointer that outbound sends go through first. All mutation of the map and
//! the preferred pointer is serialized through one lock; the lock is never
//! held across an await.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics::MetricsSnapshot;
use crate::transport::Transport;
use crate::types::{PeerId, TransportState, TransportType};

#[derive(Default)]
struct PoolInner {
    transports: HashMap<TransportType, Arc<dyn Transport>>,
    preferred: Option<TransportType>,
}

/// Status of one pooled transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledTransport {
    pub transport_type: TransportType,
    pub state: TransportState,
    pub healthy: bool,
    pub preferred: bool,
    pub metrics: MetricsSnapshot,
}

/// All transports to one remote peer.
pub struct ConnectionPool {
    peer_id: PeerId,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Insert a transport, replacing any previous one of the same type.
    ///
    /// Seeds the preferred pointer when none is set. Returns the replaced
    /// transport, which the caller is responsible for disconnecting.
    pub fn add_transport(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let ty = transport.transport_type();
        let mut inner = self.inner.lock();
        let previous = inner.transports.insert(ty, transport);
        if inner.preferred.is_none() {
            inner.preferred = Some(ty);
            debug!(peer = %self.peer_id, transport = %ty, "Seeded preferred transport");
        }
        previous
    }

    /// Remove a transport. If it was preferred, the best remaining one takes over.
    pub fn remove_transport(&self, ty: TransportType) -> Option<Arc<dyn Transport>> {
        let mut inner = self.inner.lock();
        let removed = inner.transports.remove(&ty);
        if inner.preferred == Some(ty) {
            inner.preferred = Self::best_locked(&inner).map(|t| t.transport_type());
            debug!(
                peer = %self.peer_id,
                removed = %ty,
                preferred = ?inner.preferred,
                "Preferred transport removed"
            );
        }
        removed
    }

    pub fn transport(&self, ty: TransportType) -> Option<Arc<dyn Transport>> {
        self.inner.lock().transports.get(&ty).cloned()
    }

    /// Pooled transport types in static priority order.
    pub fn transport_types(&self) -> Vec<TransportType> {
        let mut types: Vec<_> = self.inner.lock().transports.keys().copied().collect();
        types.sort_by_key(|t| t.priority());
        types
    }

    pub fn len(&self) -> usize {
        self.inner.lock().transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().transports.is_empty()
    }

    pub fn preferred(&self) -> Option<TransportType> {
        self.inner.lock().preferred
    }

    /// Point outbound sends at `ty`. Fails if the type is not pooled.
    pub fn set_preferred(&self, ty: TransportType) -> bool {
        let mut inner = self.inner.lock();
        if inner.transports.contains_key(&ty) {
            inner.preferred = Some(ty);
            true
        } else {
            false
        }
    }

    /// Healthy transport with the highest score, ties to the static priority.
    pub fn get_best_transport(&self) -> Option<Arc<dyn Transport>> {
        Self::best_locked(&self.inner.lock())
    }

    fn best_locked(inner: &PoolInner) -> Option<Arc<dyn Transport>> {
        let mut best: Option<(f64, &Arc<dyn Transport>)> = None;
        for transport in inner.transports.values() {
            if !transport.is_healthy() {
                continue;
            }
            let score = transport.score();
            let better = match best {
                None => true,
                Some((best_score, current)) => {
                    score > best_score
                        || (score == best_score
                            && transport.transport_type().priority()
                                < current.transport_type().priority())
                }
            };
            if better {
                best = Some((score, transport));
            }
        }
        best.map(|(_, t)| t.clone())
    }

    pub fn has_healthy_transport(&self) -> bool {
        self.inner.lock().transports.values().any(|t| t.is_healthy())
    }

    /// Send candidates: preferred first (if healthy), then the rest of the
    /// healthy transports in ascending priority.
    fn candidates(&self) -> Vec<Arc<dyn Transport>> {
        let inner = self.inner.lock();
        let mut rest: Vec<_> = inner
            .transports
            .iter()
            .filter(|(ty, t)| Some(**ty) != inner.preferred && t.is_healthy())
            .map(|(_, t)| t.clone())
            .collect();
        rest.sort_by_key(|t| t.transport_type().priority());

        let mut ordered = Vec::with_capacity(rest.len() + 1);
        if let Some(preferred) = inner.preferred.and_then(|ty| inner.transports.get(&ty)) {
            if preferred.is_healthy() {
                ordered.push(preferred.clone());
            }
        }
        ordered.extend(rest);
        ordered
    }

    /// Send through the fallback chain.
    ///
    /// The first transport that accepts the payload becomes preferred.
    /// Returns the transport type that carried it.
    pub async fn send(&self, data: &[u8]) -> Result<TransportType> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(Error::NoHealthyTransport);
        }

        for transport in candidates {
            let ty = transport.transport_type();
            if transport.send(data).await {
                self.promote(ty, &transport);
                return Ok(ty);
            }
            warn!(peer = %self.peer_id, transport = %ty, "Send failed, trying next transport");
        }

        Err(Error::AllTransportsFailed)
    }

    /// Make `ty` preferred if the pooled instance is still the one we used.
    fn promote(&self, ty: TransportType, used: &Arc<dyn Transport>) {
        let mut inner = self.inner.lock();
        if inner.preferred == Some(ty) {
            return;
        }
        let still_pooled = inner
            .transports
            .get(&ty)
            .is_some_and(|current| Arc::as_ptr(current).cast::<()>() == Arc::as_ptr(used).cast::<()>());
        if still_pooled {
            info!(
                peer = %self.peer_id,
                from = ?inner.preferred,
                to = %ty,
                "Promoted transport after failover"
            );
            inner.preferred = Some(ty);
        }
    }

    /// Disconnect every transport and clear the pool.
    pub async fn disconnect_all(&self) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.preferred = None;
            inner.transports.drain().map(|(_, t)| t).collect()
        };
        for transport in drained {
            transport.disconnect().await;
        }
        debug!(peer = %self.peer_id, "Connection pool cleared");
    }

    /// Snapshot of every pooled transport, in priority order.
    pub fn status(&self) -> Vec<PooledTransport> {
        let inner = self.inner.lock();
        let mut out: Vec<_> = inner
            .transports
            .iter()
            .map(|(ty, t)| PooledTransport {
                transport_type: *ty,
                state: t.state(),
                healthy: t.is_healthy(),
                preferred: inner.preferred == Some(*ty),
                metrics: t.metrics().snapshot(),
            })
            .collect();
        out.sort_by_key(|p| p.transport_type.priority());
        out
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionPool")
            .field("peer_id", &self.peer_id)
            .field("transports", &inner.transports.keys().collect::<Vec<_>>())
            .field("preferred", &inner.preferred)
            .finish()
    }
}
