//! Multi-transport orchestration with health checks and reconnects.
//!
//! [`ResilientTransportManager`] owns one [`ConnectionPool`] per peer and
//! keeps every transport that connects. A background loop pings each
//! connected transport; after `failure_threshold` consecutive misses the
//! transport leaves its pool, is marked `Failed`, and a reconnect task retries
//! it with bounded exponential backoff.
//!
//! Compare [`crate::probe::TransportProber`], which races endpoints and keeps
//! only the winner.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, TransportError};
use crate::pool::{ConnectionPool, PooledTransport};
use crate::transport::{Transport, TransportConfig, TransportFactory, WebSocketFactory};
use crate::types::{duration_ms, PeerId, TransportState, TransportStatus, TransportType};

/// Inbound payload callback carrying the sending peer.
pub type PeerMessageHandler = Arc<dyn Fn(&PeerId, TransportType, Vec<u8>) + Send + Sync>;

/// Bounded exponential backoff for reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Attempts before the transport is left `Failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first attempt; doubles on every attempt after.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Delay ceiling.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_base_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Interval of the health-check loop.
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub health_interval: Duration,

    /// Deadline for a single health ping.
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Deadline for a single connect attempt.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Consecutive missed pings before a transport is failed.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Configuration handed to transport factories.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Event channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_ping_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(8)
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_event_capacity() -> usize {
    256
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_interval: default_health_interval(),
            ping_timeout: default_ping_timeout(),
            connect_timeout: default_connect_timeout(),
            failure_threshold: default_failure_threshold(),
            reconnect: ReconnectPolicy::default(),
            transport: TransportConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Status of every (peer, transport) pair the manager knows about.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub peers: BTreeMap<PeerId, BTreeMap<TransportType, TransportStatus<TransportType>>>,
}

impl ManagerStatus {
    pub fn transport(&self, peer: &PeerId, ty: TransportType) -> Option<&TransportStatus<TransportType>> {
        self.peers.get(peer).and_then(|p| p.get(&ty))
    }

    /// Whether any transport to `peer` is connected.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|p| p.values().any(|s| s.state == TransportState::Connected))
    }
}

/// Manager events.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    TransportConnected {
        peer: PeerId,
        transport: TransportType,
    },
    /// A connect attempt or health check gave up on a transport.
    TransportFailed {
        peer: PeerId,
        transport: TransportType,
        error: String,
    },
    HealthCheckFailed {
        peer: PeerId,
        transport: TransportType,
        consecutive: u32,
    },
    ReconnectScheduled {
        peer: PeerId,
        transport: TransportType,
        attempt: u32,
        delay: Duration,
    },
    Reconnected {
        peer: PeerId,
        transport: TransportType,
        attempt: u32,
    },
    /// The backoff budget is spent; the transport stays `Failed` until it is
    /// registered again.
    ReconnectExhausted {
        peer: PeerId,
        transport: TransportType,
        attempts: u32,
    },
    PreferredChanged {
        peer: PeerId,
        transport: Option<TransportType>,
    },
    PeerUnreachable {
        peer: PeerId,
        errors: BTreeMap<TransportType, String>,
    },
    PeerDisconnected {
        peer: PeerId,
    },
}

type Key = (PeerId, TransportType);

struct Inner {
    config: ManagerConfig,
    pools: DashMap<PeerId, Arc<ConnectionPool>>,
    factories: RwLock<HashMap<TransportType, Arc<dyn TransportFactory>>>,
    addresses: DashMap<Key, String>,
    health_failures: DashMap<Key, u32>,
    reconnects: DashMap<Key, JoinHandle<()>>,
    exhausted: DashSet<Key>,
    handler: RwLock<Option<PeerMessageHandler>>,
    statuses: Mutex<ManagerStatus>,
    status_tx: watch::Sender<ManagerStatus>,
    events: broadcast::Sender<ManagerEvent>,
}

impl Inner {
    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let snapshot = self.statuses.lock().clone();
        self.status_tx.send_replace(snapshot);
    }

    fn update_status(&self, peer: &PeerId, ty: TransportType, f: impl FnOnce(&mut TransportStatus<TransportType>)) {
        {
            let mut statuses = self.statuses.lock();
            let address = self
                .addresses
                .get(&(peer.clone(), ty))
                .map(|a| a.clone())
                .unwrap_or_default();
            let status = statuses
                .peers
                .entry(peer.clone())
                .or_default()
                .entry(ty)
                .or_insert_with(|| TransportStatus::new(ty, address));
            f(status);
        }
        self.publish();
    }

    fn pool(&self, peer: &PeerId) -> Option<Arc<ConnectionPool>> {
        self.pools.get(peer).map(|p| Arc::clone(p.value()))
    }

    fn pool_or_create(&self, peer: &PeerId) -> Arc<ConnectionPool> {
        Arc::clone(
            self.pools
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(ConnectionPool::new(peer.clone())))
                .value(),
        )
    }

    fn factory(&self, ty: TransportType) -> Option<Arc<dyn TransportFactory>> {
        self.factories.read().get(&ty).cloned()
    }

    fn cancel_reconnect(&self, key: &Key) {
        if let Some((_, handle)) = self.reconnects.remove(key) {
            handle.abort();
        }
    }

    fn wire_handler(&self, peer: &PeerId, transport: &Arc<dyn Transport>) {
        let Some(handler) = self.handler.read().clone() else {
            return;
        };
        let peer = peer.clone();
        transport.set_message_handler(Arc::new(move |ty, data| handler(&peer, ty, data)));
    }

    /// Put a connected transport into the peer's pool and mark it `Connected`.
    async fn install(&self, peer: &PeerId, transport: Arc<dyn Transport>) {
        let ty = transport.transport_type();
        let key = (peer.clone(), ty);
        if let Some(address) = transport.address() {
            self.addresses.entry(key.clone()).or_insert(address);
        }
        self.health_failures.remove(&key);
        self.exhausted.remove(&key);

        self.wire_handler(peer, &transport);
        let pool = self.pool_or_create(peer);
        let preferred_before = pool.preferred();
        let latency = transport.metrics().avg_latency_ms();
        let replaced = pool.add_transport(Arc::clone(&transport));

        self.update_status(peer, ty, |s| {
            s.mark(TransportState::Connected);
            if let Some(address) = transport.address() {
                s.address = address;
            }
            if let Some(ms) = latency {
                s.latency_ms = Some(ms.round() as u64);
            }
        });
        self.emit(ManagerEvent::TransportConnected {
            peer: peer.clone(),
            transport: ty,
        });
        self.note_preferred(peer, &pool, preferred_before);

        if let Some(replaced) = replaced {
            if !same_transport(&replaced, &transport) {
                replaced.disconnect().await;
            }
        }
    }

    fn note_preferred(&self, peer: &PeerId, pool: &ConnectionPool, before: Option<TransportType>) {
        let after = pool.preferred();
        if after != before {
            debug!(peer = %peer, from = ?before, to = ?after, "Preferred transport changed");
            self.emit(ManagerEvent::PreferredChanged {
                peer: peer.clone(),
                transport: after,
            });
        }
    }

    /// One connect attempt through the registered factory.
    async fn connect_one(&self, peer: &PeerId, ty: TransportType, address: &str) -> std::result::Result<(), String> {
        if let Some(existing) = self.pool(peer).and_then(|p| p.transport(ty)) {
            if existing.is_connected() {
                return Ok(());
            }
        }

        let factory = self
            .factory(ty)
            .ok_or_else(|| TransportError::NoFactory(ty.to_string()).to_string())?;
        let transport = factory.create(ty, &self.config.transport);

        self.update_status(peer, ty, |s| s.mark(TransportState::Probing));
        let connected = timeout(self.config.connect_timeout, transport.connect(address))
            .await
            .unwrap_or(false);
        if !connected {
            return Err(format!("could not connect to {address}"));
        }

        self.install(peer, transport).await;
        Ok(())
    }

    async fn check_health(self: &Arc<Self>) {
        let mut checks = Vec::new();
        for entry in &self.pools {
            let peer = entry.key().clone();
            let pool = Arc::clone(entry.value());
            for ty in pool.transport_types() {
                if let Some(transport) = pool.transport(ty) {
                    checks.push((peer.clone(), transport));
                }
            }
        }

        let ping_timeout = self.config.ping_timeout;
        let results = join_all(checks.into_iter().map(|(peer, transport)| async move {
            let outcome = match transport.state() {
                TransportState::Connected => timeout(ping_timeout, transport.ping()).await.ok().flatten(),
                _ => None,
            };
            (peer, transport, outcome)
        }))
        .await;

        for (peer, transport, outcome) in results {
            let ty = transport.transport_type();
            let key = (peer.clone(), ty);
            match outcome {
                Some(rtt) => {
                    self.health_failures.remove(&key);
                    self.update_status(&peer, ty, |s| {
                        s.mark(TransportState::Connected);
                        s.latency_ms = Some(duration_ms(rtt));
                    });
                    debug!(peer = %peer, transport = %ty, rtt_ms = duration_ms(rtt), "Health check ok");
                }
                None if transport.state() == TransportState::Failed => {
                    self.fail_transport(&peer, transport, "link lost".to_string()).await;
                }
                None => {
                    let consecutive = {
                        let mut count = self.health_failures.entry(key).or_insert(0);
                        *count += 1;
                        *count
                    };
                    debug!(peer = %peer, transport = %ty, consecutive, "Health check missed");
                    self.emit(ManagerEvent::HealthCheckFailed {
                        peer: peer.clone(),
                        transport: ty,
                        consecutive,
                    });
                    if consecutive >= self.config.failure_threshold {
                        let reason = format!("{consecutive} consecutive health checks failed");
                        self.fail_transport(&peer, transport, reason).await;
                    }
                }
            }
        }
    }

    /// Pull a transport out of rotation and start reconnecting it.
    async fn fail_transport(self: &Arc<Self>, peer: &PeerId, transport: Arc<dyn Transport>, reason: String) {
        let ty = transport.transport_type();
        let Some(pool) = self.pool(peer) else {
            return;
        };
        let still_pooled = pool
            .transport(ty)
            .is_some_and(|current| same_transport(&current, &transport));
        if !still_pooled {
            return;
        }

        let before = pool.preferred();
        pool.remove_transport(ty);
        transport.disconnect().await;
        self.health_failures.remove(&(peer.clone(), ty));

        warn!(peer = %peer, transport = %ty, reason = %reason, "Transport failed");
        self.update_status(peer, ty, |s| s.mark_failed(reason.clone()));
        self.emit(ManagerEvent::TransportFailed {
            peer: peer.clone(),
            transport: ty,
            error: reason,
        });
        self.note_preferred(peer, &pool, before);

        self.schedule_reconnect(peer.clone(), transport);
    }

    fn schedule_reconnect(self: &Arc<Self>, peer: PeerId, transport: Arc<dyn Transport>) {
        let ty = transport.transport_type();
        let key = (peer.clone(), ty);
        let running = self.reconnects.get(&key).is_some_and(|h| !h.is_finished());
        if running || self.exhausted.contains(&key) {
            return;
        }

        let address = self
            .addresses
            .get(&key)
            .map(|a| a.clone())
            .or_else(|| transport.address());
        let Some(address) = address else {
            warn!(peer = %peer, transport = %ty, "No address to reconnect to");
            return;
        };

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.reconnect_loop(peer, transport, address).await;
        });
        self.reconnects.insert(key, handle);
    }

    async fn reconnect_loop(&self, peer: PeerId, transport: Arc<dyn Transport>, address: String) {
        let ty = transport.transport_type();
        let policy = &self.config.reconnect;

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            self.emit(ManagerEvent::ReconnectScheduled {
                peer: peer.clone(),
                transport: ty,
                attempt,
                delay,
            });
            debug!(peer = %peer, transport = %ty, attempt, delay_ms = duration_ms(delay), "Reconnect scheduled");
            tokio::time::sleep(delay).await;

            if !self.pools.contains_key(&peer) {
                return;
            }

            let connected = timeout(self.config.connect_timeout, transport.connect(&address))
                .await
                .unwrap_or(false);
            if connected {
                info!(peer = %peer, transport = %ty, attempt, "Transport reconnected");
                self.install(&peer, Arc::clone(&transport)).await;
                self.emit(ManagerEvent::Reconnected {
                    peer,
                    transport: ty,
                    attempt,
                });
                return;
            }
            self.update_status(&peer, ty, |s| {
                s.mark_failed(format!("reconnect attempt {attempt} failed"));
            });
        }

        let attempts = policy.max_attempts;
        let err = Error::ReconnectExhausted {
            peer: peer.to_string(),
            transport: ty.to_string(),
            attempts,
        };
        warn!(peer = %peer, transport = %ty, attempts, "Reconnect budget exhausted");
        self.exhausted.insert((peer.clone(), ty));
        self.update_status(&peer, ty, |s| s.mark_failed(err.to_string()));
        self.emit(ManagerEvent::ReconnectExhausted {
            peer,
            transport: ty,
            attempts,
        });
    }
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// Keeps every transport that connects, health-checks them, and fails over.
pub struct ResilientTransportManager {
    inner: Arc<Inner>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientTransportManager {
    /// New manager with WebSocket factories for LAN and relay.
    pub fn new(config: ManagerConfig) -> Self {
        let (status_tx, _) = watch::channel(ManagerStatus::default());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let mut factories: HashMap<TransportType, Arc<dyn TransportFactory>> = HashMap::new();
        factories.insert(TransportType::Lan, Arc::new(WebSocketFactory));
        factories.insert(TransportType::Relay, Arc::new(WebSocketFactory));

        Self {
            inner: Arc::new(Inner {
                config,
                pools: DashMap::new(),
                factories: RwLock::new(factories),
                addresses: DashMap::new(),
                health_failures: DashMap::new(),
                reconnects: DashMap::new(),
                exhausted: DashSet::new(),
                handler: RwLock::new(None),
                statuses: Mutex::new(ManagerStatus::default()),
                status_tx,
                events,
            }),
            health_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Plug in a driver for one medium (BLE, Wi-Fi Direct, Matter, or a
    /// replacement for the WebSocket default).
    pub fn register_factory(&self, ty: TransportType, factory: Arc<dyn TransportFactory>) {
        self.inner.factories.write().insert(ty, factory);
    }

    /// Callback for inbound payloads on every current and future transport.
    pub fn set_message_handler(&self, handler: PeerMessageHandler) {
        *self.inner.handler.write() = Some(handler);
        for entry in &self.inner.pools {
            for ty in entry.value().transport_types() {
                if let Some(transport) = entry.value().transport(ty) {
                    self.inner.wire_handler(entry.key(), &transport);
                }
            }
        }
    }

    /// Connect every given address concurrently and keep all that succeed.
    ///
    /// Returns the transport types now pooled for the peer, or
    /// `PeerUnreachable` with one error per address when none connected.
    pub async fn connect_peer(
        &self,
        peer: impl Into<PeerId>,
        addresses: &BTreeMap<TransportType, String>,
    ) -> Result<Vec<TransportType>> {
        let peer = peer.into();
        for (ty, address) in addresses {
            let key = (peer.clone(), *ty);
            self.inner.addresses.insert(key.clone(), address.clone());
            self.inner.exhausted.remove(&key);
            self.inner.cancel_reconnect(&key);
            self.inner.update_status(&peer, *ty, |s| s.address = address.clone());
        }

        info!(peer = %peer, transports = addresses.len(), "Connecting peer");
        let inner = &self.inner;
        let attempts = addresses.iter().map(|(ty, address)| {
            let peer = peer.clone();
            async move { (*ty, inner.connect_one(&peer, *ty, address).await) }
        });
        let results = join_all(attempts).await;

        let mut errors = BTreeMap::new();
        for (ty, result) in results {
            if let Err(error) = result {
                debug!(peer = %peer, transport = %ty, error = %error, "Connect attempt failed");
                self.inner.update_status(&peer, ty, |s| s.mark_failed(error.clone()));
                self.inner.emit(ManagerEvent::TransportFailed {
                    peer: peer.clone(),
                    transport: ty,
                    error: error.clone(),
                });
                errors.insert(ty, error);
            }
        }

        let connected = self
            .inner
            .pool(&peer)
            .map(|p| p.transport_types())
            .unwrap_or_default();
        if connected.is_empty() {
            warn!(peer = %peer, "No transport connected");
            self.inner.emit(ManagerEvent::PeerUnreachable {
                peer: peer.clone(),
                errors: errors.clone(),
            });
            return Err(Error::PeerUnreachable {
                peer: peer.to_string(),
                errors: errors.into_iter().map(|(t, e)| (t.to_string(), e)).collect(),
            });
        }

        info!(peer = %peer, connected = ?connected, failed = errors.len(), "Peer connected");
        Ok(connected)
    }

    /// Add an already connected transport, replacing any of the same type.
    ///
    /// Clears a `Failed` or exhausted status for that pair and cancels its
    /// pending reconnect.
    pub async fn register_transport(&self, peer: impl Into<PeerId>, transport: Arc<dyn Transport>) {
        let peer = peer.into();
        let ty = transport.transport_type();
        self.inner.cancel_reconnect(&(peer.clone(), ty));
        if let Some(address) = transport.address() {
            self.inner.addresses.insert((peer.clone(), ty), address);
        }
        info!(peer = %peer, transport = %ty, "Transport registered");
        self.inner.install(&peer, transport).await;
    }

    /// Send through the peer's pool fallback chain.
    pub async fn send(&self, peer: &PeerId, data: &[u8]) -> Result<TransportType> {
        let pool = self
            .inner
            .pool(peer)
            .ok_or_else(|| Error::PeerNotFound(peer.to_string()))?;
        let before = pool.preferred();
        let result = pool.send(data).await;
        self.inner.note_preferred(peer, &pool, before);
        result
    }

    /// Route the peer's outbound traffic through `ty`.
    pub fn switch_to(&self, peer: &PeerId, ty: TransportType) -> Result<()> {
        let pool = self
            .inner
            .pool(peer)
            .ok_or_else(|| Error::PeerNotFound(peer.to_string()))?;
        let before = pool.preferred();
        if !pool.set_preferred(ty) {
            return Err(Error::NotConnected);
        }
        info!(peer = %peer, transport = %ty, "Switched preferred transport");
        self.inner.note_preferred(peer, &pool, before);
        Ok(())
    }

    /// Drop a peer: cancel its reconnects, disconnect its transports and reset
    /// its statuses to `Unknown`.
    pub async fn disconnect_peer(&self, peer: &PeerId) {
        let keys: Vec<Key> = self
            .inner
            .reconnects
            .iter()
            .filter(|e| &e.key().0 == peer)
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            self.inner.cancel_reconnect(key);
        }
        self.inner.health_failures.retain(|(p, _), _| p != peer);
        self.inner.exhausted.retain(|(p, _)| p != peer);

        if let Some((_, pool)) = self.inner.pools.remove(peer) {
            pool.disconnect_all().await;
        }

        {
            let mut statuses = self.inner.statuses.lock();
            if let Some(transports) = statuses.peers.get_mut(peer) {
                for status in transports.values_mut() {
                    status.reset();
                }
            }
        }
        self.inner.publish();
        self.inner.emit(ManagerEvent::PeerDisconnected { peer: peer.clone() });
        info!(peer = %peer, "Peer disconnected");
    }

    /// Run one health-check pass now.
    pub async fn check_health(&self) {
        self.inner.check_health().await;
    }

    /// Start the periodic health-check loop.
    pub fn start_health_monitoring(&self) {
        let inner = Arc::clone(&self.inner);
        let period = inner.config.health_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.check_health().await;
            }
        });
        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
        debug!(interval = ?period, "Health monitoring started");
    }

    pub fn stop_health_monitoring(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
        }
    }

    /// Stop every background task and drop all peers.
    pub async fn shutdown(&self) {
        self.stop_health_monitoring();
        let peers: Vec<PeerId> = self.inner.pools.iter().map(|e| e.key().clone()).collect();
        for peer in &peers {
            self.disconnect_peer(peer).await;
        }
        let keys: Vec<Key> = self.inner.reconnects.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.inner.cancel_reconnect(key);
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.inner.pools.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    pub fn pool(&self, peer: &PeerId) -> Option<Arc<ConnectionPool>> {
        self.inner.pool(peer)
    }

    pub fn pool_status(&self, peer: &PeerId) -> Vec<PooledTransport> {
        self.inner.pool(peer).map(|p| p.status()).unwrap_or_default()
    }

    pub fn transport_status(&self, peer: &PeerId, ty: TransportType) -> Option<TransportStatus<TransportType>> {
        self.inner.statuses.lock().transport(peer, ty).cloned()
    }

    /// Whether the reconnect budget of this pair is spent.
    pub fn is_exhausted(&self, peer: &PeerId, ty: TransportType) -> bool {
        self.inner.exhausted.contains(&(peer.clone(), ty))
    }

    /// Whether a reconnect task is running for this pair.
    pub fn is_reconnecting(&self, peer: &PeerId, ty: TransportType) -> bool {
        self.inner
            .reconnects
            .get(&(peer.clone(), ty))
            .is_some_and(|h| !h.is_finished())
    }

    pub fn status(&self) -> ManagerStatus {
        self.inner.statuses.lock().clone()
    }

    /// Status updates; new subscribers see the latest snapshot.
    pub fn watch_status(&self) -> watch::Receiver<ManagerStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }
}

impl Default for ResilientTransportManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl Drop for ResilientTransportManager {
    fn drop(&mut self) {
        if let Some(handle) = self.health_task.get_mut().take() {
            handle.abort();
        }
        for entry in &self.inner.reconnects {
            entry.value().abort();
        }
    }
}

impl std::fmt::Debug for ResilientTransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientTransportManager")
            .field("peers", &self.peers())
            .field("config", &self.inner.config)
            .finish()
    }
}
