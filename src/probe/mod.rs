//! Endpoint racing for the simple discovery flow.
//!
//! [`TransportProber`] probes every candidate endpoint of one peer in
//! parallel, promotes the fastest to the single active session, and keeps
//! re-probing the others on an interval. It switches only when a candidate
//! beats the active endpoint by more than the hysteresis margin.
//!
//! Per endpoint:
//!
//! ```text
//! Unknown ─▶ Probing ─▶ Available ─promote─▶ Connected
//!               │                                │
//!               └──▶ Failed          disconnect() ──▶ Unknown
//! ```
//!
//! A probe round is bounded by one deadline. Probes still running at the
//! deadline are not cancelled: they finish in the background and update
//! their endpoint status, but the round's decision has already been made.

mod connector;

pub use connector::{EndpointConnector, WebSocketConnector};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::MeshEndpoints;
use crate::types::{duration_ms, EndpointKind, PeerId, TransportState, TransportStatus};

/// Prober configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Deadline for a whole probe round.
    #[serde(default = "default_round_timeout", with = "humantime_serde")]
    pub round_timeout: Duration,

    /// Connect timeout for a single probe.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Interval of the background re-probe loop.
    #[serde(default = "default_reprobe_interval", with = "humantime_serde")]
    pub reprobe_interval: Duration,

    /// Latency improvement required before switching endpoints.
    #[serde(default = "default_switch_threshold", with = "humantime_serde")]
    pub switch_threshold: Duration,

    /// Event channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_round_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(8)
}
fn default_reprobe_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_switch_threshold() -> Duration {
    Duration::from_millis(100)
}
fn default_event_capacity() -> usize {
    256
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            round_timeout: default_round_timeout(),
            probe_timeout: default_probe_timeout(),
            reprobe_interval: default_reprobe_interval(),
            switch_threshold: default_switch_threshold(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Hysteresis rule: switch only if `candidate + threshold < active`.
pub fn should_switch(active: Duration, candidate: Duration, threshold: Duration) -> bool {
    duration_ms(candidate) + duration_ms(threshold) < duration_ms(active)
}

/// Lowest latency wins (millisecond granularity); ties go to the higher
/// endpoint priority.
pub fn pick_best(candidates: &[(EndpointKind, Duration)]) -> Option<(EndpointKind, Duration)> {
    candidates.iter().copied().min_by(|a, b| {
        duration_ms(a.1)
            .cmp(&duration_ms(b.1))
            .then_with(|| b.0.probe_priority().cmp(&a.0.probe_priority()))
    })
}

/// Snapshot published on every status change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProberStatus {
    pub peer: PeerId,
    pub endpoints: BTreeMap<EndpointKind, TransportStatus<EndpointKind>>,
    pub active: Option<EndpointKind>,
    pub round: u64,
}

impl ProberStatus {
    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }
}

/// Prober events.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    RoundStarted {
        round: u64,
        endpoints: usize,
    },
    /// One probe finished. `late` results arrived after their round closed.
    ProbeCompleted {
        round: u64,
        kind: EndpointKind,
        result: std::result::Result<Duration, String>,
        late: bool,
    },
    /// No endpoint was usable this round.
    AllFailed {
        round: u64,
        errors: BTreeMap<EndpointKind, String>,
    },
    Promoted {
        kind: EndpointKind,
        previous: Option<EndpointKind>,
        latency: Option<Duration>,
    },
    PromotionFailed {
        kind: EndpointKind,
        error: String,
    },
    BleDiscovered {
        latency: Duration,
    },
    /// The active session died underneath us.
    SessionLost {
        kind: EndpointKind,
    },
    Disconnected,
}

struct ActiveSession<S> {
    kind: EndpointKind,
    session: S,
}

#[derive(Default)]
struct StatusTable {
    statuses: BTreeMap<EndpointKind, TransportStatus<EndpointKind>>,
    /// Newest round whose result has been recorded per endpoint.
    last_round: BTreeMap<EndpointKind, u64>,
}

struct RoundOutcome {
    round: u64,
    probed: Vec<EndpointKind>,
    passive: Vec<EndpointKind>,
    results: BTreeMap<EndpointKind, std::result::Result<Duration, String>>,
}

struct Inner<C: EndpointConnector> {
    peer: PeerId,
    connector: C,
    config: ProbeConfig,
    endpoints: RwLock<BTreeMap<EndpointKind, String>>,
    table: Mutex<StatusTable>,
    active_kind: RwLock<Option<EndpointKind>>,
    active: AsyncMutex<Option<ActiveSession<C::Session>>>,
    round: AtomicU64,
    status_tx: watch::Sender<ProberStatus>,
    events: broadcast::Sender<ProbeEvent>,
}

impl<C: EndpointConnector> Inner<C> {
    fn emit(&self, event: ProbeEvent) {
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> ProberStatus {
        ProberStatus {
            peer: self.peer.clone(),
            endpoints: self.table.lock().statuses.clone(),
            active: *self.active_kind.read(),
            round: self.round.load(Ordering::SeqCst),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn update_status(&self, kind: EndpointKind, f: impl FnOnce(&mut TransportStatus<EndpointKind>)) {
        {
            let mut table = self.table.lock();
            if let Some(status) = table.statuses.get_mut(&kind) {
                f(status);
            }
        }
        self.publish();
    }

    fn active_kind(&self) -> Option<EndpointKind> {
        *self.active_kind.read()
    }

    fn latency_of(&self, kind: EndpointKind) -> Option<Duration> {
        self.table
            .lock()
            .statuses
            .get(&kind)
            .and_then(|s| s.latency_ms)
            .map(Duration::from_millis)
    }

    /// Record a probe result unless a newer round already did.
    fn record_probe(
        &self,
        round: u64,
        kind: EndpointKind,
        result: &std::result::Result<Duration, String>,
    ) {
        let is_active = self.active_kind() == Some(kind);
        {
            let mut table = self.table.lock();
            let last = table.last_round.entry(kind).or_insert(0);
            if *last > round {
                debug!(peer = %self.peer, endpoint = %kind, round, "Discarding stale probe result");
                return;
            }
            *last = round;

            let Some(status) = table.statuses.get_mut(&kind) else {
                return;
            };
            match (result, is_active) {
                (Ok(latency), true) => {
                    status.latency_ms = Some(duration_ms(*latency));
                    status.last_check_time = Some(std::time::SystemTime::now());
                }
                (Ok(latency), false) => status.mark_available(*latency),
                (Err(e), true) => status.error = Some(e.clone()),
                (Err(e), false) => status.mark_failed(e.clone()),
            }
        }
        self.publish();
    }

    fn begin_probe(&self, kind: EndpointKind) {
        if self.active_kind() == Some(kind) {
            return;
        }
        self.update_status(kind, |s| {
            if kind.is_passive() && s.is_usable() {
                return;
            }
            s.mark(TransportState::Probing);
        });
    }

    /// Run one bounded probe round over every endpoint except `exclude`.
    async fn run_round(self: &Arc<Self>, exclude: Option<EndpointKind>) -> RoundOutcome {
        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        let targets: Vec<(EndpointKind, String)> = self
            .endpoints
            .read()
            .iter()
            .filter(|(kind, _)| Some(**kind) != exclude)
            .map(|(kind, address)| (*kind, address.clone()))
            .collect();

        self.emit(ProbeEvent::RoundStarted {
            round,
            endpoints: targets.len(),
        });
        debug!(peer = %self.peer, round, endpoints = targets.len(), "Probe round started");

        let (tx, mut rx) = mpsc::channel(targets.len().max(1));
        let mut probed = Vec::new();
        let mut passive = Vec::new();

        for (kind, address) in targets {
            self.begin_probe(kind);
            if kind.is_passive() {
                passive.push(kind);
                continue;
            }
            probed.push(kind);

            let inner = Arc::clone(self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let probe_timeout = inner.config.probe_timeout;
                let result = match timeout(probe_timeout, inner.connector.probe(kind, &address)).await {
                    Ok(Ok(latency)) => Ok(latency),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("probe timed out after {probe_timeout:?}")),
                };
                inner.record_probe(round, kind, &result);
                let late = tx.send((kind, result.clone())).await.is_err();
                if late {
                    debug!(peer = %inner.peer, endpoint = %kind, round, "Probe finished after its round closed");
                }
                inner.emit(ProbeEvent::ProbeCompleted {
                    round,
                    kind,
                    result,
                    late,
                });
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.config.round_timeout;
        let mut results = BTreeMap::new();
        while results.len() < probed.len() {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((kind, result))) => {
                    results.insert(kind, result);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        peer = %self.peer,
                        round,
                        outstanding = probed.len() - results.len(),
                        "Probe round deadline reached"
                    );
                    break;
                }
            }
        }

        // Close the round; anything already queued made the deadline.
        rx.close();
        while let Ok((kind, result)) = rx.try_recv() {
            results.insert(kind, result);
        }

        RoundOutcome {
            round,
            probed,
            passive,
            results,
        }
    }

    /// Usable candidates of a closed round (plus a discovered BLE endpoint).
    fn candidates(&self, outcome: &RoundOutcome) -> Vec<(EndpointKind, Duration)> {
        let mut candidates: Vec<_> = outcome
            .results
            .iter()
            .filter_map(|(kind, result)| result.as_ref().ok().map(|l| (*kind, *l)))
            .collect();

        let table = self.table.lock();
        for kind in &outcome.passive {
            if let Some(status) = table.statuses.get(kind) {
                if status.state == TransportState::Available {
                    if let Some(ms) = status.latency_ms {
                        candidates.push((*kind, Duration::from_millis(ms)));
                    }
                }
            }
        }
        candidates
    }

    fn round_errors(outcome: &RoundOutcome) -> BTreeMap<EndpointKind, String> {
        let mut errors = BTreeMap::new();
        for kind in &outcome.probed {
            let message = match outcome.results.get(kind) {
                Some(Err(e)) => e.clone(),
                Some(Ok(_)) => continue,
                None => "no result before round deadline".to_string(),
            };
            errors.insert(*kind, message);
        }
        for kind in &outcome.passive {
            errors.insert(*kind, "waiting for peer discovery".to_string());
        }
        errors
    }

    async fn session_alive(&self) -> bool {
        let active = self.active.lock().await;
        active
            .as_ref()
            .map_or(false, |a| self.connector.is_alive(&a.session))
    }

    async fn probe_all(self: &Arc<Self>) -> Result<EndpointKind> {
        let outcome = self.run_round(None).await;
        let Some((best, latency)) = pick_best(&self.candidates(&outcome)) else {
            let errors = Self::round_errors(&outcome);
            warn!(peer = %self.peer, round = outcome.round, "No endpoint usable this round");
            self.emit(ProbeEvent::AllFailed {
                round: outcome.round,
                errors: errors.clone(),
            });
            return Err(Error::PeerUnreachable {
                peer: self.peer.to_string(),
                errors: errors
                    .into_iter()
                    .map(|(k, e)| (k.to_string(), e))
                    .collect(),
            });
        };

        if self.active_kind() == Some(best) && self.session_alive().await {
            return Ok(best);
        }
        self.promote(best, Some(latency)).await?;
        Ok(best)
    }

    async fn reprobe(self: &Arc<Self>) -> Result<Option<EndpointKind>> {
        let Some(active) = self.active_kind() else {
            return self.probe_all().await.map(Some);
        };

        if !self.session_alive().await {
            warn!(peer = %self.peer, endpoint = %active, "Active session lost, re-racing all endpoints");
            self.emit(ProbeEvent::SessionLost { kind: active });
            if let Some(lost) = self.active.lock().await.as_ref() {
                self.connector.mark_reconnecting(&lost.session);
            }
            self.drop_active(TransportState::Failed).await;
            return self.probe_all().await.map(Some);
        }

        let outcome = self.run_round(Some(active)).await;
        let Some((candidate, latency)) = pick_best(&self.candidates(&outcome)) else {
            return Ok(None);
        };

        let Some(active_latency) = self.latency_of(active) else {
            return Ok(None);
        };
        if !should_switch(active_latency, latency, self.config.switch_threshold) {
            debug!(
                peer = %self.peer,
                active = %active,
                active_ms = duration_ms(active_latency),
                candidate = %candidate,
                candidate_ms = duration_ms(latency),
                "Candidate not better by threshold, staying"
            );
            return Ok(None);
        }

        info!(
            peer = %self.peer,
            from = %active,
            to = %candidate,
            from_ms = duration_ms(active_latency),
            to_ms = duration_ms(latency),
            "Switching to faster endpoint"
        );
        self.promote(candidate, Some(latency)).await?;
        Ok(Some(candidate))
    }

    /// Establish a session on `kind` and make it active, tearing down the old one.
    async fn promote(&self, kind: EndpointKind, latency: Option<Duration>) -> Result<()> {
        let address = self
            .endpoints
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig(format!("no {kind} endpoint configured")))?;

        let mut active = self.active.lock().await;
        let session = match self.connector.establish(kind, &address).await {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %self.peer, endpoint = %kind, error = %e, "Promotion failed");
                let message = e.to_string();
                self.update_status(kind, |s| s.mark_failed(message.clone()));
                self.emit(ProbeEvent::PromotionFailed {
                    kind,
                    error: message,
                });
                return Err(e);
            }
        };

        let previous = active.replace(ActiveSession { kind, session });
        *self.active_kind.write() = Some(kind);
        self.update_status(kind, |s| {
            s.mark(TransportState::Connected);
            if let Some(latency) = latency {
                s.latency_ms = Some(duration_ms(latency));
            }
        });

        let previous_kind = previous.as_ref().map(|p| p.kind);
        if let Some(previous) = previous {
            if previous.kind != kind {
                self.update_status(previous.kind, |s| s.mark(TransportState::Available));
            }
            self.connector.teardown(previous.session).await;
        }
        drop(active);

        info!(
            peer = %self.peer,
            endpoint = %kind,
            previous = ?previous_kind,
            latency_ms = latency.map(duration_ms),
            "Endpoint promoted"
        );
        self.emit(ProbeEvent::Promoted {
            kind,
            previous: previous_kind,
            latency,
        });
        Ok(())
    }

    async fn drop_active(&self, state: TransportState) {
        let previous = self.active.lock().await.take();
        *self.active_kind.write() = None;
        if let Some(previous) = previous {
            self.update_status(previous.kind, |s| s.mark(state));
            self.connector.teardown(previous.session).await;
        }
    }
}

/// Winner-take-all endpoint racer for one peer.
pub struct TransportProber<C: EndpointConnector> {
    inner: Arc<Inner<C>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: EndpointConnector> TransportProber<C> {
    pub fn new(peer: PeerId, endpoints: &MeshEndpoints, connector: C, config: ProbeConfig) -> Self {
        let endpoints: BTreeMap<EndpointKind, String> = endpoints.to_ordered_list().into_iter().collect();
        let mut table = StatusTable::default();
        for (kind, address) in &endpoints {
            table.statuses.insert(*kind, TransportStatus::new(*kind, address.clone()));
        }

        let initial = ProberStatus {
            peer: peer.clone(),
            endpoints: table.statuses.clone(),
            active: None,
            round: 0,
        };
        let (status_tx, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                peer,
                connector,
                config,
                endpoints: RwLock::new(endpoints),
                table: Mutex::new(table),
                active_kind: RwLock::new(None),
                active: AsyncMutex::new(None),
                round: AtomicU64::new(0),
                status_tx,
                events,
            }),
            task: Mutex::new(None),
        }
    }

    /// Register a passive BLE endpoint; it becomes usable only after
    /// [`report_ble_discovery`](Self::report_ble_discovery).
    pub fn with_ble(self, address: impl Into<String>) -> Self {
        let address = address.into();
        self.inner
            .endpoints
            .write()
            .insert(EndpointKind::Ble, address.clone());
        self.inner
            .table
            .lock()
            .statuses
            .insert(EndpointKind::Ble, TransportStatus::new(EndpointKind::Ble, address));
        self.inner.publish();
        self
    }

    pub fn peer(&self) -> &PeerId {
        &self.inner.peer
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.inner.config
    }

    /// Replace the local/public/relay candidates, e.g. after endpoint gossip.
    /// The BLE endpoint and the active endpoint's status are kept.
    pub fn update_endpoints(&self, endpoints: &MeshEndpoints) {
        let active = self.inner.active_kind();
        {
            let mut current = self.inner.endpoints.write();
            let mut table = self.inner.table.lock();
            current.retain(|kind, _| kind.is_passive() || Some(*kind) == active);
            table
                .statuses
                .retain(|kind, _| kind.is_passive() || Some(*kind) == active);
            for (kind, address) in endpoints.to_ordered_list() {
                if Some(kind) == active {
                    continue;
                }
                table
                    .statuses
                    .insert(kind, TransportStatus::new(kind, address.clone()));
                current.insert(kind, address);
            }
        }
        self.inner.publish();
    }

    /// Probe every endpoint once and promote the best.
    ///
    /// Returns the active endpoint, or `PeerUnreachable` (also emitted as
    /// [`ProbeEvent::AllFailed`]) when nothing was usable this round.
    pub async fn probe_all_transports(&self) -> Result<EndpointKind> {
        self.inner.probe_all().await
    }

    /// One re-probe cycle: probe all but the active endpoint and switch if a
    /// candidate clears the hysteresis margin. Returns the new endpoint if a
    /// switch happened.
    pub async fn reprobe(&self) -> Result<Option<EndpointKind>> {
        self.inner.reprobe().await
    }

    /// Start the periodic re-probe loop.
    pub fn start_reprobe(&self) {
        let inner = Arc::clone(&self.inner);
        let period = inner.config.reprobe_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match inner.reprobe().await {
                    Ok(Some(kind)) => {
                        debug!(peer = %inner.peer, endpoint = %kind, "Re-probe changed endpoint");
                    }
                    Ok(None) => {}
                    Err(e) => debug!(peer = %inner.peer, error = %e, "Re-probe round failed"),
                }
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_reprobe(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Manually promote `kind`, skipping the probe.
    pub async fn switch_to(&self, kind: EndpointKind) -> Result<()> {
        if self.inner.active_kind() == Some(kind) && self.inner.session_alive().await {
            return Ok(());
        }
        if kind.is_passive() {
            let usable = self
                .inner
                .table
                .lock()
                .statuses
                .get(&kind)
                .is_some_and(TransportStatus::is_usable);
            if !usable {
                return Err(Error::InvalidConfig(format!(
                    "{kind} endpoint has not been discovered"
                )));
            }
        }
        let latency = self.inner.latency_of(kind);
        self.inner.promote(kind, latency).await
    }

    /// Peer-discovery hook for the passive BLE endpoint.
    pub fn report_ble_discovery(&self, latency: Duration) -> bool {
        if !self.inner.endpoints.read().contains_key(&EndpointKind::Ble) {
            return false;
        }
        self.inner
            .update_status(EndpointKind::Ble, |s| s.mark_available(latency));
        self.inner.emit(ProbeEvent::BleDiscovered { latency });
        info!(peer = %self.inner.peer, latency_ms = duration_ms(latency), "BLE peer discovered");
        true
    }

    /// Stop re-probing, tear down the active session and reset every
    /// endpoint to `Unknown`.
    pub async fn disconnect(&self) {
        self.stop_reprobe();
        self.inner.drop_active(TransportState::Unknown).await;

        // Results of probes still in flight belong to a dead generation.
        let fence = self.inner.round.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut table = self.inner.table.lock();
            let kinds: Vec<_> = table.statuses.keys().copied().collect();
            for kind in kinds {
                table.last_round.insert(kind, fence);
                if let Some(status) = table.statuses.get_mut(&kind) {
                    status.reset();
                }
            }
        }
        self.inner.publish();
        self.inner.emit(ProbeEvent::Disconnected);
        info!(peer = %self.inner.peer, "Prober disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.active_kind().is_some()
    }

    /// Endpoint carrying the active session.
    pub fn active_transport(&self) -> Option<EndpointKind> {
        self.inner.active_kind()
    }

    /// The active session, if any.
    pub async fn session(&self) -> Option<C::Session> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.session.clone())
    }

    pub fn status(&self) -> ProberStatus {
        self.inner.snapshot()
    }

    pub fn endpoint_status(&self, kind: EndpointKind) -> Option<TransportStatus<EndpointKind>> {
        self.inner.table.lock().statuses.get(&kind).cloned()
    }

    /// Status updates; new subscribers see the latest snapshot.
    pub fn watch_status(&self) -> watch::Receiver<ProberStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.inner.events.subscribe()
    }
}

impl<C: EndpointConnector> Drop for TransportProber<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
