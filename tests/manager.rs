//! Resilient manager tests: keep-all connects, failover, health checks and
//! the reconnect budget.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use common::{MockFactory, MockTransport};
use meshconn::error::Error;
use meshconn::manager::{ManagerConfig, ManagerEvent, ReconnectPolicy, ResilientTransportManager};
use meshconn::transport::Transport;
use meshconn::types::{PeerId, TransportState, TransportType};

fn peer() -> PeerId {
    PeerId::new("peer")
}

fn manager_with(config: ManagerConfig, mocks: &[&Arc<MockTransport>]) -> ResilientTransportManager {
    let factory = MockFactory::new();
    for mock in mocks {
        factory.provide(Arc::clone(mock));
    }
    let manager = ResilientTransportManager::new(config);
    for ty in [TransportType::Lan, TransportType::Ble, TransportType::Relay] {
        manager.register_factory(ty, factory.clone());
    }
    manager
}

fn addresses(types: &[TransportType]) -> BTreeMap<TransportType, String> {
    types
        .iter()
        .map(|ty| (*ty, format!("{ty}://peer")))
        .collect()
}

fn drain(rx: &mut broadcast::Receiver<ManagerEvent>) -> Vec<ManagerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn fast_failing() -> ManagerConfig {
    ManagerConfig {
        failure_threshold: 1,
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
        },
        ..ManagerConfig::default()
    }
}

// ============================================================================
// Connecting
// ============================================================================

#[tokio::test]
async fn test_connect_keeps_every_success() {
    let lan = MockTransport::new(TransportType::Lan);
    let relay = MockTransport::new(TransportType::Relay);
    let ble = MockTransport::unreachable(TransportType::Ble);
    let manager = manager_with(ManagerConfig::default(), &[&lan, &relay, &ble]);

    let connected = manager
        .connect_peer(
            "peer",
            &addresses(&[TransportType::Lan, TransportType::Ble, TransportType::Relay]),
        )
        .await
        .unwrap();

    assert_eq!(connected, vec![TransportType::Lan, TransportType::Relay]);
    assert_eq!(manager.peers(), vec![peer()]);

    let pool = manager.pool(&peer()).unwrap();
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.preferred(), Some(TransportType::Lan));

    let ble_status = manager.transport_status(&peer(), TransportType::Ble).unwrap();
    assert_eq!(ble_status.state, TransportState::Failed);
    assert_eq!(ble_status.address, "ble://peer");

    let lan_status = manager.transport_status(&peer(), TransportType::Lan).unwrap();
    assert_eq!(lan_status.state, TransportState::Connected);
    assert_eq!(lan_status.latency_ms, Some(10));

    assert!(manager.watch_status().borrow().is_connected(&peer()));
}

#[tokio::test]
async fn test_all_connects_failing_is_unreachable() {
    let lan = MockTransport::unreachable(TransportType::Lan);
    let relay = MockTransport::unreachable(TransportType::Relay);
    let manager = manager_with(ManagerConfig::default(), &[&lan, &relay]);
    let mut events = manager.subscribe();

    let err = manager
        .connect_peer("peer", &addresses(&[TransportType::Lan, TransportType::Relay]))
        .await
        .unwrap_err();

    match err {
        Error::PeerUnreachable { peer, errors } => {
            assert_eq!(peer, "peer");
            assert_eq!(errors.len(), 2);
            assert!(errors["lan"].contains("could not connect"));
            assert!(errors["relay"].contains("relay://peer"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let unreachable = drain(&mut events).into_iter().find_map(|e| match e {
        ManagerEvent::PeerUnreachable { errors, .. } => Some(errors),
        _ => None,
    });
    assert_eq!(unreachable.map(|e| e.len()), Some(2));
    assert!(!manager.status().is_connected(&peer()));
}

#[tokio::test]
async fn test_register_transport_without_factory() {
    let manager = ResilientTransportManager::default();
    let wifi = MockTransport::new(TransportType::WifiDirect);
    assert!(wifi.connect("wifi://peer").await);

    manager.register_transport("peer", wifi.clone()).await;

    assert_eq!(manager.pool(&peer()).unwrap().preferred(), Some(TransportType::WifiDirect));
    let status = manager
        .transport_status(&peer(), TransportType::WifiDirect)
        .unwrap();
    assert_eq!(status.state, TransportState::Connected);
    assert_eq!(status.address, "wifi://peer");
}

// ============================================================================
// Sending and switching
// ============================================================================

#[tokio::test]
async fn test_send_fails_over_to_next_transport() {
    let lan = MockTransport::new(TransportType::Lan);
    let relay = MockTransport::new(TransportType::Relay);
    let manager = manager_with(ManagerConfig::default(), &[&lan, &relay]);
    manager
        .connect_peer("peer", &addresses(&[TransportType::Lan, TransportType::Relay]))
        .await
        .unwrap();
    let mut events = manager.subscribe();

    assert_eq!(manager.send(&peer(), b"one").await.unwrap(), TransportType::Lan);

    lan.set_send_ok(false);
    assert_eq!(manager.send(&peer(), b"two").await.unwrap(), TransportType::Relay);
    assert_eq!(relay.sent(), vec![b"two".to_vec()]);
    assert_eq!(manager.pool(&peer()).unwrap().preferred(), Some(TransportType::Relay));

    assert!(drain(&mut events).contains(&ManagerEvent::PreferredChanged {
        peer: peer(),
        transport: Some(TransportType::Relay),
    }));
}

#[tokio::test]
async fn test_send_with_every_transport_failing() {
    let lan = MockTransport::new(TransportType::Lan);
    let manager = manager_with(ManagerConfig::default(), &[&lan]);
    manager
        .connect_peer("peer", &addresses(&[TransportType::Lan]))
        .await
        .unwrap();

    lan.set_send_ok(false);
    assert!(matches!(
        manager.send(&peer(), b"x").await,
        Err(Error::AllTransportsFailed)
    ));
}

#[tokio::test]
async fn test_switch_to() {
    let lan = MockTransport::new(TransportType::Lan);
    let relay = MockTransport::new(TransportType::Relay);
    let manager = manager_with(ManagerConfig::default(), &[&lan, &relay]);
    manager
        .connect_peer("peer", &addresses(&[TransportType::Lan, TransportType::Relay]))
        .await
        .unwrap();

    assert!(matches!(
        manager.switch_to(&PeerId::new("ghost"), TransportType::Lan),
        Err(Error::PeerNotFound(_))
    ));
    assert!(matches!(
        manager.switch_to(&peer(), TransportType::Ble),
        Err(Error::NotConnected)
    ));

    manager.switch_to(&peer(), TransportType::Relay).unwrap();
    assert_eq!(manager.send(&peer(), b"x").await.unwrap(), TransportType::Relay);
}

#[tokio::test]
async fn test_inbound_payloads_reach_handler() {
    let lan = MockTransport::new(TransportType::Lan);
    let manager = manager_with(ManagerConfig::default(), &[&lan]);
    manager
        .connect_peer("peer", &addresses(&[TransportType::Lan]))
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    manager.set_message_handler(Arc::new(move |peer: &PeerId, ty: TransportType, data: Vec<u8>| {
        sink.lock().push((peer.clone(), ty, data));
    }));

    assert!(lan.inject(b"hello"));
    assert_eq!(
        received.lock().as_slice(),
        &[(peer(), TransportType::Lan, b"hello".to_vec())]
    );
}

// ============================================================================
// Health checks and reconnects
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_health_failures_trigger_reconnect() {
    let lan = MockTransport::new(TransportType::Lan);
    let relay = MockTransport::new(TransportType::Relay);
    let manager = manager_with(ManagerConfig::default(), &[&lan, &relay]);
    manager
        .connect_peer("peer", &addresses(&[TransportType::Lan, TransportType::Relay]))
        .await
        .unwrap();
    let mut events = manager.subscribe();

    lan.set_ping_ok(false);
    manager.check_health().await;
    manager.check_health().await;
    assert_eq!(
        manager.transport_status(&peer(), TransportType::Lan).unwrap().state,
        TransportState::Connected
    );

    manager.check_health().await;
    let status = manager.transport_status(&peer(), TransportType::Lan).unwrap();
    assert_eq!(status.state, TransportState::Failed);
    assert!(status.error.unwrap().contains("3 consecutive"));

    let pool = manager.pool(&peer()).unwrap();
    assert!(pool.transport(TransportType::Lan).is_none());
    assert_eq!(pool.preferred(), Some(TransportType::Relay));
    assert!(manager.is_reconnecting(&peer(), TransportType::Lan));

    let seen = drain(&mut events);
    let misses: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            ManagerEvent::HealthCheckFailed {
                transport: TransportType::Lan,
                consecutive,
                ..
            } => Some(*consecutive),
            _ => None,
        })
        .collect();
    assert_eq!(misses, vec![1, 2, 3]);
    assert!(seen
        .iter()
        .any(|e| matches!(e, ManagerEvent::TransportFailed { transport: TransportType::Lan, .. })));

    // First retry fires after the 5s base delay.
    lan.set_ping_ok(true);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(
        manager.transport_status(&peer(), TransportType::Lan).unwrap().state,
        TransportState::Connected
    );
    assert!(manager.pool(&peer()).unwrap().transport(TransportType::Lan).is_some());
    assert_eq!(lan.connects(), 2);
    assert!(drain(&mut events).contains(&ManagerEvent::Reconnected {
        peer: peer(),
        transport: TransportType::Lan,
        attempt: 1,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_successful_ping_resets_miss_count() {
    let lan = MockTransport::new(TransportType::Lan);
    let manager = manager_with(ManagerConfig::default(), &[&lan]);
    manager
        .connect_peer("peer", &addresses(&[TransportType::Lan]))
        .await
        .unwrap();

    lan.set_ping_ok(false);
    manager.check_health().await;
    manager.check_health().await;
    lan.set_ping_ok(true);
    manager.check_health().await;
    lan.set_ping_ok(false);
    manager.check_health().await;
    manager.check_health().await;

    assert_eq!(
        manager.transport_status(&peer(), TransportType::Lan).unwrap().state,
        TransportState::Connected
    );
    assert!(!manager.is_reconnecting(&peer(), TransportType::Lan));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_budget_exhausts() {
    let lan = MockTransport::new(TransportType::Lan);
    let manager = manager_with(fast_failing(), &[&lan]);
    manager
        .connect_peer("peer", &addresses(&[TransportType::Lan]))
        .await
        .unwrap();
    let mut events = manager.subscribe();

    lan.set_ping_ok(false);
    lan.set_connect_ok(false);
    manager.check_health().await;

    // Delays 1s, 2s, 2s.
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(manager.is_exhausted(&peer(), TransportType::Lan));
    assert!(!manager.is_reconnecting(&peer(), TransportType::Lan));
    assert_eq!(lan.connects(), 4);

    let status = manager.transport_status(&peer(), TransportType::Lan).unwrap();
    assert_eq!(status.state, TransportState::Failed);
    assert!(status.error.unwrap().contains("reconnect budget exhausted"));

    let seen = drain(&mut events);
    let delays: Vec<Duration> = seen
        .iter()
        .filter_map(|e| match e {
            ManagerEvent::ReconnectScheduled { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(2)]
    );
    assert!(seen.contains(&ManagerEvent::ReconnectExhausted {
        peer: peer(),
        transport: TransportType::Lan,
        attempts: 3,
    }));

    // Registering the transport again clears the exhausted state.
    lan.set_connect_ok(true);
    assert!(lan.connect("lan://peer").await);
    manager.register_transport("peer", lan.clone()).await;

    assert!(!manager.is_exhausted(&peer(), TransportType::Lan));
    assert_eq!(
        manager.transport_status(&peer(), TransportType::Lan).unwrap().state,
        TransportState::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_peer_cancels_reconnect() {
    let lan = MockTransport::new(TransportType::Lan);
    let manager = manager_with(fast_failing(), &[&lan]);
    manager
        .connect_peer("peer", &addresses(&[TransportType::Lan]))
        .await
        .unwrap();

    lan.set_ping_ok(false);
    manager.check_health().await;
    assert!(manager.is_reconnecting(&peer(), TransportType::Lan));
    let mut events = manager.subscribe();

    manager.disconnect_peer(&peer()).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(lan.connects(), 1);
    assert!(!manager.is_reconnecting(&peer(), TransportType::Lan));
    assert!(manager.peers().is_empty());
    assert_eq!(
        manager.transport_status(&peer(), TransportType::Lan).unwrap().state,
        TransportState::Unknown
    );
    assert!(drain(&mut events).contains(&ManagerEvent::PeerDisconnected { peer: peer() }));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_health_loop() {
    let lan = MockTransport::new(TransportType::Lan);
    let relay = MockTransport::new(TransportType::Relay);
    let manager = manager_with(ManagerConfig::default(), &[&lan, &relay]);
    manager
        .connect_peer("peer", &addresses(&[TransportType::Lan, TransportType::Relay]))
        .await
        .unwrap();

    relay.set_ping_ok(false);
    manager.start_health_monitoring();

    // Checks run at 10s, 20s and 30s.
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(
        manager.transport_status(&peer(), TransportType::Relay).unwrap().state,
        TransportState::Connected
    );

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(
        manager.transport_status(&peer(), TransportType::Relay).unwrap().state,
        TransportState::Failed
    );
    assert_eq!(
        manager.transport_status(&peer(), TransportType::Lan).unwrap().state,
        TransportState::Connected
    );

    manager.shutdown().await;
    assert!(manager.peers().is_empty());
    assert!(!manager.is_reconnecting(&peer(), TransportType::Relay));
}
