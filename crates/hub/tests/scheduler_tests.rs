//! Scheduler and registry behavior, driven directly against the hub state
//! machine with in-memory notification channels.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use hub::auth::Role;
use hub::registry::{Hub, ReservationState, SessionId};
use protocol::messages::HubNotification;
use protocol::types::{ExportDesc, ImportSpec, Part, PartSpec, ReturnReason, TcpIface, TcpImport};
use tokio::sync::mpsc;

type NoteRx = mpsc::Receiver<HubNotification>;

fn open_session(hub: &Hub, ip: &str, roles: &[Role]) -> (SessionId, NoteRx) {
    let (tx, rx) = mpsc::channel(64);
    let ip: IpAddr = ip.parse().unwrap();
    let id = hub.session_opened(ip, roles.iter().copied().collect::<HashSet<_>>(), tx);
    (id, rx)
}

fn desc(tags: &[&str]) -> ExportDesc {
    ExportDesc {
        port: 2192,
        parts: vec![Part {
            compatible: tags.iter().map(|s| s.to_string()).collect(),
            tcp: [(
                "scpi".to_string(),
                TcpIface {
                    host: "127.0.0.1".to_string(),
                    port: 5025,
                },
            )]
            .into(),
            usb: BTreeMap::new(),
        }],
    }
}

fn spec(tags: &[&str]) -> ImportSpec {
    ImportSpec {
        auto_return_time: std::time::Duration::ZERO,
        parts: [(
            "a".to_string(),
            PartSpec {
                compatible: tags.iter().map(|s| s.to_string()).collect(),
                tcp: [("scpi".to_string(), TcpImport { local_port: 5125 })].into(),
                usb: BTreeMap::new(),
            },
        )]
        .into(),
    }
}

async fn expect_available(rx: &mut NoteRx) -> protocol::messages::PlaceAvailable {
    match rx.recv().await.expect("notification expected") {
        HubNotification::PlaceAvailable(p) => p,
        other => panic!("expected place_available, got {other:?}"),
    }
}

async fn expect_reserved(rx: &mut NoteRx) -> protocol::messages::PlaceReserved {
    match rx.recv().await.expect("notification expected") {
        HubNotification::PlaceReserved(p) => p,
        other => panic!("expected place_reserved, got {other:?}"),
    }
}

#[tokio::test]
async fn test_happy_path_allocation() {
    let hub = Hub::new();
    let (exporter, mut exporter_rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (agent, mut agent_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    let place_id = hub.register_exporter(exporter, desc(&["x"])).await.unwrap();
    let reservation_id = hub.reserve(agent, spec(&["x"])).await.unwrap();

    let reserved = expect_reserved(&mut exporter_rx).await;
    assert_eq!(reserved.place_id, place_id);
    assert_eq!(reserved.peer_ip, "192.0.2.20".parse::<IpAddr>().unwrap());

    let available = expect_available(&mut agent_rx).await;
    assert_eq!(available.reservation_id, reservation_id);
    assert_eq!(available.place_id, place_id);
    assert_eq!(available.host, "192.0.2.10");
    assert_eq!(available.port, 2192);
    assert_eq!(available.token, reserved.token);
    assert!(available.parts.contains_key("a"));
    assert_eq!(available.parts["a"].tcp["scpi"].port, 5025);

    assert_eq!(
        hub.reservation_state(reservation_id),
        Some(ReservationState::Allocated)
    );
}

#[tokio::test]
async fn test_no_match_is_an_error() {
    let hub = Hub::new();
    let (exporter, _rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (agent, _agent_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    hub.register_exporter(exporter, desc(&["x"])).await.unwrap();

    let err = hub.reserve(agent, spec(&["y"])).await.unwrap_err();
    assert_eq!(err.kind(), Some(protocol::ErrorKind::NoMatch));
}

#[tokio::test]
async fn test_queue_scenario_fifo() {
    // Two places, three reservations: R1->P1, R2->P2, R3 pending; after R1
    // returns, R3 takes P1.
    let hub = Hub::new();
    let (e1, _e1_rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (e2, _e2_rx) = open_session(&hub, "192.0.2.11", &[Role::Exporter]);
    let (agent, mut agent_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    let p1 = hub.register_exporter(e1, desc(&["x"])).await.unwrap();
    let p2 = hub.register_exporter(e2, desc(&["x"])).await.unwrap();

    let r1 = hub.reserve(agent, spec(&["x"])).await.unwrap();
    let r2 = hub.reserve(agent, spec(&["x"])).await.unwrap();
    let r3 = hub.reserve(agent, spec(&["x"])).await.unwrap();

    let a1 = expect_available(&mut agent_rx).await;
    assert_eq!((a1.reservation_id, a1.place_id), (r1, p1));
    let a2 = expect_available(&mut agent_rx).await;
    assert_eq!((a2.reservation_id, a2.place_id), (r2, p2));

    assert_eq!(hub.reservation_state(r3), Some(ReservationState::Pending));

    hub.return_reservation(agent, r1).await.unwrap();
    let a3 = expect_available(&mut agent_rx).await;
    assert_eq!((a3.reservation_id, a3.place_id), (r3, p1));
}

#[tokio::test]
async fn test_fifo_fairness_on_free() {
    // R1 enqueued before R2; when the only place frees up, R1 wins.
    let hub = Hub::new();
    let (exporter, _rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (a1, mut a1_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);
    let (a2, mut a2_rx) = open_session(&hub, "192.0.2.21", &[Role::Importer]);

    let place = hub.register_exporter(exporter, desc(&["x"])).await.unwrap();

    let holder = hub.reserve(a1, spec(&["x"])).await.unwrap();
    expect_available(&mut a1_rx).await;

    let r1 = hub.reserve(a1, spec(&["x"])).await.unwrap();
    let r2 = hub.reserve(a2, spec(&["x"])).await.unwrap();

    hub.return_reservation(a1, holder).await.unwrap();

    let winner = expect_available(&mut a1_rx).await;
    assert_eq!((winner.reservation_id, winner.place_id), (r1, place));
    assert_eq!(hub.reservation_state(r2), Some(ReservationState::Pending));
    assert!(a2_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_exporter_crash_cascades() {
    let hub = Hub::new();
    let (exporter, _e_rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (agent, mut agent_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    hub.register_exporter(exporter, desc(&["x"])).await.unwrap();
    let r1 = hub.reserve(agent, spec(&["x"])).await.unwrap();
    expect_available(&mut agent_rx).await;

    hub.session_closed(exporter).await;

    match agent_rx.recv().await.unwrap() {
        HubNotification::ReservationLost(lost) => {
            assert_eq!(lost.reservation_id, r1);
            assert_eq!(lost.reason, ReturnReason::ExporterGone);
        }
        other => panic!("expected reservation_lost, got {other:?}"),
    }
    assert_eq!(hub.reservation_state(r1), Some(ReservationState::Returned));
    assert!(hub.places().is_empty());
}

#[tokio::test]
async fn test_candidates_gone() {
    // A pending reservation whose only candidate disappears is returned
    // with reason candidates_gone.
    let hub = Hub::new();
    let (exporter, _e_rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (a1, mut a1_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);
    let (a2, mut a2_rx) = open_session(&hub, "192.0.2.21", &[Role::Importer]);

    hub.register_exporter(exporter, desc(&["x"])).await.unwrap();

    hub.reserve(a1, spec(&["x"])).await.unwrap();
    expect_available(&mut a1_rx).await;
    let waiting = hub.reserve(a2, spec(&["x"])).await.unwrap();

    hub.session_closed(exporter).await;

    match a2_rx.recv().await.unwrap() {
        HubNotification::ReservationLost(lost) => {
            assert_eq!(lost.reservation_id, waiting);
            assert_eq!(lost.reason, ReturnReason::CandidatesGone);
        }
        other => panic!("expected reservation_lost, got {other:?}"),
    }
}

#[tokio::test]
async fn test_agent_close_returns_reservations() {
    let hub = Hub::new();
    let (exporter, mut exporter_rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (agent, mut agent_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    let place = hub.register_exporter(exporter, desc(&["x"])).await.unwrap();
    hub.reserve(agent, spec(&["x"])).await.unwrap();
    expect_reserved(&mut exporter_rx).await;
    expect_available(&mut agent_rx).await;

    hub.session_closed(agent).await;

    match exporter_rx.recv().await.unwrap() {
        HubNotification::PlaceReturned(returned) => assert_eq!(returned.place_id, place),
        other => panic!("expected place_returned, got {other:?}"),
    }

    // The place is free again for the next reservation.
    let (agent2, mut agent2_rx) = open_session(&hub, "192.0.2.21", &[Role::Importer]);
    hub.reserve(agent2, spec(&["x"])).await.unwrap();
    let available = expect_available(&mut agent2_rx).await;
    assert_eq!(available.place_id, place);
}

#[tokio::test]
async fn test_return_is_idempotent() {
    let hub = Hub::new();
    let (exporter, _e_rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (agent, mut agent_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    hub.register_exporter(exporter, desc(&["x"])).await.unwrap();
    let r1 = hub.reserve(agent, spec(&["x"])).await.unwrap();
    expect_available(&mut agent_rx).await;

    hub.return_reservation(agent, r1).await.unwrap();
    hub.return_reservation(agent, r1).await.unwrap();
    hub.return_reservation(agent, 9999).await.unwrap();
}

#[tokio::test]
async fn test_reserve_then_return_restores_state() {
    let hub = Hub::new();
    let (exporter, _e_rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (agent, mut agent_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    let place = hub.register_exporter(exporter, desc(&["x"])).await.unwrap();
    let r1 = hub.reserve(agent, spec(&["x"])).await.unwrap();
    expect_available(&mut agent_rx).await;
    hub.return_reservation(agent, r1).await.unwrap();

    // The place allocates again exactly as before.
    let r2 = hub.reserve(agent, spec(&["x"])).await.unwrap();
    let available = expect_available(&mut agent_rx).await;
    assert_eq!((available.reservation_id, available.place_id), (r2, place));
}

#[tokio::test]
async fn test_missing_role_is_rejected() {
    let hub = Hub::new();
    let (exporter_only, _rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (importer_only, _rx2) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    let err = hub.reserve(exporter_only, spec(&["x"])).await.unwrap_err();
    assert_eq!(err.kind(), Some(protocol::ErrorKind::Auth));

    let err = hub
        .register_exporter(importer_only, desc(&["x"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(protocol::ErrorKind::Auth));

    // Auth failures leave no state behind.
    assert!(hub.places().is_empty());
}

#[tokio::test]
async fn test_late_registration_extends_candidates() {
    // A reservation queued while no matching place exists cannot be
    // created (no_match), but a pending one picks up places registered
    // after it was enqueued.
    let hub = Hub::new();
    let (e1, _e1_rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (agent, mut agent_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    hub.register_exporter(e1, desc(&["x"])).await.unwrap();

    // Occupy the only place, then queue another request.
    hub.reserve(agent, spec(&["x"])).await.unwrap();
    expect_available(&mut agent_rx).await;
    let waiting = hub.reserve(agent, spec(&["x"])).await.unwrap();

    // A second exporter shows up; the pending reservation takes it.
    let (e2, _e2_rx) = open_session(&hub, "192.0.2.11", &[Role::Exporter]);
    let p2 = hub.register_exporter(e2, desc(&["x"])).await.unwrap();

    let available = expect_available(&mut agent_rx).await;
    assert_eq!((available.reservation_id, available.place_id), (waiting, p2));
}

#[tokio::test]
async fn test_double_registration_rejected() {
    let hub = Hub::new();
    let (exporter, _rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);

    hub.register_exporter(exporter, desc(&["x"])).await.unwrap();
    assert!(hub.register_exporter(exporter, desc(&["y"])).await.is_err());
}

#[tokio::test]
async fn test_at_most_one_allocation_per_place() {
    let hub = Hub::new();
    let (exporter, _e_rx) = open_session(&hub, "192.0.2.10", &[Role::Exporter]);
    let (agent, mut agent_rx) = open_session(&hub, "192.0.2.20", &[Role::Importer]);

    hub.register_exporter(exporter, desc(&["x"])).await.unwrap();

    let r1 = hub.reserve(agent, spec(&["x"])).await.unwrap();
    let r2 = hub.reserve(agent, spec(&["x"])).await.unwrap();

    let available = expect_available(&mut agent_rx).await;
    assert_eq!(available.reservation_id, r1);
    assert_eq!(hub.reservation_state(r2), Some(ReservationState::Pending));
    assert!(agent_rx.try_recv().is_err());
}
