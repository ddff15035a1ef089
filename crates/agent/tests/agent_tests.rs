//! Agent behavior against a fake in-memory hub.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent::agent::{Agent, AgentHandle, Command};
use agent::vhci::Vhci;
use async_trait::async_trait;
use protocol::jsonrpc::{self, Channel, RpcService, Side};
use protocol::messages::{PlaceAvailable, ReservationLost};
use protocol::types::{ImportSpec, Part, PartSpec, ReturnReason, TcpIface, TcpImport};
use protocol::{ErrorObject, HubRequest};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Fake hub: answers reserve with increasing ids and records returns.
struct FakeHub {
    next_id: AtomicU64,
    reserves: Mutex<Vec<u64>>,
    returns: Mutex<Vec<u64>>,
}

impl FakeHub {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            reserves: Mutex::new(Vec::new()),
            returns: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RpcService for FakeHub {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, ErrorObject> {
        match method {
            HubRequest::RESERVE => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.reserves.lock().unwrap().push(id);
                Ok(json!(id))
            }
            HubRequest::RETURN_RESERVATION => {
                let id = params["reservation_id"].as_u64().unwrap();
                self.returns.lock().unwrap().push(id);
                Ok(Value::Null)
            }
            other => Err(ErrorObject::method_not_found(other)),
        }
    }
}

struct NullService;

#[async_trait]
impl RpcService for NullService {
    async fn handle(&self, method: &str, _params: Value) -> Result<Value, ErrorObject> {
        Err(ErrorObject::method_not_found(method))
    }
}

struct Harness {
    handle: AgentHandle,
    cmd_tx: mpsc::Sender<Command>,
    hub: Arc<FakeHub>,
}

/// Start the agent actor wired to a fake hub over a channel pair.
async fn start_agent() -> Harness {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let agent = Agent::new(
        "hub.example.com".to_string(),
        Arc::new(Vhci::new()),
        cmd_tx.clone(),
    );
    tokio::spawn(agent.run(cmd_rx));

    let hub = FakeHub::new();
    let channel = connect_fake_hub(hub.clone()).await;
    cmd_tx.send(Command::HubConnected(channel)).await.unwrap();

    Harness {
        handle: AgentHandle::new(cmd_tx.clone()),
        cmd_tx,
        hub,
    }
}

async fn connect_fake_hub(hub: Arc<FakeHub>) -> Channel {
    let (tx_to_hub, mut rx_at_hub) = mpsc::channel::<String>(16);
    let (tx_to_agent, mut rx_at_agent) = mpsc::channel::<String>(16);

    let agent_chan = Channel::new(tx_to_hub, Side::Initiator);
    let hub_chan = Channel::new(tx_to_agent, Side::Acceptor);

    let hub_service: Arc<dyn RpcService> = hub;
    tokio::spawn(async move {
        let _ = jsonrpc::serve(&hub_chan, &mut rx_at_hub, hub_service).await;
    });
    let agent_serve = agent_chan.clone();
    tokio::spawn(async move {
        let _ = jsonrpc::serve(
            &agent_serve,
            &mut rx_at_agent,
            Arc::new(NullService) as Arc<dyn RpcService>,
        )
        .await;
    });

    agent_chan
}

/// Find a free local port by binding and dropping a listener.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn tcp_spec(local_port: u16, auto_return: Duration) -> ImportSpec {
    ImportSpec {
        auto_return_time: auto_return,
        parts: [(
            "board".to_string(),
            PartSpec {
                compatible: vec!["x".to_string()],
                tcp: [("console".to_string(), TcpImport { local_port })].into(),
                usb: BTreeMap::new(),
            },
        )]
        .into(),
    }
}

fn available(reservation_id: u64) -> PlaceAvailable {
    PlaceAvailable {
        reservation_id,
        place_id: 1,
        host: "192.0.2.40".to_string(),
        port: 2192,
        parts: [(
            "board".to_string(),
            Part {
                compatible: vec!["x".to_string()],
                tcp: [(
                    "console".to_string(),
                    TcpIface {
                        host: "127.0.0.1".to_string(),
                        port: 5025,
                    },
                )]
                .into(),
                usb: BTreeMap::new(),
            },
        )]
        .into(),
        token: "test-token".to_string(),
    }
}

#[tokio::test]
async fn test_reserve_and_list() {
    let harness = start_agent().await;
    let spec = tcp_spec(free_port().await, Duration::ZERO);

    harness
        .handle
        .reserve("lab".to_string(), spec.clone())
        .await
        .unwrap();

    let entries = harness.handle.list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].place, "lab");
    assert!(!entries[0].attached);

    // Duplicate names are rejected while the reservation is held.
    let err = harness
        .handle
        .reserve("lab".to_string(), spec)
        .await
        .unwrap_err();
    assert!(err.message.contains("already reserved"));

    assert_eq!(harness.hub.reserves.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_attach_waits_for_allocation() {
    let harness = start_agent().await;
    let spec = tcp_spec(free_port().await, Duration::ZERO);
    harness.handle.reserve("lab".to_string(), spec).await.unwrap();

    let attach = {
        let handle = harness.handle.clone();
        tokio::spawn(async move { handle.attach("lab".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!attach.is_finished(), "attach must wait for allocation");

    harness
        .cmd_tx
        .send(Command::PlaceAvailable(available(1)))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), attach)
        .await
        .expect("attach should finish after allocation")
        .unwrap()
        .unwrap();

    let entries = harness.handle.list().await.unwrap();
    assert!(entries[0].attached);

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status[0].state, "attached");
    assert_eq!(status[0].interfaces.len(), 1);
    assert_eq!(status[0].interfaces[0].kind, "tcp");
}

#[tokio::test]
async fn test_attach_then_detach_releases_port() {
    let harness = start_agent().await;
    let port = free_port().await;
    harness
        .handle
        .reserve("lab".to_string(), tcp_spec(port, Duration::ZERO))
        .await
        .unwrap();
    harness
        .cmd_tx
        .send(Command::PlaceAvailable(available(1)))
        .await
        .unwrap();
    harness.handle.attach("lab".to_string()).await.unwrap();

    // The forwarder owns the port now.
    assert!(tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .is_err());

    harness.handle.detach("lab".to_string()).await.unwrap();
    // Aborted listener tasks release the socket.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .is_ok());

    // Returning after detach reaches the hub.
    harness
        .handle
        .return_reservation("lab".to_string(), false)
        .await
        .unwrap();
    assert_eq!(harness.hub.returns.lock().unwrap().as_slice(), &[1]);
    assert!(harness.handle.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_local_port_conflict_is_resource_busy() {
    let harness = start_agent().await;
    let port = free_port().await;
    // Occupy the port before attaching.
    let _blocker = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap();

    harness
        .handle
        .reserve("lab".to_string(), tcp_spec(port, Duration::ZERO))
        .await
        .unwrap();
    harness
        .cmd_tx
        .send(Command::PlaceAvailable(available(1)))
        .await
        .unwrap();

    let err = harness.handle.attach("lab".to_string()).await.unwrap_err();
    assert_eq!(err.kind(), Some(protocol::ErrorKind::ResourceBusy));
}

#[tokio::test]
async fn test_return_refused_while_attached() {
    let harness = start_agent().await;
    harness
        .handle
        .reserve("lab".to_string(), tcp_spec(free_port().await, Duration::ZERO))
        .await
        .unwrap();
    harness
        .cmd_tx
        .send(Command::PlaceAvailable(available(1)))
        .await
        .unwrap();
    harness.handle.attach("lab".to_string()).await.unwrap();

    let err = harness
        .handle
        .return_reservation("lab".to_string(), false)
        .await
        .unwrap_err();
    assert!(err.message.contains("still attached"));

    harness
        .handle
        .return_reservation("lab".to_string(), true)
        .await
        .unwrap();
    assert!(harness.handle.list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auto_return_after_attach() {
    let harness = start_agent().await;
    harness
        .handle
        .reserve(
            "lab".to_string(),
            tcp_spec(free_port().await, Duration::from_secs(1)),
        )
        .await
        .unwrap();
    harness
        .cmd_tx
        .send(Command::PlaceAvailable(available(1)))
        .await
        .unwrap();
    harness.handle.attach("lab".to_string()).await.unwrap();

    // Paused time advances once everything is idle; the timer fires and
    // the reservation is force-returned.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let entries = harness.handle.list().await.unwrap();
    assert!(entries.is_empty(), "auto-return should remove the entry");
    assert_eq!(harness.hub.returns.lock().unwrap().as_slice(), &[1]);
}

#[tokio::test]
async fn test_reservation_lost_surfaces_reason() {
    let harness = start_agent().await;
    let port = free_port().await;
    harness
        .handle
        .reserve("lab".to_string(), tcp_spec(port, Duration::ZERO))
        .await
        .unwrap();
    harness
        .cmd_tx
        .send(Command::PlaceAvailable(available(1)))
        .await
        .unwrap();
    harness.handle.attach("lab".to_string()).await.unwrap();

    harness
        .cmd_tx
        .send(Command::ReservationLost(ReservationLost {
            reservation_id: 1,
            reason: ReturnReason::ExporterGone,
        }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status[0].state, "returned");
    assert_eq!(status[0].reason.as_deref(), Some("exporter_gone"));

    // Interfaces were torn down with the reservation.
    assert!(tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_reconnect_re_reserves() {
    let harness = start_agent().await;
    harness
        .handle
        .reserve("lab".to_string(), tcp_spec(free_port().await, Duration::ZERO))
        .await
        .unwrap();
    harness
        .cmd_tx
        .send(Command::PlaceAvailable(available(1)))
        .await
        .unwrap();

    harness.cmd_tx.send(Command::HubDisconnected).await.unwrap();
    let channel = connect_fake_hub(harness.hub.clone()).await;
    harness
        .cmd_tx
        .send(Command::HubConnected(channel))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The reservation went back to pending and was reserved again.
    assert_eq!(harness.hub.reserves.lock().unwrap().len(), 2);
    let status = harness.handle.status().await.unwrap();
    assert_eq!(status[0].state, "pending");
}

#[tokio::test]
async fn test_ipc_roundtrip() {
    let harness = start_agent().await;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("agent.sock");
    let listener = agent::ipc::bind_socket(&socket_path).await.unwrap();
    tokio::spawn(agent::ipc::run_ipc_server(listener, harness.handle.clone()));

    let entries: Vec<agent::agent::ListEntry> =
        agent::ipc::ipc_call(&socket_path, "list", &Value::Null)
            .await
            .unwrap();
    assert!(entries.is_empty());

    harness
        .handle
        .reserve("lab".to_string(), tcp_spec(free_port().await, Duration::ZERO))
        .await
        .unwrap();

    let entries: Vec<agent::agent::ListEntry> =
        agent::ipc::ipc_call(&socket_path, "list", &Value::Null)
            .await
            .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].place, "lab");

    // Unknown methods surface as typed errors.
    let err = agent::ipc::ipc_call::<_, Value>(&socket_path, "frobnicate", &Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, protocol::RpcError::Remote(_)));
}

#[tokio::test]
async fn test_edit_rejects_non_matching_spec() {
    let harness = start_agent().await;
    harness
        .handle
        .reserve("lab".to_string(), tcp_spec(free_port().await, Duration::ZERO))
        .await
        .unwrap();
    harness
        .cmd_tx
        .send(Command::PlaceAvailable(available(1)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The allocated part has no "power" tcp interface.
    let mut bad = tcp_spec(free_port().await, Duration::ZERO);
    bad.parts
        .get_mut("board")
        .unwrap()
        .tcp
        .insert("power".to_string(), TcpImport { local_port: 9999 });

    let err = harness
        .handle
        .update_spec("lab".to_string(), bad)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(protocol::ErrorKind::NoMatch));

    // A still-matching edit is accepted.
    let good = tcp_spec(free_port().await, Duration::ZERO);
    harness
        .handle
        .update_spec("lab".to_string(), good)
        .await
        .unwrap();
}
