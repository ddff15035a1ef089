//! Agent core: the reservation table and its single owner task
//!
//! All reservation state is owned by one actor task; the IPC server and
//! the hub session marshal their work through its command channel. The
//! hub connection is re-established with backoff, and because the hub
//! keeps no state across reconnects, every held reservation is
//! re-reserved on a fresh session.

use std::collections::HashMap;
use std::sync::Arc;

use protocol::messages::{PlaceAvailable, ReservationLost, Reserve};
use protocol::types::{ImportSpec, ReturnReason};
use protocol::{Channel, ErrorObject, HubRequest, RpcError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::tunnel::{self, Allocation, Tunnel};
use crate::vhci::Vhci;

/// Reservation state as seen by attach waiters and the status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResState {
    Pending,
    Allocated,
    Returned(ReturnReason),
}

/// One entry of the `list` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub place: String,
    pub attached: bool,
}

/// One interface row of the `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceStatus {
    pub part: String,
    pub interface: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attached: bool,
}

/// Per-reservation block of the `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationStatus {
    pub place: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub interfaces: Vec<InterfaceStatus>,
}

type Reply<T> = oneshot::Sender<Result<T, ErrorObject>>;

/// Commands handled by the agent task.
pub enum Command {
    Reserve {
        name: String,
        spec: ImportSpec,
        reply: Reply<()>,
    },
    /// Hand out a watch on the reservation's state, so a caller can wait
    /// for allocation without blocking the agent task.
    AwaitAllocation {
        name: String,
        reply: Reply<watch::Receiver<ResState>>,
    },
    Attach {
        name: String,
        reply: Reply<()>,
    },
    Detach {
        name: String,
        reply: Reply<()>,
    },
    Return {
        name: String,
        force: bool,
        reason: ReturnReason,
        reply: Option<Reply<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<ListEntry>>,
    },
    Status {
        reply: oneshot::Sender<Vec<ReservationStatus>>,
    },
    GetSpec {
        name: String,
        reply: Reply<ImportSpec>,
    },
    UpdateSpec {
        name: String,
        spec: ImportSpec,
        reply: Reply<()>,
    },
    HubConnected(Channel),
    HubDisconnected,
    PlaceAvailable(PlaceAvailable),
    ReservationLost(ReservationLost),
}

struct ReservedPlace {
    reservation_id: u64,
    spec: ImportSpec,
    state_tx: watch::Sender<ResState>,
    alloc_tx: watch::Sender<Option<Arc<Allocation>>>,
    tunnels: Vec<Tunnel>,
    auto_return: Option<tokio::task::JoinHandle<()>>,
}

impl ReservedPlace {
    fn is_attached(&self) -> bool {
        !self.tunnels.is_empty()
    }

    fn state(&self) -> ResState {
        self.state_tx.borrow().clone()
    }

    fn teardown_tunnels(&mut self) {
        for tunnel in self.tunnels.drain(..) {
            tunnel.detach();
        }
    }
}

/// The actor owning the reservation table.
pub struct Agent {
    reservations: HashMap<String, ReservedPlace>,
    hub: Option<Channel>,
    hub_host: String,
    vhci: Arc<Vhci>,
    /// Weak handle for timer tasks, so the actor can still shut down when
    /// the last external sender is dropped.
    cmd_tx: mpsc::WeakSender<Command>,
}

impl Agent {
    pub fn new(hub_host: String, vhci: Arc<Vhci>, cmd_tx: mpsc::Sender<Command>) -> Self {
        Self {
            reservations: HashMap::new(),
            hub: None,
            hub_host,
            vhci,
            cmd_tx: cmd_tx.downgrade(),
        }
    }

    /// Run the actor until the command channel closes.
    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(command) = cmd_rx.recv().await {
            self.handle(command).await;
        }
        // Shutting down: release everything we attached.
        for (_, mut place) in self.reservations.drain() {
            place.teardown_tunnels();
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Reserve { name, spec, reply } => {
                let _ = reply.send(self.reserve(name, spec).await);
            }
            Command::AwaitAllocation { name, reply } => {
                let result = match self.reservations.get(&name) {
                    Some(place) => Ok(place.state_tx.subscribe()),
                    None => Err(not_reserved(&name)),
                };
                let _ = reply.send(result);
            }
            Command::Attach { name, reply } => {
                let _ = reply.send(self.attach(&name).await);
            }
            Command::Detach { name, reply } => {
                let _ = reply.send(self.detach(&name));
            }
            Command::Return {
                name,
                force,
                reason,
                reply,
            } => {
                let result = self.return_reservation(&name, force, reason).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(err) = result {
                    warn!("auto-return of {name:?} failed: {}", err.message);
                }
            }
            Command::List { reply } => {
                let entries = self
                    .reservations
                    .iter()
                    .map(|(name, place)| ListEntry {
                        place: name.clone(),
                        attached: place.is_attached(),
                    })
                    .collect();
                let _ = reply.send(entries);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::GetSpec { name, reply } => {
                let result = self
                    .reservations
                    .get(&name)
                    .map(|place| place.spec.clone())
                    .ok_or_else(|| not_reserved(&name));
                let _ = reply.send(result);
            }
            Command::UpdateSpec { name, spec, reply } => {
                let _ = reply.send(self.update_spec(&name, spec).await);
            }
            Command::HubConnected(channel) => self.hub_connected(channel).await,
            Command::HubDisconnected => self.hub_disconnected(),
            Command::PlaceAvailable(available) => self.place_available(available),
            Command::ReservationLost(lost) => self.reservation_lost(lost),
        }
    }

    async fn reserve(&mut self, name: String, spec: ImportSpec) -> Result<(), ErrorObject> {
        spec.validate()
            .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;

        if let Some(place) = self.reservations.get(&name) {
            if !matches!(place.state(), ResState::Returned(_)) {
                return Err(ErrorObject::invalid_params(format!(
                    "a place named {name:?} is already reserved"
                )));
            }
        }

        let hub = self.hub.clone().ok_or_else(hub_unavailable)?;
        let reservation_id: u64 = hub
            .call(HubRequest::RESERVE, &Reserve { spec: spec.clone() })
            .await
            .map_err(rpc_to_error)?;

        info!("reserved {name:?} as reservation {reservation_id}");

        // Replace a leftover Returned entry of the same name.
        if let Some(mut old) = self.reservations.remove(&name) {
            old.teardown_tunnels();
        }

        let (state_tx, _) = watch::channel(ResState::Pending);
        let (alloc_tx, _) = watch::channel(None);
        self.reservations.insert(
            name,
            ReservedPlace {
                reservation_id,
                spec,
                state_tx,
                alloc_tx,
                tunnels: Vec::new(),
                auto_return: None,
            },
        );
        Ok(())
    }

    async fn attach(&mut self, name: &str) -> Result<(), ErrorObject> {
        let vhci = self.vhci.clone();
        let place = self
            .reservations
            .get_mut(name)
            .ok_or_else(|| not_reserved(name))?;

        if place.is_attached() {
            return Err(ErrorObject::invalid_params(format!(
                "place {name:?} is already attached"
            )));
        }
        let alloc = match place.state() {
            ResState::Allocated => place
                .alloc_tx
                .borrow()
                .clone()
                .expect("allocated place must have an allocation"),
            ResState::Pending => {
                return Err(ErrorObject::new(
                    protocol::error::CODE_INTERNAL_ERROR,
                    "place is not allocated yet",
                    Some(protocol::ErrorKind::Transient),
                ))
            }
            ResState::Returned(reason) => {
                return Err(ErrorObject::invalid_params(format!(
                    "place {name:?} was returned ({reason})"
                )))
            }
        };

        let mut tunnels = Vec::new();
        let result = Self::materialize(&alloc, place, &vhci, &mut tunnels).await;
        match result {
            Ok(()) => {
                place.tunnels = tunnels;
                info!("attached {name:?}");
                self.restart_auto_return(name);
                Ok(())
            }
            Err(err) => {
                for tunnel in tunnels {
                    tunnel.detach();
                }
                Err(err)
            }
        }
    }

    /// Spawn every interface of the import description against the parts
    /// the hub assigned.
    async fn materialize(
        alloc: &Arc<Allocation>,
        place: &ReservedPlace,
        vhci: &Arc<Vhci>,
        tunnels: &mut Vec<Tunnel>,
    ) -> Result<(), ErrorObject> {
        for (part_name, part_spec) in &place.spec.parts {
            let assigned = alloc.parts.get(part_name).ok_or_else(|| {
                ErrorObject::internal(format!("no part assigned for {part_name:?}"))
            })?;

            for (iface_name, tcp_import) in &part_spec.tcp {
                let tunnel = tunnel::spawn_tcp_tunnel(
                    part_name,
                    iface_name,
                    tcp_import.local_port,
                    place.alloc_tx.subscribe(),
                )
                .await
                .map_err(|e| ErrorObject::resource_busy(format!("{e:#}")))?;
                tunnels.push(tunnel);
            }

            for (iface_name, usb_import) in &part_spec.usb {
                let usbid = assigned
                    .usb
                    .get(iface_name)
                    .ok_or_else(|| {
                        ErrorObject::internal(format!(
                            "assigned part lacks usb interface {iface_name:?}"
                        ))
                    })?
                    .usbid
                    .clone();
                let tunnel = tunnel::spawn_usb_tunnel(
                    part_name,
                    iface_name,
                    usbid,
                    usb_import.port_num,
                    vhci.clone(),
                    place.alloc_tx.subscribe(),
                )
                .await
                .map_err(|e| ErrorObject::resource_busy(format!("{e:#}")))?;
                tunnels.push(tunnel);
            }
        }
        Ok(())
    }

    fn detach(&mut self, name: &str) -> Result<(), ErrorObject> {
        let place = self
            .reservations
            .get_mut(name)
            .ok_or_else(|| not_reserved(name))?;
        if !place.is_attached() {
            return Err(ErrorObject::invalid_params(format!(
                "place {name:?} is not attached"
            )));
        }
        place.teardown_tunnels();
        info!("detached {name:?}");
        Ok(())
    }

    async fn return_reservation(
        &mut self,
        name: &str,
        force: bool,
        reason: ReturnReason,
    ) -> Result<(), ErrorObject> {
        let place = self
            .reservations
            .get_mut(name)
            .ok_or_else(|| not_reserved(name))?;

        if place.is_attached() {
            if !force {
                return Err(ErrorObject::invalid_params(format!(
                    "place {name:?} is still attached"
                )));
            }
            place.teardown_tunnels();
        }
        if let Some(timer) = place.auto_return.take() {
            timer.abort();
        }

        let was_returned = matches!(place.state(), ResState::Returned(_));
        let reservation_id = place.reservation_id;
        self.reservations.remove(name);

        if !was_returned {
            if let Some(hub) = self.hub.clone() {
                let result = hub
                    .call::<_, serde_json::Value>(
                        HubRequest::RETURN_RESERVATION,
                        &protocol::ReturnReservation { reservation_id },
                    )
                    .await;
                if let Err(err) = result {
                    // The hub returns it anyway when our session dies.
                    warn!("failed to return reservation {reservation_id}: {err}");
                }
            }
        }
        info!("returned {name:?} ({reason})");
        Ok(())
    }

    fn status(&self) -> Vec<ReservationStatus> {
        self.reservations
            .iter()
            .map(|(name, place)| {
                let (state, reason) = match place.state() {
                    ResState::Pending => ("pending".to_string(), None),
                    ResState::Allocated if place.is_attached() => ("attached".to_string(), None),
                    ResState::Allocated => ("allocated".to_string(), None),
                    ResState::Returned(reason) => {
                        ("returned".to_string(), Some(reason.to_string()))
                    }
                };
                ReservationStatus {
                    place: name.clone(),
                    state,
                    reason,
                    interfaces: place
                        .tunnels
                        .iter()
                        .map(|tunnel| {
                            let status = tunnel.status();
                            InterfaceStatus {
                                part: status.part,
                                interface: status.interface,
                                kind: status.kind.to_string(),
                                attached: status.attached,
                            }
                        })
                        .collect(),
                }
            })
            .collect()
    }

    async fn update_spec(&mut self, name: &str, spec: ImportSpec) -> Result<(), ErrorObject> {
        spec.validate()
            .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;

        let place = self
            .reservations
            .get_mut(name)
            .ok_or_else(|| not_reserved(name))?;

        // Against an allocated place the new description must still fit
        // the parts the hub assigned.
        if place.state() == ResState::Allocated {
            let alloc = place
                .alloc_tx
                .borrow()
                .clone()
                .expect("allocated place must have an allocation");
            for (part_name, part_spec) in &spec.parts {
                let assigned = alloc.parts.get(part_name).ok_or_else(|| {
                    ErrorObject::no_match(format!(
                        "part {part_name:?} has no assignment in the allocated place"
                    ))
                })?;
                if !part_spec.matches(assigned) {
                    return Err(ErrorObject::no_match(format!(
                        "part {part_name:?} no longer matches its assigned part"
                    )));
                }
            }
        }

        place.spec = spec;
        let was_attached = place.is_attached();
        if was_attached {
            place.teardown_tunnels();
        }
        info!("updated import description of {name:?}");

        if was_attached {
            self.attach(name).await?;
        } else {
            self.restart_auto_return(name);
        }
        Ok(())
    }

    fn restart_auto_return(&mut self, name: &str) {
        let Some(place) = self.reservations.get_mut(name) else {
            return;
        };
        if let Some(timer) = place.auto_return.take() {
            timer.abort();
        }
        let timeout = place.spec.auto_return_time;
        if timeout.is_zero() {
            return;
        }

        let cmd_tx = self.cmd_tx.clone();
        let name = name.to_string();
        place.auto_return = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!("auto-return timer of {name:?} fired");
            let Some(cmd_tx) = cmd_tx.upgrade() else {
                return;
            };
            let _ = cmd_tx
                .send(Command::Return {
                    name,
                    force: true,
                    reason: ReturnReason::AutoReturn,
                    reply: None,
                })
                .await;
        }));
    }

    async fn hub_connected(&mut self, channel: Channel) {
        info!("hub connection established");
        self.hub = Some(channel.clone());

        // The hub lost all session state: re-reserve what we hold.
        let names: Vec<String> = self
            .reservations
            .iter()
            .filter(|(_, place)| !matches!(place.state(), ResState::Returned(_)))
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            let Some(place) = self.reservations.get_mut(&name) else {
                continue;
            };
            let spec = place.spec.clone();
            match channel
                .call::<_, u64>(HubRequest::RESERVE, &Reserve { spec })
                .await
            {
                Ok(reservation_id) => {
                    debug!("re-reserved {name:?} as reservation {reservation_id}");
                    place.reservation_id = reservation_id;
                    let _ = place.state_tx.send(ResState::Pending);
                    let _ = place.alloc_tx.send(None);
                }
                Err(err) => {
                    warn!("failed to re-reserve {name:?}: {err}");
                    place.teardown_tunnels();
                    let _ = place
                        .state_tx
                        .send(ResState::Returned(ReturnReason::CandidatesGone));
                    let _ = place.alloc_tx.send(None);
                }
            }
        }
    }

    fn hub_disconnected(&mut self) {
        warn!("hub connection lost");
        self.hub = None;
        for place in self.reservations.values_mut() {
            if place.state() == ResState::Allocated {
                let _ = place.state_tx.send(ResState::Pending);
                let _ = place.alloc_tx.send(None);
            }
        }
    }

    fn place_available(&mut self, available: PlaceAvailable) {
        let entry = self
            .reservations
            .iter_mut()
            .find(|(_, place)| place.reservation_id == available.reservation_id);
        let Some((name, place)) = entry else {
            debug!(
                "place_available for unknown reservation {}",
                available.reservation_id
            );
            return;
        };

        // Exporters on the hub's own machine report a loopback address;
        // reach them through the hub's host instead.
        let host = match available.host.parse::<std::net::IpAddr>() {
            Ok(ip) if ip.is_loopback() => {
                info!("replacing {} with {}", available.host, self.hub_host);
                self.hub_host.clone()
            }
            _ => available.host,
        };

        info!("reservation for {name:?} is now place {}", available.place_id);
        let alloc = Arc::new(Allocation {
            place_id: available.place_id,
            host,
            port: available.port,
            parts: available.parts,
            token: available.token,
        });
        let _ = place.alloc_tx.send(Some(alloc));
        let _ = place.state_tx.send(ResState::Allocated);
    }

    fn reservation_lost(&mut self, lost: ReservationLost) {
        let entry = self
            .reservations
            .iter_mut()
            .find(|(_, place)| place.reservation_id == lost.reservation_id);
        let Some((name, place)) = entry else {
            debug!("reservation_lost for unknown reservation {}", lost.reservation_id);
            return;
        };

        warn!("reservation for {name:?} lost: {}", lost.reason);
        place.teardown_tunnels();
        if let Some(timer) = place.auto_return.take() {
            timer.abort();
        }
        let _ = place.alloc_tx.send(None);
        let _ = place.state_tx.send(ResState::Returned(lost.reason));
    }
}

fn not_reserved(name: &str) -> ErrorObject {
    ErrorObject::invalid_params(format!("a place named {name:?} is not reserved"))
}

fn hub_unavailable() -> ErrorObject {
    ErrorObject::new(
        protocol::error::CODE_INTERNAL_ERROR,
        "hub connection is not available",
        Some(protocol::ErrorKind::Transient),
    )
}

fn rpc_to_error(err: RpcError) -> ErrorObject {
    match err {
        RpcError::Remote(obj) => obj,
        other => ErrorObject::internal(other.to_string()),
    }
}

/// A typed handle for sending commands to the agent task.
#[derive(Clone)]
pub struct AgentHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl AgentHandle {
    pub fn new(cmd_tx: mpsc::Sender<Command>) -> Self {
        Self { cmd_tx }
    }

    pub fn sender(&self) -> mpsc::Sender<Command> {
        self.cmd_tx.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ErrorObject> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| ErrorObject::internal("agent task is gone"))?;
        rx.await
            .map_err(|_| ErrorObject::internal("agent task dropped the request"))?
    }

    pub async fn reserve(&self, name: String, spec: ImportSpec) -> Result<(), ErrorObject> {
        self.request(|reply| Command::Reserve { name, spec, reply })
            .await
    }

    /// Wait until the named reservation is allocated (or fail if it was
    /// returned), then attach it.
    pub async fn attach(&self, name: String) -> Result<(), ErrorObject> {
        let mut state_rx = {
            let name = name.clone();
            self.request(|reply| Command::AwaitAllocation { name, reply })
                .await?
        };

        loop {
            let state = state_rx.borrow().clone();
            match state {
                ResState::Allocated => break,
                ResState::Returned(reason) => {
                    return Err(ErrorObject::invalid_params(format!(
                        "place {name:?} was returned ({reason})"
                    )))
                }
                ResState::Pending => {
                    if state_rx.changed().await.is_err() {
                        return Err(not_reserved(&name));
                    }
                }
            }
        }

        self.request(|reply| Command::Attach { name, reply }).await
    }

    pub async fn detach(&self, name: String) -> Result<(), ErrorObject> {
        self.request(|reply| Command::Detach { name, reply }).await
    }

    pub async fn return_reservation(&self, name: String, force: bool) -> Result<(), ErrorObject> {
        self.request(|reply| Command::Return {
            name,
            force,
            reason: ReturnReason::Returned,
            reply: Some(reply),
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<ListEntry>, ErrorObject> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::List { reply })
            .await
            .map_err(|_| ErrorObject::internal("agent task is gone"))?;
        rx.await
            .map_err(|_| ErrorObject::internal("agent task dropped the request"))
    }

    pub async fn status(&self) -> Result<Vec<ReservationStatus>, ErrorObject> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| ErrorObject::internal("agent task is gone"))?;
        rx.await
            .map_err(|_| ErrorObject::internal("agent task dropped the request"))
    }

    pub async fn get_spec(&self, name: String) -> Result<ImportSpec, ErrorObject> {
        self.request(|reply| Command::GetSpec { name, reply }).await
    }

    pub async fn update_spec(&self, name: String, spec: ImportSpec) -> Result<(), ErrorObject> {
        self.request(|reply| Command::UpdateSpec { name, spec, reply })
            .await
    }
}
