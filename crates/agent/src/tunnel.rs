//! Per-interface tunnels
//!
//! Once a reservation is allocated, every TCP interface gets a local
//! listener that opens one CONNECT tunnel per accepted connection, and
//! every USB interface gets a persistent task that imports the remote
//! device and attaches it to the virtual host controller. The USB task
//! immediately re-imports after a successful attach: when the kernel
//! drops the connection the pending import completes and the device
//! re-attaches transparently.

use std::collections::BTreeMap;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use common::http::open_tunnel;
use common::relay::relay_streams;
use protocol::types::{Part, UsbId};
use protocol::usbip;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::vhci::{select_port, Vhci};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How long an attach waits for the first successful connection before
/// reporting the interface as "still connecting".
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection parameters of an allocated place, shared with every tunnel
/// of the reservation. Cleared (set to `None`) while the reservation is
/// not allocated.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub place_id: u64,
    pub host: String,
    pub port: u16,
    pub parts: BTreeMap<String, Part>,
    pub token: String,
}

pub type AllocationRx = watch::Receiver<Option<Arc<Allocation>>>;

/// Interface state reported by the `status` command.
#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub part: String,
    pub interface: String,
    pub kind: &'static str,
    pub attached: bool,
}

/// A running tunnel task of either kind.
pub struct Tunnel {
    part_name: String,
    iface_name: String,
    kind: TunnelKind,
    task: tokio::task::JoinHandle<()>,
}

enum TunnelKind {
    Tcp,
    Usb {
        vhci: Arc<Vhci>,
        vhci_port: Arc<Mutex<Option<u8>>>,
    },
}

impl Tunnel {
    pub fn status(&self) -> TunnelStatus {
        let (kind, attached) = match &self.kind {
            TunnelKind::Tcp => ("tcp", !self.task.is_finished()),
            TunnelKind::Usb { vhci, vhci_port } => {
                let attached = vhci_port
                    .lock()
                    .expect("vhci port lock poisoned")
                    .map(|port| vhci.is_attached(port))
                    .unwrap_or(false);
                ("usb", attached)
            }
        };
        TunnelStatus {
            part: self.part_name.clone(),
            interface: self.iface_name.clone(),
            kind,
            attached,
        }
    }

    /// Stop the tunnel and release its local resources.
    pub fn detach(self) {
        self.task.abort();
        if let TunnelKind::Usb { vhci, vhci_port } = &self.kind {
            let port = vhci_port.lock().expect("vhci port lock poisoned").take();
            if let Some(port) = port {
                debug!(
                    "{}.{}: detaching VHCI port {port}",
                    self.part_name, self.iface_name
                );
                vhci.detach(port);
            }
        }
        debug!("{}.{}: tunnel detached", self.part_name, self.iface_name);
    }
}

/// Bind the local listener for a TCP interface and start forwarding.
///
/// Binding fails synchronously (the port may be taken); everything after
/// that is handled per accepted connection.
pub async fn spawn_tcp_tunnel(
    part_name: &str,
    iface_name: &str,
    local_port: u16,
    alloc_rx: AllocationRx,
) -> Result<Tunnel> {
    let listener = TcpListener::bind(("127.0.0.1", local_port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{local_port}"))?;
    info!("{part_name}.{iface_name}: forwarding 127.0.0.1:{local_port}");

    let name = format!("{part_name}.{iface_name}");
    let iface = iface_name.to_string();
    let task = tokio::spawn(async move {
        loop {
            let (local, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("{name}: accept failed: {err}");
                    tokio::time::sleep(INITIAL_BACKOFF).await;
                    continue;
                }
            };
            debug!("{name}: connection from {peer}");

            let alloc = alloc_rx.borrow().clone();
            let iface = iface.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let Some(alloc) = alloc else {
                    debug!("{name}: dropping connection, place not allocated");
                    return;
                };
                if let Err(err) = forward_connection(local, &alloc, &iface).await {
                    debug!("{name}: forward ended: {err:#}");
                }
            });
        }
    });

    Ok(Tunnel {
        part_name: part_name.to_string(),
        iface_name: iface_name.to_string(),
        kind: TunnelKind::Tcp,
        task,
    })
}

async fn forward_connection(mut local: TcpStream, alloc: &Allocation, iface: &str) -> Result<()> {
    let mut remote = TcpStream::connect((alloc.host.as_str(), alloc.port))
        .await
        .with_context(|| format!("failed to reach gateway {}:{}", alloc.host, alloc.port))?;

    let authority = format!("tcp:{iface}@{}", alloc.place_id);
    let trailing = open_tunnel(&mut remote, &authority, &alloc.token).await?;
    if !trailing.is_empty() {
        local.write_all(&trailing).await?;
    }
    relay_streams(&mut local, &mut remote).await?;
    Ok(())
}

/// Start the persistent import/attach loop for a USB interface.
///
/// Waits up to five seconds for the first attach; a device that is not
/// plugged in yet leaves the tunnel in its retry loop and the attach
/// completes later.
pub async fn spawn_usb_tunnel(
    part_name: &str,
    iface_name: &str,
    usbid: UsbId,
    port_num: u8,
    vhci: Arc<Vhci>,
    alloc_rx: AllocationRx,
) -> Result<Tunnel> {
    let name = format!("{part_name}.{iface_name}");
    let vhci_port: Arc<Mutex<Option<u8>>> = Arc::new(Mutex::new(None));
    let (ready_tx, mut ready_rx) = watch::channel(false);

    let task = {
        let name = name.clone();
        let vhci = vhci.clone();
        let vhci_port = vhci_port.clone();
        let mut alloc_rx = alloc_rx;
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                // Wait for the reservation to be allocated.
                let alloc = loop {
                    if let Some(alloc) = alloc_rx.borrow().clone() {
                        break alloc;
                    }
                    if alloc_rx.changed().await.is_err() {
                        return;
                    }
                };

                match usb_attach_once(&vhci, &alloc, &usbid, port_num).await {
                    Ok(port) => {
                        debug!("{name}: USB device attached to port {port}");
                        *vhci_port.lock().expect("vhci port lock poisoned") = Some(port);
                        let _ = ready_tx.send(true);
                        backoff = INITIAL_BACKOFF;
                        // Loop around immediately: the next import blocks
                        // on the exporter until the device is free again,
                        // which re-attaches it after a kernel-side drop.
                    }
                    Err(err) => {
                        debug!("{name}: attach attempt failed: {err:#}");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        })
    };

    debug!("{name}: attaching USB device");
    tokio::spawn(async move {
        let ready = tokio::time::timeout(READY_TIMEOUT, async {
            while !*ready_rx.borrow() {
                if ready_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if ready.is_err() {
            warn!("{name}: attaching USB device timed out");
        }
    });

    Ok(Tunnel {
        part_name: part_name.to_string(),
        iface_name: iface_name.to_string(),
        kind: TunnelKind::Usb { vhci, vhci_port },
        task,
    })
}

/// One import/attach round: tunnel to the gateway, import the device
/// (blocks until it is available), then hand the socket to the kernel.
async fn usb_attach_once(
    vhci: &Vhci,
    alloc: &Allocation,
    usbid: &UsbId,
    port_num: u8,
) -> Result<u8> {
    let mut stream = TcpStream::connect((alloc.host.as_str(), alloc.port))
        .await
        .with_context(|| format!("failed to reach gateway {}:{}", alloc.host, alloc.port))?;

    let authority = format!("usb:{usbid}@{}", alloc.place_id);
    let trailing = open_tunnel(&mut stream, &authority, &alloc.token).await?;
    if !trailing.is_empty() {
        bail!("USB/IP implementation cannot handle trailing data");
    }

    usbip::write_import_request(&mut stream, usbid.as_str()).await?;
    // Blocks until the exporter has the device bound and free.
    let device = usbip::read_import_reply(&mut stream).await?;

    let vhci_port = select_port(port_num, device.speed_class())?;
    vhci.ensure_available().await?;

    // The kernel keeps its own reference to the socket; our copy closes
    // when `std_stream` drops.
    let std_stream = stream.into_std()?;
    std_stream.set_nonblocking(false)?;
    vhci.attach(
        vhci_port,
        std_stream.as_raw_fd(),
        device.devid(),
        device.speed,
    )
    .await?;
    drop(std_stream);

    Ok(vhci_port)
}
