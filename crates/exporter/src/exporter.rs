//! Exporter core: hub session, token cache and lifecycle
//!
//! The exporter registers its place on the hub's control channel and
//! keeps the gateway's token cache in sync with the hub's notifications.
//! The control channel reconnects with exponential backoff; hub state is
//! gone after a reconnect, so every session re-registers from scratch.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::ws::{control_url, ws_connect};
use protocol::jsonrpc::{self, Channel, RpcService, Side};
use protocol::messages::{HubNotification, HubRequest, RegisterExporter};
use protocol::types::ExportDesc;
use protocol::{ErrorObject, T_DEAD, T_IDLE};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::load_export_desc;
use crate::gateway::{run_gateway, GatewayState};
use crate::usbip::{refresh_pipe_task, UsbIpDevice, UsbIpServer};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct Exporter {
    hub_url: String,
    token: Option<String>,
    desc: ExportDesc,
    devices: Vec<Arc<UsbIpDevice>>,
    state: Arc<GatewayState>,
}

impl Exporter {
    pub fn new(hub_url: String, desc_path: &Path, token: Option<String>) -> Result<Self> {
        let desc = load_export_desc(desc_path)?;

        let devices: Vec<Arc<UsbIpDevice>> = desc
            .parts
            .iter()
            .flat_map(|part| part.usb.values())
            .map(|iface| Arc::new(UsbIpDevice::new(iface.usbid.clone())))
            .collect();

        let usbip = UsbIpServer::new(devices.clone());
        let state = Arc::new(GatewayState::new(desc.clone(), usbip));

        Ok(Self {
            hub_url,
            token,
            desc,
            devices,
            state,
        })
    }

    /// Run gateway, device plumbing and the hub session until cancelled.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.desc.port))
            .await
            .with_context(|| format!("failed to bind gateway port {}", self.desc.port))?;
        info!("gateway listening on port {}", self.desc.port);

        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(run_gateway(listener, self.state.clone()));
        for device in &self.devices {
            let device = device.clone();
            tasks.spawn(async move { refresh_pipe_task(device).await });
        }

        let url = control_url(&self.hub_url)?;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.session(&url).await {
                Ok(()) => {
                    warn!("hub connection lost, reconnecting");
                    backoff = INITIAL_BACKOFF;
                }
                Err(err) => {
                    warn!("hub session failed: {err:#}");
                }
            }
            self.state.set_place_id(None);
            self.state.revoke_all();

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// One control-channel session: connect, register, then serve
    /// notifications until the connection dies.
    async fn session(&self, url: &str) -> Result<()> {
        let conn = ws_connect(url, self.token.as_deref(), T_IDLE, T_DEAD).await?;
        let channel = Channel::new(conn.outgoing.clone(), Side::Initiator);

        let service: Arc<dyn RpcService> = Arc::new(ExporterService {
            state: self.state.clone(),
        });
        let serve_channel = channel.clone();
        let mut incoming = conn.incoming;
        let serve_task = tokio::spawn(async move {
            jsonrpc::serve(&serve_channel, &mut incoming, service).await
        });

        let place_id: u64 = channel
            .call(
                HubRequest::REGISTER_EXPORTER,
                &RegisterExporter {
                    place: self.desc.clone(),
                },
            )
            .await
            .context("failed to register place")?;
        self.state.set_place_id(Some(place_id));
        info!("registered place {place_id}");

        serve_task
            .await
            .context("control channel task failed")?
            .map_err(Into::into)
    }

    /// Give the devices back to their default drivers.
    pub async fn shutdown(&self) {
        for device in &self.devices {
            device.restore_default_driver().await;
        }
    }
}

struct ExporterService {
    state: Arc<GatewayState>,
}

#[async_trait]
impl RpcService for ExporterService {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, ErrorObject> {
        match HubNotification::parse(method, params)? {
            HubNotification::PlaceReserved(reserved) => {
                self.state.grant(reserved.token, reserved.peer_ip);
                Ok(Value::Null)
            }
            HubNotification::PlaceReturned(returned) => {
                info!("place {} returned", returned.place_id);
                self.state.revoke_all();
                Ok(Value::Null)
            }
            other => {
                warn!("unexpected notification: {}", other.method());
                Ok(Value::Null)
            }
        }
    }
}
