//! Hub control-channel session loop
//!
//! Connects to the hub, feeds its notifications into the agent task, and
//! reconnects with exponential backoff. The agent re-reserves everything
//! after each reconnect because the hub keeps no session state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::ws::{control_url, ws_connect};
use protocol::jsonrpc::{self, Channel, RpcService, Side};
use protocol::messages::HubNotification;
use protocol::{ErrorObject, T_DEAD, T_IDLE};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::agent::Command;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Keep a control channel to the hub alive forever.
pub async fn run_hub_session(
    hub_url: String,
    token: Option<String>,
    cmd_tx: mpsc::Sender<Command>,
) -> Result<()> {
    let url = control_url(&hub_url)?;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match session(&url, token.as_deref(), &cmd_tx).await {
            Ok(()) => backoff = INITIAL_BACKOFF,
            Err(err) => warn!("hub session failed: {err:#}"),
        }
        if cmd_tx.send(Command::HubDisconnected).await.is_err() {
            // Agent task is gone, nothing left to serve.
            return Ok(());
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn session(url: &str, token: Option<&str>, cmd_tx: &mpsc::Sender<Command>) -> Result<()> {
    let conn = ws_connect(url, token, T_IDLE, T_DEAD).await?;
    let channel = Channel::new(conn.outgoing.clone(), Side::Initiator);

    let service: Arc<dyn RpcService> = Arc::new(HubEventService {
        cmd_tx: cmd_tx.clone(),
    });

    cmd_tx
        .send(Command::HubConnected(channel.clone()))
        .await
        .map_err(|_| anyhow::anyhow!("agent task is gone"))?;

    let mut incoming = conn.incoming;
    jsonrpc::serve(&channel, &mut incoming, service)
        .await
        .map_err(Into::into)
}

struct HubEventService {
    cmd_tx: mpsc::Sender<Command>,
}

#[async_trait]
impl RpcService for HubEventService {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, ErrorObject> {
        let command = match HubNotification::parse(method, params)? {
            HubNotification::PlaceAvailable(available) => Command::PlaceAvailable(available),
            HubNotification::ReservationLost(lost) => Command::ReservationLost(lost),
            other => {
                warn!("unexpected notification: {}", other.method());
                return Ok(Value::Null);
            }
        };
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| ErrorObject::internal("agent task is gone"))?;
        Ok(Value::Null)
    }
}
