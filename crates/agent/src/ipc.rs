//! Local IPC between the agent daemon and the client CLI
//!
//! Length-prefixed JSON-RPC over a Unix domain socket, group-restricted
//! by file mode. The daemon serves the socket; `ipc_call` is the thin
//! client half used by the CLI subcommands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::framed::{read_frame, write_frame};
use protocol::jsonrpc::{self, Channel, RpcService, Side};
use protocol::types::ImportSpec;
use protocol::{ErrorObject, RpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::AgentHandle;

/// Default agent socket path.
pub const SOCKET_PATH: &str = "/run/not-my-board-agent.sock";

#[derive(Debug, Serialize, Deserialize)]
pub struct ReserveParams {
    pub name: String,
    pub spec: ImportSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NameParams {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReturnParams {
    pub name: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateParams {
    pub name: String,
    pub spec: ImportSpec,
}

/// Bind the agent socket, replacing a stale one; refuses to start when
/// another agent is alive on it.
pub async fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        match UnixStream::connect(path).await {
            Ok(_) => anyhow::bail!(
                "another agent is already running (socket at {} is active)",
                path.display()
            ),
            Err(_) => {
                std::fs::remove_file(path)
                    .with_context(|| format!("failed to remove stale socket {}", path.display()))?
            }
        }
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind socket {}", path.display()))?;

    // Restrict to the owning user and group.
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
        .with_context(|| format!("failed to chmod {}", path.display()))?;

    Ok(listener)
}

/// Serve IPC clients until cancelled.
pub async fn run_ipc_server(listener: UnixListener, handle: AgentHandle) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await.context("IPC accept failed")?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_client(stream, handle).await {
                debug!("IPC client ended: {err:#}");
            }
        });
    }
}

async fn serve_client(stream: UnixStream, handle: AgentHandle) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let (in_tx, mut in_rx) = mpsc::channel::<String>(64);

    let channel = Channel::new(out_tx, Side::Acceptor);
    let service: Arc<dyn RpcService> = Arc::new(IpcService { handle });

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut writer, frame.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let serve_channel = channel.clone();
    let serve_task =
        tokio::spawn(async move { jsonrpc::serve(&serve_channel, &mut in_rx, service).await });

    let result = loop {
        match read_frame(&mut reader).await {
            Ok(Some(payload)) => {
                let text = String::from_utf8(payload)
                    .map_err(|_| anyhow::anyhow!("IPC frame is not UTF-8"))?;
                if in_tx.send(text).await.is_err() {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err.into()),
        }
    };

    drop(in_tx);
    channel.close();
    let _ = serve_task.await;
    writer_task.abort();
    result
}

struct IpcService {
    handle: AgentHandle,
}

#[async_trait]
impl RpcService for IpcService {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, ErrorObject> {
        fn params_of<T: DeserializeOwned>(params: Value) -> Result<T, ErrorObject> {
            serde_json::from_value(params).map_err(|e| ErrorObject::invalid_params(e.to_string()))
        }

        match method {
            "reserve" => {
                let p: ReserveParams = params_of(params)?;
                self.handle.reserve(p.name, p.spec).await?;
                Ok(Value::Null)
            }
            "attach" => {
                let p: NameParams = params_of(params)?;
                self.handle.attach(p.name).await?;
                Ok(Value::Null)
            }
            "detach" => {
                let p: NameParams = params_of(params)?;
                self.handle.detach(p.name).await?;
                Ok(Value::Null)
            }
            "return_reservation" => {
                let p: ReturnParams = params_of(params)?;
                self.handle.return_reservation(p.name, p.force).await?;
                Ok(Value::Null)
            }
            "list" => {
                let entries = self.handle.list().await?;
                Ok(json!(entries))
            }
            "status" => {
                let status = self.handle.status().await?;
                Ok(json!(status))
            }
            "get_import_description" => {
                let p: NameParams = params_of(params)?;
                let spec = self.handle.get_spec(p.name).await?;
                Ok(json!(spec))
            }
            "update_import_description" => {
                let p: UpdateParams = params_of(params)?;
                self.handle.update_spec(p.name, p.spec).await?;
                Ok(Value::Null)
            }
            other => Err(ErrorObject::method_not_found(other)),
        }
    }
}

/// One-shot client call against the agent socket.
pub async fn ipc_call<P, R>(socket_path: &Path, method: &str, params: &P) -> Result<R, RpcError>
where
    P: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let stream = UnixStream::connect(socket_path).await.map_err(|e| {
        RpcError::Protocol(format!(
            "failed to connect to agent at {}: {e}; is the agent running?",
            socket_path.display()
        ))
    })?;
    let (mut reader, mut writer) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::channel::<String>(16);
    let channel = Channel::new(out_tx, Side::Initiator);

    let reader_channel = channel.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(payload)) => {
                    let Ok(text) = String::from_utf8(payload) else {
                        break;
                    };
                    match reader_channel.handle_frame(&text) {
                        // The agent never calls back into the client.
                        Ok(Some(incoming)) => {
                            warn!("unexpected request from agent: {}", incoming.method)
                        }
                        Ok(None) => {}
                        Err(_) => break,
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        reader_channel.close();
    });

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut writer, frame.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let result = channel.call(method, params).await;
    reader_task.abort();
    writer_task.abort();
    result
}

/// Socket path override used by tests and non-standard setups.
pub fn socket_path() -> PathBuf {
    match std::env::var_os("NOT_MY_BOARD_AGENT_SOCK") {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(SOCKET_PATH),
    }
}
