//! WebSocket client transport
//!
//! Connects to a hub and pumps text frames between the socket and a pair
//! of mpsc queues, so the JSON-RPC layer never sees the transport. The
//! pump owns keep-alive: it pings after `idle` without inbound frames and
//! gives up after `dead`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// An established control-channel transport. The connection is gone when
/// `incoming` yields `None`; dropping `outgoing` closes it.
pub struct WsConnection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

/// Derive the WebSocket URL from the hub's HTTP URL.
pub fn control_url(hub_url: &str) -> Result<String> {
    let url = if let Some(rest) = hub_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = hub_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if hub_url.starts_with("ws://") || hub_url.starts_with("wss://") {
        hub_url.to_string()
    } else {
        return Err(Error::Config(format!("unsupported hub URL: {hub_url}")));
    };
    Ok(format!("{}/ws", url.trim_end_matches('/')))
}

/// Connect to `url` and spawn the frame pump.
pub async fn ws_connect(
    url: &str,
    bearer: Option<&str>,
    idle: Duration,
    dead: Duration,
) -> Result<WsConnection> {
    let mut request = url
        .into_client_request()
        .map_err(|e| Error::Http(format!("invalid WebSocket URL: {e}")))?;
    if let Some(token) = bearer {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::Http(format!("invalid bearer token: {e}")))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::Http(format!("WebSocket handshake failed: {e}")))?;
    debug!("WebSocket connection established to {url}");

    let (out_tx, out_rx) = mpsc::channel::<String>(256);
    let (in_tx, in_rx) = mpsc::channel::<String>(256);
    tokio::spawn(pump(socket, out_rx, in_tx, idle, dead));

    Ok(WsConnection {
        outgoing: out_tx,
        incoming: in_rx,
    })
}

async fn pump(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut out_rx: mpsc::Receiver<String>,
    in_tx: mpsc::Sender<String>,
    idle: Duration,
    dead: Duration,
) {
    let (mut sink, mut stream) = socket.split();
    let mut last_rx = Instant::now();
    let mut ping_sent = false;

    loop {
        let idle_at = last_rx + idle;
        let dead_at = last_rx + dead;

        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!("WebSocket send failed: {err}");
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_rx = Instant::now();
                        ping_sent = false;
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_rx = Instant::now();
                        ping_sent = false;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("unexpected binary frame on control channel");
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("server closed connection");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(err)) => {
                        debug!("WebSocket read error: {err}");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(idle_at), if !ping_sent => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                ping_sent = true;
            }
            _ = tokio::time::sleep_until(dead_at) => {
                info!("control channel timed out");
                break;
            }
        }
    }
    // Dropping in_tx signals the channel layer that the connection died.
}
