//! HTTP surface and control-channel sessions
//!
//! The hub speaks plain HTTP for the status page and the places API, and
//! upgrades `/ws` to the duplex JSON-RPC control channel. Keep-alive runs
//! at the WebSocket layer: a ping after `T_IDLE` without inbound frames,
//! teardown after `T_DEAD`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use protocol::jsonrpc::{self, Channel, RpcService, Side};
use protocol::messages::HubRequest;
use protocol::ErrorObject;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::AuthPolicy;
use crate::registry::{Hub, SessionId};

pub struct AppState {
    pub hub: Arc<Hub>,
    pub auth: Arc<dyn AuthPolicy>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/api/v1/places", get(places))
        .route("/login", get(login))
        .route("/oidc-callback", get(oidc_callback))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html>\n\
         <html><head><title>not-my-board hub</title></head>\n\
         <body><h1>not-my-board hub</h1>\n\
         <p>This is a board-farm hub. Exporters and agents connect on\n\
         <code>/ws</code>; registered places are listed under\n\
         <code>/api/v1/places</code>.</p></body></html>\n",
    )
}

async fn places(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "places": state.hub.places() }))
}

async fn login() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html>\n\
         <html><body><p>Log in with the not-my-board CLI; it will direct\n\
         you to your OpenID Connect provider.</p></body></html>\n",
    )
}

async fn oidc_callback(Query(query): Query<HashMap<String, String>>) -> impl IntoResponse {
    // The login flow itself is handled by the auth policy; the callback
    // only needs to tell the user to go back to their terminal.
    debug!("oidc callback with state {:?}", query.get("state"));
    "Continue in the not-my-board CLI"
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then_some(token.trim())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let peer_ip = canonical_ip(peer.ip());
    let roles = match state.auth.grant_roles(bearer_token(&headers), peer_ip).await {
        Ok(roles) => roles,
        Err(err) => {
            info!("rejected control channel from {peer_ip}: {}", err.message);
            return (StatusCode::UNAUTHORIZED, err.message).into_response();
        }
    };

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        handle_session(socket, hub, peer_ip, roles).await;
    })
}

/// Resolve IPv4-mapped-on-IPv6 to a plain IPv4 address.
fn canonical_ip(ip: std::net::IpAddr) -> std::net::IpAddr {
    match ip {
        std::net::IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => std::net::IpAddr::V4(v4),
            None => std::net::IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

struct SessionService {
    hub: Arc<Hub>,
    session_id: SessionId,
}

#[async_trait]
impl RpcService for SessionService {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, ErrorObject> {
        match HubRequest::parse(method, params)? {
            HubRequest::RegisterExporter(req) => {
                let id = self
                    .hub
                    .register_exporter(self.session_id, req.place)
                    .await?;
                Ok(json!(id))
            }
            HubRequest::Reserve(req) => {
                let id = self.hub.reserve(self.session_id, req.spec).await?;
                Ok(json!(id))
            }
            HubRequest::ReturnReservation(req) => {
                self.hub
                    .return_reservation(self.session_id, req.reservation_id)
                    .await?;
                Ok(Value::Null)
            }
        }
    }
}

async fn handle_session(
    socket: WebSocket,
    hub: Arc<Hub>,
    peer_ip: std::net::IpAddr,
    roles: std::collections::HashSet<crate::auth::Role>,
) {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let (in_tx, mut in_rx) = mpsc::channel::<String>(256);
    let (note_tx, mut note_rx) = mpsc::channel(64);

    let channel = Channel::new(out_tx, Side::Acceptor);
    let session_id = hub.session_opened(peer_ip, roles, note_tx);

    let service: Arc<dyn RpcService> = Arc::new(SessionService {
        hub: hub.clone(),
        session_id,
    });
    let serve_channel = channel.clone();
    let serve_task = tokio::spawn(async move {
        if let Err(err) = jsonrpc::serve(&serve_channel, &mut in_rx, service).await {
            warn!("control channel error: {err}");
        }
    });

    // Forward scheduler notifications onto the channel.
    let notify_channel = channel.clone();
    let notify_task = tokio::spawn(async move {
        while let Some(note) = note_rx.recv().await {
            let params = match note.params() {
                Ok(params) => params,
                Err(err) => {
                    warn!("failed to serialize notification: {err}");
                    continue;
                }
            };
            if notify_channel.notify(note.method(), &params).await.is_err() {
                break;
            }
        }
    });

    let (mut sink, mut stream) = socket.split();
    let mut last_rx = Instant::now();
    let mut ping_sent = false;

    loop {
        let idle_at = last_rx + jsonrpc::T_IDLE;
        let dead_at = last_rx + jsonrpc::T_DEAD;

        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
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
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!("control channel read error: {err}");
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
                info!("control channel from {peer_ip} timed out");
                break;
            }
        }
    }

    drop(in_tx);
    channel.close();
    notify_task.abort();
    hub.session_closed(session_id).await;
    serve_task.abort();
}
