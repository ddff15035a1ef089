//! The authenticating HTTP-CONNECT gateway
//!
//! Every data tunnel enters through here: one CONNECT request per TCP
//! connection, authenticated with the bearer token issued by the hub and
//! the source address it was issued for. Status codes are the contract:
//! 400 non-CONNECT, 401 bad token, 403 wrong source address, 404 unknown
//! target, 502 unreachable target.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use common::http::{self, RequestHead};
use common::relay::relay_streams;
use protocol::types::{ExportDesc, UsbId};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::usbip::UsbIpServer;

const MSG_WRONG_METHOD: &str = "This is a not-my-board export server. \
     You probably want to use not-my-board, instead of connecting directly.\n";
const MSG_WRONG_TOKEN: &str =
    "This is a not-my-board export server. Your token is not valid.\n";
const MSG_WRONG_IP: &str =
    "This is a not-my-board export server. Your IP address is not allowed.\n";
const MSG_WRONG_TARGET: &str =
    "This is a not-my-board export server. The requested target is not allowed.\n";

/// A tunnel target named in a CONNECT authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authority {
    Tcp { iface: String, place_id: u64 },
    Usb { usbid: UsbId, place_id: u64 },
}

/// Parse `tcp:<if-name>@<place_id>` / `usb:<usbid>@<place_id>`.
pub fn parse_authority(target: &str) -> Option<Authority> {
    let (scheme, rest) = target.split_once(':')?;
    let (name, place) = rest.split_once('@')?;
    let place_id: u64 = place.parse().ok()?;
    match scheme {
        "tcp" if !name.is_empty() => Some(Authority::Tcp {
            iface: name.to_string(),
            place_id,
        }),
        "usb" => Some(Authority::Usb {
            usbid: name.parse().ok()?,
            place_id,
        }),
        _ => None,
    }
}

struct TokenEntry {
    peer_ip: IpAddr,
    revoke: watch::Sender<bool>,
}

/// Shared state between the hub session (which grants and revokes
/// tokens) and the gateway connections that consume them.
pub struct GatewayState {
    desc: ExportDesc,
    usbip: UsbIpServer,
    place_id: RwLock<Option<u64>>,
    tokens: Mutex<HashMap<String, TokenEntry>>,
}

impl GatewayState {
    pub fn new(desc: ExportDesc, usbip: UsbIpServer) -> Self {
        Self {
            desc,
            usbip,
            place_id: RwLock::new(None),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn usbip(&self) -> &UsbIpServer {
        &self.usbip
    }

    /// Record the id the hub assigned on registration.
    pub fn set_place_id(&self, id: Option<u64>) {
        *self.place_id.write().expect("place id lock poisoned") = id;
    }

    pub fn place_id(&self) -> Option<u64> {
        *self.place_id.read().expect("place id lock poisoned")
    }

    /// Allow tunnels with `token` from `peer_ip`.
    pub fn grant(&self, token: String, peer_ip: IpAddr) {
        info!("allowed peer added: {peer_ip}");
        let (revoke, _) = watch::channel(false);
        let mut tokens = self.tokens.lock().expect("token lock poisoned");
        tokens.insert(token, TokenEntry { peer_ip, revoke });
    }

    /// Drop every grant and tear down the tunnels that used them.
    pub fn revoke_all(&self) {
        let mut tokens = self.tokens.lock().expect("token lock poisoned");
        if !tokens.is_empty() {
            info!("revoking {} token(s)", tokens.len());
        }
        for entry in tokens.values() {
            let _ = entry.revoke.send(true);
        }
        tokens.clear();
    }

    /// Check a CONNECT's credentials. `Ok` carries the revocation signal
    /// the tunnel must watch.
    fn authorize(&self, token: &str, peer_ip: IpAddr) -> Result<watch::Receiver<bool>, Denied> {
        let tokens = self.tokens.lock().expect("token lock poisoned");
        let entry = tokens.get(token).ok_or(Denied::Token)?;
        if entry.peer_ip != peer_ip {
            return Err(Denied::Ip);
        }
        Ok(entry.revoke.subscribe())
    }
}

enum Denied {
    Token,
    Ip,
}

/// Accept loop of the gateway listener.
pub async fn run_gateway(listener: TcpListener, state: Arc<GatewayState>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("gateway accept failed")?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer.ip(), &state).await {
                debug!("gateway connection from {peer} ended: {err:#}");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_ip: IpAddr,
    state: &GatewayState,
) -> Result<()> {
    let (head, trailing) = match http::read_request_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(err) => {
            let _ = http::write_response(&mut stream, 400, "Bad Request", Some(MSG_WRONG_METHOD))
                .await;
            return Err(err.into());
        }
    };

    if head.method != "CONNECT" {
        http::write_response(&mut stream, 400, "Bad Request", Some(MSG_WRONG_METHOD)).await?;
        anyhow::bail!("unexpected method: {}", head.method);
    }

    let revoked = match check_auth(state, &head, peer_ip) {
        Ok(revoked) => revoked,
        Err(Denied::Token) => {
            http::write_response(&mut stream, 401, "Unauthorized", Some(MSG_WRONG_TOKEN)).await?;
            anyhow::bail!("rejected token from {peer_ip}");
        }
        Err(Denied::Ip) => {
            http::write_response(&mut stream, 403, "Forbidden", Some(MSG_WRONG_IP)).await?;
            anyhow::bail!("rejected source address {peer_ip}");
        }
    };

    let authority = parse_authority(&head.target)
        .filter(|authority| {
            let place_id = match authority {
                Authority::Tcp { place_id, .. } | Authority::Usb { place_id, .. } => *place_id,
            };
            state.place_id() == Some(place_id)
        });
    let Some(authority) = authority else {
        http::write_response(&mut stream, 404, "Not Found", Some(MSG_WRONG_TARGET)).await?;
        anyhow::bail!("unknown tunnel target: {}", head.target);
    };

    info!("proxy CONNECT target: {}", head.target);

    match authority {
        Authority::Tcp { iface, .. } => {
            let target = state
                .desc
                .parts
                .iter()
                .find_map(|part| part.tcp.get(&iface));
            let Some(target) = target else {
                http::write_response(&mut stream, 404, "Not Found", Some(MSG_WRONG_TARGET))
                    .await?;
                anyhow::bail!("unknown tcp interface: {iface}");
            };

            let mut upstream =
                match TcpStream::connect((target.host.as_str(), target.port)).await {
                    Ok(upstream) => upstream,
                    Err(err) => {
                        http::write_response(&mut stream, 502, "Bad Gateway", None).await?;
                        anyhow::bail!(
                            "failed to reach {}:{}: {err}",
                            target.host,
                            target.port
                        );
                    }
                };

            http::write_response(&mut stream, 200, "Connection established", None).await?;
            if !trailing.is_empty() {
                upstream.write_all(&trailing).await?;
            }

            run_until_revoked(revoked, async move {
                relay_streams(&mut stream, &mut upstream).await?;
                Ok(())
            })
            .await
        }
        Authority::Usb { usbid, .. } => {
            let Some(device) = state.usbip.device(&usbid) else {
                http::write_response(&mut stream, 404, "Not Found", Some(MSG_WRONG_TARGET))
                    .await?;
                anyhow::bail!("unknown usb device: {usbid}");
            };
            if !trailing.is_empty() {
                http::write_response(&mut stream, 400, "Bad Request", None).await?;
                anyhow::bail!("trailing data on usb tunnel");
            }

            http::write_response(&mut stream, 200, "Connection established", None).await?;

            let usbip = &state.usbip;
            run_until_revoked(revoked, usbip.handle_tunnel(device, stream)).await
        }
    }
}

fn check_auth(
    state: &GatewayState,
    head: &RequestHead,
    peer_ip: IpAddr,
) -> Result<watch::Receiver<bool>, Denied> {
    let token = head.bearer_token().ok_or(Denied::Token)?;
    state.authorize(token, peer_ip)
}

/// Drive a tunnel future, cancelling it when its token is revoked.
async fn run_until_revoked<F>(mut revoked: watch::Receiver<bool>, tunnel: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let watch = async move {
        loop {
            if *revoked.borrow() {
                return;
            }
            // A dropped sender means the grant is gone as well.
            if revoked.changed().await.is_err() {
                return;
            }
        }
    };

    tokio::select! {
        result = tunnel => result,
        _ = watch => {
            warn!("tunnel closed: reservation returned");
            Ok(())
        }
    }
}
