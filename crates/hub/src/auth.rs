//! Authorization policy oracle
//!
//! The hub consults an `AuthPolicy` once per control channel, at handshake
//! time, and stores the granted roles on the session. Role checks happen
//! per RPC; a session with a valid token but a missing role keeps its
//! channel and only the call fails.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use async_trait::async_trait;
use protocol::ErrorObject;

use crate::config::AuthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// May register places.
    Exporter,
    /// May reserve and return places.
    Importer,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Exporter => "exporter",
            Role::Importer => "importer",
        }
    }
}

#[async_trait]
pub trait AuthPolicy: Send + Sync + 'static {
    /// Resolve the roles of a connecting peer. An error rejects the
    /// handshake.
    async fn grant_roles(
        &self,
        bearer: Option<&str>,
        peer_ip: IpAddr,
    ) -> Result<HashSet<Role>, ErrorObject>;
}

/// Policy used when the hub runs without an `[auth]` section: every peer
/// holds both roles.
pub struct PermissiveAuth;

#[async_trait]
impl AuthPolicy for PermissiveAuth {
    async fn grant_roles(
        &self,
        _bearer: Option<&str>,
        _peer_ip: IpAddr,
    ) -> Result<HashSet<Role>, ErrorObject> {
        Ok([Role::Exporter, Role::Importer].into())
    }
}

/// Static token-to-roles mapping from the hub config.
pub struct StaticTokenAuth {
    tokens: HashMap<String, HashSet<Role>>,
}

impl StaticTokenAuth {
    pub fn new(config: &AuthConfig) -> Self {
        let mut tokens: HashMap<String, HashSet<Role>> = HashMap::new();
        for perm in &config.tokens {
            let roles = tokens.entry(perm.token.clone()).or_default();
            for role in &perm.roles {
                match role.as_str() {
                    "exporter" => {
                        roles.insert(Role::Exporter);
                    }
                    "importer" => {
                        roles.insert(Role::Importer);
                    }
                    // validated at config load
                    _ => {}
                }
            }
        }
        Self { tokens }
    }
}

#[async_trait]
impl AuthPolicy for StaticTokenAuth {
    async fn grant_roles(
        &self,
        bearer: Option<&str>,
        peer_ip: IpAddr,
    ) -> Result<HashSet<Role>, ErrorObject> {
        let token = bearer.ok_or_else(|| ErrorObject::auth("missing bearer token"))?;
        match self.tokens.get(token) {
            Some(roles) => Ok(roles.clone()),
            None => {
                tracing::info!("rejected unknown token from {peer_ip}");
                Err(ErrorObject::auth("invalid token"))
            }
        }
    }
}
