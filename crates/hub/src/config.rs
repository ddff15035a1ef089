//! Hub configuration management

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "NOT_MY_BOARD_HUB_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/not-my-board/hub.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "HubConfig::default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "HubConfig::default_log_level")]
    pub log_level: String,

    /// Static token permissions. Without this section every peer is
    /// granted both roles.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub tokens: Vec<TokenPermission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenPermission {
    pub token: String,
    /// Granted roles: "exporter" and/or "importer".
    pub roles: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            log_level: Self::default_log_level(),
            auth: None,
        }
    }
}

impl HubConfig {
    fn default_bind_addr() -> String {
        "[::]:2092".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from the given path, the `NOT_MY_BOARD_HUB_CONFIG`
    /// environment variable, or `/etc/not-my-board/hub.toml`. A missing
    /// default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(p) => (PathBuf::from(p), true),
                None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("config file not found: {}", path.display());
            }
            tracing::warn!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: HubConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;

        tracing::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            anyhow::bail!(
                "invalid log level {:?}, must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            );
        }

        if let Some(auth) = &self.auth {
            for perm in &auth.tokens {
                if perm.token.is_empty() {
                    anyhow::bail!("empty token in [auth] section");
                }
                for role in &perm.roles {
                    if role != "exporter" && role != "importer" {
                        anyhow::bail!("unknown role {role:?}, expected exporter or importer");
                    }
                }
            }
        }
        Ok(())
    }
}
