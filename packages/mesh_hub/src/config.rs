use anyhow::{Context, Result};
use mesh_protocol::{IceConfiguration, IceServer};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [hub]
//                    keepalive_secs = 15
//
//   env var:         MESH_HUB__KEEPALIVE_SECS=15   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Hub behaviour (lives under `[hub]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// ICE servers handed to every node in its binding.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            ice_servers: default_ice_servers(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_keepalive_secs() -> u64 {
    30
}
fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

/// Build a figment that layers: defaults → config.toml → MESH_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `MESH_SERVER__PORT=9000`  →  `server.port = 9000`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("MESH_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub bind_addr: SocketAddr,
    /// Zero disables keepalive pings.
    pub keepalive_interval: Duration,
    pub ice: IceConfiguration,
}

impl HubConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let bind_addr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!("invalid bind address {}:{}", fc.server.host, fc.server.port)
            })?;
        Ok(Self {
            bind_addr,
            keepalive_interval: Duration::from_secs(fc.hub.keepalive_secs),
            ice: IceConfiguration {
                ice_servers: fc.hub.ice_servers.clone(),
            },
        })
    }
}
