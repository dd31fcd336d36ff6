use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [engine]
//                    connect_timeout_ms = 10000
//
//   env var:         MESH_PEER_ENGINE__CONNECT_TIMEOUT_MS=10000

/// Top-level tunable configuration for a node, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub hub: HubFileConfig,
    #[serde(default)]
    pub engine: EngineFileConfig,
    #[serde(default)]
    pub socket: SocketFileConfig,
    #[serde(default)]
    pub duplex: DuplexFileConfig,
}

/// Hub connection settings (lives under `[hub]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_hub_url")]
    pub url: String,
    #[serde(default = "default_true")]
    pub reconnect: bool,
    /// Zero retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            reconnect: true,
            max_reconnect_attempts: 0,
            max_backoff_secs: default_max_backoff_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Negotiation engine settings (lives under `[engine]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineFileConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_bind_timeout_ms")]
    pub bind_timeout_ms: u64,
}

impl Default for EngineFileConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            bind_timeout_ms: default_bind_timeout_ms(),
        }
    }
}

/// Socket write pacing (lives under `[socket]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketFileConfig {
    #[serde(default = "default_chunk_budget")]
    pub chunk_budget: usize,
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_close_retry_interval_ms")]
    pub close_retry_interval_ms: u64,
    #[serde(default = "default_close_max_retries")]
    pub close_max_retries: u32,
}

impl Default for SocketFileConfig {
    fn default() -> Self {
        Self {
            chunk_budget: default_chunk_budget(),
            high_water_mark: default_high_water_mark(),
            poll_interval_ms: default_poll_interval_ms(),
            close_retry_interval_ms: default_close_retry_interval_ms(),
            close_max_retries: default_close_max_retries(),
        }
    }
}

/// Framed duplex timeouts (lives under `[duplex]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DuplexFileConfig {
    #[serde(default = "default_duplex_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_duplex_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for DuplexFileConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_duplex_timeout_ms(),
            write_timeout_ms: default_duplex_timeout_ms(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_hub_url() -> String {
    "ws://127.0.0.1:8787/".to_string()
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    4_000
}
fn default_bind_timeout_ms() -> u64 {
    10_000
}
fn default_chunk_budget() -> usize {
    32 * 1024
}
fn default_high_water_mark() -> usize {
    64 * 1024 - 1
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_close_retry_interval_ms() -> u64 {
    100
}
fn default_close_max_retries() -> u32 {
    50
}
fn default_duplex_timeout_ms() -> u64 {
    8_000
}
fn default_max_frame_len() -> usize {
    16 * 1024 * 1024
}

/// Build a figment that layers: defaults → config.toml → MESH_PEER_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `MESH_PEER_HUB__URL=ws://hub:8787/`  →  `hub.url = "ws://hub:8787/"`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("MESH_PEER_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HubClientConfig {
    pub url: String,
    pub reconnect: bool,
    /// Zero retries forever.
    pub max_reconnect_attempts: u32,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for HubClientConfig {
    fn default() -> Self {
        Self::from_file(&HubFileConfig::default())
    }
}

impl HubClientConfig {
    pub fn from_file(fc: &HubFileConfig) -> Self {
        Self {
            url: fc.url.clone(),
            reconnect: fc.reconnect,
            max_reconnect_attempts: fc.max_reconnect_attempts,
            max_backoff: Duration::from_secs(fc.max_backoff_secs),
            request_timeout: Duration::from_millis(fc.request_timeout_ms),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Applied to `connect` when the caller gives no timeout.
    pub connect_timeout: Duration,
    /// How long startup waits for the hub's binding.
    pub bind_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_file(&EngineFileConfig::default())
    }
}

impl EngineConfig {
    pub fn from_file(fc: &EngineFileConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(fc.connect_timeout_ms),
            bind_timeout: Duration::from_millis(fc.bind_timeout_ms),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Bytes per write slice before dividing among open channels.
    pub chunk_budget: usize,
    /// Writes wait while the connection buffers at least this much.
    pub high_water_mark: usize,
    pub poll_interval: Duration,
    pub close_retry_interval: Duration,
    pub close_max_retries: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self::from_file(&SocketFileConfig::default())
    }
}

impl SocketConfig {
    pub fn from_file(fc: &SocketFileConfig) -> Self {
        Self {
            chunk_budget: fc.chunk_budget.max(1),
            high_water_mark: fc.high_water_mark.max(1),
            poll_interval: Duration::from_millis(fc.poll_interval_ms),
            close_retry_interval: Duration::from_millis(fc.close_retry_interval_ms),
            close_max_retries: fc.close_max_retries,
        }
    }
}

/// Largest payload the four-byte length prefix can describe.
pub const MAX_WIRE_FRAME_LEN: usize = u32::MAX as usize;

#[derive(Clone, Debug)]
pub struct DuplexConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self::from_file(&DuplexFileConfig::default())
    }
}

impl DuplexConfig {
    pub fn from_file(fc: &DuplexFileConfig) -> Self {
        Self {
            read_timeout: Duration::from_millis(fc.read_timeout_ms),
            write_timeout: Duration::from_millis(fc.write_timeout_ms),
            max_frame_len: fc.max_frame_len.min(MAX_WIRE_FRAME_LEN),
        }
    }
}

/// Everything a node needs, resolved from one [`FileConfig`].
#[derive(Clone, Debug, Default)]
pub struct PeerConfig {
    pub hub: HubClientConfig,
    pub engine: EngineConfig,
    pub socket: SocketConfig,
    pub duplex: DuplexConfig,
}

impl PeerConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            hub: HubClientConfig::from_file(&fc.hub),
            engine: EngineConfig::from_file(&fc.engine),
            socket: SocketConfig::from_file(&fc.socket),
            duplex: DuplexConfig::from_file(&fc.duplex),
        }
    }
}
