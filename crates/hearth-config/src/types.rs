//! Configuration types.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Top-level Hearth configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HearthConfig {
    /// Gateway-level settings.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Protocol adapter configuration.
    #[serde(default)]
    pub protocols: ProtocolsConfig,

    /// Session-encrypted transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Embedded event bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Per-plugin configuration keyed by plugin name.
    ///
    /// When the section is absent entirely, the standard stack is
    /// enabled. Any explicit `[plugins.*]` table replaces the whole
    /// set, so a partial listing loads exactly the plugins it names.
    #[serde(default = "default_plugins")]
    pub plugins: HashMap<String, PluginConfig>,

    /// Rate limiting settings used by the rate-limit plugin.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Task scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Persistent storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings::default(),
            protocols: ProtocolsConfig::default(),
            transport: TransportConfig::default(),
            bus: BusConfig::default(),
            plugins: default_plugins(),
            rate_limit: RateLimitConfig::default(),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl HearthConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid TOML.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Configuration for a named plugin, or a default-disabled entry.
    #[must_use]
    pub fn plugin(&self, name: &str) -> PluginConfig {
        self.plugins.get(name).cloned().unwrap_or_default()
    }

    /// Whether a named plugin is enabled.
    #[must_use]
    pub fn plugin_enabled(&self, name: &str) -> bool {
        self.plugins.get(name).is_some_and(|p| p.enabled)
    }
}

/// Gateway-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Advertised server name.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Protocol adapter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolsConfig {
    /// Request/reply HTTP adapter.
    #[serde(default)]
    pub rest: RestProtocolConfig,

    /// Bidirectional session adapter.
    #[serde(default)]
    pub websocket: WebSocketProtocolConfig,

    /// Local IPC adapter.
    #[serde(default)]
    pub ipc: IpcProtocolConfig,
}

/// REST adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestProtocolConfig {
    /// Whether the adapter is started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_rest_port")]
    pub port: u16,
}

impl Default for RestProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_rest_port(),
        }
    }
}

/// WebSocket adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketProtocolConfig {
    /// Whether the adapter is started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_ws_port")]
    pub port: u16,

    /// Heartbeat interval in seconds. Connections silent for three
    /// intervals are closed by the sweeper.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Maximum concurrently open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for WebSocketProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_ws_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_connections: default_max_connections(),
        }
    }
}

/// IPC adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcProtocolConfig {
    /// Whether the adapter is started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filesystem path of the Unix domain socket (or named pipe).
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Loopback fallback host used when the primary transport fails.
    #[serde(default = "default_host")]
    pub fallback_host: String,

    /// Loopback fallback port.
    #[serde(default = "default_ipc_port")]
    pub fallback_port: u16,
}

impl Default for IpcProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: default_socket_path(),
            fallback_host: default_host(),
            fallback_port: default_ipc_port(),
        }
    }
}

/// Session-encrypted transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Master switch for the transport layer.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// When true, protected paths without a valid session are rejected.
    #[serde(default = "default_true")]
    pub require_encryption: bool,

    /// Handshake endpoint path.
    #[serde(default = "default_handshake_path")]
    pub handshake_path: String,

    /// Paths that bypass the transport layer entirely.
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,

    /// Session lifetime settings.
    #[serde(default)]
    pub session: SessionSettings,

    /// Message size and compression settings.
    #[serde(default)]
    pub message: MessageLimits,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_encryption: true,
            handshake_path: default_handshake_path(),
            public_paths: default_public_paths(),
            session: SessionSettings::default(),
            message: MessageLimits::default(),
        }
    }
}

/// Session lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Session lifetime in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,

    /// Handshake completion timeout in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Maximum live sessions per client identity.
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_client: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_sessions_per_client: default_max_sessions(),
        }
    }
}

/// Message size and compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLimits {
    /// Maximum payload size in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload_size: usize,

    /// Whether payload compression is negotiated.
    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    /// Minimum payload size before compression kicks in.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload(),
            compression_enabled: true,
            compression_threshold: default_compression_threshold(),
        }
    }
}

/// Embedded event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Loopback bind host for external module connections.
    #[serde(default = "default_host")]
    pub bind_host: String,

    /// Loopback bind port; 0 disables the TCP listener.
    #[serde(default = "default_bus_port")]
    pub bind_port: u16,

    /// Per-subscriber channel capacity.
    #[serde(default = "default_bus_capacity")]
    pub channel_capacity: usize,

    /// Whether published envelopes are archived to the database.
    #[serde(default = "default_true")]
    pub persist_events: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bind_host: default_host(),
            bind_port: default_bus_port(),
            channel_capacity: default_bus_capacity(),
            persist_events: true,
        }
    }
}

/// Configuration for a single plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Whether the plugin is loaded into the pipeline.
    #[serde(default)]
    pub enabled: bool,

    /// Free-form plugin settings.
    #[serde(default)]
    pub settings: HashMap<String, toml::Value>,
}

/// Rate limiting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained requests per minute per client.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Burst allowance on top of the sustained rate.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
        }
    }
}

/// Task scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick loop interval in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Wall-clock timeout for a single task execution, in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// TTL for execution locks, in seconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Directory scanned for `<task_id>.trigger` files.
    #[serde(default = "default_trigger_dir")]
    pub trigger_dir: String,

    /// Days of execution history kept by the cleanup task.
    #[serde(default = "default_retention_days")]
    pub history_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            task_timeout_secs: default_task_timeout(),
            lock_ttl_secs: default_lock_ttl(),
            trigger_dir: default_trigger_dir(),
            history_retention_days: default_retention_days(),
        }
    }
}

/// Persistent storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Optional at-rest encryption key, applied as a key pragma on
    /// cipher-enabled SQLite builds.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            encryption_key: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Built-in plugins loaded when no `[plugins.*]` table is present.
const STANDARD_PLUGINS: [&str; 6] = [
    "message_bus",
    "log_shipper",
    "security",
    "rate_limiting",
    "validation",
    "routing",
];

fn default_plugins() -> HashMap<String, PluginConfig> {
    STANDARD_PLUGINS
        .iter()
        .map(|name| {
            (
                (*name).to_string(),
                PluginConfig {
                    enabled: true,
                    settings: HashMap::new(),
                },
            )
        })
        .collect()
}

fn default_server_name() -> String {
    "hearth-gateway".to_string()
}

fn default_shutdown_timeout() -> u64 {
    15
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rest_port() -> u16 {
    8771
}

fn default_ws_port() -> u16 {
    8772
}

fn default_ipc_port() -> u16 {
    8773
}

fn default_bus_port() -> u16 {
    8774
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_socket_path() -> String {
    "/tmp/hearth/daemon.sock".to_string()
}

fn default_handshake_path() -> String {
    "/api/v1/handshake".to_string()
}

fn default_public_paths() -> Vec<String> {
    vec![
        "/api/v1/health".to_string(),
        "/api/v1/health/detailed".to_string(),
        "/api/v1/handshake".to_string(),
    ]
}

fn default_session_timeout() -> u64 {
    3600
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_max_sessions() -> usize {
    5
}

fn default_max_payload() -> usize {
    1_048_576
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_requests_per_minute() -> u32 {
    300
}

fn default_burst() -> u32 {
    50
}

fn default_tick_interval() -> u64 {
    1
}

fn default_task_timeout() -> u64 {
    3600
}

fn default_lock_ttl() -> u64 {
    3600
}

fn default_trigger_dir() -> String {
    "/tmp/hearth/scheduler/triggers".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_db_path() -> String {
    "/tmp/hearth/hearth.db".to_string()
}
