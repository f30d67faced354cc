//! Configuration for the Hearth gateway runtime.
//!
//! One TOML file configures the whole daemon. Every section has full
//! serde defaults so an empty file (or no file at all) yields a
//! runnable local configuration.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod error;
mod types;

pub use error::{ConfigError, ConfigResult};
pub use types::{
    BusConfig, GatewaySettings, HearthConfig, IpcProtocolConfig, MessageLimits, PluginConfig,
    ProtocolsConfig, RateLimitConfig, RestProtocolConfig, SchedulerConfig, SessionSettings,
    StorageConfig, TransportConfig, WebSocketProtocolConfig,
};
