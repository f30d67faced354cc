//! API gateway core for the Hearth runtime.
//!
//! This crate wires the pieces the rest of the workspace provides into
//! a running gateway:
//!
//! - a [`container::ServiceContainer`] resolving service factories in
//!   dependency order with lifecycle management,
//! - a [`pipeline::PluginPipeline`] running every inbound request
//!   through the ordered interceptor chain (security, rate limiting,
//!   validation, routing),
//! - the session-encrypted transport layer wrapping the REST surface
//!   at the byte level,
//! - protocol adapters for request/reply HTTP, bidirectional
//!   WebSocket sessions, and local IPC,
//! - the scheduler's administrative API.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod adapters;
pub mod container;
pub mod core;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod routes;
pub mod session;
pub mod transport;

pub use container::{Service, ServiceContainer, ServiceState};
pub use core::GatewayCore;
pub use error::{GatewayError, GatewayResult};
pub use pipeline::PluginPipeline;
pub use plugin::{GatewayPlugin, PluginMetadata, PluginPriority, SharedServices};
pub use session::{AuthTokens, SessionManager};
pub use transport::TransportLayer;
