//! Version information.

/// The Hearth workspace version, from the crate manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name advertised in welcome frames and health responses.
pub const SERVER_NAME: &str = "hearth-gateway";
