//! Gateway error types.

use thiserror::Error;

/// Errors raised by the gateway core and its components.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A service name was registered twice.
    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),

    /// A service name is unknown to the container.
    #[error("service '{0}' is not registered")]
    NotFound(String),

    /// Service construction recursed into itself.
    #[error("circular dependency detected involving service '{0}'")]
    CircularDependency(String),

    /// A service factory or lifecycle call failed.
    #[error("service '{name}' failed during {phase}: {reason}")]
    ServiceFailed {
        /// Service name.
        name: String,
        /// Lifecycle phase (construct, initialize, start).
        phase: &'static str,
        /// Failure description.
        reason: String,
    },

    /// A plugin name was registered twice.
    #[error("plugin '{0}' is already registered")]
    PluginAlreadyRegistered(String),

    /// An enabled plugin depends on plugins that are not loaded.
    #[error("plugin '{plugin}' is missing dependencies: {}", missing.join(", "))]
    MissingPluginDependencies {
        /// The plugin whose dependencies are unsatisfied.
        plugin: String,
        /// Missing dependency names, in the plugin's declared order.
        missing: Vec<String>,
    },

    /// The plugin dependency graph contains a cycle.
    #[error("plugin dependency cycle involving '{0}'")]
    PluginDependencyCycle(String),

    /// A plugin failed to initialize.
    #[error("plugin '{plugin}' failed to initialize: {reason}")]
    PluginInitFailed {
        /// Plugin name.
        plugin: String,
        /// Failure description.
        reason: String,
    },

    /// An adapter failed to bind or start.
    #[error("adapter '{adapter}' failed to start: {reason}")]
    AdapterStartFailed {
        /// Adapter name.
        adapter: String,
        /// Failure description.
        reason: String,
    },

    /// Session transport failure.
    #[error(transparent)]
    Crypto(#[from] hearth_crypto::CryptoError),

    /// Event bus failure.
    #[error(transparent)]
    Events(#[from] hearth_events::EventsError),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] hearth_storage::StorageError),

    /// Scheduler failure.
    #[error(transparent)]
    Scheduler(#[from] hearth_scheduler::SchedulerError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
