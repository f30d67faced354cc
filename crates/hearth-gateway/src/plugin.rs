//! Plugin contract for the request pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_config::HearthConfig;
use hearth_core::RequestContext;
use hearth_events::EventBus;
use hearth_storage::Database;

use crate::error::GatewayResult;
use crate::session::{AuthTokens, SessionManager};

/// Coarse execution bands; lower values run earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginPriority {
    /// Infrastructure plugins (bus hosting, log shipping).
    Infrastructure = 0,
    /// Authentication and authorization.
    Security = 20,
    /// Rate limiting.
    High = 40,
    /// Message validation.
    Medium = 60,
    /// Routing; terminal stages.
    Low = 80,
}

impl PluginPriority {
    /// Numeric band value used for ordering.
    #[must_use]
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Immutable plugin metadata, declared once at registration.
#[derive(Debug, Clone)]
pub struct PluginMetadata {
    /// Plugin name, unique within the registry.
    pub name: String,
    /// Plugin version string.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Execution band.
    pub priority: PluginPriority,
    /// Names of plugins that must load before this one, in declared
    /// order (error messages preserve it).
    pub dependencies: Vec<String>,
}

impl PluginMetadata {
    /// Create metadata with no dependencies.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        priority: PluginPriority,
    ) -> Self {
        Self {
            name: name.into(),
            version: hearth_core::VERSION.to_string(),
            description: description.into(),
            priority,
            dependencies: Vec::new(),
        }
    }

    /// Declare dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Shared handles passed to plugins at initialization.
///
/// Plugins receive everything they need here and never reach back into
/// the gateway core.
#[derive(Clone)]
pub struct SharedServices {
    /// Full runtime configuration.
    pub config: Arc<HearthConfig>,
    /// The embedded event bus.
    pub bus: EventBus,
    /// Session channel map and handshake processing.
    pub sessions: Arc<SessionManager>,
    /// Session token issuer/validator.
    pub auth: Arc<AuthTokens>,
    /// Database handle.
    pub db: Database,
}

impl std::fmt::Debug for SharedServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedServices").finish_non_exhaustive()
    }
}

/// A re-entrant interceptor in the request pipeline.
///
/// Plugins mutate the [`RequestContext`]: setting `error` or
/// `skip_remaining` stops traversal. Returning `Err` signals an
/// unexpected fault; the pipeline coerces it to a 500 without killing
/// the server.
#[async_trait]
pub trait GatewayPlugin: Send + Sync {
    /// Plugin metadata.
    fn metadata(&self) -> PluginMetadata;

    /// Initialize with shared services. Called once before the first
    /// request.
    async fn initialize(&self, services: &SharedServices) -> GatewayResult<()>;

    /// Process an inbound request.
    async fn process_request(&self, ctx: &mut RequestContext) -> GatewayResult<()>;

    /// Process the outbound response (reverse pass). Default is a
    /// no-op.
    async fn process_response(&self, _ctx: &mut RequestContext) -> GatewayResult<()> {
        Ok(())
    }

    /// Release resources. Bounded to five seconds by the pipeline.
    async fn shutdown(&self) {}

    /// Whether the plugin participates in the pipeline.
    fn is_enabled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(PluginPriority::Infrastructure < PluginPriority::Security);
        assert!(PluginPriority::Security < PluginPriority::High);
        assert!(PluginPriority::High < PluginPriority::Medium);
        assert!(PluginPriority::Medium < PluginPriority::Low);
        assert_eq!(PluginPriority::Security.value(), 20);
    }

    #[test]
    fn test_metadata_builder() {
        let metadata = PluginMetadata::new("routing", "routes messages", PluginPriority::Low)
            .with_dependencies(vec!["security".into(), "validation".into()]);
        assert_eq!(metadata.name, "routing");
        assert_eq!(metadata.dependencies.len(), 2);
    }
}
