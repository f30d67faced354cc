//! Ships request logs onto the bus for the log-persistence consumer.

use std::sync::OnceLock;

use async_trait::async_trait;
use hearth_config::HearthConfig;
use hearth_core::{MessageEnvelope, RequestContext};
use hearth_events::ModuleClient;
use serde_json::json;

use crate::error::GatewayResult;
use crate::plugin::{GatewayPlugin, PluginMetadata, PluginPriority, SharedServices};

/// Topic the shipper publishes request logs on.
const LOG_TOPIC: &str = "logs.gateway.request";

/// Publishes a log envelope for every completed request.
///
/// Runs in the reverse pass so the outcome (response or error) is
/// known. Shipping never affects the request: the scoped client's
/// failures are swallowed.
pub struct LogShipperPlugin {
    enabled: bool,
    client: OnceLock<ModuleClient>,
}

impl LogShipperPlugin {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &HearthConfig) -> Self {
        Self {
            enabled: config.plugin_enabled("log_shipper"),
            client: OnceLock::new(),
        }
    }
}

#[async_trait]
impl GatewayPlugin for LogShipperPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            "log_shipper",
            "publishes request logs onto the bus",
            PluginPriority::Infrastructure,
        )
    }

    async fn initialize(&self, services: &SharedServices) -> GatewayResult<()> {
        let client = services
            .bus
            .register_module("log_shipper", vec!["logs.**".to_string()]);
        let _ = self.client.set(client);
        Ok(())
    }

    async fn process_request(&self, _ctx: &mut RequestContext) -> GatewayResult<()> {
        Ok(())
    }

    async fn process_response(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let Some(client) = self.client.get() else {
            return Ok(());
        };

        let entry = json!({
            "protocol": ctx.protocol.to_string(),
            "transport": ctx.client.transport,
            "message_type": ctx.message_type,
            "authenticated": ctx.is_authenticated(),
            "status": ctx.error.as_ref().map_or(200, |error| error.status),
            "error": ctx.error.as_ref().map(|error| error.kind.as_str()),
        });

        let envelope = MessageEnvelope::new("log.gateway_request", entry, "log_shipper");
        let _ = client.publish(LOG_TOPIC, envelope);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
