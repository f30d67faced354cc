//! Infrastructure plugin hosting the embedded event bus.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use hearth_config::HearthConfig;
use hearth_core::RequestContext;
use hearth_events::EventBus;
use hearth_storage::EventArchive;
use tracing::info;

use crate::error::GatewayResult;
use crate::plugin::{GatewayPlugin, PluginMetadata, PluginPriority, SharedServices};

/// Hosts the embedded broker for the pipeline.
///
/// Does no per-request work; it exists so that routing can declare the
/// bus as a hard dependency, and it wires the persistence hook that
/// archives every published envelope when `bus.persist_events` is set.
pub struct MessageBusPlugin {
    enabled: bool,
    persist_events: bool,
    bus: OnceLock<EventBus>,
}

impl MessageBusPlugin {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &HearthConfig) -> Self {
        Self {
            enabled: config.plugin_enabled("message_bus"),
            persist_events: config.bus.persist_events,
            bus: OnceLock::new(),
        }
    }
}

#[async_trait]
impl GatewayPlugin for MessageBusPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            "message_bus",
            "embedded publish/subscribe broker host",
            PluginPriority::Infrastructure,
        )
    }

    async fn initialize(&self, services: &SharedServices) -> GatewayResult<()> {
        let _ = self.bus.set(services.bus.clone());

        if self.persist_events {
            let archive = Arc::new(EventArchive::new(services.db.clone()));
            services.bus.enable_persistence(Arc::new(move |message| {
                let archive = Arc::clone(&archive);
                Box::pin(async move {
                    archive
                        .append(&message.topic, &message.envelope)
                        .await
                        .map_err(|err| err.to_string())
                })
            }));
            info!("Event persistence enabled");
        }

        Ok(())
    }

    async fn process_request(&self, _ctx: &mut RequestContext) -> GatewayResult<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
