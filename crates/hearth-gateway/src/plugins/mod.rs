//! Built-in pipeline plugins.

mod log_shipper;
mod message_bus;
mod rate_limit;
mod routing;
mod security;
mod validation;

pub use log_shipper::LogShipperPlugin;
pub use message_bus::MessageBusPlugin;
pub use rate_limit::RateLimitPlugin;
pub use routing::RoutingPlugin;
pub use security::SecurityPlugin;
pub use validation::ValidationPlugin;

use std::sync::Arc;

use hearth_config::HearthConfig;

use crate::error::GatewayResult;
use crate::pipeline::PluginPipeline;
use crate::plugin::GatewayPlugin;

/// Build the pipeline from the configured built-in plugins.
///
/// Disabled plugins are constructed but dropped by the registry, so a
/// partial configuration (e.g. routing without security) fails at
/// [`PluginPipeline::finalize`] with the missing dependencies named.
///
/// # Errors
///
/// Propagates registration and finalization errors.
pub fn build_pipeline(config: &HearthConfig) -> GatewayResult<PluginPipeline> {
    let mut pipeline = PluginPipeline::new();

    let plugins: Vec<Arc<dyn GatewayPlugin>> = vec![
        Arc::new(MessageBusPlugin::from_config(config)),
        Arc::new(LogShipperPlugin::from_config(config)),
        Arc::new(SecurityPlugin::from_config(config)),
        Arc::new(RateLimitPlugin::from_config(config)),
        Arc::new(ValidationPlugin::from_config(config)),
        Arc::new(RoutingPlugin::from_config(config)),
    ];

    for plugin in plugins {
        pipeline.register(plugin)?;
    }

    pipeline.finalize()?;
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use hearth_config::PluginConfig;

    fn config_with(enabled: &[&str]) -> HearthConfig {
        let mut config = HearthConfig::default();
        config.plugins.clear();
        for name in enabled {
            config.plugins.insert(
                (*name).to_string(),
                PluginConfig {
                    enabled: true,
                    settings: Default::default(),
                },
            );
        }
        config
    }

    #[test]
    fn test_full_stack_orders_correctly() {
        let config = config_with(&[
            "message_bus",
            "log_shipper",
            "security",
            "rate_limiting",
            "validation",
            "routing",
        ]);
        let pipeline = build_pipeline(&config).unwrap();

        assert_eq!(
            pipeline.execution_order(),
            &[
                "log_shipper",
                "message_bus",
                "security",
                "rate_limiting",
                "validation",
                "routing",
            ]
        );
    }

    #[test]
    fn test_routing_alone_fails_naming_security_first() {
        let config = config_with(&["routing"]);
        let err = build_pipeline(&config).unwrap_err();
        match err {
            GatewayError::MissingPluginDependencies { plugin, missing } => {
                assert_eq!(plugin, "routing");
                assert_eq!(missing.first().map(String::as_str), Some("security"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_plugins_is_an_empty_pipeline() {
        let pipeline = build_pipeline(&config_with(&[])).unwrap();
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_default_config_builds_full_stack() {
        let pipeline = build_pipeline(&HearthConfig::default()).unwrap();
        assert_eq!(pipeline.len(), 6);
    }
}
