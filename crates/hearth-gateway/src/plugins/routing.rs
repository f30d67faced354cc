//! Terminal routing stage: publish to the bus, await the reply.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use hearth_config::HearthConfig;
use hearth_core::{ApiError, ErrorKind, MessageEnvelope, RequestContext};
use hearth_events::{EventBus, EventsError};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::GatewayResult;
use crate::plugin::{GatewayPlugin, PluginMetadata, PluginPriority, SharedServices};

/// Topic prefix for inbound requests.
const REQUEST_TOPIC_PREFIX: &str = "gateway.request";

/// Pattern the routing stage watches for correlated replies.
const REPLY_PATTERN: &str = "gateway.reply.**";

/// Attempts to find a consumer before reporting the bus unavailable.
const PUBLISH_ATTEMPTS: u32 = 3;

/// Publishes the validated message on the request topic and waits for
/// the correlated reply.
///
/// The pipeline's last stage: everything before it may veto the
/// request, this stage produces the response.
pub struct RoutingPlugin {
    enabled: bool,
    bus: OnceLock<EventBus>,
    reply_timeout: Duration,
}

impl RoutingPlugin {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &HearthConfig) -> Self {
        let reply_timeout = config
            .plugin("routing")
            .settings
            .get("reply_timeout_secs")
            .and_then(toml::Value::as_integer)
            .map_or(Duration::from_secs(10), |secs| {
                Duration::from_secs(u64::try_from(secs).unwrap_or(10))
            });

        Self {
            enabled: config.plugin_enabled("routing"),
            bus: OnceLock::new(),
            reply_timeout,
        }
    }
}

#[async_trait]
impl GatewayPlugin for RoutingPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            "routing",
            "publishes validated messages on the bus and correlates replies",
            PluginPriority::Low,
        )
        .with_dependencies(vec![
            "security".into(),
            "rate_limiting".into(),
            "validation".into(),
            "message_bus".into(),
        ])
    }

    async fn initialize(&self, services: &SharedServices) -> GatewayResult<()> {
        let _ = self.bus.set(services.bus.clone());
        Ok(())
    }

    async fn process_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let Some(bus) = self.bus.get() else {
            ctx.fail(ApiError::internal("routing plugin not initialized"));
            return Ok(());
        };

        let Some(kind) = ctx.message_type.clone() else {
            ctx.fail(ApiError::bad_request(
                ErrorKind::MalformedMessage,
                "message type not resolved before routing",
            ));
            return Ok(());
        };

        let payload = ctx
            .request
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let topic = format!("{REQUEST_TOPIC_PREFIX}.{kind}");
        let envelope = MessageEnvelope::new(kind.clone(), payload, ctx.protocol.to_string());

        // The reply subscription must exist before the first publish
        // attempt, or a fast consumer could answer into the void.
        let correlation = envelope.metadata.message_id;
        let mut replies = bus.subscribe(REPLY_PATTERN);

        let mut delivered = 0usize;
        for attempt in 1..=PUBLISH_ATTEMPTS {
            delivered = bus.publish(topic.clone(), envelope.clone());
            if delivered > 0 {
                break;
            }
            warn!(topic = %topic, attempt, "No consumer for request topic");
            if attempt < PUBLISH_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
        }

        if delivered == 0 {
            ctx.fail(ApiError::unavailable(
                ErrorKind::BusUnavailable,
                format!("no handler consuming '{topic}'"),
            ));
            return Ok(());
        }

        let wait = async {
            while let Some(message) = replies.recv().await {
                if message.envelope.metadata.correlation_id == Some(correlation) {
                    return Some(message.envelope.payload.clone());
                }
            }
            None
        };

        match tokio::time::timeout(self.reply_timeout, wait).await {
            Ok(Some(payload)) => {
                debug!(kind = %kind, "Reply correlated");
                ctx.respond(payload);
            }
            Ok(None) => {
                ctx.fail(ApiError::unavailable(
                    ErrorKind::BusUnavailable,
                    "reply stream closed",
                ));
            }
            Err(_) => {
                ctx.fail(ApiError::unavailable(
                    ErrorKind::DownstreamTimeout,
                    format!("no reply for '{kind}' within {:?}", self.reply_timeout),
                ));
            }
        }

        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Convert a bus error into the routing error contract (used by
/// adapters that publish directly).
#[must_use]
pub(crate) fn bus_error_to_api(error: &EventsError) -> ApiError {
    match error {
        EventsError::ReplyTimeout(topic) => ApiError::unavailable(
            ErrorKind::DownstreamTimeout,
            format!("no reply on '{topic}'"),
        ),
        EventsError::TopicNotPermitted { .. } => {
            ApiError::forbidden("publish not permitted on this topic")
        }
        _ => ApiError::unavailable(ErrorKind::BusUnavailable, error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{ClientInfo, Protocol};
    use serde_json::json;

    fn plugin_with_bus(bus: &EventBus, timeout: Duration) -> RoutingPlugin {
        let plugin = RoutingPlugin {
            enabled: true,
            bus: OnceLock::new(),
            reply_timeout: timeout,
        };
        let _ = plugin.bus.set(bus.clone());
        plugin
    }

    fn validated_ctx(kind: &str, payload: Value) -> RequestContext {
        let mut ctx = RequestContext::new(
            Protocol::Rest,
            json!({"kind": kind, "payload": payload}),
            ClientInfo::new("127.0.0.1:1", "test", "rest"),
        );
        ctx.message_type = Some(kind.to_string());
        ctx
    }

    #[tokio::test]
    async fn test_publish_and_correlate_reply() {
        let bus = EventBus::new();
        let plugin = plugin_with_bus(&bus, Duration::from_secs(1));

        let responder_bus = bus.clone();
        let mut requests = bus.subscribe("gateway.request.echo.request");
        tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                let reply = message.envelope.reply(
                    "echo.response",
                    json!({"echo": message.envelope.payload["message"].clone()}),
                    "echo-service",
                );
                responder_bus.publish("gateway.reply.echo.request", reply);
            }
        });

        let mut ctx = validated_ctx("echo.request", json!({"message": "hi"}));
        plugin.process_request(&mut ctx).await.unwrap();

        assert!(ctx.error.is_none());
        assert_eq!(ctx.response.unwrap()["echo"], "hi");
    }

    #[tokio::test]
    async fn test_no_consumer_is_503() {
        let bus = EventBus::new();
        let plugin = plugin_with_bus(&bus, Duration::from_millis(100));

        let mut ctx = validated_ctx("echo.request", json!({}));
        plugin.process_request(&mut ctx).await.unwrap();

        let error = ctx.error.unwrap();
        assert_eq!(error.status, 503);
        assert_eq!(error.kind, ErrorKind::BusUnavailable);
    }

    #[tokio::test]
    async fn test_silent_consumer_times_out() {
        let bus = EventBus::new();
        let plugin = plugin_with_bus(&bus, Duration::from_millis(100));

        // A consumer that reads and never answers.
        let mut requests = bus.subscribe("gateway.request.**");
        tokio::spawn(async move { while requests.recv().await.is_some() {} });

        let mut ctx = validated_ctx("echo.request", json!({}));
        plugin.process_request(&mut ctx).await.unwrap();

        let error = ctx.error.unwrap();
        assert_eq!(error.status, 503);
        assert_eq!(error.kind, ErrorKind::DownstreamTimeout);
    }

    #[tokio::test]
    async fn test_unresolved_type_rejected() {
        let bus = EventBus::new();
        let plugin = plugin_with_bus(&bus, Duration::from_millis(100));

        let mut ctx = RequestContext::new(
            Protocol::Rest,
            json!({"kind": "echo.request"}),
            ClientInfo::new("127.0.0.1:1", "test", "rest"),
        );
        // message_type never set (validation did not run).
        plugin.process_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.error.unwrap().kind, ErrorKind::MalformedMessage);
    }
}
