//! Message envelope validation and type dispatch.

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use hearth_config::HearthConfig;
use hearth_core::{ApiError, ErrorKind, RequestContext};
use serde_json::Value;

use crate::error::GatewayResult;
use crate::plugin::{GatewayPlugin, PluginMetadata, PluginPriority, SharedServices};

/// Message kinds the gateway dispatches. Payloads are routed by this
/// tag through a static table; anything else is rejected before it can
/// reach the bus.
const KNOWN_KINDS: [&str; 7] = [
    "echo.request",
    "conversation.message",
    "users.query",
    "admin.command",
    "logs.query",
    "scheduler.command",
    "system.ping",
];

/// Validates inbound messages against the envelope contract.
pub struct ValidationPlugin {
    enabled: bool,
    max_payload_size: OnceLock<usize>,
    known_kinds: HashSet<&'static str>,
}

impl ValidationPlugin {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &HearthConfig) -> Self {
        Self {
            enabled: config.plugin_enabled("validation"),
            max_payload_size: OnceLock::new(),
            known_kinds: KNOWN_KINDS.iter().copied().collect(),
        }
    }

    fn validate(&self, ctx: &RequestContext) -> Result<String, ApiError> {
        let Some(body) = ctx.request.as_object() else {
            return Err(ApiError::bad_request(
                ErrorKind::MalformedMessage,
                "message body must be a JSON object",
            ));
        };

        let kind = body
            .get("kind")
            .and_then(Value::as_str)
            .filter(|kind| !kind.is_empty())
            .ok_or_else(|| {
                ApiError::bad_request(
                    ErrorKind::MalformedMessage,
                    "message requires a non-empty 'kind' field",
                )
            })?;

        if !self.known_kinds.contains(kind) {
            return Err(ApiError::bad_request(
                ErrorKind::UnknownMessageType,
                format!("unknown message type: {kind}"),
            ));
        }

        if let Some(payload) = body.get("payload") {
            if !payload.is_object() {
                return Err(ApiError::bad_request(
                    ErrorKind::SchemaViolation,
                    "'payload' must be a JSON object",
                ));
            }
        }

        let max = self.max_payload_size.get().copied().unwrap_or(1_048_576);
        let size = ctx.request.to_string().len();
        if size > max {
            return Err(ApiError::new(
                413,
                ErrorKind::PayloadTooLarge,
                format!("message of {size} bytes exceeds the {max} byte limit"),
            ));
        }

        Ok(kind.to_string())
    }
}

#[async_trait]
impl GatewayPlugin for ValidationPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            "validation",
            "message envelope validation and type dispatch",
            PluginPriority::Medium,
        )
        .with_dependencies(vec!["security".into()])
    }

    async fn initialize(&self, services: &SharedServices) -> GatewayResult<()> {
        let _ = self
            .max_payload_size
            .set(services.config.transport.message.max_payload_size);
        Ok(())
    }

    async fn process_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        match self.validate(ctx) {
            Ok(kind) => ctx.message_type = Some(kind),
            Err(error) => ctx.fail(error),
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{ClientInfo, Protocol};
    use serde_json::json;

    fn plugin() -> ValidationPlugin {
        let mut config = HearthConfig::default();
        config.plugins.insert(
            "validation".into(),
            hearth_config::PluginConfig {
                enabled: true,
                settings: Default::default(),
            },
        );
        ValidationPlugin::from_config(&config)
    }

    fn ctx_with(request: Value) -> RequestContext {
        RequestContext::new(
            Protocol::WebSocket,
            request,
            ClientInfo::new("127.0.0.1:1", "test", "websocket"),
        )
    }

    #[tokio::test]
    async fn test_known_kind_sets_message_type() {
        let plugin = plugin();
        let mut ctx = ctx_with(json!({"kind": "echo.request", "payload": {"message": "hi"}}));
        plugin.process_request(&mut ctx).await.unwrap();

        assert!(ctx.error.is_none());
        assert_eq!(ctx.message_type.as_deref(), Some("echo.request"));
    }

    #[tokio::test]
    async fn test_missing_kind_is_malformed() {
        let plugin = plugin();
        let mut ctx = ctx_with(json!({"payload": {}}));
        plugin.process_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.error.unwrap().kind, ErrorKind::MalformedMessage);
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let plugin = plugin();
        let mut ctx = ctx_with(json!({"kind": "nonsense.kind"}));
        plugin.process_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.error.unwrap().kind, ErrorKind::UnknownMessageType);
    }

    #[tokio::test]
    async fn test_non_object_body_rejected() {
        let plugin = plugin();
        let mut ctx = ctx_with(json!("just a string"));
        plugin.process_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.error.unwrap().kind, ErrorKind::MalformedMessage);
    }

    #[tokio::test]
    async fn test_non_object_payload_rejected() {
        let plugin = plugin();
        let mut ctx = ctx_with(json!({"kind": "echo.request", "payload": [1, 2, 3]}));
        plugin.process_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.error.unwrap().kind, ErrorKind::SchemaViolation);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let plugin = plugin();
        let _ = plugin.max_payload_size.set(64);

        let mut ctx = ctx_with(json!({
            "kind": "echo.request",
            "payload": {"filler": "x".repeat(256)},
        }));
        plugin.process_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.error.unwrap().status, 413);
    }
}
