//! Authentication and authorization plugin.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use hearth_config::HearthConfig;
use hearth_core::{ApiError, ErrorKind, Principal, RequestContext};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::plugin::{GatewayPlugin, PluginMetadata, PluginPriority, SharedServices};
use crate::session::AuthTokens;

/// Message-type prefixes that require the `admin` role.
const ADMIN_PREFIXES: [&str; 2] = ["admin.", "scheduler."];

/// Validates session tokens and gates privileged message types.
pub struct SecurityPlugin {
    enabled: bool,
    auth: OnceLock<Arc<AuthTokens>>,
}

impl SecurityPlugin {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &HearthConfig) -> Self {
        Self {
            enabled: config.plugin_enabled("security"),
            auth: OnceLock::new(),
        }
    }

    fn extract_token(ctx: &RequestContext) -> Option<String> {
        // REST requests carry the header; frame protocols put the
        // token in the message itself.
        if let Some(header) = ctx.client.attributes.get("authorization") {
            if let Some(token) = header.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
        ctx.request
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn requested_kind(ctx: &RequestContext) -> Option<String> {
        ctx.message_type.clone().or_else(|| {
            ctx.request
                .get("kind")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }
}

#[async_trait]
impl GatewayPlugin for SecurityPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            "security",
            "session token authentication and role-based authorization",
            PluginPriority::Security,
        )
    }

    async fn initialize(&self, services: &SharedServices) -> GatewayResult<()> {
        let _ = self.auth.set(Arc::clone(&services.auth));
        Ok(())
    }

    async fn process_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let Some(auth) = self.auth.get() else {
            ctx.fail(ApiError::internal("security plugin not initialized"));
            return Ok(());
        };

        let principal = if let Some(token) = Self::extract_token(ctx) {
            match auth.validate(&token) {
                Ok(principal) => principal,
                Err(error) => {
                    ctx.fail(error);
                    return Ok(());
                }
            }
        } else if let Some(client_id) = ctx
            .client
            .attributes
            .get(crate::transport::SESSION_ATTESTATION_HEADER)
        {
            // A verified session channel authenticates the local user;
            // the transport layer strips this attribute from anything
            // a client sent itself.
            Principal {
                user_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, client_id.as_bytes()),
                roles: vec!["user".to_string()],
                auth_method: "session_channel".to_string(),
            }
        } else {
            ctx.fail(ApiError::unauthorized(
                ErrorKind::MissingCredential,
                "authentication required",
            ));
            return Ok(());
        };

        if let Some(kind) = Self::requested_kind(ctx) {
            let privileged = ADMIN_PREFIXES.iter().any(|prefix| kind.starts_with(prefix));
            if privileged && !principal.has_role("admin") {
                debug!(kind, user = %principal.user_id, "Privileged message type denied");
                ctx.fail(ApiError::forbidden(format!(
                    "message type '{kind}' requires the admin role"
                )));
                return Ok(());
            }
        }

        ctx.principal = Some(principal);
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
    use uuid::Uuid;

    async fn services_with_auth() -> (SharedServices, Arc<AuthTokens>) {
        let auth = Arc::new(AuthTokens::new(3600));
        let services = crate::core::test_support::shared_services(Arc::clone(&auth)).await;
        (services, auth)
    }

    fn enabled_plugin() -> SecurityPlugin {
        let mut config = HearthConfig::default();
        config.plugins.insert(
            "security".into(),
            hearth_config::PluginConfig {
                enabled: true,
                settings: Default::default(),
            },
        );
        SecurityPlugin::from_config(&config)
    }

    fn ctx_with(request: Value) -> RequestContext {
        RequestContext::new(
            Protocol::Rest,
            request,
            ClientInfo::new("127.0.0.1:1", "test", "rest"),
        )
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let (services, _) = services_with_auth().await;
        let plugin = enabled_plugin();
        plugin.initialize(&services).await.unwrap();

        let mut ctx = ctx_with(json!({"kind": "echo.request"}));
        plugin.process_request(&mut ctx).await.unwrap();

        let error = ctx.error.unwrap();
        assert_eq!(error.status, 401);
        assert_eq!(error.kind, ErrorKind::MissingCredential);
    }

    #[tokio::test]
    async fn test_valid_token_sets_principal() {
        let (services, auth) = services_with_auth().await;
        let plugin = enabled_plugin();
        plugin.initialize(&services).await.unwrap();

        let user_id = Uuid::new_v4();
        let token = auth.issue(user_id, &["user".into()]);
        let mut ctx = ctx_with(json!({"kind": "echo.request", "token": token}));

        plugin.process_request(&mut ctx).await.unwrap();
        assert!(ctx.error.is_none());
        assert_eq!(ctx.principal.unwrap().user_id, user_id);
    }

    #[tokio::test]
    async fn test_bearer_header_accepted() {
        let (services, auth) = services_with_auth().await;
        let plugin = enabled_plugin();
        plugin.initialize(&services).await.unwrap();

        let token = auth.issue(Uuid::new_v4(), &["user".into()]);
        let mut ctx = ctx_with(json!({"kind": "echo.request"}));
        ctx.client
            .attributes
            .insert("authorization".into(), format!("Bearer {token}"));

        plugin.process_request(&mut ctx).await.unwrap();
        assert!(ctx.principal.is_some());
    }

    #[tokio::test]
    async fn test_admin_kind_requires_admin_role() {
        let (services, auth) = services_with_auth().await;
        let plugin = enabled_plugin();
        plugin.initialize(&services).await.unwrap();

        let token = auth.issue(Uuid::new_v4(), &["user".into()]);
        let mut ctx = ctx_with(json!({"kind": "scheduler.command", "token": token}));
        plugin.process_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.error.unwrap().status, 403);

        let token = auth.issue(Uuid::new_v4(), &["admin".into()]);
        let mut ctx = ctx_with(json!({"kind": "scheduler.command", "token": token}));
        plugin.process_request(&mut ctx).await.unwrap();
        assert!(ctx.error.is_none());
    }

    #[tokio::test]
    async fn test_session_attestation_authenticates() {
        let (services, _) = services_with_auth().await;
        let plugin = enabled_plugin();
        plugin.initialize(&services).await.unwrap();

        let mut ctx = ctx_with(json!({"kind": "echo.request"}));
        ctx.client.attributes.insert(
            crate::transport::SESSION_ATTESTATION_HEADER.to_string(),
            "abcd1234abcd1234".to_string(),
        );

        plugin.process_request(&mut ctx).await.unwrap();
        assert!(ctx.error.is_none());

        let principal = ctx.principal.unwrap();
        assert_eq!(principal.auth_method, "session_channel");
        assert!(principal.has_role("user"));
        // Session-derived principals are not admins.
        let mut ctx = ctx_with(json!({"kind": "admin.command"}));
        ctx.client.attributes.insert(
            crate::transport::SESSION_ATTESTATION_HEADER.to_string(),
            "abcd1234abcd1234".to_string(),
        );
        plugin.process_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.error.unwrap().status, 403);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let (services, _) = services_with_auth().await;
        let plugin = enabled_plugin();
        plugin.initialize(&services).await.unwrap();

        let mut ctx = ctx_with(json!({"kind": "echo.request", "token": "garbage"}));
        plugin.process_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.error.unwrap().kind, ErrorKind::InvalidCredential);
    }
}
