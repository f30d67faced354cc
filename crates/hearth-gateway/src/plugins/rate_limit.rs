//! Per-client token-bucket rate limiting.

use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use hearth_config::{HearthConfig, RateLimitConfig};
use hearth_core::{ApiError, RequestContext};
use tracing::debug;

use crate::error::GatewayResult;
use crate::plugin::{GatewayPlugin, PluginMetadata, PluginPriority, SharedServices};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by client identity.
///
/// Buckets are keyed by the authenticated principal when one is
/// attached (the plugin runs after security), falling back to the
/// remote IP. The ephemeral source port never participates, so
/// reconnecting does not mint a fresh bucket.
///
/// Buckets refill continuously at `requests_per_minute / 60` per
/// second up to a capacity of `burst`. An exhausted bucket yields 429.
pub struct RateLimitPlugin {
    enabled: bool,
    limits: OnceLock<RateLimitConfig>,
    buckets: DashMap<String, Bucket>,
}

impl RateLimitPlugin {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &HearthConfig) -> Self {
        Self {
            enabled: config.plugin_enabled("rate_limiting"),
            limits: OnceLock::new(),
            buckets: DashMap::new(),
        }
    }

    fn limiter_key(ctx: &RequestContext) -> String {
        match &ctx.principal {
            Some(principal) => format!("user:{}", principal.user_id),
            None => format!("addr:{}", ctx.client.remote_ip()),
        }
    }

    fn try_acquire(&self, client_key: &str) -> bool {
        let limits = self.limits.get().cloned().unwrap_or_default();
        let rate_per_sec = f64::from(limits.requests_per_minute) / 60.0;
        let capacity = f64::from(limits.burst).max(1.0);

        let mut bucket = self
            .buckets
            .entry(client_key.to_string())
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            });

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(capacity);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl GatewayPlugin for RateLimitPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(
            "rate_limiting",
            "per-client token bucket rate limiting",
            PluginPriority::High,
        )
        .with_dependencies(vec!["security".into()])
    }

    async fn initialize(&self, services: &SharedServices) -> GatewayResult<()> {
        let _ = self.limits.set(services.config.rate_limit.clone());
        Ok(())
    }

    async fn process_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let key = Self::limiter_key(ctx);
        if !self.try_acquire(&key) {
            debug!(client = %key, "Rate limit exceeded");
            ctx.fail(ApiError::rate_limited("request quota exceeded"));
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
