//! Protocol adapters and their supervisor.

mod ipc;
mod rest;
mod websocket;

pub use ipc::IpcAdapter;
pub use rest::{RestAdapter, RestState};
pub use websocket::WebSocketAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::{ApiError, ClientInfo, Protocol, RequestContext};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::PluginPipeline;
use crate::plugin::SharedServices;

/// Dependency bundle injected into adapters at initialization.
#[derive(Clone)]
pub struct AdapterDeps {
    /// Shared service handles (config, bus, sessions, auth, db).
    pub services: SharedServices,
    /// The request pipeline every adapter feeds.
    pub pipeline: Arc<PluginPipeline>,
    /// The scheduler, surfaced by the REST admin API.
    pub scheduler: Arc<hearth_scheduler::TaskScheduler>,
}

impl std::fmt::Debug for AdapterDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterDeps").finish_non_exhaustive()
    }
}

/// A component terminating one client protocol.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Stable protocol name (`rest`, `websocket`, `ipc`).
    fn protocol_name(&self) -> &'static str;

    /// Receive the dependency bundle. Called once before `start`.
    async fn initialize(&self, deps: &AdapterDeps) -> GatewayResult<()>;

    /// Bind listeners and spawn the accept loop.
    async fn start(&self) -> GatewayResult<()>;

    /// Cancel the accept loop and close open connections.
    async fn stop(&self);

    /// Run one decoded payload through the pipeline.
    async fn handle_request(&self, payload: Value, client: ClientInfo) -> Result<Value, ApiError>;

    /// Adapter health payload.
    async fn health_check(&self) -> Value {
        json!({"protocol": self.protocol_name()})
    }
}

/// Drive one payload through the pipeline and collapse the context
/// into a result. Shared by every adapter's `handle_request`.
pub(crate) async fn run_pipeline(
    pipeline: &PluginPipeline,
    protocol: Protocol,
    payload: Value,
    client: ClientInfo,
) -> Result<Value, ApiError> {
    let mut ctx = RequestContext::new(protocol, payload, client);
    pipeline.handle(&mut ctx).await;

    match (ctx.response, ctx.error) {
        (_, Some(error)) => Err(error),
        (Some(response), None) => Ok(response),
        // The pipeline guarantees one of the two is set.
        (None, None) => Err(ApiError::internal("pipeline produced no outcome")),
    }
}

/// Registers, initializes, and supervises protocol adapters.
pub struct AdapterManager {
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
}

impl AdapterManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Register an adapter.
    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        info!(protocol = adapter.protocol_name(), "Adapter registered");
        self.adapters.push(adapter);
    }

    /// Names of registered adapters.
    #[must_use]
    pub fn protocol_names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.protocol_name()).collect()
    }

    /// Initialize every adapter with the dependency bundle.
    ///
    /// # Errors
    ///
    /// Propagates the first initialization failure.
    pub async fn initialize_all(&self, deps: &AdapterDeps) -> GatewayResult<()> {
        for adapter in &self.adapters {
            adapter.initialize(deps).await?;
        }
        Ok(())
    }

    /// Start every adapter; on failure, stop the ones already running.
    ///
    /// # Errors
    ///
    /// Returns the failing adapter's error after rollback.
    pub async fn start_all(&self) -> GatewayResult<()> {
        let mut started: Vec<&Arc<dyn ProtocolAdapter>> = Vec::new();

        for adapter in &self.adapters {
            if let Err(err) = adapter.start().await {
                error!(
                    protocol = adapter.protocol_name(),
                    error = %err,
                    "Adapter failed to start, rolling back"
                );
                for adapter in started.iter().rev() {
                    adapter.stop().await;
                }
                return Err(GatewayError::AdapterStartFailed {
                    adapter: adapter.protocol_name().to_string(),
                    reason: err.to_string(),
                });
            }
            started.push(adapter);
        }

        info!(protocols = ?self.protocol_names(), "All adapters started");
        Ok(())
    }

    /// Stop every adapter in reverse registration order.
    pub async fn stop_all(&self) {
        for adapter in self.adapters.iter().rev() {
            adapter.stop().await;
            info!(protocol = adapter.protocol_name(), "Adapter stopped");
        }
    }

    /// Aggregate adapter health.
    pub async fn health_check(&self) -> Value {
        let mut entries = serde_json::Map::new();
        for adapter in &self.adapters {
            entries.insert(
                adapter.protocol_name().to_string(),
                adapter.health_check().await,
            );
        }
        Value::Object(entries)
    }
}

impl Default for AdapterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdapterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterManager")
            .field("protocols", &self.protocol_names())
            .finish()
    }
}
