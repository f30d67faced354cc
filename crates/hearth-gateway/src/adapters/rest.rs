//! Request/reply HTTP adapter.
//!
//! Hosts the REST surface with the session transport as the outermost
//! layer. No framework middleware sits between the transport wrap and
//! the routes, and no framework CORS is applied: anything outside the
//! wrap would observe ciphertext (see the transport module notes).

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use hearth_config::{RestProtocolConfig, TransportConfig};
use hearth_core::{ApiError, ClientInfo, Protocol, VERSION};
use hearth_events::EventBus;
use hearth_scheduler::TaskScheduler;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{run_pipeline, AdapterDeps, ProtocolAdapter};
use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::PluginPipeline;
use crate::session::SessionManager;
use crate::transport::{TransportLayer, SESSION_ATTESTATION_HEADER};

/// Shared state for REST handlers.
#[derive(Clone)]
pub struct RestState {
    /// The request pipeline.
    pub pipeline: Arc<PluginPipeline>,
    /// The task scheduler (admin API).
    pub scheduler: Arc<TaskScheduler>,
    /// Session channel map (status reporting).
    pub sessions: Arc<SessionManager>,
    /// The event bus (status reporting).
    pub bus: EventBus,
    /// Gateway start time.
    pub started_at: Instant,
    /// Advertised service name.
    pub server_name: String,
}

impl std::fmt::Debug for RestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestState").finish_non_exhaustive()
    }
}

/// The request/reply HTTP adapter.
pub struct RestAdapter {
    config: RestProtocolConfig,
    transport: TransportConfig,
    state: OnceLock<RestState>,
    shutdown: CancellationToken,
    serve_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RestAdapter {
    /// Create the adapter from its config subtree.
    #[must_use]
    pub fn new(config: RestProtocolConfig, transport: TransportConfig) -> Self {
        Self {
            config,
            transport,
            state: OnceLock::new(),
            shutdown: CancellationToken::new(),
            serve_handle: Mutex::new(None),
        }
    }

    /// Build the router: routes first, the transport layer last so it
    /// wraps everything, the fallback included.
    fn build_router(&self, state: &RestState) -> Router {
        Router::new()
            .route("/api/v1/health", get(health_basic))
            .route("/api/v1/health/detailed", get(health_detailed))
            .route("/api/v1/echo", post(echo))
            .route("/api/v1/gateway/status", get(gateway_status))
            .nest("/api/v1/scheduler", crate::routes::scheduler::router())
            .fallback(not_found)
            .with_state(state.clone())
            .layer(TransportLayer::new(
                self.transport.clone(),
                Arc::clone(&state.sessions),
            ))
    }
}

#[async_trait]
impl ProtocolAdapter for RestAdapter {
    fn protocol_name(&self) -> &'static str {
        "rest"
    }

    async fn initialize(&self, deps: &AdapterDeps) -> GatewayResult<()> {
        let state = RestState {
            pipeline: Arc::clone(&deps.pipeline),
            scheduler: Arc::clone(&deps.scheduler),
            sessions: Arc::clone(&deps.services.sessions),
            bus: deps.services.bus.clone(),
            started_at: Instant::now(),
            server_name: deps.services.config.gateway.name.clone(),
        };
        let _ = self.state.set(state);
        Ok(())
    }

    async fn start(&self) -> GatewayResult<()> {
        let state = self
            .state
            .get()
            .ok_or_else(|| GatewayError::AdapterStartFailed {
                adapter: "rest".to_string(),
                reason: "adapter not initialized".to_string(),
            })?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|err| {
            GatewayError::AdapterStartFailed {
                adapter: "rest".to_string(),
                reason: format!("failed to bind {addr}: {err}"),
            }
        })?;

        info!(%addr, "REST adapter listening");

        let app = self.build_router(state);
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned());

            if let Err(error) = serve.await {
                tracing::error!(%error, "REST server terminated with error");
            }
        });

        *self.serve_handle.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.serve_handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn handle_request(&self, payload: Value, client: ClientInfo) -> Result<Value, ApiError> {
        let state = self
            .state
            .get()
            .ok_or_else(|| ApiError::internal("adapter not initialized"))?;
        run_pipeline(&state.pipeline, Protocol::Rest, payload, client).await
    }

    async fn health_check(&self) -> Value {
        json!({
            "protocol": "rest",
            "bind": format!("{}:{}", self.config.host, self.config.port),
            "running": self.serve_handle.lock().await.is_some() && !self.shutdown.is_cancelled(),
        })
    }
}

impl std::fmt::Debug for RestAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestAdapter")
            .field("bind", &format!("{}:{}", self.config.host, self.config.port))
            .finish_non_exhaustive()
    }
}

/// Collect transport metadata for the pipeline's client info.
fn client_info_from(headers: &HeaderMap, remote: Option<SocketAddr>) -> ClientInfo {
    let remote_addr = remote.map_or_else(|| "unknown".to_string(), |addr| addr.to_string());
    let user_agent = headers
        .get(http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    let mut client = ClientInfo::new(remote_addr, user_agent, "rest");
    for name in ["authorization", SESSION_ATTESTATION_HEADER] {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            client.attributes.insert(name.to_string(), value.to_string());
        }
    }
    client
}

async fn health_basic(State(state): State<RestState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": state.server_name,
        "version": VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn health_detailed(State(state): State<RestState>) -> Json<Value> {
    // Process and system stats are best-effort; anything unavailable
    // is simply omitted.
    let threads = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .ok();

    Json(json!({
        "status": "healthy",
        "service": state.server_name,
        "version": VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "process": {
            "pid": std::process::id(),
            "available_parallelism": threads,
        },
        "system": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "gateway": {
            "plugins": state.pipeline.execution_order(),
            "bus_subscribers": state.bus.subscriber_count(),
            "session_channels": state.sessions.len(),
        },
    }))
}

async fn gateway_status(State(state): State<RestState>) -> Json<Value> {
    Json(json!({
        "running": true,
        "service": state.server_name,
        "version": VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "plugins_loaded": state.pipeline.execution_order(),
        "bus_subscribers": state.bus.subscriber_count(),
        "session_channels": state.sessions.len(),
    }))
}

async fn echo(
    State(state): State<RestState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let client = client_info_from(&headers, Some(remote));

    let payload = json!({
        "kind": "echo.request",
        "payload": {
            "message": body.get("message").cloned().unwrap_or(Value::Null),
            "test_data": body
                .get("test_data")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        },
        "token": body.get("token").cloned().unwrap_or(Value::Null),
    });

    match run_pipeline(&state.pipeline, Protocol::Rest, payload, client).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(error) => (
            StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(error.to_json()),
        ),
    }
}

async fn not_found(uri: Uri) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "not_found",
            "detail": format!("no route for {}", uri.path()),
        })),
    )
}
