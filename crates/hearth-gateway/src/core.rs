//! Gateway core: wires bus, plugins, adapters, sessions, scheduler.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use hearth_config::HearthConfig;
use hearth_crypto::{IdentityKeyPair, TransportIdentity};
use hearth_events::EventBus;
use hearth_scheduler::{tasks, TaskRegistry, TaskScheduler};
use hearth_storage::Database;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::adapters::{AdapterDeps, AdapterManager, IpcAdapter, RestAdapter, WebSocketAdapter};
use crate::container::Service;
use crate::error::GatewayResult;
use crate::health::{Component, ComponentHealth, HealthReport};
use crate::pipeline::PluginPipeline;
use crate::plugin::SharedServices;
use crate::plugins;
use crate::session::{AuthTokens, SessionManager};

/// Sweep interval for expired session channels.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Central orchestrator for the gateway.
///
/// Construction resolves configuration into concrete components (and
/// fails fast on an unsatisfiable plugin graph); the [`Service`]
/// lifecycle then drives initialization, startup, and shutdown in the
/// documented dependency order.
pub struct GatewayCore {
    config: Arc<HearthConfig>,
    services: SharedServices,
    pipeline: Arc<PluginPipeline>,
    scheduler: Arc<TaskScheduler>,
    adapters: AdapterManager,
    shutdown: CancellationToken,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started_at: StdMutex<Option<Instant>>,
}

impl GatewayCore {
    /// Build the gateway from configuration.
    ///
    /// # Errors
    ///
    /// Fails when the enabled plugin set has missing dependencies or
    /// cycles, a configuration error surfaced before anything binds.
    pub fn new(
        config: HearthConfig,
        db: Database,
        identity: IdentityKeyPair,
    ) -> GatewayResult<Self> {
        let config = Arc::new(config);

        let bus = EventBus::with_capacity(config.bus.channel_capacity);
        let sessions = Arc::new(SessionManager::new(
            TransportIdentity::new(identity, "gateway"),
            config.transport.session.timeout_secs,
        ));
        let auth = Arc::new(AuthTokens::new(config.transport.session.timeout_secs));

        let services = SharedServices {
            config: Arc::clone(&config),
            bus,
            sessions,
            auth,
            db: db.clone(),
        };

        let pipeline = Arc::new(plugins::build_pipeline(&config)?);

        let mut registry = TaskRegistry::new();
        tasks::register_builtin_tasks(&mut registry);
        let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone(), db, registry));

        let mut adapters = AdapterManager::new();
        if config.protocols.rest.enabled {
            adapters.register(Arc::new(RestAdapter::new(
                config.protocols.rest.clone(),
                config.transport.clone(),
            )));
        }
        if config.protocols.websocket.enabled {
            adapters.register(Arc::new(WebSocketAdapter::new(
                config.protocols.websocket.clone(),
            )));
        }
        if config.protocols.ipc.enabled {
            adapters.register(Arc::new(IpcAdapter::new(config.protocols.ipc.clone())));
        }

        Ok(Self {
            config,
            services,
            pipeline,
            scheduler,
            adapters,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            started_at: StdMutex::new(None),
        })
    }

    /// Shared handles (for embedding and tests).
    #[must_use]
    pub fn services(&self) -> &SharedServices {
        &self.services
    }

    /// The scheduler instance.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Gateway status snapshot.
    pub async fn status(&self) -> Value {
        let started_at = *self.started_at.lock().expect("started_at lock");

        json!({
            "running": started_at.is_some(),
            "uptime_seconds": started_at.map_or(0, |at| at.elapsed().as_secs()),
            "protocols_active": self.adapters.protocol_names(),
            "plugins_loaded": self.pipeline.execution_order(),
            "message_bus_connected": true,
            "session_channels": self.services.sessions.len(),
            "scheduler": self.scheduler.status().await,
        })
    }
}

#[async_trait]
impl Service for GatewayCore {
    async fn initialize(&self) -> GatewayResult<()> {
        // Scheduler first: it refuses to run against an unmigrated
        // store and that refusal must surface before anything binds.
        self.scheduler.initialize().await?;

        self.pipeline.initialize_all(&self.services).await?;

        let deps = AdapterDeps {
            services: self.services.clone(),
            pipeline: Arc::clone(&self.pipeline),
            scheduler: Arc::clone(&self.scheduler),
        };
        self.adapters.initialize_all(&deps).await?;

        info!(
            plugins = ?self.pipeline.execution_order(),
            protocols = ?self.adapters.protocol_names(),
            "Gateway initialized"
        );
        Ok(())
    }

    async fn start(&self) -> GatewayResult<()> {
        let mut background = self.background.lock().await;

        // Loopback bus listener for external backend modules.
        if self.config.bus.bind_port != 0 {
            let addr = format!("{}:{}", self.config.bus.bind_host, self.config.bus.bind_port);
            let handle = hearth_events::spawn_frame_listener(
                self.services.bus.clone(),
                &addr,
                self.shutdown.clone(),
            )
            .await?;
            background.push(handle);
        }

        // Session expiry sweeper.
        background.push(
            self.services
                .sessions
                .spawn_sweeper(SWEEP_INTERVAL, self.shutdown.clone()),
        );

        // Built-in echo responder, the reference bus consumer.
        background.push(spawn_echo_responder(
            self.services.bus.clone(),
            self.shutdown.clone(),
        ));

        // Adapters before the scheduler, mirroring the dependency
        // order; the scheduler is the last component up.
        self.adapters.start_all().await?;

        if let Err(err) = self.scheduler.start().await {
            error!(error = %err, "Scheduler failed to start");
            self.adapters.stop_all().await;
            return Err(err.into());
        }

        *self.started_at.lock().expect("started_at lock") = Some(Instant::now());
        info!("Gateway started");
        Ok(())
    }

    async fn stop(&self) -> GatewayResult<()> {
        info!("Stopping gateway");

        // Reverse startup order: scheduler, adapters, plugins.
        self.scheduler.stop().await;
        self.adapters.stop_all().await;
        self.pipeline.shutdown_all().await;

        self.shutdown.cancel();
        for task in self.background.lock().await.drain(..) {
            let _ = task.await;
        }

        self.services.sessions.clear();
        *self.started_at.lock().expect("started_at lock") = None;

        info!("Gateway stopped");
        Ok(())
    }

    async fn health_check(&self) -> Value {
        let uptime = self
            .started_at
            .lock()
            .expect("started_at lock")
            .map_or(Duration::ZERO, |at| at.elapsed());

        let mut components = Vec::new();

        let start = Instant::now();
        components.push(
            ComponentHealth::ok(Component::Bus, start.elapsed())
                .with_detail("subscribers", self.services.bus.subscriber_count()),
        );

        let start = Instant::now();
        components.push(
            ComponentHealth::ok(Component::Sessions, start.elapsed())
                .with_detail("channels", self.services.sessions.len()),
        );

        let start = Instant::now();
        components.push(match self.services.db.ping().await {
            Ok(()) => ComponentHealth::ok(Component::Storage, start.elapsed()),
            Err(err) => {
                ComponentHealth::failed(Component::Storage, err.to_string(), start.elapsed())
            }
        });

        let start = Instant::now();
        let scheduler_status = self.scheduler.status().await;
        components.push(if scheduler_status.running {
            ComponentHealth::ok(Component::Scheduler, start.elapsed())
                .with_detail("scheduled_tasks", scheduler_status.scheduled_tasks)
                .with_detail("running_tasks", scheduler_status.running_tasks)
        } else {
            ComponentHealth::degraded(
                Component::Scheduler,
                "tick loop not running",
                start.elapsed(),
            )
        });

        let start = Instant::now();
        components.push(
            ComponentHealth::ok(Component::Adapters, start.elapsed())
                .with_detail("protocols", self.adapters.health_check().await),
        );

        let report = HealthReport::new(components, uptime, hearth_core::VERSION);
        serde_json::to_value(&report).unwrap_or_default()
    }
}

impl std::fmt::Debug for GatewayCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCore")
            .field("protocols", &self.adapters.protocol_names())
            .finish_non_exhaustive()
    }
}

/// The reference bus consumer answering `echo.request` messages.
///
/// Kept in the gateway so the wire contract is exercisable without any
/// domain service attached.
fn spawn_echo_responder(
    bus: EventBus,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut requests = bus.subscribe("gateway.request.echo.request");
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                () = shutdown.cancelled() => return,
                message = requests.recv() => message,
            };
            let Some(message) = message else { return };

            let payload = &message.envelope.payload;
            let reply_payload = json!({
                "echo": payload.get("message").cloned().unwrap_or(Value::Null),
                "received_data": payload
                    .get("test_data")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                "server_timestamp": Utc::now().timestamp(),
                "status": "success",
            });

            let reply = message
                .envelope
                .reply("echo.response", reply_payload, "echo");
            bus.publish("gateway.reply.echo.request", reply);
        }
    })
}
