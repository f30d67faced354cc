//! Service container: dependency resolution and lifecycle management.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::{GatewayError, GatewayResult};

/// Lifecycle states of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Registered but not constructed.
    Registered,
    /// Factory or `initialize` in progress.
    Initializing,
    /// Initialized, not yet started.
    Initialized,
    /// `start` in progress.
    Starting,
    /// Operating normally.
    Running,
    /// `stop` in progress.
    Stopping,
    /// Stopped cleanly.
    Stopped,
    /// A lifecycle call failed.
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Registered => "registered",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Lifecycle contract for container-managed services.
///
/// Every method has a no-op default so passive services (bare
/// resources that only need constructing) can implement the trait
/// without ceremony.
#[async_trait]
pub trait Service: Send + Sync {
    /// Acquire resources. Called once, before `start`.
    async fn initialize(&self) -> GatewayResult<()> {
        Ok(())
    }

    /// Begin operations. Called after every dependency has started.
    async fn start(&self) -> GatewayResult<()> {
        Ok(())
    }

    /// Stop operations. Called in reverse startup order; failures are
    /// logged by the container and never propagate.
    async fn stop(&self) -> GatewayResult<()> {
        Ok(())
    }

    /// Service-specific health payload merged into the aggregate.
    async fn health_check(&self) -> Value {
        json!({})
    }
}

type ServiceFactory = Box<dyn Fn(&ServiceContainer) -> GatewayResult<Arc<dyn Service>> + Send + Sync>;

struct ServiceDefinition {
    factory: ServiceFactory,
    dependencies: Vec<String>,
    priority: i32,
    auto_start: bool,
}

/// Central registry resolving service factories in dependency order.
pub struct ServiceContainer {
    definitions: Mutex<HashMap<String, Arc<ServiceDefinition>>>,
    instances: Mutex<HashMap<String, Arc<dyn Service>>>,
    states: Mutex<HashMap<String, ServiceState>>,
    constructing: Mutex<HashSet<String>>,
    startup_order: Mutex<Vec<String>>,
}

impl ServiceContainer {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            definitions: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            constructing: Mutex::new(HashSet::new()),
            startup_order: Mutex::new(Vec::new()),
        }
    }

    /// Register a service factory.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AlreadyRegistered`] for duplicate names.
    pub fn register<F>(
        &self,
        name: &str,
        factory: F,
        dependencies: Vec<String>,
        priority: i32,
        auto_start: bool,
    ) -> GatewayResult<()>
    where
        F: Fn(&ServiceContainer) -> GatewayResult<Arc<dyn Service>> + Send + Sync + 'static,
    {
        let mut definitions = self.definitions.lock().expect("definitions lock");
        if definitions.contains_key(name) {
            return Err(GatewayError::AlreadyRegistered(name.to_string()));
        }

        definitions.insert(
            name.to_string(),
            Arc::new(ServiceDefinition {
                factory: Box::new(factory),
                dependencies: dependencies.clone(),
                priority,
                auto_start,
            }),
        );
        self.states
            .lock()
            .expect("states lock")
            .insert(name.to_string(), ServiceState::Registered);

        info!(service = name, deps = ?dependencies, priority, "Service registered");
        Ok(())
    }

    /// Register an already-constructed instance. It participates in
    /// `stop_all` and health checks but has no factory or dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AlreadyRegistered`] for duplicate names.
    pub fn register_instance(&self, name: &str, instance: Arc<dyn Service>) -> GatewayResult<()> {
        let mut instances = self.instances.lock().expect("instances lock");
        if instances.contains_key(name) {
            return Err(GatewayError::AlreadyRegistered(name.to_string()));
        }
        instances.insert(name.to_string(), instance);
        self.states
            .lock()
            .expect("states lock")
            .insert(name.to_string(), ServiceState::Running);
        info!(service = name, "Service instance registered");
        Ok(())
    }

    /// Fetch (lazily constructing) a service.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] for unknown names and
    /// [`GatewayError::CircularDependency`] when construction recurses
    /// into itself.
    pub fn get(&self, name: &str) -> GatewayResult<Arc<dyn Service>> {
        if let Some(instance) = self.instances.lock().expect("instances lock").get(name) {
            return Ok(Arc::clone(instance));
        }

        let definition = self
            .definitions
            .lock()
            .expect("definitions lock")
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?;

        {
            let mut constructing = self.constructing.lock().expect("constructing lock");
            if !constructing.insert(name.to_string()) {
                return Err(GatewayError::CircularDependency(name.to_string()));
            }
        }
        self.set_state(name, ServiceState::Initializing);

        // Construct dependencies first, then the service itself. No
        // lock is held here so factories may call back into `get`.
        let constructed = (|| {
            for dep in &definition.dependencies {
                self.get(dep)?;
            }
            (definition.factory)(self)
        })();

        self.constructing
            .lock()
            .expect("constructing lock")
            .remove(name);

        match constructed {
            Ok(instance) => {
                self.instances
                    .lock()
                    .expect("instances lock")
                    .insert(name.to_string(), Arc::clone(&instance));
                self.set_state(name, ServiceState::Initialized);
                Ok(instance)
            }
            Err(err) => {
                self.set_state(name, ServiceState::Error);
                Err(err)
            }
        }
    }

    /// Current state of a service.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.states.lock().expect("states lock").get(name).copied()
    }

    fn set_state(&self, name: &str, state: ServiceState) {
        self.states
            .lock()
            .expect("states lock")
            .insert(name.to_string(), state);
    }

    /// Compute the startup order: Kahn's topological sort with the
    /// ready set drained in (priority, name) order, so the order is
    /// deterministic across restarts and never violates a dependency.
    fn compute_startup_order(&self) -> GatewayResult<Vec<String>> {
        let definitions = self.definitions.lock().expect("definitions lock");

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, definition) in definitions.iter() {
            in_degree.entry(name.as_str()).or_insert(0);
            for dep in &definition.dependencies {
                // Dependencies outside the container (pre-registered
                // instances) do not constrain ordering.
                if !definitions.contains_key(dep) {
                    continue;
                }
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let sort_key = |name: &&str| {
            let priority = definitions.get(*name).map_or(0, |d| d.priority);
            (priority, (*name).to_string())
        };
        ready.sort_by_key(sort_key);

        let mut queue: VecDeque<&str> = ready.into();
        let mut order = Vec::with_capacity(definitions.len());

        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());

            let mut newly_ready = Vec::new();
            for dependent in dependents.get(name).into_iter().flatten() {
                let degree = in_degree.get_mut(dependent).expect("degree entry");
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(*dependent);
                }
            }
            newly_ready.sort_by_key(sort_key);
            for name in newly_ready {
                queue.push_back(name);
            }
        }

        if order.len() != definitions.len() {
            let stuck = definitions
                .keys()
                .find(|name| !order.contains(*name))
                .cloned()
                .unwrap_or_default();
            return Err(GatewayError::CircularDependency(stuck));
        }

        Ok(order)
    }

    /// Construct and start every auto-start service in dependency
    /// order.
    ///
    /// # Errors
    ///
    /// The first failure aborts the remaining startup, triggers
    /// [`Self::stop_all`] for what already ran, and is returned.
    pub async fn start_all(&self) -> GatewayResult<()> {
        let order = self.compute_startup_order()?;
        *self.startup_order.lock().expect("order lock") = order.clone();

        info!(order = ?order, "Starting services");

        for name in &order {
            let definition = self
                .definitions
                .lock()
                .expect("definitions lock")
                .get(name)
                .cloned();
            let Some(definition) = definition else { continue };
            if !definition.auto_start {
                continue;
            }

            if let Err(err) = self.start_one(name).await {
                error!(service = name, error = %err, "Service startup failed, rolling back");
                self.stop_all().await;
                return Err(err);
            }
        }

        info!(count = order.len(), "All services started");
        Ok(())
    }

    async fn start_one(&self, name: &str) -> GatewayResult<()> {
        let instance = self.get(name)?;

        self.set_state(name, ServiceState::Initializing);
        instance
            .initialize()
            .await
            .map_err(|err| self.fail(name, "initialize", err))?;
        self.set_state(name, ServiceState::Initialized);

        self.set_state(name, ServiceState::Starting);
        instance
            .start()
            .await
            .map_err(|err| self.fail(name, "start", err))?;
        self.set_state(name, ServiceState::Running);

        info!(service = name, "Service started");
        Ok(())
    }

    fn fail(&self, name: &str, phase: &'static str, err: GatewayError) -> GatewayError {
        self.set_state(name, ServiceState::Error);
        GatewayError::ServiceFailed {
            name: name.to_string(),
            phase,
            reason: err.to_string(),
        }
    }

    /// Stop every constructed service in reverse startup order.
    ///
    /// Stop failures are logged and swallowed so one misbehaving
    /// service cannot block shutdown of the rest.
    pub async fn stop_all(&self) {
        let mut order = self.startup_order.lock().expect("order lock").clone();
        if order.is_empty() {
            order = self.instances.lock().expect("instances lock").keys().cloned().collect();
        }

        for name in order.iter().rev() {
            let instance = self.instances.lock().expect("instances lock").get(name).cloned();
            let Some(instance) = instance else { continue };

            let state = self.state(name);
            if !matches!(state, Some(ServiceState::Running | ServiceState::Error)) {
                continue;
            }

            self.set_state(name, ServiceState::Stopping);
            if let Err(err) = instance.stop().await {
                warn!(service = name, error = %err, "Service stop failed, continuing shutdown");
            }
            self.set_state(name, ServiceState::Stopped);
            info!(service = name, "Service stopped");
        }

        info!("All services stopped");
    }

    /// Aggregate health of every constructed service.
    pub async fn health_check(&self) -> Value {
        let instances: Vec<(String, Arc<dyn Service>)> = self
            .instances
            .lock()
            .expect("instances lock")
            .iter()
            .map(|(name, instance)| (name.clone(), Arc::clone(instance)))
            .collect();

        let mut services = serde_json::Map::new();
        let mut healthy = 0usize;
        let mut unhealthy = 0usize;

        for (name, instance) in instances {
            let state = self.state(&name).unwrap_or(ServiceState::Registered);
            let is_healthy = state == ServiceState::Running;
            if is_healthy {
                healthy += 1;
            } else {
                unhealthy += 1;
            }

            let mut entry = json!({
                "name": name.clone(),
                "state": state.to_string(),
                "healthy": is_healthy,
            });
            let detail = instance.health_check().await;
            if let (Some(entry_map), Some(detail_map)) = (entry.as_object_mut(), detail.as_object())
            {
                for (key, value) in detail_map {
                    entry_map.insert(key.clone(), value.clone());
                }
            }
            services.insert(name, entry);
        }

        let total = healthy + unhealthy;
        json!({
            "container": if unhealthy > 0 { "degraded" } else { "healthy" },
            "services": services,
            "summary": {"total": total, "healthy": healthy, "unhealthy": unhealthy},
        })
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("services", &self.states.lock().expect("states lock").len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingService {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    }

    #[async_trait]
    impl Service for RecordingService {
        async fn initialize(&self) -> GatewayResult<()> {
            self.log.lock().unwrap().push(format!("init:{}", self.name));
            Ok(())
        }

        async fn start(&self) -> GatewayResult<()> {
            if self.fail_start {
                return Err(GatewayError::ServiceFailed {
                    name: self.name.clone(),
                    phase: "start",
                    reason: "intentional".into(),
                });
            }
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            Ok(())
        }

        async fn stop(&self) -> GatewayResult<()> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    fn recording(
        name: &str,
        log: &Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    ) -> impl Fn(&ServiceContainer) -> GatewayResult<Arc<dyn Service>> + Send + Sync + 'static
    {
        let name = name.to_string();
        let log = Arc::clone(log);
        move |_| {
            Ok(Arc::new(RecordingService {
                name: name.clone(),
                log: Arc::clone(&log),
                fail_start,
            }) as Arc<dyn Service>)
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let container = ServiceContainer::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        container
            .register("bus", recording("bus", &log, false), vec![], 0, true)
            .unwrap();
        let err = container
            .register("bus", recording("bus", &log, false), vec![], 0, true)
            .unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_get_unknown_service() {
        let container = ServiceContainer::new();
        assert!(matches!(
            container.get("missing"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_startup_respects_dependencies() {
        let container = ServiceContainer::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Registered out of order; adapter depends on bus and store.
        container
            .register(
                "adapter",
                recording("adapter", &log, false),
                vec!["bus".into(), "store".into()],
                30,
                true,
            )
            .unwrap();
        container
            .register("bus", recording("bus", &log, false), vec!["store".into()], 20, true)
            .unwrap();
        container
            .register("store", recording("store", &log, false), vec![], 10, true)
            .unwrap();

        container.start_all().await.unwrap();

        let entries = log.lock().unwrap().clone();
        let pos = |needle: &str| entries.iter().position(|e| e == needle).unwrap();
        assert!(pos("start:store") < pos("start:bus"));
        assert!(pos("start:bus") < pos("start:adapter"));

        container.stop_all().await;
        let entries = log.lock().unwrap().clone();
        let pos = |needle: &str| entries.iter().position(|e| e == needle).unwrap();
        assert!(pos("stop:adapter") < pos("stop:bus"));
        assert!(pos("stop:bus") < pos("stop:store"));
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back() {
        let container = ServiceContainer::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        container
            .register("store", recording("store", &log, false), vec![], 10, true)
            .unwrap();
        container
            .register("broken", recording("broken", &log, true), vec!["store".into()], 20, true)
            .unwrap();

        let err = container.start_all().await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceFailed { .. }));

        // The already-started store was stopped during rollback.
        let entries = log.lock().unwrap().clone();
        assert!(entries.contains(&"start:store".to_string()));
        assert!(entries.contains(&"stop:store".to_string()));
    }

    #[tokio::test]
    async fn test_circular_dependency_detected() {
        let container = ServiceContainer::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        container
            .register("a", recording("a", &log, false), vec!["b".into()], 0, true)
            .unwrap();
        container
            .register("b", recording("b", &log, false), vec!["a".into()], 0, true)
            .unwrap();

        let err = container.start_all().await.unwrap_err();
        assert!(matches!(err, GatewayError::CircularDependency(_)));
    }

    #[tokio::test]
    async fn test_stop_failure_does_not_block_others() {
        struct FailingStop;

        #[async_trait]
        impl Service for FailingStop {
            async fn stop(&self) -> GatewayResult<()> {
                Err(GatewayError::NotFound("boom".into()))
            }
        }

        struct Witness {
            stopped: Arc<AtomicBool>,
        }

        #[async_trait]
        impl Service for Witness {
            async fn stop(&self) -> GatewayResult<()> {
                self.stopped.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let container = ServiceContainer::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&stopped);
        container
            .register(
                "witness",
                move |_| {
                    Ok(Arc::new(Witness {
                        stopped: Arc::clone(&flag),
                    }) as Arc<dyn Service>)
                },
                vec![],
                10,
                true,
            )
            .unwrap();
        container
            .register(
                "failing",
                |_| Ok(Arc::new(FailingStop) as Arc<dyn Service>),
                vec!["witness".into()],
                20,
                true,
            )
            .unwrap();

        container.start_all().await.unwrap();
        container.stop_all().await;

        assert!(stopped.load(Ordering::SeqCst), "witness must still stop");
    }

    #[tokio::test]
    async fn test_health_aggregation() {
        let container = ServiceContainer::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        container
            .register("store", recording("store", &log, false), vec![], 10, true)
            .unwrap();
        container.start_all().await.unwrap();

        let health = container.health_check().await;
        assert_eq!(health["container"], "healthy");
        assert_eq!(health["summary"]["total"], 1);
        assert_eq!(health["summary"]["healthy"], 1);
        assert_eq!(health["services"]["store"]["state"], "running");
    }
}
