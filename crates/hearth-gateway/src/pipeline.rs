//! Ordered plugin execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hearth_core::{ApiError, ErrorKind, RequestContext};
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::plugin::{GatewayPlugin, SharedServices};

/// Per-plugin shutdown time cap.
const SHUTDOWN_CAP: Duration = Duration::from_secs(5);

/// Registry of enabled plugins plus their computed execution order.
///
/// Plugins are registered during gateway construction, validated and
/// ordered by [`PluginPipeline::finalize`], then driven by
/// [`PluginPipeline::handle`] for every inbound request on every
/// protocol.
#[derive(Default)]
pub struct PluginPipeline {
    plugins: HashMap<String, Arc<dyn GatewayPlugin>>,
    order: Vec<String>,
}

impl PluginPipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Disabled plugins are accepted and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PluginAlreadyRegistered`] on duplicate
    /// names.
    pub fn register(&mut self, plugin: Arc<dyn GatewayPlugin>) -> GatewayResult<()> {
        let name = plugin.metadata().name;

        if !plugin.is_enabled() {
            info!(plugin = %name, "Plugin disabled, skipping load");
            return Ok(());
        }

        if self.plugins.contains_key(&name) {
            return Err(GatewayError::PluginAlreadyRegistered(name));
        }

        debug!(plugin = %name, "Plugin registered");
        self.plugins.insert(name, plugin);
        self.order.clear();
        Ok(())
    }

    /// Validate dependencies and compute the execution order.
    ///
    /// The order is the topological sort of the dependency graph with
    /// ties broken by (priority band, name), so it is stable across
    /// restarts.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MissingPluginDependencies`] when an
    /// enabled plugin names dependencies that are not loaded (in the
    /// plugin's declared order), and
    /// [`GatewayError::PluginDependencyCycle`] on cycles.
    pub fn finalize(&mut self) -> GatewayResult<()> {
        // Missing dependencies first, so the error names the plugin's
        // own declaration order rather than an arbitrary graph walk.
        for (name, plugin) in &self.plugins {
            let missing: Vec<String> = plugin
                .metadata()
                .dependencies
                .iter()
                .filter(|dep| !self.plugins.contains_key(*dep))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(GatewayError::MissingPluginDependencies {
                    plugin: name.clone(),
                    missing,
                });
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, plugin) in &self.plugins {
            in_degree.entry(name.as_str()).or_insert(0);
            for dep in &plugin.metadata().dependencies {
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                let dep = self
                    .plugins
                    .keys()
                    .find(|key| *key == dep)
                    .expect("validated above");
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let sort_key = |name: &&str| {
            let priority = self
                .plugins
                .get(*name)
                .map_or(u8::MAX, |p| p.metadata().priority.value());
            (priority, (*name).to_string())
        };

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        ready.sort_by_key(sort_key);

        let mut order = Vec::with_capacity(self.plugins.len());
        let mut queue: std::collections::VecDeque<&str> = ready.into();

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

        if order.len() != self.plugins.len() {
            let stuck = self
                .plugins
                .keys()
                .find(|name| !order.contains(*name))
                .cloned()
                .unwrap_or_default();
            return Err(GatewayError::PluginDependencyCycle(stuck));
        }

        info!(order = ?order, "Plugin execution order computed");
        self.order = order;
        Ok(())
    }

    /// The computed execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    /// Number of loaded plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugins are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Initialize every loaded plugin in execution order.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PluginInitFailed`] naming the first
    /// plugin whose initialization failed.
    pub async fn initialize_all(&self, services: &SharedServices) -> GatewayResult<()> {
        for name in &self.order {
            let plugin = self.plugins.get(name).expect("ordered plugin");
            plugin
                .initialize(services)
                .await
                .map_err(|err| GatewayError::PluginInitFailed {
                    plugin: name.clone(),
                    reason: err.to_string(),
                })?;
            debug!(plugin = %name, "Plugin initialized");
        }
        Ok(())
    }

    /// Run the pipeline over one request context.
    ///
    /// Forward pass in execution order with short-circuit on `error`
    /// and `skip_remaining`; then a reverse `process_response` pass
    /// over every plugin. Guarantees that exactly one of `response` or
    /// `error` is set on exit.
    pub async fn handle(&self, ctx: &mut RequestContext) {
        for name in &self.order {
            let plugin = self.plugins.get(name).expect("ordered plugin");

            if let Err(err) = plugin.process_request(ctx).await {
                error!(plugin = %name, error = %err, "Plugin raised unexpected error");
                ctx.fail(ApiError::new(
                    500,
                    ErrorKind::ProcessingError,
                    format!("plugin '{name}' failed"),
                ));
            }

            if ctx.is_terminated() {
                debug!(plugin = %name, "Pipeline short-circuited");
                break;
            }
        }

        for name in self.order.iter().rev() {
            let plugin = self.plugins.get(name).expect("ordered plugin");
            if let Err(err) = plugin.process_response(ctx).await {
                warn!(plugin = %name, error = %err, "Response pass failed, continuing");
            }
        }

        if ctx.error.is_none() && ctx.response.is_none() {
            ctx.fail(ApiError::new(
                500,
                ErrorKind::NoHandler,
                "no plugin produced a response",
            ));
        }
    }

    /// Shut every plugin down, five seconds each; stragglers are
    /// logged and left behind.
    pub async fn shutdown_all(&self) {
        for name in self.order.iter().rev() {
            let plugin = self.plugins.get(name).expect("ordered plugin");
            if tokio::time::timeout(SHUTDOWN_CAP, plugin.shutdown()).await.is_err() {
                warn!(plugin = %name, "Plugin shutdown timed out");
            }
        }
    }
}

impl std::fmt::Debug for PluginPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginPipeline")
            .field("order", &self.order)
            .finish()
    }
}
