//! Gateway health reporting.
//!
//! The gateway has a fixed set of subsystems worth probing, so health
//! is modeled over a closed [`Component`] enum rather than free-form
//! component names: a report either covers the whole set or the gap is
//! visible in the type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// The gateway subsystems included in every health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Embedded event bus.
    Bus,
    /// Session channel map.
    Sessions,
    /// Persistent store.
    Storage,
    /// Task scheduler.
    Scheduler,
    /// Protocol adapters.
    Adapters,
}

impl Component {
    /// The wire name of this component.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bus => "bus",
            Self::Sessions => "sessions",
            Self::Storage => "storage",
            Self::Scheduler => "scheduler",
            Self::Adapters => "adapters",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health state of one component or the aggregate.
///
/// Ordered by severity, so the aggregate is the maximum over the
/// component states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Operating normally.
    Healthy,
    /// Usable with a non-critical issue.
    Degraded,
    /// Not usable.
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Probe result for one subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Which subsystem was probed.
    pub component: Component,

    /// Probe outcome.
    pub state: HealthState,

    /// What went wrong, for degraded and unhealthy probes.
    pub message: Option<String>,

    /// How long the probe took.
    pub probe_ms: u64,

    /// Component-specific figures (counts, bindings).
    #[serde(default)]
    pub details: serde_json::Map<String, Value>,
}

impl ComponentHealth {
    fn new(component: Component, state: HealthState, message: Option<String>, probe: Duration) -> Self {
        Self {
            component,
            state,
            message,
            probe_ms: u64::try_from(probe.as_millis()).unwrap_or(u64::MAX),
            details: serde_json::Map::new(),
        }
    }

    /// A healthy probe.
    #[must_use]
    pub fn ok(component: Component, probe: Duration) -> Self {
        Self::new(component, HealthState::Healthy, None, probe)
    }

    /// A degraded probe.
    #[must_use]
    pub fn degraded(component: Component, message: impl Into<String>, probe: Duration) -> Self {
        Self::new(component, HealthState::Degraded, Some(message.into()), probe)
    }

    /// A failed probe.
    #[must_use]
    pub fn failed(component: Component, message: impl Into<String>, probe: Duration) -> Self {
        Self::new(component, HealthState::Unhealthy, Some(message.into()), probe)
    }

    /// Attach a component-specific figure.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.details.insert(key.into(), value);
        }
        self
    }
}

/// Aggregate gateway health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst state over all components.
    pub state: HealthState,

    /// When this report was assembled.
    pub checked_at: DateTime<Utc>,

    /// Per-component probe results.
    pub components: Vec<ComponentHealth>,

    /// Gateway uptime.
    pub uptime_secs: u64,

    /// Gateway version.
    pub version: String,
}

impl HealthReport {
    /// Assemble a report from component probes.
    ///
    /// The aggregate state is the worst component state; a report with
    /// no components is degraded, never healthy by omission.
    #[must_use]
    pub fn new(components: Vec<ComponentHealth>, uptime: Duration, version: impl Into<String>) -> Self {
        let state = components
            .iter()
            .map(|component| component.state)
            .max()
            .unwrap_or(HealthState::Degraded);

        Self {
            state,
            checked_at: Utc::now(),
            components,
            uptime_secs: uptime.as_secs(),
            version: version.into(),
        }
    }

    /// Whether every component is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    /// The probe result for one component, if present.
    #[must_use]
    pub fn component(&self, component: Component) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(HealthState::Healthy < HealthState::Degraded);
        assert!(HealthState::Degraded < HealthState::Unhealthy);
    }

    #[test]
    fn test_aggregate_is_worst_component() {
        let report = HealthReport::new(
            vec![
                ComponentHealth::ok(Component::Bus, Duration::ZERO),
                ComponentHealth::ok(Component::Storage, Duration::ZERO),
            ],
            Duration::from_secs(5),
            "0.1.0",
        );
        assert!(report.is_healthy());

        let report = HealthReport::new(
            vec![
                ComponentHealth::ok(Component::Bus, Duration::ZERO),
                ComponentHealth::degraded(Component::Scheduler, "tick loop not running", Duration::ZERO),
            ],
            Duration::from_secs(5),
            "0.1.0",
        );
        assert_eq!(report.state, HealthState::Degraded);

        let report = HealthReport::new(
            vec![
                ComponentHealth::degraded(Component::Scheduler, "tick loop not running", Duration::ZERO),
                ComponentHealth::failed(Component::Storage, "unreachable", Duration::ZERO),
            ],
            Duration::from_secs(5),
            "0.1.0",
        );
        assert_eq!(report.state, HealthState::Unhealthy);
    }

    #[test]
    fn test_empty_report_is_not_healthy() {
        let report = HealthReport::new(vec![], Duration::ZERO, "0.1.0");
        assert_eq!(report.state, HealthState::Degraded);
    }

    #[test]
    fn test_component_lookup_and_details() {
        let report = HealthReport::new(
            vec![ComponentHealth::ok(Component::Sessions, Duration::ZERO).with_detail("channels", 4)],
            Duration::ZERO,
            "0.1.0",
        );

        let sessions = report.component(Component::Sessions).unwrap();
        assert_eq!(sessions.details["channels"], serde_json::json!(4));
        assert!(report.component(Component::Storage).is_none());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(Component::Bus.as_str(), "bus");
        assert_eq!(
            serde_json::to_value(Component::Scheduler).unwrap(),
            serde_json::json!("scheduler")
        );
        assert_eq!(
            serde_json::to_value(HealthState::Unhealthy).unwrap(),
            serde_json::json!("unhealthy")
        );
    }
}
