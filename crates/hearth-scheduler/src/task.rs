//! Task contract and execution types.

use async_trait::async_trait;
use hearth_storage::Database;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution status persisted to `task_executions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued but not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error or timed out.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Declined to run (lock held, already running, or self-skipped).
    Skipped,
}

impl TaskStatus {
    /// The persisted status name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one task execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether the task achieved its goal.
    pub success: bool,
    /// Human-readable summary.
    #[serde(default)]
    pub message: String,
    /// Structured result data.
    #[serde(default)]
    pub data: Option<Value>,
    /// The task declined to run.
    #[serde(default)]
    pub skipped: bool,
    /// Error description when failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock duration, filled in by the executor.
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

impl TaskResult {
    /// A successful result.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    /// A successful result carrying data.
    #[must_use]
    pub fn ok_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            ..Self::default()
        }
    }

    /// A skipped result.
    #[must_use]
    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            skipped: true,
            ..Self::default()
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// The status this result maps to in execution history.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        if self.skipped {
            TaskStatus::Skipped
        } else if self.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }
}

/// Context handed to a task for one execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task being executed.
    pub task_id: String,
    /// Unique id of this execution.
    pub execution_id: String,
    /// Instance configuration from the persistent record.
    pub instance_config: Value,
    /// Defaults declared by the task class.
    pub defaults: Value,
    /// Database handle for task-owned reads and writes.
    pub db: Database,
}

impl TaskContext {
    /// Resolve a configuration key: instance config first, then the
    /// task's declared defaults.
    #[must_use]
    pub fn get_config(&self, key: &str) -> Option<&Value> {
        self.instance_config
            .get(key)
            .or_else(|| self.defaults.get(key))
    }

    /// Resolve a numeric configuration key with a final fallback.
    #[must_use]
    pub fn get_u64(&self, key: &str, fallback: u64) -> u64 {
        self.get_config(key)
            .and_then(Value::as_u64)
            .unwrap_or(fallback)
    }
}

/// A schedulable unit of background work.
///
/// Implementations are registered once at startup and shared across
/// executions; any per-run state belongs in the execution, not the
/// task value.
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique dotted identifier, e.g. `maintenance.log_cleanup`.
    fn task_id(&self) -> &'static str;

    /// Implementation identifier persisted as `task_class`.
    fn task_class(&self) -> &'static str;

    /// Default cron schedule registered for this task.
    fn default_schedule(&self) -> &'static str {
        "0 3 * * *"
    }

    /// Whether the task is enabled when first registered.
    fn default_enabled(&self) -> bool {
        true
    }

    /// Default configuration merged under instance config.
    fn default_config(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    /// Run the task.
    async fn execute(&self, ctx: &TaskContext) -> TaskResult;

    /// Release any resources after execution. Failures are logged and
    /// swallowed by the executor.
    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_status_mapping() {
        assert_eq!(TaskResult::ok("done").status(), TaskStatus::Completed);
        assert_eq!(TaskResult::failed("boom").status(), TaskStatus::Failed);
        assert_eq!(
            TaskResult::skipped("already running").status(),
            TaskStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_context_config_layering() {
        let db = Database::open_memory().await.unwrap();
        let ctx = TaskContext {
            task_id: "t".into(),
            execution_id: "e".into(),
            instance_config: json!({"retention_days": 7}),
            defaults: json!({"retention_days": 30, "batch_size": 100}),
            db,
        };

        // Instance wins over defaults.
        assert_eq!(ctx.get_u64("retention_days", 1), 7);
        // Defaults fill gaps.
        assert_eq!(ctx.get_u64("batch_size", 1), 100);
        // Fallback when neither layer has the key.
        assert_eq!(ctx.get_u64("missing", 42), 42);
    }
}
