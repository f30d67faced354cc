//! In-process index of task implementations.

use std::collections::HashMap;
use std::sync::Arc;

use hearth_storage::TaskStore;
use tracing::{debug, info};

use crate::error::SchedulerResult;
use crate::task::Task;

/// Registry of task implementations keyed by task id.
///
/// Built-ins are registered during scheduler initialization; deployment
/// extensions register before `start`. The registry is immutable once
/// the scheduler is running.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<&'static str, Arc<dyn Task>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task implementation. Later registrations replace
    /// earlier ones with the same id.
    pub fn register(&mut self, task: Arc<dyn Task>) {
        debug!(task_id = task.task_id(), "Registered task");
        self.tasks.insert(task.task_id(), task);
    }

    /// Look up a task implementation.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(task_id).cloned()
    }

    /// All registered task ids, sorted.
    #[must_use]
    pub fn task_ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.tasks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Upsert every registered task into the persistent store with its
    /// declared defaults.
    ///
    /// Existing rows are refreshed (class, schedule, config) but keep
    /// whatever `enabled` state an operator set; new rows start from
    /// the task's `default_enabled`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if an upsert fails.
    pub async fn sync_to_store(&self, store: &TaskStore) -> SchedulerResult<()> {
        for task in self.tasks.values() {
            let existing = store.get_task(task.task_id()).await?;
            let enabled = existing
                .map(|record| record.enabled)
                .unwrap_or_else(|| task.default_enabled());

            store
                .upsert_task(
                    task.task_id(),
                    task.task_class(),
                    task.default_schedule(),
                    Some(&task.default_config()),
                    enabled,
                )
                .await?;
        }

        info!(count = self.tasks.len(), "Registered tasks synced to store");
        Ok(())
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskContext, TaskResult};
    use async_trait::async_trait;
    use hearth_storage::Database;

    struct NoopTask;

    #[async_trait]
    impl Task for NoopTask {
        fn task_id(&self) -> &'static str {
            "test.noop"
        }

        fn task_class(&self) -> &'static str {
            "NoopTask"
        }

        fn default_enabled(&self) -> bool {
            false
        }

        async fn execute(&self, _ctx: &TaskContext) -> TaskResult {
            TaskResult::ok("noop")
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let mut registry = TaskRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(NoopTask));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("test.noop").is_some());
        assert!(registry.get("test.other").is_none());
        assert_eq!(registry.task_ids(), vec!["test.noop"]);
    }

    #[tokio::test]
    async fn test_sync_preserves_operator_enabled_state() {
        let db = Database::open_memory().await.unwrap();
        db.migrate().await.unwrap();
        let store = TaskStore::new(db);

        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(NoopTask));

        registry.sync_to_store(&store).await.unwrap();
        let record = store.get_task("test.noop").await.unwrap().unwrap();
        assert!(!record.enabled, "default_enabled=false should persist");

        // Operator enables; a later sync must not flip it back.
        store.set_task_enabled("test.noop", true).await.unwrap();
        registry.sync_to_store(&store).await.unwrap();
        let record = store.get_task("test.noop").await.unwrap().unwrap();
        assert!(record.enabled);
    }
}
