//! Task execution with locks, timeouts, and history.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use hearth_storage::{Database, ScheduledTaskRecord, TaskStore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::task::{Task, TaskContext, TaskResult, TaskStatus};

/// Executes tasks with single-execution guarantees.
///
/// Two guards run in order: the in-memory running map rejects
/// same-process duplicates without touching the database, then the
/// persistent TTL lock arbitrates with everything else sharing the
/// store. Both rejections surface as skipped results, never errors.
pub struct TaskExecutor {
    store: TaskStore,
    db: Database,
    running: DashMap<String, ()>,
    task_timeout: Duration,
    lock_ttl_secs: u64,
}

impl TaskExecutor {
    /// Create an executor over the task store.
    #[must_use]
    pub fn new(db: Database, task_timeout: Duration, lock_ttl_secs: u64) -> Self {
        Self {
            store: TaskStore::new(db.clone()),
            db,
            running: DashMap::new(),
            task_timeout,
            lock_ttl_secs,
        }
    }

    /// Ids of tasks currently executing in this process.
    #[must_use]
    pub fn running_task_ids(&self) -> Vec<String> {
        self.running.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Whether a task is currently executing in this process.
    #[must_use]
    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }

    /// Execute one task with full lifecycle management.
    ///
    /// Records start and completion rows, races the task against the
    /// configured timeout, and always releases the lock and the
    /// running-map entry on the way out.
    pub async fn execute(
        self: &Arc<Self>,
        task: Arc<dyn Task>,
        record: &ScheduledTaskRecord,
    ) -> TaskResult {
        let task_id = record.task_id.clone();
        let execution_id = Uuid::new_v4().to_string();

        info!(task_id, execution_id, "Starting task execution");

        if self.running.contains_key(&task_id) {
            warn!(task_id, "Task is already running, skipping");
            return TaskResult::skipped("Task already running");
        }

        let lock_acquired = match self
            .store
            .acquire_lock(&task_id, &execution_id, self.lock_ttl_secs)
            .await
        {
            Ok(acquired) => acquired,
            Err(error) => {
                error!(task_id, %error, "Lock acquisition failed");
                return TaskResult::failed(format!("lock acquisition failed: {error}"));
            }
        };

        if !lock_acquired {
            warn!(task_id, "Could not acquire lock for task");
            return TaskResult::skipped("Could not acquire execution lock");
        }

        // Claimed only after the lock, so a lock loser never evicts the
        // winner's entry on its way out.
        self.running.insert(task_id.clone(), ());

        let started = Utc::now();

        if let Err(error) = self.store.record_execution_start(&task_id, &execution_id).await {
            error!(task_id, %error, "Failed to record execution start");
        }

        let ctx = TaskContext {
            task_id: task_id.clone(),
            execution_id: execution_id.clone(),
            instance_config: record.config.clone(),
            defaults: task.default_config(),
            db: self.db.clone(),
        };

        let mut result = match tokio::time::timeout(self.task_timeout, task.execute(&ctx)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    task_id,
                    timeout_secs = self.task_timeout.as_secs(),
                    "Task execution timed out"
                );
                TaskResult::failed("task execution timed out")
            }
        };

        let status = result.status();
        result.duration_seconds = Some(
            (Utc::now() - started)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        );

        self.finish(&task_id, &execution_id, &task, &result, status).await;

        info!(task_id, execution_id, %status, "Task execution finished");
        result
    }

    /// Record completion and release every guard. Failures here are
    /// logged and swallowed: a bookkeeping error must not convert a
    /// finished execution into a stuck lock.
    async fn finish(
        &self,
        task_id: &str,
        execution_id: &str,
        task: &Arc<dyn Task>,
        result: &TaskResult,
        status: TaskStatus,
    ) {
        let result_json = serde_json::to_value(result).ok();
        if let Err(error) = self
            .store
            .record_execution_result(
                task_id,
                execution_id,
                status.as_str(),
                result_json.as_ref(),
                result.error.as_deref(),
                result.duration_seconds.unwrap_or(0.0),
            )
            .await
        {
            error!(task_id, %error, "Failed to record execution result");
        }

        task.cleanup().await;

        if let Err(error) = self.store.release_lock(task_id, execution_id).await {
            warn!(task_id, %error, "Failed to release execution lock");
        }

        self.running.remove(task_id);
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("running", &self.running.len())
            .field("task_timeout", &self.task_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SleepyTask {
        sleep: Duration,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Task for SleepyTask {
        fn task_id(&self) -> &'static str {
            "test.sleepy"
        }

        fn task_class(&self) -> &'static str {
            "SleepyTask"
        }

        async fn execute(&self, _ctx: &TaskContext) -> TaskResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.sleep).await;
            TaskResult::ok("slept")
        }
    }

    async fn setup(task_timeout: Duration) -> (Arc<TaskExecutor>, ScheduledTaskRecord) {
        let db = Database::open_memory().await.unwrap();
        db.migrate().await.unwrap();
        let executor = Arc::new(TaskExecutor::new(db, task_timeout, 60));

        let record = ScheduledTaskRecord {
            task_id: "test.sleepy".into(),
            task_class: "SleepyTask".into(),
            schedule: "* * * * *".into(),
            config: json!({}),
            enabled: true,
            created_at: String::new(),
            updated_at: String::new(),
        };

        (executor, record)
    }

    #[tokio::test]
    async fn test_successful_execution_records_history() {
        let (executor, record) = setup(Duration::from_secs(5)).await;
        let task = Arc::new(SleepyTask {
            sleep: Duration::from_millis(1),
            runs: AtomicUsize::new(0),
        });

        let result = executor.execute(task, &record).await;
        assert!(result.success);
        assert!(result.duration_seconds.is_some());

        let last = executor
            .store
            .get_last_execution("test.sleepy")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.status, "completed");
        assert!(last.completed_at.is_some());

        // Guards released.
        assert!(!executor.is_running("test.sleepy"));
        assert!(executor.store.acquire_lock("test.sleepy", "probe", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let (executor, record) = setup(Duration::from_millis(20)).await;
        let task = Arc::new(SleepyTask {
            sleep: Duration::from_secs(30),
            runs: AtomicUsize::new(0),
        });

        let result = executor.execute(task, &record).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("task execution timed out"));

        let last = executor
            .store
            .get_last_execution("test.sleepy")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.status, "failed");
    }

    #[tokio::test]
    async fn test_concurrent_executions_one_wins() {
        let (executor, record) = setup(Duration::from_secs(5)).await;
        // The winner sleeps long enough that every loser attempts
        // while the lock is still held.
        let task = Arc::new(SleepyTask {
            sleep: Duration::from_millis(500),
            runs: AtomicUsize::new(0),
        });

        let mut handles = Vec::new();
        for _ in 0..100 {
            let executor = Arc::clone(&executor);
            let task = Arc::clone(&task) as Arc<dyn Task>;
            let record = record.clone();
            handles.push(tokio::spawn(async move {
                executor.execute(task, &record).await
            }));
        }

        let mut successes = 0;
        let mut skips = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            if result.success {
                successes += 1;
            } else if result.skipped {
                skips += 1;
                assert!(
                    result.message == "Task already running"
                        || result.message == "Could not acquire execution lock",
                    "unexpected skip message: {}",
                    result.message
                );
            }
        }

        assert_eq!(successes, 1, "exactly one execution should win");
        assert_eq!(skips, 99);
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_conflict_from_foreign_holder() {
        let (executor, record) = setup(Duration::from_secs(5)).await;
        let task = Arc::new(SleepyTask {
            sleep: Duration::from_millis(1),
            runs: AtomicUsize::new(0),
        });

        // Someone outside this process holds the lock.
        executor
            .store
            .acquire_lock("test.sleepy", "foreign", 60)
            .await
            .unwrap();

        let result = executor.execute(task, &record).await;
        assert!(result.skipped);
        assert_eq!(result.message, "Could not acquire execution lock");
    }
}
