//! The scheduler service: next-run table, tick loop, triggers.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hearth_config::SchedulerConfig;
use hearth_storage::{Database, TaskStore};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cron::CronParser;
use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::TaskExecutor;
use crate::registry::TaskRegistry;
use crate::task::TaskResult;

/// Snapshot of scheduler state for the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Whether the tick loop is running.
    pub running: bool,
    /// Number of task implementations in the registry.
    pub registered_tasks: usize,
    /// Number of tasks with a computed next run.
    pub scheduled_tasks: usize,
    /// Number of executions in flight.
    pub running_tasks: usize,
    /// Next run per task id, ISO-8601 UTC.
    pub next_run_times: HashMap<String, String>,
}

/// Coordinates task discovery, scheduling, and execution.
pub struct TaskScheduler {
    config: SchedulerConfig,
    store: TaskStore,
    registry: Arc<TaskRegistry>,
    executor: Arc<TaskExecutor>,
    parser: CronParser,
    trigger_dir: PathBuf,
    next_runs: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Create a scheduler over an opened database.
    #[must_use]
    pub fn new(config: SchedulerConfig, db: Database, registry: TaskRegistry) -> Self {
        let executor = Arc::new(TaskExecutor::new(
            db.clone(),
            Duration::from_secs(config.task_timeout_secs),
            config.lock_ttl_secs,
        ));

        Self {
            trigger_dir: PathBuf::from(&config.trigger_dir),
            config,
            store: TaskStore::new(db),
            registry: Arc::new(registry),
            executor,
            parser: CronParser::new(),
            next_runs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Verify the store schema and sync registered tasks.
    ///
    /// # Errors
    ///
    /// Fails with the storage schema error when the scheduler tables
    /// are missing; the daemon treats that as fatal.
    pub async fn initialize(&self) -> SchedulerResult<()> {
        self.store.verify_tables_exist().await?;
        self.registry.sync_to_store(&self.store).await?;
        info!(
            tasks = self.registry.len(),
            "Task scheduler initialized"
        );
        Ok(())
    }

    /// Compute the next-run table and start the tick loop.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyRunning`] if the loop is
    /// already live.
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.recompute_next_runs().await?;

        let scheduler = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let interval = Duration::from_secs(self.config.tick_interval_secs.max(1));

        *handle = Some(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Scheduler loop started");
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        info!("Scheduler loop cancelled");
                        return;
                    }
                    () = tokio::time::sleep(interval) => {
                        scheduler.tick().await;
                    }
                }
            }
        }));

        info!("Task scheduler started");
        Ok(())
    }

    /// Stop the tick loop and wait briefly for in-flight executions.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }

        // Bounded grace for in-flight executors; they hold persistent
        // locks, so abandoning them after the grace is safe.
        let grace = Duration::from_secs(10);
        let waited = tokio::time::timeout(grace, async {
            while !self.executor.running_task_ids().is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        if waited.is_err() {
            warn!(
                tasks = ?self.executor.running_task_ids(),
                "In-flight tasks still running at shutdown"
            );
        }

        info!("Task scheduler stopped");
    }

    /// Whether the tick loop is live.
    pub async fn is_running(&self) -> bool {
        self.loop_handle.lock().await.is_some() && !self.shutdown.is_cancelled()
    }

    /// One pass of the tick loop: gather due and triggered tasks, then
    /// launch them detached.
    async fn tick(self: &Arc<Self>) {
        let now = Utc::now();
        let mut due: HashSet<String> = HashSet::new();
        let mut scheduled: HashSet<String> = HashSet::new();

        {
            let next_runs = self.next_runs.lock().await;
            for (task_id, next_run) in next_runs.iter() {
                if *next_run <= now {
                    due.insert(task_id.clone());
                    scheduled.insert(task_id.clone());
                }
            }
        }

        for task_id in self.collect_triggers() {
            due.insert(task_id);
        }

        if due.is_empty() {
            return;
        }

        for task_id in due {
            if let Err(error) = self.launch(&task_id, scheduled.contains(&task_id), now).await {
                error!(task_id, %error, "Failed to launch task");
            }
        }
    }

    /// Launch one task as a detached execution.
    async fn launch(
        self: &Arc<Self>,
        task_id: &str,
        is_scheduled: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let Some(record) = self.store.get_task(task_id).await? else {
            // A stray trigger file for an unknown task.
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        };

        // Scheduled runs honor the enabled flag; manual triggers run
        // regardless.
        if is_scheduled && !record.enabled {
            debug!(task_id, "Skipping disabled scheduled task");
            self.next_runs.lock().await.remove(task_id);
            return Ok(());
        }

        let Some(task) = self.registry.get(task_id) else {
            return Err(SchedulerError::TaskClassNotFound(task_id.to_string()));
        };

        if is_scheduled {
            let mut next_runs = self.next_runs.lock().await;
            match self.parser.next_run_time(&record.schedule, now) {
                Some(next) => {
                    debug!(task_id, %next, "Next run computed");
                    next_runs.insert(task_id.to_string(), next);
                }
                None => {
                    warn!(task_id, schedule = %record.schedule, "Could not compute next run");
                    next_runs.remove(task_id);
                }
            }
        }

        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            executor.execute(task, &record).await;
        });

        Ok(())
    }

    /// Scan the trigger directory; each `<task_id>.trigger` file queues
    /// a manual run and is deleted.
    fn collect_triggers(&self) -> Vec<String> {
        let mut triggered = Vec::new();

        let entries = match std::fs::read_dir(&self.trigger_dir) {
            Ok(entries) => entries,
            Err(_) => return triggered, // Directory absent until first trigger.
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("trigger") {
                continue;
            }
            let Some(task_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            info!(task_id, "Manual trigger file detected");
            triggered.push(task_id.to_string());

            if let Err(error) = std::fs::remove_file(&path) {
                error!(path = %path.display(), %error, "Failed to delete trigger file");
            }
        }

        triggered
    }

    /// Compute next runs for every enabled task.
    async fn recompute_next_runs(&self) -> SchedulerResult<()> {
        let tasks = self.store.list_tasks(true).await?;
        let now = Utc::now();
        let mut next_runs = self.next_runs.lock().await;
        next_runs.clear();

        for task in &tasks {
            match self.parser.next_run_time(&task.schedule, now) {
                Some(next) => {
                    debug!(task_id = %task.task_id, %next, "Next run computed");
                    next_runs.insert(task.task_id.clone(), next);
                }
                None => {
                    error!(task_id = %task.task_id, schedule = %task.schedule, "Invalid schedule");
                }
            }
        }

        info!(count = next_runs.len(), "Next run table computed");
        Ok(())
    }

    /// Refresh the next-run entry for one task after an admin change.
    pub async fn reschedule(&self, task_id: &str) -> SchedulerResult<()> {
        let record = self.store.get_task(task_id).await?;
        let mut next_runs = self.next_runs.lock().await;

        match record {
            Some(record) if record.enabled => {
                if let Some(next) = self.parser.next_run_time(&record.schedule, Utc::now()) {
                    next_runs.insert(task_id.to_string(), next);
                } else {
                    next_runs.remove(task_id);
                }
            }
            _ => {
                next_runs.remove(task_id);
            }
        }
        Ok(())
    }

    /// Manually run a task now, awaiting its result.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskNotFound`] /
    /// [`SchedulerError::TaskClassNotFound`] when the task cannot be
    /// resolved.
    pub async fn trigger_task(&self, task_id: &str) -> SchedulerResult<TaskResult> {
        let Some(record) = self.store.get_task(task_id).await? else {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        };
        let Some(task) = self.registry.get(task_id) else {
            return Err(SchedulerError::TaskClassNotFound(task_id.to_string()));
        };

        Ok(self.executor.execute(task, &record).await)
    }

    /// Scheduler status snapshot.
    pub async fn status(&self) -> SchedulerStatus {
        let next_runs = self.next_runs.lock().await;
        SchedulerStatus {
            running: self.is_running().await,
            registered_tasks: self.registry.len(),
            scheduled_tasks: next_runs.len(),
            running_tasks: self.executor.running_task_ids().len(),
            next_run_times: next_runs
                .iter()
                .map(|(task_id, at)| (task_id.clone(), at.to_rfc3339()))
                .collect(),
        }
    }

    /// The persistent store used by this scheduler.
    #[must_use]
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// The task registry.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Whether a task is executing right now.
    #[must_use]
    pub fn is_task_running(&self, task_id: &str) -> bool {
        self.executor.is_running(task_id)
    }

    /// Next run for one task, if scheduled.
    pub async fn next_run_for(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.next_runs.lock().await.get(task_id).copied()
    }

    /// The cron parser (shared with API validation).
    #[must_use]
    pub fn parser(&self) -> &CronParser {
        &self.parser
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("registered_tasks", &self.registry.len())
            .finish_non_exhaustive()
    }
}
