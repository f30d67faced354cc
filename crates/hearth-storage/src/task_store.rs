//! Persistence for scheduled tasks, executions, and locks.

use chrono::{Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{StorageError, StorageResult};

/// Tables the scheduler refuses to run without.
pub const REQUIRED_TABLES: [&str; 3] = ["scheduled_tasks", "task_executions", "task_locks"];

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A row of `scheduled_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTaskRecord {
    /// Unique dotted task identifier.
    pub task_id: String,
    /// Implementation identifier resolved against the task registry.
    pub task_class: String,
    /// 5-field cron expression.
    pub schedule: String,
    /// Task parameters.
    pub config: Value,
    /// Whether the schedule is active.
    pub enabled: bool,
    /// Creation time, ISO-8601 UTC.
    pub created_at: String,
    /// Last update time, ISO-8601 UTC.
    pub updated_at: String,
}

/// A row of `task_executions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique execution id.
    pub execution_id: String,
    /// Owning task.
    pub task_id: String,
    /// Execution status name.
    pub status: String,
    /// Start time, ISO-8601 UTC.
    pub started_at: String,
    /// Completion time, if finished.
    pub completed_at: Option<String>,
    /// Serialized task result, if finished.
    pub result: Option<Value>,
    /// Error message, if failed.
    pub error_message: Option<String>,
    /// Wall-clock duration.
    pub duration_seconds: Option<f64>,
}

/// Database operations for the scheduler.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    /// Create a store over an opened database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Verify that the required scheduler tables exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SchemaOutOfDate`] naming the missing
    /// tables; the caller is expected to treat this as fatal.
    pub async fn verify_tables_exist(&self) -> StorageResult<()> {
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(self.db.pool())
            .await?;

        let existing: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("name").ok())
            .collect();

        let missing: Vec<&str> = REQUIRED_TABLES
            .iter()
            .copied()
            .filter(|table| !existing.iter().any(|name| name == table))
            .collect();

        if missing.is_empty() {
            debug!("Scheduler tables verified");
            Ok(())
        } else {
            Err(StorageError::SchemaOutOfDate {
                missing: missing.join(", "),
            })
        }
    }

    /// Insert or update a scheduled task.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn upsert_task(
        &self,
        task_id: &str,
        task_class: &str,
        schedule: &str,
        config: Option<&Value>,
        enabled: bool,
    ) -> StorageResult<()> {
        let config_json = config.map(Value::to_string);
        let now = now_iso();

        sqlx::query(
            "INSERT INTO scheduled_tasks
                 (task_id, task_class, schedule, config, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(task_id) DO UPDATE SET
                 task_class = excluded.task_class,
                 schedule   = excluded.schedule,
                 config     = excluded.config,
                 enabled    = excluded.enabled,
                 updated_at = excluded.updated_at",
        )
        .bind(task_id)
        .bind(task_class)
        .bind(schedule)
        .bind(config_json)
        .bind(enabled)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        debug!(task_id, "Upserted task");
        Ok(())
    }

    /// Fetch a scheduled task by id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn get_task(&self, task_id: &str) -> StorageResult<Option<ScheduledTaskRecord>> {
        let row = sqlx::query(
            "SELECT task_id, task_class, schedule, config, enabled, created_at, updated_at
             FROM scheduled_tasks WHERE task_id = ?1",
        )
        .bind(task_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|row| Self::task_from_row(&row)).transpose()
    }

    /// List scheduled tasks ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn list_tasks(&self, enabled_only: bool) -> StorageResult<Vec<ScheduledTaskRecord>> {
        let query = if enabled_only {
            "SELECT task_id, task_class, schedule, config, enabled, created_at, updated_at
             FROM scheduled_tasks WHERE enabled = 1 ORDER BY task_id"
        } else {
            "SELECT task_id, task_class, schedule, config, enabled, created_at, updated_at
             FROM scheduled_tasks ORDER BY task_id"
        };

        let rows = sqlx::query(query).fetch_all(self.db.pool()).await?;
        rows.iter().map(Self::task_from_row).collect()
    }

    /// Delete a scheduled task. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn delete_task(&self, task_id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE task_id = ?1")
            .bind(task_id)
            .execute(self.db.pool())
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(task_id, "Deleted task");
        } else {
            warn!(task_id, "Task not found for deletion");
        }
        Ok(deleted)
    }

    /// Enable or disable a task. Returns whether a row was updated.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn set_task_enabled(&self, task_id: &str, enabled: bool) -> StorageResult<bool> {
        let result =
            sqlx::query("UPDATE scheduled_tasks SET enabled = ?1, updated_at = ?2 WHERE task_id = ?3")
                .bind(enabled)
                .bind(now_iso())
                .bind(task_id)
                .execute(self.db.pool())
                .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            info!(task_id, enabled, "Task enabled flag changed");
        }
        Ok(updated)
    }

    /// Record the start of an execution.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn record_execution_start(
        &self,
        task_id: &str,
        execution_id: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO task_executions (execution_id, task_id, status, started_at)
             VALUES (?1, ?2, 'running', ?3)",
        )
        .bind(execution_id)
        .bind(task_id)
        .bind(now_iso())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Record the completion of an execution.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn record_execution_result(
        &self,
        task_id: &str,
        execution_id: &str,
        status: &str,
        result: Option<&Value>,
        error_message: Option<&str>,
        duration_seconds: f64,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE task_executions
             SET status = ?1, completed_at = ?2, result = ?3,
                 error_message = ?4, duration_seconds = ?5
             WHERE task_id = ?6 AND execution_id = ?7",
        )
        .bind(status)
        .bind(now_iso())
        .bind(result.map(Value::to_string))
        .bind(error_message)
        .bind(duration_seconds)
        .bind(task_id)
        .bind(execution_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Execution history for a task, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn get_execution_history(
        &self,
        task_id: &str,
        limit: u32,
    ) -> StorageResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT execution_id, task_id, status, started_at, completed_at,
                    result, error_message, duration_seconds
             FROM task_executions
             WHERE task_id = ?1
             ORDER BY started_at DESC
             LIMIT ?2",
        )
        .bind(task_id)
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::execution_from_row).collect()
    }

    /// The most recent execution of a task, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn get_last_execution(
        &self,
        task_id: &str,
    ) -> StorageResult<Option<ExecutionRecord>> {
        Ok(self.get_execution_history(task_id, 1).await?.into_iter().next())
    }

    /// Count executions currently marked running for a task.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn count_running(&self, task_id: &str) -> StorageResult<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM task_executions WHERE task_id = ?1 AND status = 'running'",
        )
        .bind(task_id)
        .fetch_one(self.db.pool())
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Acquire the execution lock for a task.
    ///
    /// One transaction: expired rows are swept, a live row means the
    /// lock is held elsewhere, otherwise a fresh row is inserted. A
    /// unique-constraint violation from a concurrent inserter is the
    /// signal "someone else has it" and maps to `false`, never to an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn acquire_lock(
        &self,
        task_id: &str,
        execution_id: &str,
        ttl_secs: u64,
    ) -> StorageResult<bool> {
        let now = Utc::now();
        let ttl = i64::try_from(ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::days(36500));
        let expires_at = (now + ttl).to_rfc3339_opts(SecondsFormat::Micros, true);
        let now = now.to_rfc3339_opts(SecondsFormat::Micros, true);

        let mut tx = self.db.pool().begin().await?;

        sqlx::query("DELETE FROM task_locks WHERE expires_at < ?1")
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query("SELECT execution_id FROM task_locks WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;

        if existing.is_some() {
            tx.rollback().await?;
            debug!(task_id, "Lock held elsewhere");
            return Ok(false);
        }

        let inserted = sqlx::query(
            "INSERT INTO task_locks (task_id, execution_id, expires_at) VALUES (?1, ?2, ?3)",
        )
        .bind(task_id)
        .bind(execution_id)
        .bind(&expires_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(true)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                debug!(task_id, "Lock lost to concurrent inserter");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Release the execution lock. Idempotent: releasing a lock that
    /// was never held (or already swept) returns `false`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn release_lock(&self, task_id: &str, execution_id: &str) -> StorageResult<bool> {
        let result =
            sqlx::query("DELETE FROM task_locks WHERE task_id = ?1 AND execution_id = ?2")
                .bind(task_id)
                .bind(execution_id)
                .execute(self.db.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete execution records older than the retention window.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn cleanup_old_executions(&self, retention_days: u32) -> StorageResult<u64> {
        let cutoff = (Utc::now() - Duration::days(i64::from(retention_days)))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        let result = sqlx::query("DELETE FROM task_executions WHERE started_at < ?1")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "Cleaned up old task execution records");
        }
        Ok(deleted)
    }

    fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<ScheduledTaskRecord> {
        let config: Option<String> = row.try_get("config")?;
        let config = match config {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Value::Object(serde_json::Map::new()),
        };

        Ok(ScheduledTaskRecord {
            task_id: row.try_get("task_id")?,
            task_class: row.try_get("task_class")?,
            schedule: row.try_get("schedule")?,
            config,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<ExecutionRecord> {
        let result: Option<String> = row.try_get("result")?;
        let result = result.map(|raw| serde_json::from_str(&raw)).transpose()?;

        Ok(ExecutionRecord {
            execution_id: row.try_get("execution_id")?,
            task_id: row.try_get("task_id")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            result,
            error_message: row.try_get("error_message")?,
            duration_seconds: row.try_get("duration_seconds")?,
        })
    }
}
