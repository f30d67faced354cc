//! Maintenance tasks: retention sweeps and storage health probes.

use async_trait::async_trait;
use serde_json::json;
use sqlx::Row;
use tracing::info;

use hearth_storage::{EventArchive, TaskStore};

use crate::task::{Task, TaskContext, TaskResult};

/// Deletes archived bus events older than the retention window.
pub struct EventLogCleanupTask;

#[async_trait]
impl Task for EventLogCleanupTask {
    fn task_id(&self) -> &'static str {
        "maintenance.log_cleanup"
    }

    fn task_class(&self) -> &'static str {
        "EventLogCleanupTask"
    }

    fn default_schedule(&self) -> &'static str {
        "0 3 * * *"
    }

    fn default_config(&self) -> serde_json::Value {
        json!({"retention_days": 30})
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult {
        let retention_days = ctx.get_u64("retention_days", 30);
        let retention_days = u32::try_from(retention_days).unwrap_or(30);

        let archive = EventArchive::new(ctx.db.clone());
        match archive.cleanup(retention_days).await {
            Ok(deleted) => {
                info!(deleted, retention_days, "Event log cleanup finished");
                TaskResult::ok_with_data(
                    format!("removed {deleted} archived events"),
                    json!({"deleted": deleted, "retention_days": retention_days}),
                )
            }
            Err(error) => TaskResult::failed(format!("event cleanup failed: {error}")),
        }
    }
}

/// Deletes task execution history older than the retention window.
///
/// This is the scheduler cleaning up after itself; it runs after the
/// event sweep so both retention passes land in the same nightly
/// window.
pub struct ExecutionHistoryCleanupTask;

#[async_trait]
impl Task for ExecutionHistoryCleanupTask {
    fn task_id(&self) -> &'static str {
        "maintenance.execution_cleanup"
    }

    fn task_class(&self) -> &'static str {
        "ExecutionHistoryCleanupTask"
    }

    fn default_schedule(&self) -> &'static str {
        "30 3 * * *"
    }

    fn default_config(&self) -> serde_json::Value {
        json!({"retention_days": 30})
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult {
        let retention_days = ctx.get_u64("retention_days", 30);
        let retention_days = u32::try_from(retention_days).unwrap_or(30);

        let store = TaskStore::new(ctx.db.clone());
        match store.cleanup_old_executions(retention_days).await {
            Ok(deleted) => TaskResult::ok_with_data(
                format!("removed {deleted} execution records"),
                json!({"deleted": deleted, "retention_days": retention_days}),
            ),
            Err(error) => TaskResult::failed(format!("execution cleanup failed: {error}")),
        }
    }
}

/// Probes the storage layer and reports basic table counts.
pub struct StorageHealthCheckTask;

#[async_trait]
impl Task for StorageHealthCheckTask {
    fn task_id(&self) -> &'static str {
        "maintenance.health_check"
    }

    fn task_class(&self) -> &'static str {
        "StorageHealthCheckTask"
    }

    fn default_schedule(&self) -> &'static str {
        "*/30 * * * *"
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult {
        let probe = sqlx::query("SELECT COUNT(*) AS n FROM scheduled_tasks")
            .fetch_one(ctx.db.pool())
            .await;

        match probe {
            Ok(row) => {
                let tasks: i64 = row.try_get("n").unwrap_or(0);
                TaskResult::ok_with_data(
                    "storage reachable",
                    json!({"scheduled_tasks": tasks}),
                )
            }
            Err(error) => TaskResult::failed(format!("storage probe failed: {error}")),
        }
    }
}

/// Summarizes archived event volume per topic prefix.
///
/// Disabled by default: digesting usage is an opt-in behavior that
/// deployments enable through the admin API.
pub struct UsageDigestTask;

#[async_trait]
impl Task for UsageDigestTask {
    fn task_id(&self) -> &'static str {
        "insights.usage_digest"
    }

    fn task_class(&self) -> &'static str {
        "UsageDigestTask"
    }

    fn default_schedule(&self) -> &'static str {
        "0 4 * * 0"
    }

    fn default_enabled(&self) -> bool {
        false
    }

    fn default_config(&self) -> serde_json::Value {
        json!({"top_topics": 10})
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult {
        let limit = ctx.get_u64("top_topics", 10);
        let limit = i64::try_from(limit).unwrap_or(10);

        let rows = sqlx::query(
            "SELECT topic, COUNT(*) AS n FROM events GROUP BY topic ORDER BY n DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(ctx.db.pool())
        .await;

        match rows {
            Ok(rows) => {
                let digest: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| {
                        json!({
                            "topic": row.try_get::<String, _>("topic").unwrap_or_default(),
                            "count": row.try_get::<i64, _>("n").unwrap_or(0),
                        })
                    })
                    .collect();
                TaskResult::ok_with_data(
                    format!("digested {} topics", digest.len()),
                    json!({"topics": digest}),
                )
            }
            Err(error) => TaskResult::failed(format!("usage digest failed: {error}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::MessageEnvelope;
    use hearth_storage::Database;

    async fn test_ctx(task_id: &str) -> TaskContext {
        let db = Database::open_memory().await.unwrap();
        db.migrate().await.unwrap();
        TaskContext {
            task_id: task_id.into(),
            execution_id: "test-exec".into(),
            instance_config: json!({}),
            defaults: json!({}),
            db,
        }
    }

    #[tokio::test]
    async fn test_log_cleanup_on_empty_archive() {
        let ctx = test_ctx("maintenance.log_cleanup").await;
        let result = EventLogCleanupTask.execute(&ctx).await;
        assert!(result.success);
        assert_eq!(result.data.as_ref().unwrap()["deleted"], 0);
    }

    #[tokio::test]
    async fn test_health_check_reports_counts() {
        let ctx = test_ctx("maintenance.health_check").await;
        let result = StorageHealthCheckTask.execute(&ctx).await;
        assert!(result.success);
        assert_eq!(result.data.as_ref().unwrap()["scheduled_tasks"], 0);
    }

    #[tokio::test]
    async fn test_usage_digest_counts_topics() {
        let ctx = test_ctx("insights.usage_digest").await;
        let archive = EventArchive::new(ctx.db.clone());
        for _ in 0..3 {
            archive
                .append(
                    "gateway.request.echo",
                    &MessageEnvelope::new("echo.request", json!({}), "rest"),
                )
                .await
                .unwrap();
        }

        let result = UsageDigestTask.execute(&ctx).await;
        assert!(result.success);
        let topics = &result.data.as_ref().unwrap()["topics"];
        assert_eq!(topics[0]["topic"], "gateway.request.echo");
        assert_eq!(topics[0]["count"], 3);
    }

    #[tokio::test]
    async fn test_digest_disabled_by_default() {
        assert!(!UsageDigestTask.default_enabled());
        assert!(EventLogCleanupTask.default_enabled());
    }
}
