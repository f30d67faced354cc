//! Append-only archive of published bus envelopes.

use chrono::{SecondsFormat, Utc};
use hearth_core::MessageEnvelope;
use sqlx::Row;
use tracing::debug;

use crate::db::Database;
use crate::error::StorageResult;

/// Appends published envelopes to the `events` table.
///
/// Installed as the bus persistence hook when `bus.persist_events` is
/// set; append failures are logged by the bus and never fail the
/// publish.
#[derive(Debug, Clone)]
pub struct EventArchive {
    db: Database,
}

impl EventArchive {
    /// Create an archive over an opened database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one published envelope.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Query`] on database failure.
    pub async fn append(&self, topic: &str, envelope: &MessageEnvelope) -> StorageResult<()> {
        let payload = serde_json::to_vec(&envelope.payload)?;
        let metadata = serde_json::to_string(&envelope.metadata)?;

        sqlx::query(
            "INSERT INTO events
                 (timestamp, topic, source, message_type, message_id,
                  priority, correlation_id, payload, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(topic)
        .bind(&envelope.metadata.source)
        .bind(&envelope.kind)
        .bind(envelope.metadata.message_id.to_string())
        .bind(i64::from(envelope.metadata.priority))
        .bind(envelope.metadata.correlation_id.map(|id| id.to_string()))
        .bind(payload)
        .bind(metadata)
        .execute(self.db.pool())
        .await?;

        debug!(topic, kind = %envelope.kind, "Envelope archived");
        Ok(())
    }

    /// Number of archived events (used by health checks and tests).
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Query`] on database failure.
    pub async fn count(&self) -> StorageResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(self.db.pool())
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Delete archived events older than the retention window.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Query`] on database failure.
    pub async fn cleanup(&self, retention_days: u32) -> StorageResult<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retention_days)))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_count() {
        let db = Database::open_memory().await.unwrap();
        db.migrate().await.unwrap();
        let archive = EventArchive::new(db);

        let envelope = MessageEnvelope::new("echo.request", json!({"echo": "hi"}), "rest");
        archive.append("gateway.request.echo", &envelope).await.unwrap();

        let reply = envelope.reply("echo.response", json!({}), "echo");
        archive.append("gateway.reply.echo", &reply).await.unwrap();

        assert_eq!(archive.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_by_age() {
        let db = Database::open_memory().await.unwrap();
        db.migrate().await.unwrap();
        let archive = EventArchive::new(db.clone());

        sqlx::query(
            "INSERT INTO events (timestamp, topic, source, message_type, message_id,
                                 priority, correlation_id, payload, metadata)
             VALUES ('2000-01-01T00:00:00.000000Z', 't', 's', 'k', 'id', 5, NULL, X'7B7D', '{}')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert_eq!(archive.cleanup(30).await.unwrap(), 1);
        assert_eq!(archive.count().await.unwrap(), 0);
    }
}
