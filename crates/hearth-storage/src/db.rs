//! SQLite database wrapper.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};

/// Handle to the Hearth database.
///
/// The pool holds a single connection: SQLite is effectively a
/// single-writer store and funneling all access through one connection
/// keeps transactions serialized without busy-retry loops.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (and create if missing) the database at `path`.
    ///
    /// `encryption_key`, when present, is applied as a `key` pragma
    /// before any other statement; cipher-enabled SQLite builds use it
    /// for at-rest encryption and plain builds ignore it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>, encryption_key: Option<&str>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let mut options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("foreign_keys", "ON");

        if let Some(key) = encryption_key {
            options = options.pragma("key", key.to_string());
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Open(e.to_string()))?;

        info!(path = %path.display(), "Database opened");
        Ok(Self { pool })
    }

    /// Open an in-memory database (for tests).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection fails.
    pub async fn open_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Open(e.to_string()))?
            .pragma("foreign_keys", "ON");

        // One connection only, or each pooled connection would see its
        // own empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Open(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Create the gateway-owned tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if DDL execution fails.
    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                task_id    TEXT PRIMARY KEY,
                task_class TEXT NOT NULL,
                schedule   TEXT NOT NULL,
                config     TEXT,
                enabled    INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_executions (
                execution_id     TEXT PRIMARY KEY,
                task_id          TEXT NOT NULL,
                status           TEXT NOT NULL,
                started_at       TEXT NOT NULL,
                completed_at     TEXT,
                result           TEXT,
                error_message    TEXT,
                duration_seconds REAL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_locks (
                task_id      TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                expires_at   TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp      TEXT NOT NULL,
                topic          TEXT NOT NULL,
                source         TEXT NOT NULL,
                message_type   TEXT NOT NULL,
                message_id     TEXT NOT NULL,
                priority       INTEGER NOT NULL,
                correlation_id TEXT,
                payload        BLOB NOT NULL,
                metadata       TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        debug!("Database migration complete");
        Ok(())
    }

    /// Probe the connection with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the database is unreachable.
    pub async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// The underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_and_migrate() {
        let db = Database::open_memory().await.unwrap();
        db.migrate().await.unwrap();
        // Idempotent.
        db.migrate().await.unwrap();
        db.ping().await.unwrap();
    }
}
