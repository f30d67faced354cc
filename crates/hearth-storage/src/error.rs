//! Storage error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database could not be opened.
    #[error("failed to open database: {0}")]
    Open(String),

    /// The schema is missing required tables.
    ///
    /// The daemon treats this as fatal: the scheduler refuses to run
    /// against an unmigrated store.
    #[error(
        "database schema is out of date: missing required scheduler tables: {missing}. \
         Run the database migrations before starting the gateway."
    )]
    SchemaOutOfDate {
        /// Comma-joined names of the missing tables.
        missing: String,
    },

    /// A query failed.
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Stored JSON could not be decoded.
    #[error("stored JSON could not be decoded: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
