//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A cron expression failed to parse.
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron {
        /// The offending expression.
        expr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The referenced task has no persistent record.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The task class cannot be resolved against the registry.
    #[error("task class not found for: {0}")]
    TaskClassNotFound(String),

    /// A storage operation failed.
    #[error(transparent)]
    Storage(#[from] hearth_storage::StorageError),

    /// The scheduler is already running.
    #[error("scheduler is already running")]
    AlreadyRunning,
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
