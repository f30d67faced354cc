//! Persistent storage for the Hearth gateway runtime.
//!
//! Wraps a single SQLite database holding the scheduler tables
//! (`scheduled_tasks`, `task_executions`, `task_locks`) and the event
//! archive (`events`). The pool is capped at one connection so every
//! write goes through the same serialized path; callers on the hot
//! path dispatch store calls onto their own tasks rather than awaiting
//! them inline.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod db;
mod error;
mod events;
mod task_store;

pub use db::Database;
pub use error::{StorageError, StorageResult};
pub use events::EventArchive;
pub use task_store::{ExecutionRecord, ScheduledTaskRecord, TaskStore, REQUIRED_TABLES};
