//! Built-in tasks shipped with the scheduler.

mod maintenance;

pub use maintenance::{
    EventLogCleanupTask, ExecutionHistoryCleanupTask, StorageHealthCheckTask, UsageDigestTask,
};

use crate::registry::TaskRegistry;
use std::sync::Arc;

/// Register every built-in task.
pub fn register_builtin_tasks(registry: &mut TaskRegistry) {
    registry.register(Arc::new(EventLogCleanupTask));
    registry.register(Arc::new(ExecutionHistoryCleanupTask));
    registry.register(Arc::new(StorageHealthCheckTask));
    registry.register(Arc::new(UsageDigestTask));
}
