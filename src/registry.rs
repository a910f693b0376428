//! Process-wide mapping from qualified task name to executable function,
//! realized as an explicit constructed value rather than a decorator-populated
//! global.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::TaskExecutionError;
use crate::task::RetryOptions;

/// A task body, already resolved to an owned future. Both synchronous and
/// asynchronous user functions are registered this way: a synchronous body
/// is simply wrapped in `async move { .. }` by the caller of `register`, so
/// the Grunt Worker's dispatch path never needs to branch on a sync-vs-async
/// sum type — it always awaits.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskExecutionError>> + Send>>;

pub type Dispatch = Arc<dyn Fn(Value, Value) -> TaskFuture + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTask {
    pub dispatch: Dispatch,
    pub retry: Option<RetryOptions>,
}

/// A process-local registry of task names to executable functions.
///
/// `qualified_name` (`<module>.<function>`) must be unique within a
/// registry; registering the same name twice replaces the previous entry,
/// matching how re-importing a module would redefine the same decorated
/// function in the source this system was distilled from.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task body under `qualified_name`, with its definition-time
    /// retry policy (if any).
    pub fn register(
        &mut self,
        qualified_name: impl Into<String>,
        retry: Option<RetryOptions>,
        dispatch: Dispatch,
    ) {
        self.tasks
            .insert(qualified_name.into(), RegisteredTask { dispatch, retry });
    }

    /// Resolve `qualified_name` to its registered task, or
    /// `TaskExecutionError::TaskNotRegistered` if absent.
    pub fn resolve(&self, qualified_name: &str) -> Result<&RegisteredTask, TaskExecutionError> {
        self.tasks
            .get(qualified_name)
            .ok_or_else(|| TaskExecutionError::TaskNotRegistered(qualified_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
