use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use asyncq_backend::ResultStore;
use asyncq_core::{ResultMeta, RetryPolicy, TaskError, TaskState, DEFAULT_MAX_RETRIES};

/// Why a handler did not produce a result.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Ask for the task to be re-published for another attempt, after
    /// `countdown` if given, else after the task's retry policy delay.
    #[error("retry requested")]
    Retry { countdown: Option<Duration> },

    /// The attempt failed. Retried automatically while attempts remain.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn retry() -> Self {
        HandlerError::Retry { countdown: None }
    }

    pub fn retry_in(countdown: Duration) -> Self {
        HandlerError::Retry {
            countdown: Some(countdown),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::Failed(format!("{error:#}"))
    }
}

/// Execution context handed to each handler invocation.
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_name: String,
    /// How many attempts came before this one.
    pub retries: u32,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    backend: Option<Arc<ResultStore>>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: Uuid,
        task_name: String,
        retries: u32,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        backend: Option<Arc<ResultStore>>,
    ) -> Self {
        Self {
            task_id,
            task_name,
            retries,
            args,
            kwargs,
            backend,
        }
    }

    /// Publish interim, non-terminal state (e.g. STARTED with progress
    /// metadata) to the result store. A no-op without a backend.
    pub async fn update_state(&self, state: TaskState, meta: Value) -> Result<(), TaskError> {
        if state.is_terminal() {
            return Err(TaskError::Handler(format!(
                "update_state cannot set terminal state {state}"
            )));
        }
        match &self.backend {
            Some(store) => {
                store
                    .store(self.task_id, &ResultMeta::with_state(self.task_id, state, meta))
                    .await
            }
            None => {
                debug!(task_id = %self.task_id, "no result backend; dropping state update");
                Ok(())
            }
        }
    }
}

/// A unit of work executable by the worker.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<Value, HandlerError>;
}

/// Per-task execution options.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    /// Skip the SUCCESS result write; failures are still recorded.
    pub ignore_result: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_policy: RetryPolicy::default(),
            ignore_result: false,
        }
    }
}

/// A registered task: its handler and options.
pub struct RegisteredTask {
    pub handler: Arc<dyn TaskHandler>,
    pub options: TaskOptions,
}

/// Maps task names to handlers. Names are global per worker process.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<RegisteredTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, options: TaskOptions, handler: Arc<dyn TaskHandler>) {
        let mut tasks = self.tasks.write();
        if tasks
            .insert(name.to_string(), Arc::new(RegisteredTask { handler, options }))
            .is_some()
        {
            warn!(task = name, "handler replaced an existing registration");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTask>> {
        self.tasks.read().get(name).cloned()
    }

    /// Registered task names, sorted for stable startup logs.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoArgs;

    #[async_trait]
    impl TaskHandler for EchoArgs {
        async fn run(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
            Ok(Value::Array(ctx.args))
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = TaskRegistry::new();
        registry.register("t.echo", TaskOptions::default(), Arc::new(EchoArgs));

        let task = registry.get("t.echo").unwrap();
        let ctx = TaskContext::new(
            Uuid::new_v4(),
            "t.echo".to_string(),
            0,
            vec![json!(1), json!("two")],
            Map::new(),
            None,
        );
        let result = task.handler.run(ctx).await.unwrap();
        assert_eq!(result, json!([1, "two"]));
    }

    #[test]
    fn test_unknown_task_lookup() {
        let registry = TaskRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_names_sorted() {
        let registry = TaskRegistry::new();
        registry.register("b.task", TaskOptions::default(), Arc::new(EchoArgs));
        registry.register("a.task", TaskOptions::default(), Arc::new(EchoArgs));
        assert_eq!(registry.names(), vec!["a.task", "b.task"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_registration_replaces_handler() {
        let registry = TaskRegistry::new();
        registry.register("t.echo", TaskOptions::default(), Arc::new(EchoArgs));
        let replacement = TaskOptions {
            max_retries: 0,
            ..TaskOptions::default()
        };
        registry.register("t.echo", replacement, Arc::new(EchoArgs));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("t.echo").unwrap().options.max_retries, 0);
    }

    #[tokio::test]
    async fn test_update_state_rejects_terminal_states() {
        let ctx = TaskContext::new(
            Uuid::new_v4(),
            "t".to_string(),
            0,
            Vec::new(),
            Map::new(),
            None,
        );
        assert!(ctx
            .update_state(TaskState::Success, json!(null))
            .await
            .is_err());
        // Non-terminal without a backend is accepted and dropped.
        assert!(ctx
            .update_state(TaskState::Started, json!({"progress": 0.1}))
            .await
            .is_ok());
    }
}
