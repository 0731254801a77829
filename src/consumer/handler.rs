//! Task handler contract and registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::TaskError;
use crate::queue::Task;

/// Default handler timeout.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Executes tasks of one type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type this handler is registered under.
    fn task_type(&self) -> &str;

    /// Downstream service the handler calls. Keys its circuit breaker;
    /// defaults to the task type.
    fn service(&self) -> Option<&str> {
        None
    }

    /// Upper bound on a single attempt. Exceeding it is a transient failure.
    fn execution_timeout(&self) -> Duration {
        DEFAULT_EXECUTION_TIMEOUT
    }

    /// Run one attempt. The returned value is stored as the task output.
    async fn handle(&self, task: &Task) -> Result<serde_json::Value, TaskError>;
}

/// Observes terminal task outcomes reported by the consumer pool.
#[async_trait]
pub trait TaskLifecycleHook: Send + Sync {
    /// Called after a successful ack.
    async fn on_task_completed(&self, task: &Task, output: &serde_json::Value);

    /// Called after a failure became terminal.
    async fn on_task_failed(&self, task: &Task, error: &TaskError);
}

/// Handlers keyed by task type.
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one for the same type.
    pub async fn register(&self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type().to_string();
        if self
            .handlers
            .write()
            .await
            .insert(task_type.clone(), handler)
            .is_some()
        {
            tracing::warn!(task_type = %task_type, "Replaced existing task handler");
        } else {
            tracing::debug!(task_type = %task_type, "Registered task handler");
        }
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(task_type).cloned()
    }

    pub async fn has(&self, task_type: &str) -> bool {
        self.handlers.read().await.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    pub async fn count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

/// Completes immediately, echoing the payload back as output.
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    fn task_type(&self) -> &str {
        "noop"
    }

    async fn handle(&self, task: &Task) -> Result<serde_json::Value, TaskError> {
        Ok(task.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NewTask;
    use chrono::Utc;
    use serde_json::json;

    struct Fixed(&'static str);

    #[async_trait]
    impl TaskHandler for Fixed {
        fn task_type(&self) -> &str {
            self.0
        }

        async fn handle(&self, _task: &Task) -> Result<serde_json::Value, TaskError> {
            Ok(json!({ "handled_by": self.0 }))
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = TaskHandlerRegistry::new();
        registry.register(Arc::new(Fixed("email"))).await;
        registry.register(Arc::new(NoopHandler)).await;

        assert!(registry.has("email").await);
        assert!(!registry.has("sms").await);
        assert_eq!(registry.list().await, vec!["email", "noop"]);
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn re_registering_replaces() {
        let registry = TaskHandlerRegistry::new();
        registry.register(Arc::new(Fixed("email"))).await;
        registry.register(Arc::new(Fixed("email"))).await;
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn noop_echoes_payload_with_defaults() {
        let task = NewTask::new("noop", json!({"x": 1})).into_task(3, Utc::now());
        let handler = NoopHandler;
        assert_eq!(handler.handle(&task).await.unwrap(), json!({"x": 1}));
        assert!(handler.service().is_none());
        assert_eq!(handler.execution_timeout(), DEFAULT_EXECUTION_TIMEOUT);
    }
}
