//! Queue handler that runs workflow steps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::engine::{STEP_TASK_TYPE, StepTaskPayload, WorkflowEngine};
use super::executor::StepExecutor;
use crate::consumer::TaskHandler;
use crate::error::TaskError;
use crate::queue::Task;

/// Outer bound for one step task. The step's own timeout is enforced by the
/// executor and is normally much shorter.
const STEP_TASK_TIMEOUT: Duration = Duration::from_secs(3600);

/// Executes `workflow-step` tasks. The pool reports the outcome back to the
/// engine through its lifecycle hook.
pub struct WorkflowStepHandler {
    engine: Arc<WorkflowEngine>,
    executor: Arc<StepExecutor>,
}

impl WorkflowStepHandler {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        let executor = Arc::clone(engine.executor());
        Self { engine, executor }
    }
}

#[async_trait]
impl TaskHandler for WorkflowStepHandler {
    fn task_type(&self) -> &str {
        STEP_TASK_TYPE
    }

    fn execution_timeout(&self) -> Duration {
        STEP_TASK_TIMEOUT
    }

    async fn handle(&self, task: &Task) -> Result<serde_json::Value, TaskError> {
        let payload = StepTaskPayload::from_task(task)?;
        let (step, context) = self
            .engine
            .begin_step(payload.execution_id, &payload.step_id, task.attempt)
            .await?;

        debug!(
            execution_id = %payload.execution_id,
            step_id = %step.id,
            step_type = %step.step_type,
            attempt = task.attempt,
            "Executing workflow step"
        );
        let output = self.executor.execute(&step, &context).await?;
        serde_json::to_value(&output).map_err(|e| TaskError::Handler(format!("step output: {e}")))
    }
}
