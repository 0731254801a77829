//! Workflow execution state machine.
//!
//! Every step runs as a `workflow-step` queue task. The engine reacts to
//! step outcomes (reported through [`TaskLifecycleHook`]) by merging
//! outputs into the context and dispatching whatever became runnable.
//! Mutations of one execution are serialized by its own async mutex;
//! different executions proceed in parallel. State is written through to
//! the store after every change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::{StepExecutor, StepOutput};
use super::model::{
    Context, DefinitionStatus, ExecutionStatus, OnError, StepExecutionRecord, StepSpec,
    StepStatus, WorkflowDefinition, WorkflowExecution,
};
use super::resolver;
use crate::config::WorkflowConfig;
use crate::consumer::TaskLifecycleHook;
use crate::error::{TaskError, WorkflowError};
use crate::events::{EventBroadcaster, StatusEvent};
use crate::queue::{NewTask, Task, TaskQueue};
use crate::store::Database;

/// Queue task type carrying one workflow step.
pub const STEP_TASK_TYPE: &str = "workflow-step";

/// Payload of a `workflow-step` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTaskPayload {
    pub execution_id: Uuid,
    pub step_id: String,
}

impl StepTaskPayload {
    pub fn from_task(task: &Task) -> Result<Self, TaskError> {
        serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskError::Validation(format!("invalid workflow-step payload: {e}")))
    }
}

/// In-memory view of one live execution.
struct ExecutionState {
    definition: Arc<WorkflowDefinition>,
    execution: WorkflowExecution,
    records: Vec<StepExecutionRecord>,
    /// Records changed since the last write-through.
    dirty: HashSet<String>,
}

impl ExecutionState {
    fn record(&self, step_id: &str) -> Option<&StepExecutionRecord> {
        self.records.iter().find(|r| r.step_id == step_id)
    }

    fn record_mut(&mut self, step_id: &str) -> Option<&mut StepExecutionRecord> {
        let record = self.records.iter_mut().find(|r| r.step_id == step_id)?;
        self.dirty.insert(step_id.to_string());
        Some(record)
    }
}

type SharedState = Arc<AsyncMutex<ExecutionState>>;

/// Runs workflow executions on top of the task queue.
pub struct WorkflowEngine {
    store: Arc<dyn Database>,
    queue: Arc<TaskQueue>,
    executor: Arc<StepExecutor>,
    broadcaster: Arc<EventBroadcaster>,
    config: WorkflowConfig,
    /// Non-terminal executions touched by this process.
    active: Mutex<HashMap<Uuid, SharedState>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Database>,
        queue: Arc<TaskQueue>,
        executor: Arc<StepExecutor>,
        broadcaster: Arc<EventBroadcaster>,
        config: WorkflowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            executor,
            broadcaster,
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    /// Executions currently cached in memory.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    // ── Definitions ─────────────────────────────────────────────────

    /// Validate and store a definition. Assigns an id when it has none.
    pub async fn register_definition(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        if definition.id.trim().is_empty() {
            definition.id = Uuid::new_v4().to_string();
        }
        resolver::validate(&definition, |t| self.executor.has_type(t))?;
        let lease = self.queue.config().visibility_timeout;
        if let Some(step) = definition
            .steps
            .iter()
            .find(|s| self.executor.timeout_for(s) >= lease)
        {
            return Err(WorkflowError::InvalidDefinition(format!(
                "step '{}' timeout of {:?} must be shorter than the {:?} task lease",
                step.id,
                self.executor.timeout_for(step),
                lease
            )));
        }
        definition.updated_at = Utc::now();
        self.store.save_definition(&definition).await?;
        info!(
            workflow_id = %definition.id,
            name = %definition.name,
            steps = definition.steps.len(),
            "Workflow definition registered"
        );
        Ok(definition)
    }

    pub async fn get_definition(&self, id: &str) -> Result<WorkflowDefinition, WorkflowError> {
        self.store
            .get_definition(id)
            .await?
            .ok_or_else(|| WorkflowError::DefinitionNotFound { id: id.to_string() })
    }

    pub async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        Ok(self.store.list_definitions().await?)
    }

    // ── Execution lifecycle ─────────────────────────────────────────

    /// Start an execution of `workflow_id` with `input` overlaid on the
    /// definition variables.
    pub async fn start(
        &self,
        workflow_id: &str,
        input: Context,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let definition = self.get_definition(workflow_id).await?;
        if definition.status != DefinitionStatus::Active {
            return Err(WorkflowError::NotStartable {
                id: definition.id.clone(),
                status: definition.status.as_str().to_string(),
            });
        }

        let mut context = definition.variables.clone();
        context.extend(input);
        let execution = WorkflowExecution::new(&definition, context);
        let records: Vec<StepExecutionRecord> = definition
            .steps
            .iter()
            .map(|step| StepExecutionRecord::pending(execution.id, step))
            .collect();

        self.store.insert_execution(&execution).await?;
        for record in &records {
            self.store.upsert_step_record(record).await?;
        }

        let execution_id = execution.id;
        let handle: SharedState = Arc::new(AsyncMutex::new(ExecutionState {
            definition: Arc::new(definition),
            execution,
            records,
            dirty: HashSet::new(),
        }));
        // Cache before dispatching so step workers find this state.
        let mut state = handle.lock().await;
        self.active.lock().insert(execution_id, Arc::clone(&handle));

        state.execution.transition_to(ExecutionStatus::Running)?;
        info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            "Workflow execution started"
        );
        self.publish_execution(&state.execution);

        let advanced = self.advance(&mut state).await;
        self.persist(&mut state).await?;
        advanced?;
        self.evict_if_terminal(&state);
        Ok(state.execution.clone())
    }

    /// Record a completed step and dispatch whatever it unblocks.
    pub async fn on_step_completed(
        &self,
        execution_id: Uuid,
        step_id: &str,
        result: StepOutput,
    ) -> Result<(), WorkflowError> {
        let handle = self.state_handle(execution_id).await?;
        let mut state = handle.lock().await;
        let definition = Arc::clone(&state.definition);
        let Some(step) = definition.step(step_id) else {
            warn!(execution_id = %execution_id, step_id, "Completion for unknown step");
            return Ok(());
        };
        if state.record(step_id).is_none_or(|r| r.status.is_terminal()) {
            debug!(execution_id = %execution_id, step_id, "Duplicate step completion ignored");
            return Ok(());
        }

        let target = result
            .next_override
            .clone()
            .or_else(|| step.next_step_id.clone())
            .filter(|t| {
                let known = definition.step(t).is_some();
                if !known {
                    warn!(execution_id = %execution_id, step_id, target = %t, "Jump to unknown step ignored");
                }
                known
            });

        let live = !state.execution.status.is_terminal();
        if let Some(record) = state.record_mut(step_id) {
            record.output = Some(Value::Object(result.output.clone()));
            record.next_step_id = target.clone();
            record.error_message = None;
            record.finish(StepStatus::Completed);
        }
        self.broadcaster.publish(StatusEvent::step(
            execution_id,
            step_id,
            StepStatus::Completed,
            json!({ "output": result.output, "next_step_id": target }),
        ));

        if !live {
            // Late result for an aborted execution: keep the record, change nothing else.
            self.persist(&mut state).await?;
            self.evict_if_terminal(&state);
            return Ok(());
        }

        state.execution.context.extend(result.output);
        state.execution.completed_steps += 1;
        state.execution.executed_step_ids.push(step_id.to_string());
        state.execution.current_step_id = Some(step_id.to_string());
        debug!(
            execution_id = %execution_id,
            step_id,
            next = target.as_deref().unwrap_or("-"),
            "Step completed"
        );

        let bypassed: Vec<String> =
            resolver::bypassed_steps(&definition, &state.records, step, target.as_deref())
                .into_iter()
                .map(str::to_string)
                .collect();
        for id in bypassed {
            self.skip_step(&mut state, &id, "branch not taken");
        }

        let advanced = self.advance(&mut state).await;
        self.persist(&mut state).await?;
        advanced?;
        self.evict_if_terminal(&state);
        Ok(())
    }

    /// Record a terminally failed step and apply the error policy.
    pub async fn on_step_failed(
        &self,
        execution_id: Uuid,
        step_id: &str,
        error: &str,
    ) -> Result<(), WorkflowError> {
        let handle = self.state_handle(execution_id).await?;
        let mut state = handle.lock().await;
        if state.record(step_id).is_none_or(|r| r.status.is_terminal()) {
            debug!(execution_id = %execution_id, step_id, "Duplicate step failure ignored");
            return Ok(());
        }

        let live = !state.execution.status.is_terminal();
        let on_error = state.definition.error_policy.on_error;
        let record_status = if live && on_error == OnError::Skip {
            StepStatus::Skipped
        } else {
            StepStatus::Failed
        };
        if let Some(record) = state.record_mut(step_id) {
            record.error_message = Some(error.to_string());
            record.finish(record_status);
        }
        self.broadcaster.publish(StatusEvent::step(
            execution_id,
            step_id,
            StepStatus::Failed,
            json!({ "error": error, "on_error": on_error }),
        ));

        if !live {
            self.persist(&mut state).await?;
            self.evict_if_terminal(&state);
            return Ok(());
        }

        state.execution.failed_steps += 1;
        state.execution.executed_step_ids.push(step_id.to_string());
        state.execution.current_step_id = Some(step_id.to_string());
        warn!(
            execution_id = %execution_id,
            step_id,
            on_error = ?on_error,
            error,
            "Step failed"
        );

        let advanced = self.advance(&mut state).await;
        self.persist(&mut state).await?;
        advanced?;
        self.evict_if_terminal(&state);
        Ok(())
    }

    /// Stop dispatching new steps. In-flight steps finish normally.
    pub async fn pause(&self, execution_id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let handle = self.state_handle(execution_id).await?;
        let mut state = handle.lock().await;
        state.execution.transition_to(ExecutionStatus::Paused)?;
        info!(execution_id = %execution_id, "Workflow execution paused");
        self.publish_execution(&state.execution);
        self.persist(&mut state).await?;
        Ok(state.execution.clone())
    }

    /// Resume a paused execution from its persisted step state.
    pub async fn resume(&self, execution_id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let handle = self.state_handle(execution_id).await?;
        let mut state = handle.lock().await;
        state.execution.transition_to(ExecutionStatus::Running)?;
        info!(execution_id = %execution_id, "Workflow execution resumed");
        self.publish_execution(&state.execution);

        let advanced = self.advance(&mut state).await;
        self.persist(&mut state).await?;
        advanced?;
        self.evict_if_terminal(&state);
        Ok(state.execution.clone())
    }

    /// Abort the execution and cancel its queued step tasks.
    pub async fn abort(&self, execution_id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let handle = self.state_handle(execution_id).await?;
        let mut state = handle.lock().await;
        self.finish(&mut state, ExecutionStatus::Aborted, None)?;
        self.cancel_dispatched(&mut state).await;

        self.persist(&mut state).await?;
        self.evict_if_terminal(&state);
        Ok(state.execution.clone())
    }

    /// Mark a step task as starting its attempt. Returns the step and a
    /// context snapshot to run it against.
    ///
    /// Refuses with a cancellation error once the execution is terminal.
    pub async fn begin_step(
        &self,
        execution_id: Uuid,
        step_id: &str,
        attempt: u32,
    ) -> Result<(StepSpec, Context), TaskError> {
        let handle = self.state_handle(execution_id).await.map_err(|e| match e {
            WorkflowError::ExecutionNotFound { .. } | WorkflowError::DefinitionNotFound { .. } => {
                TaskError::Validation(e.to_string())
            }
            other => TaskError::Handler(other.to_string()),
        })?;
        let mut state = handle.lock().await;

        if state.execution.status.is_terminal() {
            let reason = format!("execution {execution_id} is {}", state.execution.status);
            // The task was claimed before it could be cancelled.
            self.cancel_step(&mut state, step_id, &reason);
            let persisted = self.persist(&mut state).await;
            self.evict_if_terminal(&state);
            if let Err(e) = persisted {
                warn!(execution_id = %execution_id, step_id, error = %e, "Failed to record cancelled step");
            }
            return Err(TaskError::Cancelled(reason));
        }
        let Some(step) = state.definition.step(step_id).cloned() else {
            return Err(TaskError::Validation(format!("unknown step '{step_id}'")));
        };
        if let Some(status) = state
            .record(step_id)
            .map(|r| r.status)
            .filter(StepStatus::is_terminal)
        {
            return Err(TaskError::Cancelled(format!("step {step_id} is already {status}")));
        }

        let retry_count = attempt.saturating_sub(1);
        if let Some(record) = state.record_mut(step_id) {
            record.status = StepStatus::Running;
            record.retry_count = retry_count;
            record.started_at = Some(Utc::now());
        }
        state.execution.current_step_id = Some(step_id.to_string());
        self.broadcaster.publish(StatusEvent::step(
            execution_id,
            step_id,
            StepStatus::Running,
            json!({ "attempt": attempt, "retry_count": retry_count }),
        ));
        self.persist(&mut state)
            .await
            .map_err(|e| TaskError::Handler(e.to_string()))?;

        Ok((step, state.execution.context.clone()))
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or(WorkflowError::ExecutionNotFound { id: execution_id })
    }

    pub async fn list_step_records(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, WorkflowError> {
        Ok(self.store.list_step_records(execution_id).await?)
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn state_handle(&self, execution_id: Uuid) -> Result<SharedState, WorkflowError> {
        if let Some(handle) = self.active.lock().get(&execution_id) {
            return Ok(Arc::clone(handle));
        }

        let execution = self.get_execution(execution_id).await?;
        let definition = self.get_definition(&execution.workflow_id).await?;
        let records = self.store.list_step_records(execution_id).await?;
        let terminal = execution.status.is_terminal();
        let loaded = ExecutionState {
            definition: Arc::new(definition),
            execution,
            records,
            dirty: HashSet::new(),
        };
        // Finished executions only see late results; nothing to keep around.
        if terminal {
            return Ok(Arc::new(AsyncMutex::new(loaded)));
        }

        let mut active = self.active.lock();
        let handle = active
            .entry(execution_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(loaded)));
        Ok(Arc::clone(handle))
    }

    /// Dispatch runnable steps, or close the execution when nothing is left.
    async fn advance(&self, state: &mut ExecutionState) -> Result<(), WorkflowError> {
        if state.execution.status != ExecutionStatus::Running {
            return Ok(());
        }
        if let Some(reason) = failure_reason(state) {
            self.finish(state, ExecutionStatus::Failed, Some(reason))?;
            self.cancel_dispatched(state).await;
            return Ok(());
        }

        let definition = Arc::clone(&state.definition);
        let runnable: Vec<&StepSpec> = resolver::runnable_steps(&definition, &state.records);
        if runnable.is_empty() {
            if !resolver::has_in_flight(&state.records) {
                self.finish(state, ExecutionStatus::Completed, None)?;
            }
            return Ok(());
        }

        for step in runnable {
            self.dispatch(state, &definition, step).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        state: &mut ExecutionState,
        definition: &WorkflowDefinition,
        step: &StepSpec,
    ) -> Result<(), WorkflowError> {
        let execution_id = state.execution.id;
        let payload = StepTaskPayload {
            execution_id,
            step_id: step.id.clone(),
        };
        let new = NewTask::new(STEP_TASK_TYPE, json!(payload))
            .with_priority(self.config.step_priority)
            .with_max_attempts(definition.max_attempts_for(step))
            .with_backoff_base(Duration::from_millis(definition.error_policy.retry_delay_ms));
        let task = self.queue.enqueue(new).await?;

        if let Some(record) = state.record_mut(&step.id) {
            record.status = StepStatus::Running;
            record.task_id = Some(task.id);
        }
        debug!(execution_id = %execution_id, step_id = %step.id, task_id = %task.id, "Step dispatched");
        self.broadcaster.publish(StatusEvent::step(
            execution_id,
            &step.id,
            "queued",
            json!({ "task_id": task.id }),
        ));
        Ok(())
    }

    /// Move to a terminal status, skipping every step still pending.
    fn finish(
        &self,
        state: &mut ExecutionState,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), WorkflowError> {
        state.execution.transition_to(status)?;
        if error.is_some() {
            state.execution.error_message = error;
        }

        let pending: Vec<String> = state
            .records
            .iter()
            .filter(|r| r.status == StepStatus::Pending)
            .map(|r| r.step_id.clone())
            .collect();
        for step_id in pending {
            self.skip_step(state, &step_id, "not reached");
        }

        let execution = &state.execution;
        match status {
            ExecutionStatus::Failed => error!(
                execution_id = %execution.id,
                error = execution.error_message.as_deref().unwrap_or(""),
                "Workflow execution failed"
            ),
            _ => info!(
                execution_id = %execution.id,
                status = %status,
                completed_steps = execution.completed_steps,
                failed_steps = execution.failed_steps,
                duration_ms = execution.duration_ms.unwrap_or(0),
                "Workflow execution finished"
            ),
        }
        self.publish_execution(execution);
        Ok(())
    }

    /// Cancel the queued task of every dispatched step and mark it skipped.
    /// Tasks a worker already holds are settled by [`Self::begin_step`].
    async fn cancel_dispatched(&self, state: &mut ExecutionState) {
        let reason = format!("execution {}", state.execution.status);
        let queued: Vec<(String, Uuid)> = state
            .records
            .iter()
            .filter(|r| r.status == StepStatus::Running)
            .filter_map(|r| r.task_id.map(|task_id| (r.step_id.clone(), task_id)))
            .collect();
        for (step_id, task_id) in queued {
            match self.queue.cancel(task_id, &format!("workflow {reason}")).await {
                Ok(true) => self.cancel_step(state, &step_id, &reason),
                Ok(false) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "Failed to cancel step task"),
            }
        }
    }

    /// Mark a dispatched step skipped after its execution ended.
    fn cancel_step(&self, state: &mut ExecutionState, step_id: &str, reason: &str) {
        let execution_id = state.execution.id;
        let Some(record) = state.record_mut(step_id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        record.finish(StepStatus::Skipped);
        self.broadcaster.publish(StatusEvent::step(
            execution_id,
            step_id,
            StepStatus::Skipped,
            json!({ "reason": reason }),
        ));
    }

    fn skip_step(&self, state: &mut ExecutionState, step_id: &str, reason: &str) {
        let execution_id = state.execution.id;
        let Some(record) = state.record_mut(step_id) else {
            return;
        };
        if record.status != StepStatus::Pending {
            return;
        }
        record.finish(StepStatus::Skipped);
        self.broadcaster.publish(StatusEvent::step(
            execution_id,
            step_id,
            StepStatus::Skipped,
            json!({ "reason": reason }),
        ));
    }

    async fn persist(&self, state: &mut ExecutionState) -> Result<(), WorkflowError> {
        state.execution.updated_at = Utc::now();
        self.store.update_execution(&state.execution).await?;
        let dirty: Vec<String> = state.dirty.drain().collect();
        for step_id in dirty {
            if let Some(record) = state.record(&step_id) {
                self.store.upsert_step_record(record).await?;
            }
        }
        Ok(())
    }

    fn evict_if_terminal(&self, state: &ExecutionState) {
        if state.execution.status.is_terminal() {
            self.active.lock().remove(&state.execution.id);
        }
    }

    fn publish_execution(&self, execution: &WorkflowExecution) {
        self.broadcaster.publish(StatusEvent::execution(
            execution.id,
            execution.status,
            json!({
                "workflow_id": execution.workflow_id,
                "completed_steps": execution.completed_steps,
                "failed_steps": execution.failed_steps,
                "total_steps": execution.total_steps,
                "progress": execution.progress_percent(),
                "error": execution.error_message,
            }),
        ));
    }
}

/// Why the error policy fails the execution, if it does.
fn failure_reason(state: &ExecutionState) -> Option<String> {
    let policy = &state.definition.error_policy;
    match policy.on_error {
        OnError::Abort => state
            .records
            .iter()
            .find(|r| r.status == StepStatus::Failed)
            .map(|r| {
                format!(
                    "Step {} failed: {}",
                    r.step_id,
                    r.error_message.as_deref().unwrap_or("unknown error")
                )
            }),
        OnError::Continue => policy
            .max_failures
            .filter(|max| state.execution.failed_steps > *max)
            .map(|max| {
                format!(
                    "{} steps failed, more than the allowed {max}",
                    state.execution.failed_steps
                )
            }),
        OnError::Skip => None,
    }
}

#[async_trait]
impl TaskLifecycleHook for WorkflowEngine {
    async fn on_task_completed(&self, task: &Task, output: &Value) {
        if task.task_type != STEP_TASK_TYPE {
            return;
        }
        let payload = match StepTaskPayload::from_task(task) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Ignoring completed step task");
                return;
            }
        };
        let outcome = match serde_json::from_value::<StepOutput>(output.clone()) {
            Ok(result) => {
                self.on_step_completed(payload.execution_id, &payload.step_id, result)
                    .await
            }
            Err(e) => {
                self.on_step_failed(
                    payload.execution_id,
                    &payload.step_id,
                    &format!("invalid step output: {e}"),
                )
                .await
            }
        };
        if let Err(e) = outcome {
            error!(
                task_id = %task.id,
                execution_id = %payload.execution_id,
                step_id = %payload.step_id,
                error = %e,
                "Failed to record step completion"
            );
        }
    }

    async fn on_task_failed(&self, task: &Task, error: &TaskError) {
        if task.task_type != STEP_TASK_TYPE {
            return;
        }
        let Ok(payload) = StepTaskPayload::from_task(task) else {
            warn!(task_id = %task.id, "Ignoring failed step task with invalid payload");
            return;
        };
        if let Err(e) = self
            .on_step_failed(payload.execution_id, &payload.step_id, &error.to_string())
            .await
        {
            error!(
                task_id = %task.id,
                execution_id = %payload.execution_id,
                error = %e,
                "Failed to record step failure"
            );
        }
    }
}
