//! Unified `Database` trait, the single async interface for all persistence.
//!
//! Every task mutation is one conditional statement so concurrent workers
//! cannot double-process a task or overwrite a terminal record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{QueueStats, Task, TaskStatus};
use crate::workflow::model::{StepExecutionRecord, WorkflowDefinition, WorkflowExecution};

/// Requeue parameters for a failed attempt.
#[derive(Debug, Clone)]
pub struct Requeue {
    /// Attempt counter to store. Lower than the current one when the attempt is refunded.
    pub attempt: u32,
    pub next_retry_at: DateTime<Utc>,
    pub error: String,
}

/// Backend-agnostic database trait covering tasks and workflows.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new queued task.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Atomically claim the next eligible queued task for `worker_id`.
    ///
    /// Eligible: queued, `next_retry_at <= now`, attempts left. Ordered by
    /// priority then insertion. Flips to processing and bumps `attempt`.
    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError>;

    /// `processing → completed`. Returns false if the task was not processing.
    async fn complete_task(
        &self,
        id: Uuid,
        output: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `processing → queued` for the given attempt. Returns false if the
    /// task moved on since (already handled).
    async fn requeue_task(
        &self,
        id: Uuid,
        expected_attempt: u32,
        requeue: &Requeue,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `processing → failed` for the given attempt. Returns false if already handled.
    async fn fail_task(
        &self,
        id: Uuid,
        expected_attempt: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `queued → failed` for cancellation. Returns false if the task was not queued.
    async fn cancel_queued_task(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Processing tasks whose lease elapsed before `now`.
    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError>;

    /// Tasks in a given status, most recently updated first.
    async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Delete terminal tasks last updated before `before`. Returns rows removed.
    async fn purge_terminal_tasks(&self, before: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Count tasks per status.
    async fn task_stats(&self) -> Result<QueueStats, DatabaseError>;

    // ── Workflow definitions ────────────────────────────────────────

    /// Insert or replace a workflow definition.
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), DatabaseError>;

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, DatabaseError>;

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError>;

    // ── Executions ──────────────────────────────────────────────────

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), DatabaseError>;

    /// Overwrite the mutable fields of an execution.
    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), DatabaseError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, DatabaseError>;

    // ── Step records ────────────────────────────────────────────────

    /// Insert or replace a step record keyed by (execution, step).
    async fn upsert_step_record(&self, record: &StepExecutionRecord) -> Result<(), DatabaseError>;

    async fn list_step_records(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, DatabaseError>;
}
