//! libSQL implementation of the `Database` trait.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared by every caller; each statement below is atomic on its own.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{QueueStats, Task, TaskStatus};
use crate::store::migrations;
use crate::store::traits::{Database, Requeue};
use crate::workflow::model::{
    DefinitionStatus, ExecutionStatus, StepExecutionRecord, StepStatus, WorkflowDefinition,
    WorkflowExecution,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open the queue and workflow database at `path`, creating parent
    /// directories as needed. The schema is migrated before returning.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let backend = Self::connect(db).await?;
        info!(path = %path.display(), "Task store opened");
        Ok(backend)
    }

    /// Throwaway store; every task and execution vanishes on drop.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::connect(db).await
    }

    async fn connect(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_tasks(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        ctx: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width so text comparison in SQL
/// matches chronological order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<u64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n as i64),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(fmt_ts))
}

fn to_json<T: serde::Serialize>(value: &T, ctx: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(format!("{ctx}: {e}")))
}

fn col_str(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

fn col_i64(row: &libsql::Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

fn parse_uuid(s: &str, name: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{name} parse: {e}")))
}

// ── Row mappers ─────────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, task_type, payload, priority, status, attempt, max_attempts, backoff_base_ms, last_error, output, lease_owner, lease_expires_at, enqueued_at, next_retry_at, updated_at, completed_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = col_str(row, 0, "task.id")?;
    let payload_str: String = row.get(2).unwrap_or_else(|_| "null".to_string());
    let status_str: String = col_str(row, 4, "task.status")?;
    let output_str: Option<String> = row.get(9).ok();

    Ok(Task {
        id: parse_uuid(&id_str, "task.id")?,
        task_type: col_str(row, 1, "task.task_type")?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        priority: row.get(3).unwrap_or(0),
        status: status_str
            .parse::<TaskStatus>()
            .map_err(DatabaseError::Serialization)?,
        attempt: col_i64(row, 5, "task.attempt")? as u32,
        max_attempts: col_i64(row, 6, "task.max_attempts")? as u32,
        backoff_base_ms: row.get::<i64>(7).ok().map(|n| n as u64),
        last_error: row.get(8).ok(),
        output: output_str.and_then(|s| serde_json::from_str(&s).ok()),
        lease_owner: row.get(10).ok(),
        lease_expires_at: parse_optional_datetime(row.get(11).ok()),
        enqueued_at: parse_datetime(&col_str(row, 12, "task.enqueued_at")?),
        next_retry_at: parse_datetime(&col_str(row, 13, "task.next_retry_at")?),
        updated_at: parse_datetime(&col_str(row, 14, "task.updated_at")?),
        completed_at: parse_optional_datetime(row.get(15).ok()),
    })
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, status, context, current_step_id, executed_step_ids, completed_steps, failed_steps, total_steps, started_at, completed_at, duration_ms, error_message, created_at, updated_at";

fn row_to_execution(row: &libsql::Row) -> Result<WorkflowExecution, DatabaseError> {
    let id_str: String = col_str(row, 0, "execution.id")?;
    let status_str: String = col_str(row, 2, "execution.status")?;
    let context_str: String = row.get(3).unwrap_or_else(|_| "{}".to_string());
    let executed_str: String = row.get(5).unwrap_or_else(|_| "[]".to_string());

    Ok(WorkflowExecution {
        id: parse_uuid(&id_str, "execution.id")?,
        workflow_id: col_str(row, 1, "execution.workflow_id")?,
        status: status_str
            .parse::<ExecutionStatus>()
            .map_err(DatabaseError::Serialization)?,
        context: serde_json::from_str(&context_str)
            .map_err(|e| DatabaseError::Serialization(format!("execution.context: {e}")))?,
        current_step_id: row.get(4).ok(),
        executed_step_ids: serde_json::from_str(&executed_str).unwrap_or_default(),
        completed_steps: row.get::<i64>(6).unwrap_or(0) as u32,
        failed_steps: row.get::<i64>(7).unwrap_or(0) as u32,
        total_steps: row.get::<i64>(8).unwrap_or(0) as u32,
        started_at: parse_optional_datetime(row.get(9).ok()),
        completed_at: parse_optional_datetime(row.get(10).ok()),
        duration_ms: row.get::<i64>(11).ok().map(|n| n as u64),
        error_message: row.get(12).ok(),
        created_at: parse_datetime(&col_str(row, 13, "execution.created_at")?),
        updated_at: parse_datetime(&col_str(row, 14, "execution.updated_at")?),
    })
}

const STEP_COLUMNS: &str = "execution_id, step_id, status, task_id, input, output, error_message, retry_count, execution_time_ms, started_at, completed_at, next_step_id";

fn row_to_step_record(row: &libsql::Row) -> Result<StepExecutionRecord, DatabaseError> {
    let execution_str: String = col_str(row, 0, "step.execution_id")?;
    let status_str: String = col_str(row, 2, "step.status")?;
    let task_str: Option<String> = row.get(3).ok();
    let input_str: String = row.get(4).unwrap_or_else(|_| "null".to_string());
    let output_str: Option<String> = row.get(5).ok();

    Ok(StepExecutionRecord {
        execution_id: parse_uuid(&execution_str, "step.execution_id")?,
        step_id: col_str(row, 1, "step.step_id")?,
        status: status_str
            .parse::<StepStatus>()
            .map_err(DatabaseError::Serialization)?,
        task_id: task_str.and_then(|s| Uuid::parse_str(&s).ok()),
        input: serde_json::from_str(&input_str).unwrap_or(serde_json::Value::Null),
        output: output_str.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.get(6).ok(),
        retry_count: row.get::<i64>(7).unwrap_or(0) as u32,
        execution_time_ms: row.get::<i64>(8).ok().map(|n| n as u64),
        started_at: parse_optional_datetime(row.get(9).ok()),
        completed_at: parse_optional_datetime(row.get(10).ok()),
        next_step_id: row.get(11).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let payload = to_json(&task.payload, "insert_task payload")?;
        self.conn()
            .execute(
                "INSERT INTO tasks (id, task_type, payload, priority, status, attempt, max_attempts, backoff_base_ms, enqueued_at, next_retry_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id.to_string(),
                    task.task_type.clone(),
                    payload,
                    task.priority,
                    task.status.as_str(),
                    i64::from(task.attempt),
                    i64::from(task.max_attempts),
                    opt_int(task.backoff_base_ms),
                    fmt_ts(&task.enqueued_at),
                    fmt_ts(&task.next_retry_at),
                    fmt_ts(&task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        debug!(task_id = %task.id, task_type = %task.task_type, "Task inserted into DB");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                "get_task",
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        let sql = format!(
            "UPDATE tasks
             SET status = 'processing', attempt = attempt + 1, lease_owner = ?1,
                 lease_expires_at = ?2, updated_at = ?3
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status = 'queued' AND next_retry_at <= ?3 AND attempt < max_attempts
                 ORDER BY priority ASC, seq ASC
                 LIMIT 1
             ) AND status = 'queued'
             RETURNING {TASK_COLUMNS}"
        );
        let tasks = self
            .query_tasks(
                &sql,
                params![worker_id, fmt_ts(&lease_expires_at), fmt_ts(&now)],
                "claim_next_task",
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn complete_task(
        &self,
        id: Uuid,
        output: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let output = output
            .map(|v| to_json(v, "complete_task output"))
            .transpose()?;
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'completed', output = ?2, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?3, completed_at = ?3
                 WHERE id = ?1 AND status = 'processing'",
                params![id.to_string(), opt_text_owned(output), fmt_ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;
        Ok(changed > 0)
    }

    async fn requeue_task(
        &self,
        id: Uuid,
        expected_attempt: u32,
        requeue: &Requeue,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'queued', attempt = ?3, next_retry_at = ?4, last_error = ?5,
                     lease_owner = NULL, lease_expires_at = NULL, updated_at = ?6
                 WHERE id = ?1 AND status = 'processing' AND attempt = ?2",
                params![
                    id.to_string(),
                    i64::from(expected_attempt),
                    i64::from(requeue.attempt),
                    fmt_ts(&requeue.next_retry_at),
                    requeue.error.clone(),
                    fmt_ts(&now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_task: {e}")))?;
        Ok(changed > 0)
    }

    async fn fail_task(
        &self,
        id: Uuid,
        expected_attempt: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', last_error = ?3, lease_owner = NULL, lease_expires_at = NULL,
                     updated_at = ?4, completed_at = ?4
                 WHERE id = ?1 AND status = 'processing' AND attempt = ?2",
                params![id.to_string(), i64::from(expected_attempt), error, fmt_ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_task: {e}")))?;
        Ok(changed > 0)
    }

    async fn cancel_queued_task(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', last_error = ?2, updated_at = ?3, completed_at = ?3
                 WHERE id = ?1 AND status = 'queued'",
                params![id.to_string(), reason, fmt_ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_queued_task: {e}")))?;
        Ok(changed > 0)
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = 'processing' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1
                 ORDER BY lease_expires_at ASC"
            ),
            params![fmt_ts(&now)],
            "list_expired_leases",
        )
        .await
    }

    async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                 ORDER BY updated_at DESC LIMIT ?2"
            ),
            params![status.as_str(), limit as i64],
            "list_tasks_by_status",
        )
        .await
    }

    async fn purge_terminal_tasks(&self, before: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM tasks WHERE status IN ('completed', 'failed') AND updated_at < ?1",
                params![fmt_ts(&before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_terminal_tasks: {e}")))?;
        Ok(removed)
    }

    async fn task_stats(&self) -> Result<QueueStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM tasks GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("task_stats: {e}")))?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("task_stats: {e}")))?
        {
            let status_str: String = col_str(&row, 0, "task_stats.status")?;
            let count: i64 = col_i64(&row, 1, "task_stats.count")?;
            if let Ok(status) = status_str.parse::<TaskStatus>() {
                stats.set(status, count as u64);
            }
        }
        Ok(stats)
    }

    // ── Workflow definitions ────────────────────────────────────────

    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), DatabaseError> {
        let body = to_json(definition, "save_definition")?;
        self.conn()
            .execute(
                "INSERT INTO workflow_definitions (id, name, status, definition, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, status = excluded.status,
                     definition = excluded.definition, updated_at = excluded.updated_at",
                params![
                    definition.id.clone(),
                    definition.name.clone(),
                    definition.status.as_str(),
                    body,
                    fmt_ts(&definition.created_at),
                    fmt_ts(&definition.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_definition: {e}")))?;
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT definition, status FROM workflow_definitions WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_definition: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let body: String = col_str(&row, 0, "definition.body")?;
                let status: String = col_str(&row, 1, "definition.status")?;
                let mut definition: WorkflowDefinition = serde_json::from_str(&body)
                    .map_err(|e| DatabaseError::Serialization(format!("get_definition: {e}")))?;
                definition.status = status
                    .parse::<DefinitionStatus>()
                    .map_err(DatabaseError::Serialization)?;
                Ok(Some(definition))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_definition: {e}"))),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT definition FROM workflow_definitions ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_definitions: {e}")))?;

        let mut definitions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_definitions: {e}")))?
        {
            let body: String = col_str(&row, 0, "definition.body")?;
            definitions.push(
                serde_json::from_str(&body)
                    .map_err(|e| DatabaseError::Serialization(format!("list_definitions: {e}")))?,
            );
        }
        Ok(definitions)
    }

    // ── Executions ──────────────────────────────────────────────────

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO workflow_executions ({EXECUTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    execution.id.to_string(),
                    execution.workflow_id.clone(),
                    execution.status.as_str(),
                    to_json(&execution.context, "insert_execution context")?,
                    opt_text(execution.current_step_id.as_deref()),
                    to_json(&execution.executed_step_ids, "insert_execution executed")?,
                    i64::from(execution.completed_steps),
                    i64::from(execution.failed_steps),
                    i64::from(execution.total_steps),
                    opt_ts(execution.started_at.as_ref()),
                    opt_ts(execution.completed_at.as_ref()),
                    opt_int(execution.duration_ms),
                    opt_text(execution.error_message.as_deref()),
                    fmt_ts(&execution.created_at),
                    fmt_ts(&execution.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_execution: {e}")))?;

        debug!(execution_id = %execution.id, workflow_id = %execution.workflow_id, "Execution inserted into DB");
        Ok(())
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE workflow_executions SET status = ?2, context = ?3, current_step_id = ?4,
                     executed_step_ids = ?5, completed_steps = ?6, failed_steps = ?7,
                     started_at = ?8, completed_at = ?9, duration_ms = ?10, error_message = ?11,
                     updated_at = ?12
                 WHERE id = ?1",
                params![
                    execution.id.to_string(),
                    execution.status.as_str(),
                    to_json(&execution.context, "update_execution context")?,
                    opt_text(execution.current_step_id.as_deref()),
                    to_json(&execution.executed_step_ids, "update_execution executed")?,
                    i64::from(execution.completed_steps),
                    i64::from(execution.failed_steps),
                    opt_ts(execution.started_at.as_ref()),
                    opt_ts(execution.completed_at.as_ref()),
                    opt_int(execution.duration_ms),
                    opt_text(execution.error_message.as_deref()),
                    fmt_ts(&execution.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_execution: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "workflow_execution".into(),
                id: execution.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_execution: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_execution(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_execution: {e}"))),
        }
    }

    // ── Step records ────────────────────────────────────────────────

    async fn upsert_step_record(&self, record: &StepExecutionRecord) -> Result<(), DatabaseError> {
        let output = record
            .output
            .as_ref()
            .map(|v| to_json(v, "upsert_step_record output"))
            .transpose()?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO step_records ({STEP_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(execution_id, step_id) DO UPDATE SET status = excluded.status,
                         task_id = excluded.task_id, input = excluded.input, output = excluded.output,
                         error_message = excluded.error_message, retry_count = excluded.retry_count,
                         execution_time_ms = excluded.execution_time_ms,
                         started_at = excluded.started_at, completed_at = excluded.completed_at,
                         next_step_id = excluded.next_step_id"
                ),
                params![
                    record.execution_id.to_string(),
                    record.step_id.clone(),
                    record.status.as_str(),
                    opt_text_owned(record.task_id.map(|id| id.to_string())),
                    to_json(&record.input, "upsert_step_record input")?,
                    opt_text_owned(output),
                    opt_text(record.error_message.as_deref()),
                    i64::from(record.retry_count),
                    opt_int(record.execution_time_ms),
                    opt_ts(record.started_at.as_ref()),
                    opt_ts(record.completed_at.as_ref()),
                    opt_text(record.next_step_id.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_step_record: {e}")))?;
        Ok(())
    }

    async fn list_step_records(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM step_records WHERE execution_id = ?1 ORDER BY rowid ASC"
                ),
                params![execution_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_step_records: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_step_records: {e}")))?
        {
            records.push(row_to_step_record(&row)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::NewTask;
    use crate::workflow::model::StepSpec;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_task(task_type: &str, priority: i64) -> Task {
        NewTask::new(task_type, json!({"n": priority}))
            .with_priority(priority)
            .into_task(3, Utc::now())
    }

    fn lease(now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::seconds(30)
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_task() {
        let db = test_db().await;
        let task = make_task("noop", 0);
        db.insert_task(&task).await.unwrap();

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.task_type, "noop");
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert_eq!(fetched.payload, json!({"n": 0}));
        assert_eq!(fetched.max_attempts, 3);
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let db = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_insertion() {
        let db = test_db().await;
        let low = make_task("a", 5);
        let high_first = make_task("b", 1);
        let high_second = make_task("c", 1);
        db.insert_task(&low).await.unwrap();
        db.insert_task(&high_first).await.unwrap();
        db.insert_task(&high_second).await.unwrap();

        let now = Utc::now();
        let order: Vec<Uuid> = {
            let mut ids = Vec::new();
            while let Some(task) = db.claim_next_task("w1", now, lease(now)).await.unwrap() {
                assert_eq!(task.status, TaskStatus::Processing);
                assert_eq!(task.attempt, 1);
                assert_eq!(task.lease_owner.as_deref(), Some("w1"));
                ids.push(task.id);
            }
            ids
        };
        assert_eq!(order, vec![high_first.id, high_second.id, low.id]);
    }

    #[tokio::test]
    async fn claim_skips_tasks_scheduled_in_the_future() {
        let db = test_db().await;
        let mut task = make_task("noop", 0);
        task.next_retry_at = Utc::now() + ChronoDuration::seconds(60);
        db.insert_task(&task).await.unwrap();

        let now = Utc::now();
        assert!(db.claim_next_task("w1", now, lease(now)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_is_conditional_on_processing() {
        let db = test_db().await;
        let task = make_task("noop", 0);
        db.insert_task(&task).await.unwrap();

        // Not claimed yet
        assert!(!db.complete_task(task.id, None, Utc::now()).await.unwrap());

        let now = Utc::now();
        db.claim_next_task("w1", now, lease(now)).await.unwrap().unwrap();
        let output = json!({"ok": true});
        assert!(db.complete_task(task.id, Some(&output), Utc::now()).await.unwrap());
        assert!(!db.complete_task(task.id, None, Utc::now()).await.unwrap());

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.output, Some(output));
        assert!(fetched.completed_at.is_some());
        assert!(fetched.lease_owner.is_none());
    }

    #[tokio::test]
    async fn requeue_and_fail_check_attempt() {
        let db = test_db().await;
        let task = make_task("noop", 0);
        db.insert_task(&task).await.unwrap();
        let now = Utc::now();
        let claimed = db.claim_next_task("w1", now, lease(now)).await.unwrap().unwrap();

        let requeue = Requeue {
            attempt: claimed.attempt,
            next_retry_at: now,
            error: "boom".into(),
        };
        // Stale attempt is ignored
        assert!(!db.requeue_task(task.id, 7, &requeue, now).await.unwrap());
        assert!(db.requeue_task(task.id, 1, &requeue, now).await.unwrap());
        // Already queued, a second requeue is a no-op
        assert!(!db.requeue_task(task.id, 1, &requeue, now).await.unwrap());

        let reclaimed = db.claim_next_task("w2", now, lease(now)).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempt, 2);
        assert_eq!(reclaimed.last_error.as_deref(), Some("boom"));

        assert!(db.fail_task(task.id, 2, "fatal", now).await.unwrap());
        assert!(!db.fail_task(task.id, 2, "fatal", now).await.unwrap());
        let failed = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("fatal"));
    }

    #[tokio::test]
    async fn exhausted_tasks_are_never_claimed() {
        let db = test_db().await;
        let mut task = make_task("noop", 0);
        task.max_attempts = 1;
        task.attempt = 1;
        db.insert_task(&task).await.unwrap();

        let now = Utc::now();
        assert!(db.claim_next_task("w1", now, lease(now)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_only_touches_queued_tasks() {
        let db = test_db().await;
        let queued = make_task("a", 0);
        let running = make_task("b", 1);
        db.insert_task(&queued).await.unwrap();
        db.insert_task(&running).await.unwrap();

        let now = Utc::now();
        // Claims `queued` (priority 0) first, so cancel the other way round.
        let claimed = db.claim_next_task("w1", now, lease(now)).await.unwrap().unwrap();
        assert_eq!(claimed.id, queued.id);

        assert!(!db.cancel_queued_task(queued.id, "abort", now).await.unwrap());
        assert!(db.cancel_queued_task(running.id, "abort", now).await.unwrap());
        let cancelled = db.get_task(running.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn expired_leases_are_listed() {
        let db = test_db().await;
        let task = make_task("noop", 0);
        db.insert_task(&task).await.unwrap();

        let now = Utc::now();
        db.claim_next_task("w1", now, now - ChronoDuration::seconds(1))
            .await
            .unwrap()
            .unwrap();

        let expired = db.list_expired_leases(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, task.id);
    }

    #[tokio::test]
    async fn purge_and_stats() {
        let db = test_db().await;
        let done = make_task("a", 0);
        let waiting = make_task("b", 1);
        db.insert_task(&done).await.unwrap();
        db.insert_task(&waiting).await.unwrap();

        let now = Utc::now();
        db.claim_next_task("w1", now, lease(now)).await.unwrap().unwrap();
        db.complete_task(done.id, None, now).await.unwrap();

        let stats = db.task_stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.total(), 2);

        let failed = db.list_tasks_by_status(TaskStatus::Completed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);

        let removed = db
            .purge_terminal_tasks(now + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_task(done.id).await.unwrap().is_none());
        assert!(db.get_task(waiting.id).await.unwrap().is_some());
    }

    // ── Workflow tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn definition_round_trip_and_upsert() {
        let db = test_db().await;
        let mut def = WorkflowDefinition::new("greet", vec![StepSpec::new("hello", "set", 1)]);
        db.save_definition(&def).await.unwrap();

        def.name = "greet-v2".into();
        db.save_definition(&def).await.unwrap();

        let fetched = db.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "greet-v2");
        assert_eq!(fetched.steps.len(), 1);
        assert_eq!(db.list_definitions().await.unwrap().len(), 1);
        assert!(db.get_definition("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execution_and_step_records() {
        let db = test_db().await;
        let def = WorkflowDefinition::new(
            "wf",
            vec![StepSpec::new("a", "set", 1), StepSpec::new("b", "set", 2)],
        );
        let mut exec = WorkflowExecution::new(&def, serde_json::Map::new());
        db.insert_execution(&exec).await.unwrap();

        exec.transition_to(ExecutionStatus::Running).unwrap();
        exec.context.insert("greeting".into(), json!("hi"));
        exec.executed_step_ids.push("a".into());
        exec.completed_steps = 1;
        db.update_execution(&exec).await.unwrap();

        let fetched = db.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Running);
        assert_eq!(fetched.context.get("greeting"), Some(&json!("hi")));
        assert_eq!(fetched.executed_step_ids, vec!["a".to_string()]);
        assert_eq!(fetched.total_steps, 2);

        for step in &def.steps {
            db.upsert_step_record(&StepExecutionRecord::pending(exec.id, step))
                .await
                .unwrap();
        }
        let mut record = StepExecutionRecord::pending(exec.id, &def.steps[0]);
        record.output = Some(json!({"x": 1}));
        record.finish(StepStatus::Completed);
        db.upsert_step_record(&record).await.unwrap();

        let records = db.list_step_records(exec.id).await.unwrap();
        assert_eq!(records.len(), 2);
        let a = records.iter().find(|r| r.step_id == "a").unwrap();
        assert_eq!(a.status, StepStatus::Completed);
        assert_eq!(a.output, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn update_missing_execution_is_not_found() {
        let db = test_db().await;
        let def = WorkflowDefinition::new("wf", vec![StepSpec::new("a", "set", 1)]);
        let exec = WorkflowExecution::new(&def, serde_json::Map::new());
        let err = db.update_execution(&exec).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("arq.db");
        let task = make_task("noop", 0);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_task(&task).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_task(task.id).await.unwrap().is_some());
    }
}
