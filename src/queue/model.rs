//! Task data model.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
///
/// `queued → processing → {queued | completed | failed}`. Completed and
/// failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal records are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Handler routing key.
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: serde_json::Value,
    /// Lower values are served first.
    pub priority: i64,
    pub status: TaskStatus,
    /// Executions started so far. Never exceeds `max_attempts`.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Per-task override of the retry base delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Handler output recorded on successful completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether another execution may still be started after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn backoff_base(&self) -> Option<Duration> {
        self.backoff_base_ms.map(Duration::from_millis)
    }
}

/// A task submission, before the queue assigns an id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i64,
    /// Falls back to the queue default when absent.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            payload,
            priority: 0,
            max_attempts: None,
            backoff_base_ms: None,
        }
    }

    /// Builder: set an explicit id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Builder: set priority (lower is served first).
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Builder: override the retry base delay.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = Some(base.as_millis() as u64);
        self
    }

    /// Materialize into a queued task.
    pub fn into_task(self, default_max_attempts: u32, now: DateTime<Utc>) -> Task {
        Task {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            task_type: self.task_type,
            payload: self.payload,
            priority: self.priority,
            status: TaskStatus::Queued,
            attempt: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            backoff_base_ms: self.backoff_base_ms,
            last_error: None,
            output: None,
            lease_owner: None,
            lease_expires_at: None,
            enqueued_at: now,
            next_retry_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn set(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Queued => self.queued = count,
            TaskStatus::Processing => self.processing = count,
            TaskStatus::Completed => self.completed = count,
            TaskStatus::Failed => self.failed = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed
    }
}
