//! Failure classification and retry-or-terminate decisions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::config::RetryConfig;
use crate::error::{DatabaseError, TaskError};
use crate::events::{EventBroadcaster, StatusEvent};
use crate::queue::model::{Task, TaskStatus};
use crate::store::{Database, Requeue};

/// Broad failure families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network, timeout, lease expiry or a generic handler failure.
    Transient,
    /// Bad input or no handler. Retrying cannot help.
    Permanent,
    /// Rate limited or circuit open. Retried without consuming an attempt.
    Capacity,
    /// Aborted by the caller.
    Cancellation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub retryable: bool,
    pub category: ErrorCategory,
}

/// Classify a task failure.
pub fn classify(error: &TaskError) -> Classification {
    let category = match error {
        TaskError::Network(_)
        | TaskError::Timeout(_)
        | TaskError::LeaseExpired
        | TaskError::Handler(_) => ErrorCategory::Transient,
        TaskError::Capacity(_) => ErrorCategory::Capacity,
        TaskError::Validation(_) | TaskError::UnsupportedType(_) => ErrorCategory::Permanent,
        TaskError::Cancelled(_) => ErrorCategory::Cancellation,
    };
    Classification {
        retryable: matches!(category, ErrorCategory::Transient | ErrorCategory::Capacity),
        category,
    }
}

/// What `handle` did with a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// Back in the queue, eligible again at `next_retry_at`.
    Retrying {
        attempt: u32,
        backoff: Duration,
        next_retry_at: DateTime<Utc>,
    },
    /// Terminally failed. Reported exactly once.
    Failed,
    /// This (task, attempt) was already handled, or the task is no longer processing.
    Ignored,
}

/// Drives the `processing → {queued | failed}` transition for failed attempts.
pub struct TaskErrorHandler {
    store: Arc<dyn Database>,
    broadcaster: Arc<EventBroadcaster>,
    config: RetryConfig,
}

impl TaskErrorHandler {
    pub fn new(
        store: Arc<dyn Database>,
        broadcaster: Arc<EventBroadcaster>,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            config,
        }
    }

    /// Delay before retrying after `attempt` executions: `base · 2^(attempt−1)`, capped.
    pub fn backoff_for(&self, attempt: u32, base: Option<Duration>) -> Duration {
        let base = base.unwrap_or(self.config.base_backoff);
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        base.checked_mul(factor)
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff)
    }

    /// Requeue or terminally fail `task` after `error`.
    ///
    /// Conditional on the task still being processing at the same attempt,
    /// so a repeated call for one (task, attempt) is `Ignored`.
    pub async fn handle(&self, task: &Task, error: &TaskError) -> Result<NackOutcome, DatabaseError> {
        let classification = classify(error);
        let now = Utc::now();
        let message = error.to_string();

        let retry_attempt = match classification.category {
            ErrorCategory::Capacity => Some(task.attempt.saturating_sub(1)),
            _ if classification.retryable && task.has_attempts_left() => Some(task.attempt),
            _ => None,
        };

        if let Some(stored_attempt) = retry_attempt {
            let backoff = self.backoff_for(task.attempt, task.backoff_base());
            let next_retry_at = now
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            let requeue = Requeue {
                attempt: stored_attempt,
                next_retry_at,
                error: message.clone(),
            };
            if !self
                .store
                .requeue_task(task.id, task.attempt, &requeue, now)
                .await?
            {
                debug!(task_id = %task.id, attempt = task.attempt, "Failure already handled");
                return Ok(NackOutcome::Ignored);
            }

            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempt = task.attempt,
                max_attempts = task.max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %message,
                "Task failed, retrying"
            );
            self.broadcaster.publish(StatusEvent::task(
                task.id,
                TaskStatus::Queued,
                json!({
                    "retry": true,
                    "attempt": stored_attempt,
                    "max_attempts": task.max_attempts,
                    "backoff_ms": backoff.as_millis() as u64,
                    "next_retry_at": next_retry_at,
                    "category": classification.category,
                    "error": message,
                }),
            ));
            return Ok(NackOutcome::Retrying {
                attempt: stored_attempt,
                backoff,
                next_retry_at,
            });
        }

        if !self
            .store
            .fail_task(task.id, task.attempt, &message, now)
            .await?
        {
            debug!(task_id = %task.id, attempt = task.attempt, "Failure already handled");
            return Ok(NackOutcome::Ignored);
        }

        error!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempt,
            category = ?classification.category,
            error = %message,
            "Task failed permanently"
        );
        self.broadcaster.publish(StatusEvent::task(
            task.id,
            TaskStatus::Failed,
            json!({
                "attempt": task.attempt,
                "max_attempts": task.max_attempts,
                "category": classification.category,
                "error": message,
            }),
        ));
        Ok(NackOutcome::Failed)
    }
}
