//! Durable priority task queue with atomic claim, ack and nack.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{NewTask, QueueStats, Task, TaskStatus};
use crate::config::{QueueConfig, RetryConfig};
use crate::error::{QueueError, TaskError};
use crate::events::{EventBroadcaster, StatusEvent};
use crate::resilience::{NackOutcome, TaskErrorHandler};
use crate::store::Database;

/// Durable, priority-ordered task queue.
///
/// Owns the task lifecycle. Every transition is a conditional update in the
/// store and is mirrored to the [`EventBroadcaster`].
pub struct TaskQueue {
    store: Arc<dyn Database>,
    broadcaster: Arc<EventBroadcaster>,
    error_handler: TaskErrorHandler,
    config: QueueConfig,
    /// Wakes long-polling workers when new work arrives.
    notify: Notify,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn Database>,
        broadcaster: Arc<EventBroadcaster>,
        config: QueueConfig,
        retry: RetryConfig,
    ) -> Arc<Self> {
        let error_handler =
            TaskErrorHandler::new(Arc::clone(&store), Arc::clone(&broadcaster), retry);
        Arc::new(Self {
            store,
            broadcaster,
            error_handler,
            config,
            notify: Notify::new(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn error_handler(&self) -> &TaskErrorHandler {
        &self.error_handler
    }

    /// Validate and insert a task. Returns the stored record.
    pub async fn enqueue(&self, new: NewTask) -> Result<Task, QueueError> {
        validate(&new)?;
        let task = new.into_task(self.config.default_max_attempts, Utc::now());
        self.store.insert_task(&task).await?;

        debug!(task_id = %task.id, task_type = %task.task_type, priority = task.priority, "Task enqueued");
        self.broadcaster.publish(StatusEvent::task(
            task.id,
            TaskStatus::Queued,
            json!({
                "task_type": task.task_type,
                "priority": task.priority,
                "attempt": task.attempt,
                "max_attempts": task.max_attempts,
            }),
        ));
        self.notify.notify_waiters();
        Ok(task)
    }

    /// Claim the next eligible task, hiding it for `visibility_timeout`.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| QueueError::Validation(format!("visibility timeout: {e}")))?;
        let Some(task) = self
            .store
            .claim_next_task(worker_id, now, now + lease)
            .await?
        else {
            return Ok(None);
        };

        debug!(task_id = %task.id, worker_id, attempt = task.attempt, "Task claimed");
        self.broadcaster.publish(StatusEvent::task(
            task.id,
            TaskStatus::Processing,
            json!({
                "attempt": task.attempt,
                "max_attempts": task.max_attempts,
                "worker_id": worker_id,
            }),
        ));
        Ok(Some(task))
    }

    /// Like [`dequeue`](Self::dequeue), but when the queue is empty waits up
    /// to `wait` for an enqueue notification before trying once more.
    pub async fn dequeue_wait(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(task) = self.dequeue(worker_id, visibility_timeout).await? {
            return Ok(Some(task));
        }
        let _ = tokio::time::timeout(wait, notified).await;
        self.dequeue(worker_id, visibility_timeout).await
    }

    /// Mark a processing task completed. Repeat calls are no-ops returning false.
    pub async fn ack(&self, task_id: Uuid) -> Result<bool, QueueError> {
        self.complete(task_id, None).await
    }

    /// Ack and record the handler output.
    pub async fn ack_with_output(
        &self,
        task_id: Uuid,
        output: &serde_json::Value,
    ) -> Result<bool, QueueError> {
        self.complete(task_id, Some(output)).await
    }

    async fn complete(
        &self,
        task_id: Uuid,
        output: Option<&serde_json::Value>,
    ) -> Result<bool, QueueError> {
        if !self.store.complete_task(task_id, output, Utc::now()).await? {
            debug!(task_id = %task_id, "Ack ignored, task not processing");
            return Ok(false);
        }
        info!(task_id = %task_id, "Task completed");
        self.broadcaster.publish(StatusEvent::task(
            task_id,
            TaskStatus::Completed,
            json!({ "output": output }),
        ));
        Ok(true)
    }

    /// Report a failed attempt of the current claim on `task_id`.
    pub async fn nack(&self, task_id: Uuid, error: &TaskError) -> Result<NackOutcome, QueueError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(QueueError::NotFound { id: task_id })?;
        if task.status != TaskStatus::Processing {
            return Ok(NackOutcome::Ignored);
        }
        self.nack_claimed(&task, error).await
    }

    /// Report a failed attempt for a claim the caller holds.
    pub async fn nack_claimed(&self, task: &Task, error: &TaskError) -> Result<NackOutcome, QueueError> {
        let outcome = self.error_handler.handle(task, error).await?;
        if matches!(outcome, NackOutcome::Retrying { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Return every task whose lease elapsed to the error handler. Returns
    /// how many were reclaimed.
    pub async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let expired = self.store.list_expired_leases(Utc::now()).await?;
        let mut reclaimed = 0;
        for task in expired {
            warn!(
                task_id = %task.id,
                lease_owner = task.lease_owner.as_deref().unwrap_or("unknown"),
                attempt = task.attempt,
                "Task lease expired"
            );
            if self.nack_claimed(&task, &TaskError::LeaseExpired).await? != NackOutcome::Ignored {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Cancel a queued task. Processing tasks are left to finish; returns
    /// false when nothing was cancelled.
    pub async fn cancel(&self, task_id: Uuid, reason: &str) -> Result<bool, QueueError> {
        let message = TaskError::Cancelled(reason.to_string()).to_string();
        if !self
            .store
            .cancel_queued_task(task_id, &message, Utc::now())
            .await?
        {
            return Ok(false);
        }
        info!(task_id = %task_id, reason, "Queued task cancelled");
        self.broadcaster.publish(StatusEvent::task(
            task_id,
            TaskStatus::Failed,
            json!({ "category": "cancellation", "error": message }),
        ));
        Ok(true)
    }

    /// Delete terminal tasks older than the retention window.
    pub async fn purge_terminal(&self) -> Result<u64, QueueError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| QueueError::Validation(format!("retention: {e}")))?;
        let removed = self
            .store
            .purge_terminal_tasks(Utc::now() - retention)
            .await?;
        if removed > 0 {
            info!(removed, "Purged terminal tasks");
        }
        Ok(removed)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<Task>, QueueError> {
        Ok(self.store.get_task(task_id).await?)
    }

    /// Tasks in `status`, most recently updated first.
    pub async fn list(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, QueueError> {
        Ok(self.store.list_tasks_by_status(status, limit).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.task_stats().await?)
    }
}

fn validate(new: &NewTask) -> Result<(), QueueError> {
    if new.task_type.trim().is_empty() {
        return Err(QueueError::Validation("task type must not be empty".into()));
    }
    if !(new.payload.is_object() || new.payload.is_null()) {
        return Err(QueueError::Validation(
            "payload must be a JSON object".into(),
        ));
    }
    if new.max_attempts == Some(0) {
        return Err(QueueError::Validation(
            "max_attempts must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Spawn the lease-reclaim and retention sweep. Stops when `shutdown` flips to true.
pub fn spawn_maintenance_task(
    queue: Arc<TaskQueue>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match queue.reclaim_expired().await {
                        Ok(0) => {}
                        Ok(n) => info!(reclaimed = n, "Reclaimed expired leases"),
                        Err(e) => warn!(error = %e, "Lease reclaim failed"),
                    }
                    if let Err(e) = queue.purge_terminal().await {
                        warn!(error = %e, "Retention purge failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Maintenance task stopping");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GLOBAL_TOPIC;
    use crate::store::LibSqlBackend;

    async fn test_queue() -> (Arc<TaskQueue>, Arc<EventBroadcaster>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let broadcaster = Arc::new(EventBroadcaster::new());
        let queue = TaskQueue::new(
            store,
            Arc::clone(&broadcaster),
            QueueConfig::default(),
            RetryConfig::default(),
        );
        (queue, broadcaster)
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn enqueue_assigns_id_and_defaults() {
        let (queue, _) = test_queue().await;
        let task = queue.enqueue(NewTask::new("noop", json!({}))).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.max_attempts, 3);
        assert!(queue.get(task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_submissions() {
        let (queue, _) = test_queue().await;
        for bad in [
            NewTask::new("  ", json!({})),
            NewTask::new("noop", json!([1, 2])),
            NewTask::new("noop", json!({})).with_max_attempts(0),
        ] {
            let err = queue.enqueue(bad).await.unwrap_err();
            assert!(matches!(err, QueueError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn dequeue_empty_returns_none() {
        let (queue, _) = test_queue().await;
        assert!(queue.dequeue("w1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_twice_is_a_no_op() {
        let (queue, broadcaster) = test_queue().await;
        let task = queue.enqueue(NewTask::new("noop", json!({}))).await.unwrap();
        let (sub, mut rx) = broadcaster.connect();
        broadcaster.subscribe(sub, GLOBAL_TOPIC);

        queue.dequeue("w1", LEASE).await.unwrap().unwrap();
        assert!(queue.ack(task.id).await.unwrap());
        assert!(!queue.ack(task.id).await.unwrap());

        let statuses: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec!["processing", "completed"]);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn racing_workers_claim_once() {
        let (queue, _) = test_queue().await;
        let task = queue.enqueue(NewTask::new("noop", json!({}))).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let worker = format!("w{i}");
                match queue.dequeue(&worker, LEASE).await.unwrap() {
                    Some(claimed) => queue.ack(claimed.id).await.unwrap(),
                    None => false,
                }
            }));
        }
        let results = futures::future::join_all(handles).await;
        let acked = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(acked, 1);

        let stored = queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.attempt, 1);
    }

    #[tokio::test]
    async fn nack_by_id_routes_through_error_handler() {
        let (queue, _) = test_queue().await;
        let task = queue.enqueue(NewTask::new("noop", json!({}))).await.unwrap();
        queue.dequeue("w1", LEASE).await.unwrap().unwrap();

        let outcome = queue
            .nack(task.id, &TaskError::Timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(matches!(outcome, NackOutcome::Retrying { .. }));
        // No longer processing
        let again = queue
            .nack(task.id, &TaskError::Timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(again, NackOutcome::Ignored);

        let err = queue
            .nack(Uuid::new_v4(), &TaskError::LeaseExpired)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound { .. }));
    }

    #[tokio::test]
    async fn expired_lease_returns_task_to_queue() {
        let (queue, _) = test_queue().await;
        let task = queue
            .enqueue(NewTask::new("noop", json!({})).with_backoff_base(Duration::ZERO))
            .await
            .unwrap();
        queue.dequeue("crashed", Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(queue.reclaim_expired().await.unwrap(), 1);
        let stored = queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert!(stored.lease_owner.is_none());

        let reclaimed = queue.dequeue("w2", LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, task.id);
        assert_eq!(reclaimed.attempt, 2);
    }

    #[tokio::test]
    async fn cancel_fails_queued_task_once() {
        let (queue, _) = test_queue().await;
        let task = queue.enqueue(NewTask::new("noop", json!({}))).await.unwrap();

        assert!(queue.cancel(task.id, "execution aborted").await.unwrap());
        assert!(!queue.cancel(task.id, "execution aborted").await.unwrap());
        let stored = queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(queue.dequeue("w1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_wait_wakes_on_enqueue() {
        let (queue, _) = test_queue().await;
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .dequeue_wait("w1", LEASE, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let task = queue.enqueue(NewTask::new("noop", json!({}))).await.unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake before the poll interval")
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, task.id);
    }

    #[tokio::test]
    async fn list_failed_tasks() {
        let (queue, _) = test_queue().await;
        let task = queue
            .enqueue(NewTask::new("noop", json!({})).with_max_attempts(1))
            .await
            .unwrap();
        let claimed = queue.dequeue("w1", LEASE).await.unwrap().unwrap();
        queue
            .nack_claimed(&claimed, &TaskError::Handler("boom".into()))
            .await
            .unwrap();

        let failed = queue.list(TaskStatus::Failed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, task.id);
    }
}
