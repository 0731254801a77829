//! Fixed-size worker pool draining the task queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{TaskHandlerRegistry, TaskLifecycleHook};
use crate::config::PoolConfig;
use crate::error::TaskError;
use crate::queue::{Task, TaskQueue, spawn_maintenance_task};
use crate::resilience::{CircuitBreakerRegistry, ErrorCategory, NackOutcome, classify};

/// Decrements the in-flight counter when a task finishes, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// `worker_count` tokio tasks sharing one queue.
pub struct TaskConsumerPool {
    queue: Arc<TaskQueue>,
    handlers: Arc<TaskHandlerRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    hooks: Vec<Arc<dyn TaskLifecycleHook>>,
    config: PoolConfig,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: AtomicUsize,
}

impl TaskConsumerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        handlers: Arc<TaskHandlerRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: PoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            handlers,
            breakers,
            hooks: Vec::new(),
            config,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Builder: notify `hook` of terminal task outcomes.
    pub fn with_hook(mut self, hook: Arc<dyn TaskLifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Tasks currently being executed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Spawn the workers and the maintenance sweeper. No-op if already started.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("Consumer pool already started");
            return;
        }
        let _ = self.shutdown_tx.send(false);

        for i in 0..self.config.worker_count {
            let pool = Arc::clone(self);
            let worker_id = format!("worker-{}-{i}", std::process::id());
            let shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown).await;
            }));
        }
        workers.push(spawn_maintenance_task(
            Arc::clone(&self.queue),
            self.config.sweep_interval,
            self.shutdown_tx.subscribe(),
        ));

        info!(
            workers = self.config.worker_count,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Consumer pool started"
        );
    }

    /// Stop claiming, wait up to the grace period for in-flight tasks, then
    /// abort whatever is still running.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(self.config.shutdown_grace, futures::future::join_all(handles))
            .await
        {
            Ok(_) => info!("Consumer pool drained"),
            Err(_) => {
                warn!(
                    in_flight = self.in_flight(),
                    grace_secs = self.config.shutdown_grace.as_secs(),
                    "Shutdown grace elapsed, aborting workers"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }

    async fn worker_loop(&self, worker_id: String, shutdown: watch::Receiver<bool>) {
        debug!(worker_id = %worker_id, "Worker started");
        let visibility = self.queue.config().visibility_timeout;

        while !*shutdown.borrow() {
            match self
                .queue
                .dequeue_wait(&worker_id, visibility, self.config.poll_interval)
                .await
            {
                Ok(Some(task)) => self.process(&task).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Dequeue failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        debug!(worker_id = %worker_id, "Worker stopped");
    }

    /// Run one claimed task to an ack or a nack.
    async fn process(&self, task: &Task) {
        let _guard = InFlight::enter(&self.in_flight);

        let Some(handler) = self.handlers.get(&task.task_type).await else {
            warn!(task_id = %task.id, task_type = %task.task_type, "No handler registered");
            self.report_failure(task, TaskError::UnsupportedType(task.task_type.clone()))
                .await;
            return;
        };

        let service = handler.service().unwrap_or(handler.task_type()).to_string();
        let breaker = self.breakers.get(&service);
        if let Err(open) = breaker.check_state() {
            debug!(task_id = %task.id, service = %service, "Circuit open, deferring task");
            self.report_failure(task, TaskError::Capacity(open.to_string()))
                .await;
            return;
        }

        // Never outlive the lease, or a reclaimed copy could run concurrently.
        let timeout = handler
            .execution_timeout()
            .min(self.queue.config().visibility_timeout);
        let result = match tokio::time::timeout(timeout, handler.handle(task)).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout(timeout)),
        };

        match result {
            Ok(output) => {
                breaker.record_success();
                match self.queue.ack_with_output(task.id, &output).await {
                    Ok(true) => {
                        for hook in &self.hooks {
                            hook.on_task_completed(task, &output).await;
                        }
                    }
                    Ok(false) => {
                        warn!(task_id = %task.id, "Ack ignored, lease was lost");
                    }
                    Err(e) => error!(task_id = %task.id, error = %e, "Ack failed"),
                }
            }
            Err(err) => {
                match classify(&err).category {
                    ErrorCategory::Transient | ErrorCategory::Capacity => breaker.record_failure(),
                    // Not the downstream's fault; frees a half-open probe slot.
                    ErrorCategory::Permanent | ErrorCategory::Cancellation => {
                        breaker.record_success()
                    }
                }
                self.report_failure(task, err).await;
            }
        }
    }

    async fn report_failure(&self, task: &Task, err: TaskError) {
        match self.queue.nack_claimed(task, &err).await {
            Ok(NackOutcome::Failed) => {
                for hook in &self.hooks {
                    hook.on_task_failed(task, &err).await;
                }
            }
            Ok(_) => {}
            Err(e) => error!(task_id = %task.id, error = %e, "Nack failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, QueueConfig, RetryConfig};
    use crate::consumer::handler::{NoopHandler, TaskHandler};
    use crate::events::{EventBroadcaster, GLOBAL_TOPIC};
    use crate::queue::{NewTask, TaskStatus};
    use crate::store::{Database, LibSqlBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    const FAST_POLL: Duration = Duration::from_millis(20);

    struct Recorder {
        completed: Mutex<Vec<uuid::Uuid>>,
        failed: Mutex<Vec<(uuid::Uuid, TaskError)>>,
    }

    #[async_trait]
    impl TaskLifecycleHook for Recorder {
        async fn on_task_completed(&self, task: &Task, _output: &serde_json::Value) {
            self.completed.lock().push(task.id);
        }

        async fn on_task_failed(&self, task: &Task, error: &TaskError) {
            self.failed.lock().push((task.id, error.clone()));
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl TaskHandler for AlwaysFails {
        fn task_type(&self) -> &str {
            "flaky"
        }

        fn service(&self) -> Option<&str> {
            Some("downstream")
        }

        async fn handle(&self, _task: &Task) -> Result<serde_json::Value, TaskError> {
            Err(TaskError::Network("connection reset".into()))
        }
    }

    struct Slow;

    #[async_trait]
    impl TaskHandler for Slow {
        fn task_type(&self) -> &str {
            "slow"
        }

        fn execution_timeout(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn handle(&self, _task: &Task) -> Result<serde_json::Value, TaskError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    /// Declares a longer timeout than the queue lease allows.
    struct Lingering;

    #[async_trait]
    impl TaskHandler for Lingering {
        fn task_type(&self) -> &str {
            "lingering"
        }

        fn execution_timeout(&self) -> Duration {
            Duration::from_secs(3600)
        }

        async fn handle(&self, _task: &Task) -> Result<serde_json::Value, TaskError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    struct Fixture {
        queue: Arc<TaskQueue>,
        broadcaster: Arc<EventBroadcaster>,
        breakers: Arc<CircuitBreakerRegistry>,
        recorder: Arc<Recorder>,
        pool: Arc<TaskConsumerPool>,
    }

    async fn fixture(retry: RetryConfig) -> Fixture {
        fixture_with(QueueConfig::default(), retry).await
    }

    async fn fixture_with(queue_config: QueueConfig, retry: RetryConfig) -> Fixture {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let broadcaster = Arc::new(EventBroadcaster::new());
        let queue = TaskQueue::new(store, Arc::clone(&broadcaster), queue_config, retry);

        let handlers = Arc::new(TaskHandlerRegistry::new());
        handlers.register(Arc::new(NoopHandler)).await;
        handlers.register(Arc::new(AlwaysFails)).await;
        handlers.register(Arc::new(Slow)).await;
        handlers.register(Arc::new(Lingering)).await;

        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let recorder = Arc::new(Recorder {
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        });
        let config = PoolConfig {
            worker_count: 2,
            poll_interval: FAST_POLL,
            shutdown_grace: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(60),
        };
        let pool = Arc::new(
            TaskConsumerPool::new(
                Arc::clone(&queue),
                handlers,
                Arc::clone(&breakers),
                config,
            )
            .with_hook(Arc::clone(&recorder) as Arc<dyn TaskLifecycleHook>),
        );
        Fixture {
            queue,
            broadcaster,
            breakers,
            recorder,
            pool,
        }
    }

    async fn claim(queue: &TaskQueue) -> Task {
        queue
            .dequeue("test-worker", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn success_acks_and_notifies_hooks() {
        let f = fixture(RetryConfig::default()).await;
        let task = f.queue.enqueue(NewTask::new("noop", json!({"n": 1}))).await.unwrap();
        let claimed = claim(&f.queue).await;

        f.pool.process(&claimed).await;

        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.output, Some(json!({"n": 1})));
        assert_eq!(*f.recorder.completed.lock(), vec![task.id]);
        assert_eq!(f.pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn unknown_type_fails_permanently() {
        let f = fixture(RetryConfig::default()).await;
        let task = f.queue.enqueue(NewTask::new("mystery", json!({}))).await.unwrap();
        let claimed = claim(&f.queue).await;

        f.pool.process(&claimed).await;

        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.attempt, 1);
        let failed = f.recorder.failed.lock();
        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0].1, TaskError::UnsupportedType(_)));
    }

    #[tokio::test]
    async fn open_breaker_defers_without_consuming_an_attempt() {
        let f = fixture(RetryConfig::default()).await;
        let breaker = f.breakers.get("downstream");
        for _ in 0..BreakerConfig::default().failure_threshold {
            breaker.record_failure();
        }

        let task = f
            .queue
            .enqueue(NewTask::new("flaky", json!({})).with_max_attempts(1))
            .await
            .unwrap();
        let claimed = claim(&f.queue).await;
        f.pool.process(&claimed).await;

        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.attempt, 0);
        assert!(f.recorder.failed.lock().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_trip_the_breaker() {
        let f = fixture(RetryConfig {
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        })
        .await;
        let threshold = BreakerConfig::default().failure_threshold;
        f.queue
            .enqueue(NewTask::new("flaky", json!({})).with_max_attempts(threshold + 1))
            .await
            .unwrap();

        for _ in 0..threshold {
            let claimed = claim(&f.queue).await;
            f.pool.process(&claimed).await;
        }
        let snapshot = &f.breakers.snapshots()[0];
        assert_eq!(snapshot.service, "downstream");
        assert_eq!(snapshot.state, crate::resilience::CircuitState::Open);
    }

    #[tokio::test]
    async fn handler_timeout_is_retried() {
        let f = fixture(RetryConfig::default()).await;
        let task = f.queue.enqueue(NewTask::new("slow", json!({}))).await.unwrap();
        let claimed = claim(&f.queue).await;

        f.pool.process(&claimed).await;

        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.last_error.as_deref(), Some("Timed out after 10ms"));
    }

    #[tokio::test]
    async fn handler_timeout_is_capped_by_the_lease() {
        let f = fixture_with(
            QueueConfig {
                visibility_timeout: Duration::from_millis(30),
                ..QueueConfig::default()
            },
            RetryConfig::default(),
        )
        .await;
        let task = f.queue.enqueue(NewTask::new("lingering", json!({}))).await.unwrap();
        let claimed = claim(&f.queue).await;

        tokio::time::timeout(Duration::from_secs(2), f.pool.process(&claimed))
            .await
            .expect("handler ran past its lease");

        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.last_error.as_deref(), Some("Timed out after 30ms"));
    }

    #[tokio::test]
    async fn retries_with_doubling_backoff_then_fails_once() {
        let f = fixture(RetryConfig {
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(5),
        })
        .await;
        let (sub, mut rx) = f.broadcaster.connect();
        f.broadcaster.subscribe(sub, GLOBAL_TOPIC);

        let task = f
            .queue
            .enqueue(NewTask::new("flaky", json!({})).with_max_attempts(3))
            .await
            .unwrap();
        f.pool.start();

        let mut events = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                let done = event.status == "failed";
                events.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("task never failed terminally");
        f.pool.shutdown().await;

        let processing = events.iter().filter(|e| e.status == "processing").count();
        let backoffs: Vec<u64> = events
            .iter()
            .filter(|e| e.data.get("retry").is_some())
            .filter_map(|e| e.data["backoff_ms"].as_u64())
            .collect();
        assert_eq!(processing, 3);
        assert_eq!(backoffs, vec![20, 40]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no events after the terminal failure");

        let stored = f.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.attempt, 3);
        assert_eq!(f.recorder.failed.lock().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_workers() {
        let f = fixture(RetryConfig::default()).await;
        f.pool.start();
        assert!(f.pool.is_running());

        tokio::time::timeout(Duration::from_secs(3), f.pool.shutdown())
            .await
            .expect("shutdown hung");
        assert!(!f.pool.is_running());
    }
}
