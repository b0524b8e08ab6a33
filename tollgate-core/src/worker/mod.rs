//! Background task worker.
//!
//! A [`TaskWorker`] drains one [`TaskQueue`], dispatching each task through a
//! [`HandlerRegistry`]. Handler errors and panics are recorded and retried;
//! tasks whose declared type has no handler are failed without retry. The worker keeps the
//! lease of the task it is running fresh and publishes a heartbeat so
//! operators can see it.

mod handler;

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;
use tollgate_model::{Task, TaskId, WorkerBeat};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::queue::{Disposition, TaskQueue};

pub use handler::{HandlerRegistry, HandlerRegistryBuilder, TaskHandler, TaskKind};

/// Loop timing for a [`TaskWorker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Longest single wait for work; also bounds how long `stop` takes to land.
    pub poll_interval: Duration,
    /// Pause after a store error before the next iteration.
    pub error_backoff: Duration,
    /// Heartbeat expiry. Refreshed every third of this.
    pub heartbeat_ttl: Duration,
    /// Lease renewal period while a handler runs. Defaults to a third of the
    /// queue's lease timeout.
    pub lease_renewal: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            heartbeat_ttl: Duration::from_secs(30),
            lease_renewal: None,
        }
    }
}

/// Result of one worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(TaskId),
    /// Handler failed and the task went back to pending.
    Retried(TaskId),
    /// Handler failed on the last allowed attempt.
    Failed(TaskId),
    /// No handler for the declared type; failed without retry.
    Unroutable(TaskId),
    /// Settled elsewhere (its lease was reaped) before the handler finished.
    Lost(TaskId),
    /// Nothing arrived before the timeout.
    Idle,
}

impl TaskOutcome {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            TaskOutcome::Completed(id)
            | TaskOutcome::Retried(id)
            | TaskOutcome::Failed(id)
            | TaskOutcome::Unroutable(id)
            | TaskOutcome::Lost(id) => Some(*id),
            TaskOutcome::Idle => None,
        }
    }
}

/// Cloneable stop switch for a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct TaskWorker<K: TaskKind> {
    id: Uuid,
    queue: Arc<TaskQueue>,
    registry: Arc<HandlerRegistry<K>>,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl<K: TaskKind> TaskWorker<K> {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<HandlerRegistry<K>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            registry,
            config,
            running: Arc::new(AtomicBool::new(true)),
            started_at: Utc::now(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            running: Arc::clone(&self.running),
        }
    }

    pub fn stop(&self) {
        info!(worker_id = %self.id, "Task worker stopping");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Tasks completed and tasks failed (retried or terminal) so far.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    /// Process tasks until stopped. Store errors never end the loop.
    pub async fn run(&self) {
        info!(
            worker_id = %self.id,
            queue = %self.queue.name(),
            "Task worker started"
        );

        let beat_every = (self.config.heartbeat_ttl / 3).max(Duration::from_millis(100));
        let mut last_beat: Option<Instant> = None;

        while self.is_running() {
            if last_beat.is_none_or(|at| at.elapsed() >= beat_every) {
                self.beat().await;
                last_beat = Some(Instant::now());
            }

            match self.process_next(self.config.poll_interval).await {
                Ok(TaskOutcome::Idle) => {}
                Ok(outcome) => debug!(worker_id = %self.id, ?outcome, "Task processed"),
                Err(err) => {
                    error!(worker_id = %self.id, error = %err, "Worker error");
                    tokio::time::sleep(self.jittered_backoff()).await;
                }
            }
        }

        if let Err(err) = self.queue.clear_heartbeat(&self.id).await {
            warn!(worker_id = %self.id, error = %err, "Failed to clear worker heartbeat");
        }
        info!(worker_id = %self.id, "Task worker stopped");
    }

    /// Run one iteration: wait up to `timeout` for a task and settle it.
    pub async fn process_next(&self, timeout: Duration) -> Result<TaskOutcome> {
        let Some(task) = self.queue.dequeue(timeout).await? else {
            return Ok(TaskOutcome::Idle);
        };

        let Some((kind, handler)) = self.registry.route(task.task_type()) else {
            let message = format!("No handler for task type: {:?}", task.task_type());
            warn!(worker_id = %self.id, task_id = %task.id, "{message}");
            self.queue.fail(&task.id, &message, false).await?;
            self.failed.fetch_add(1, Ordering::Relaxed);
            return Ok(TaskOutcome::Unroutable(task.id));
        };

        debug!(
            worker_id = %self.id,
            task_id = %task.id,
            task_kind = kind.as_str(),
            attempt = task.attempts + 1,
            "Running task"
        );

        match self.run_handler(&task, handler).await {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                if self.queue.complete(&task.id).await? {
                    Ok(TaskOutcome::Completed(task.id))
                } else {
                    warn!(task_id = %task.id, "Completed task was no longer held by this worker");
                    Ok(TaskOutcome::Lost(task.id))
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    task_kind = kind.as_str(),
                    error = %message,
                    "Task failed"
                );
                self.failed.fetch_add(1, Ordering::Relaxed);
                match self.queue.fail_with_disposition(&task.id, &message, true).await? {
                    Some(Disposition::Requeued { .. }) => Ok(TaskOutcome::Retried(task.id)),
                    Some(Disposition::Failed { .. } | Disposition::Malformed) => {
                        Ok(TaskOutcome::Failed(task.id))
                    }
                    None => {
                        warn!(task_id = %task.id, "Failed task was no longer held by this worker");
                        Ok(TaskOutcome::Lost(task.id))
                    }
                }
            }
        }
    }

    /// Drive the handler on its own task while renewing the lease. A panic
    /// in the handler comes back as an error instead of unwinding the loop.
    async fn run_handler(
        &self,
        task: &Task,
        handler: Arc<dyn TaskHandler>,
    ) -> anyhow::Result<()> {
        let every = self
            .config
            .lease_renewal
            .unwrap_or(self.queue.settings().lease_timeout / 3)
            .max(Duration::from_millis(10));
        let mut renewals = tokio::time::interval_at(Instant::now() + every, every);

        let work = {
            let task = task.clone();
            tokio::spawn(async move { handler.handle(&task).await })
        };
        let _abort = AbortOnDrop(work.abort_handle());
        tokio::pin!(work);

        loop {
            tokio::select! {
                joined = &mut work => return joined.unwrap_or_else(|err| Err(join_failure(err))),
                _ = renewals.tick() => match self.queue.renew_lease(&task.id).await {
                    Ok(true) => debug!(task_id = %task.id, "Lease renewed"),
                    Ok(false) => warn!(task_id = %task.id, "Lease lost while task was running"),
                    Err(err) => warn!(task_id = %task.id, error = %err, "Lease renewal failed"),
                },
            }
        }
    }

    async fn beat(&self) {
        let (completed, failed) = self.counters();
        let beat = WorkerBeat {
            worker_id: self.id,
            queue: self.queue.name().to_string(),
            started_at: self.started_at,
            last_seen: Utc::now(),
            completed,
            failed,
        };
        if let Err(err) = self
            .queue
            .record_heartbeat(&beat, self.config.heartbeat_ttl)
            .await
        {
            warn!(worker_id = %self.id, error = %err, "Failed to record worker heartbeat");
        }
    }

    fn jittered_backoff(&self) -> Duration {
        let base = self.config.error_backoff;
        if base.is_zero() {
            return base;
        }
        base.mul_f64(rand::rng().random_range(0.75..=1.25))
    }
}

/// Cancels a spawned handler when the worker stops waiting on it.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn join_failure(err: JoinError) -> anyhow::Error {
    if err.is_panic() {
        anyhow::anyhow!("handler panicked: {}", panic_message(err.into_panic()))
    } else {
        anyhow::anyhow!("handler was cancelled")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "non-string panic payload".to_string(), |m| m.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeProvider;
    use crate::queue::QueueSettings;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tollgate_model::TaskPayload;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Echo,
        Explode,
    }

    impl TaskKind for Kind {
        const ALL: &'static [Self] = &[Kind::Echo, Kind::Explode];

        fn as_str(&self) -> &'static str {
            match self {
                Kind::Echo => "echo",
                Kind::Explode => "explode",
            }
        }
    }

    struct Explode;

    #[async_trait]
    impl TaskHandler for Explode {
        async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("kaboom"))
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
            panic!("handler bug")
        }
    }

    /// Fails after a pause long enough for the test to reap its lease.
    struct SlowExplode;

    #[async_trait]
    impl TaskHandler for SlowExplode {
        async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(anyhow::anyhow!("late kaboom"))
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(10),
            ..WorkerConfig::default()
        }
    }

    fn worker(store: &MemoryStore, calls: Arc<AtomicUsize>) -> TaskWorker<Kind> {
        let queue = Arc::new(TaskQueue::new(
            Arc::new(store.clone()),
            QueueSettings::named("worker-test"),
        ));
        let registry = HandlerRegistry::builder()
            .register(Kind::Echo, move |_task: Task| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            })
            .register(Kind::Explode, Explode)
            .build()
            .unwrap();
        TaskWorker::new(
            queue,
            Arc::new(registry),
            WorkerConfig {
                poll_interval: Duration::from_millis(20),
                error_backoff: Duration::from_millis(10),
                ..WorkerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn process_next_reports_each_outcome() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = worker(&store, calls.clone());
        let queue = worker.queue.clone();

        assert_eq!(worker.process_next(Duration::ZERO).await.unwrap(), TaskOutcome::Idle);

        let echo = queue.enqueue(TaskPayload::new("echo"), 0).await.unwrap();
        assert_eq!(
            worker.process_next(Duration::ZERO).await.unwrap(),
            TaskOutcome::Completed(echo)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let unknown = queue.enqueue(TaskPayload::new("mystery"), 0).await.unwrap();
        assert_eq!(
            worker.process_next(Duration::ZERO).await.unwrap(),
            TaskOutcome::Unroutable(unknown)
        );

        let boom = queue
            .enqueue_request(
                crate::queue::EnqueueRequest::new(TaskPayload::new("explode")).max_attempts(2),
            )
            .await
            .unwrap();
        assert_eq!(
            worker.process_next(Duration::ZERO).await.unwrap(),
            TaskOutcome::Retried(boom)
        );
        assert_eq!(
            worker.process_next(Duration::ZERO).await.unwrap(),
            TaskOutcome::Failed(boom)
        );

        let failed = queue.failed_tasks().await.unwrap();
        assert_eq!(failed.len(), 2);
        let exploded = failed.iter().find(|task| task.id == boom).unwrap();
        assert_eq!(exploded.attempts, 2);
        assert_eq!(exploded.last_error.as_deref(), Some("kaboom"));
        assert_eq!(worker.counters(), (1, 3));
    }

    #[tokio::test]
    async fn run_stops_after_handle_is_triggered() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(worker(&store, calls.clone()));
        let queue = worker.queue.clone();
        for _ in 0..3 {
            queue.enqueue(TaskPayload::new("echo"), 0).await.unwrap();
        }

        let handle = worker.handle();
        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should drain the queue");
        assert_eq!(queue.active_workers().await.unwrap().len(), 1);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("worker should stop within a poll interval")
            .unwrap();
        assert!(queue.stats().await.unwrap().is_drained());
        assert!(queue.active_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_errors_do_not_end_the_loop() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(worker(&store, calls.clone()));
        let queue = worker.queue.clone();
        store.set_offline(true);

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!running.is_finished());

        store.set_offline(false);
        queue.enqueue(TaskPayload::new("echo"), 0).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should recover once the store is back");

        worker.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn long_handlers_keep_their_lease() {
        let store = MemoryStore::new();
        let queue = Arc::new(TaskQueue::new(
            Arc::new(store.clone()),
            QueueSettings::named("slow").with_lease_timeout(Duration::from_millis(60)),
        ));
        let registry = HandlerRegistry::builder()
            .register(Kind::Echo, |_task: Task| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), anyhow::Error>(())
            })
            .register(Kind::Explode, Explode)
            .build()
            .unwrap();
        let worker = Arc::new(TaskWorker::new(
            queue.clone(),
            Arc::new(registry),
            WorkerConfig {
                lease_renewal: Some(Duration::from_millis(15)),
                ..WorkerConfig::default()
            },
        ));
        let id = queue.enqueue(TaskPayload::new("echo"), 0).await.unwrap();

        let processing = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.process_next(Duration::ZERO).await })
        };

        // Sweep repeatedly while the handler outlives its original lease.
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(queue.reap_expired().await.unwrap().is_empty());
        }

        let outcome = processing.await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Completed(id));
    }
    #[tokio::test]
    async fn panicking_handler_is_recorded_as_a_failure() {
        let store = MemoryStore::new();
        let queue = Arc::new(TaskQueue::new(
            Arc::new(store.clone()),
            QueueSettings::named("panics"),
        ));
        let registry = HandlerRegistry::builder()
            .register(Kind::Echo, Panics)
            .register(Kind::Explode, Explode)
            .build()
            .unwrap();
        let worker = TaskWorker::new(queue.clone(), Arc::new(registry), fast_config());

        let id = queue
            .enqueue_request(
                crate::queue::EnqueueRequest::new(TaskPayload::new("echo")).max_attempts(2),
            )
            .await
            .unwrap();
        assert_eq!(
            worker.process_next(Duration::ZERO).await.unwrap(),
            TaskOutcome::Retried(id)
        );
        assert_eq!(
            worker.process_next(Duration::ZERO).await.unwrap(),
            TaskOutcome::Failed(id)
        );

        let failed = queue.failed_tasks().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 2);
        assert_eq!(
            failed[0].last_error.as_deref(),
            Some("handler panicked: handler bug")
        );
    }

    #[tokio::test]
    async fn run_keeps_serving_after_a_handler_panics() {
        let store = MemoryStore::new();
        let queue = Arc::new(TaskQueue::new(
            Arc::new(store.clone()),
            QueueSettings::named("panics-loop"),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = {
            let calls = calls.clone();
            HandlerRegistry::builder()
                .register(Kind::Explode, Panics)
                .register(Kind::Echo, move |_task: Task| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), anyhow::Error>(())
                    }
                })
                .build()
                .unwrap()
        };
        let worker = Arc::new(TaskWorker::new(
            queue.clone(),
            Arc::new(registry),
            fast_config(),
        ));

        for _ in 0..2 {
            queue
                .enqueue_request(
                    crate::queue::EnqueueRequest::new(TaskPayload::new("explode"))
                        .priority(1)
                        .max_attempts(1),
                )
                .await
                .unwrap();
        }
        queue.enqueue(TaskPayload::new("echo"), 0).await.unwrap();

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stats = queue.stats().await.unwrap();
                if calls.load(Ordering::SeqCst) == 1 && stats.pending + stats.processing == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should reach the task queued behind the panics");

        assert!(!running.is_finished());
        assert_eq!(queue.stats().await.unwrap().failed, 2);

        worker.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn outcome_reflects_a_lease_reaped_mid_handler() {
        let store = MemoryStore::new();
        let clock = ManualTimeProvider::default();
        let queue = Arc::new(
            TaskQueue::new(
                Arc::new(store.clone()),
                QueueSettings::named("reaped").with_lease_timeout(Duration::from_secs(30)),
            )
            .with_clock(Arc::new(clock.clone())),
        );
        let registry = HandlerRegistry::builder()
            .register(Kind::Echo, SlowExplode)
            .register(Kind::Explode, SlowExplode)
            .build()
            .unwrap();
        let worker = Arc::new(TaskWorker::new(queue.clone(), Arc::new(registry), fast_config()));
        let id = queue.enqueue(TaskPayload::new("echo"), 0).await.unwrap();

        let processing = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.process_next(Duration::ZERO).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        clock.advance(Duration::from_secs(31));
        assert_eq!(queue.reap_expired().await.unwrap().requeued, 1);

        let outcome = processing.await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Lost(id));
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.pending, stats.processing, stats.failed), (1, 0, 0));
    }
}
