//! Durable priority task queue.
//!
//! A task lives in exactly one of three structures:
//!
//! - **pending**: sorted set of serialized tasks, highest score first
//! - **processing**: hash of id to serialized task, plus a lease deadline
//! - **failed**: hash of id to serialized task, terminal
//!
//! Every move between them is a single guarded [`Transaction`], so a task is
//! never visible in two places and a concurrent claimer or reaper can never
//! double-apply a move. Delivery is at-least-once: a worker that dies holding a
//! task leaves it to [`TaskQueue::reap_expired`] once its lease runs out.

mod reaper;
mod score;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tollgate_model::{
    DEFAULT_MAX_ATTEMPTS, QueueSnapshot, QueueStats, ReapReport, Task, TaskId, TaskPayload,
    WorkerBeat,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{self, TimeProvider};
use crate::error::{Result, TollgateError};
use crate::keys::QueueKeys;
use crate::store::{CoordinationStore, Guard, Reply, ScoreBound, StoreError, Transaction};

pub use reaper::{LeaseReaper, ReaperHandle};
pub use score::{MAX_PRIORITY, MIN_PRIORITY, clamp_priority, pending_score, priority_of};

use score::TieBreaker;

/// Error recorded on tasks reclaimed from an expired lease.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Attempts a guarded move is retried when another caller wins the race.
const MAX_CONTENTION_RETRIES: usize = 16;

/// Static settings for one named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub name: String,
    pub default_max_attempts: u32,
    /// How long a claim stays valid without renewal.
    pub lease_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_timeout: Duration::from_secs(300),
        }
    }
}

impl QueueSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }
}

/// Enqueue parameters beyond the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub payload: TaskPayload,
    pub priority: i64,
    /// Overrides both the payload's `max_attempts` and the queue default.
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            priority: 0,
            max_attempts: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Where a failed task went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back in pending for another attempt.
    Requeued { attempts: u32, max_attempts: u32 },
    /// Moved to failed with its attempts used up, or without retry.
    Failed { attempts: u32 },
    /// The processing entry did not decode and went to failed as is.
    Malformed,
}

/// Handle on one named queue. Cheap to share behind an [`Arc`].
pub struct TaskQueue {
    store: Arc<dyn CoordinationStore>,
    settings: QueueSettings,
    keys: QueueKeys,
    ticks: TieBreaker,
    clock: Arc<dyn TimeProvider>,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("settings", &self.settings)
            .field("store", &self.store)
            .finish()
    }
}

impl TaskQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, settings: QueueSettings) -> Self {
        let keys = QueueKeys::new(settings.name.clone());
        Self {
            store,
            settings,
            keys,
            ticks: TieBreaker::default(),
            clock: clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    fn lease_deadline(&self) -> f64 {
        clock::unix_seconds(self.clock.utc_now()) + self.settings.lease_timeout.as_secs_f64()
    }

    fn pending_score(&self, priority: i64) -> f64 {
        score::pending_score(priority, self.ticks.next(self.clock.utc_now()))
    }

    /// Add a task with the queue's default attempt budget.
    pub async fn enqueue(&self, payload: TaskPayload, priority: i64) -> Result<TaskId> {
        self.enqueue_request(EnqueueRequest::new(payload).priority(priority))
            .await
    }

    pub async fn enqueue_request(&self, request: EnqueueRequest) -> Result<TaskId> {
        let max_attempts = request
            .max_attempts
            .or_else(|| request.payload.requested_max_attempts())
            .unwrap_or(self.settings.default_max_attempts);
        let priority = clamp_priority(request.priority);
        let mut task = Task::new(request.payload, priority, max_attempts);
        task.created_at = self.clock.utc_now();

        let body = serde_json::to_string(&task)?;
        let tx = Transaction::new()
            .zadd(self.keys.pending(), body, self.pending_score(priority))
            .notify(self.keys.signal());
        self.execute(tx).await?;

        info!(
            queue = %self.settings.name,
            task_id = %task.id,
            task_type = task.task_type(),
            priority,
            max_attempts = task.max_attempts,
            "Task enqueued"
        );
        Ok(task.id)
    }

    /// Claim the highest priority task, waiting up to `timeout` for one to arrive.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_claim().await? {
                return Ok(Some(task));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.store
                .wait_for_signal(self.keys.signal(), remaining)
                .await?;
        }
    }

    /// Claim the head of the pending set without waiting.
    pub async fn try_claim(&self) -> Result<Option<Task>> {
        for _ in 0..MAX_CONTENTION_RETRIES {
            let head = self
                .store
                .zrevrange_by_score(
                    self.keys.pending(),
                    ScoreBound::PosInf,
                    ScoreBound::NegInf,
                    Some(1),
                )
                .await?;
            let Some((body, _score)) = head.into_iter().next() else {
                return Ok(None);
            };

            let in_pending = Guard::MemberExists {
                key: self.keys.pending().to_string(),
                member: body.clone(),
            };

            let task = match serde_json::from_str::<Task>(&body) {
                Ok(task) => task,
                Err(err) => {
                    let field = format!("malformed:{}", Uuid::new_v4());
                    let tx = Transaction::new()
                        .guard(in_pending)
                        .zrem(self.keys.pending(), body.clone())
                        .hset(self.keys.failed(), field.clone(), body)
                        .clamp_signal(self.keys.signal(), self.keys.pending());
                    if self.store.execute(tx).await?.is_some() {
                        error!(
                            queue = %self.settings.name,
                            field,
                            error = %err,
                            "Malformed pending entry moved to failed"
                        );
                    }
                    continue;
                }
            };

            // Wake-up tokens never outnumber pending tasks, so an empty queue
            // leaves nothing for a waiter to wake on.
            let id = task.id.to_string();
            let tx = Transaction::new()
                .guard(in_pending)
                .zrem(self.keys.pending(), body.clone())
                .hset(self.keys.processing(), id.clone(), body)
                .zadd(self.keys.leases(), id, self.lease_deadline())
                .clamp_signal(self.keys.signal(), self.keys.pending());

            if self.store.execute(tx).await?.is_some() {
                debug!(
                    queue = %self.settings.name,
                    task_id = %task.id,
                    task_type = task.task_type(),
                    "Task claimed"
                );
                return Ok(Some(task));
            }
            debug!(queue = %self.settings.name, "Lost claim race; retrying");
        }
        Ok(None)
    }

    /// Drop a finished task. `false` when it was not being processed.
    pub async fn complete(&self, id: &TaskId) -> Result<bool> {
        let field = id.to_string();
        let tx = Transaction::new()
            .hdel(self.keys.processing(), field.clone())
            .zrem(self.keys.leases(), field);
        let replies = self.execute(tx).await?;
        let removed = first_int(&replies)? > 0;
        if removed {
            info!(queue = %self.settings.name, task_id = %id, "Task completed");
        }
        Ok(removed)
    }

    /// Record a failed attempt, then requeue or move the task to failed.
    /// `false` when it was not being processed.
    pub async fn fail(&self, id: &TaskId, error: &str, retry: bool) -> Result<bool> {
        Ok(self.fail_with_disposition(id, error, retry).await?.is_some())
    }

    /// [`fail`](Self::fail), reporting where the task went. `None` when it was
    /// not being processed, e.g. because its lease was reaped meanwhile.
    pub async fn fail_with_disposition(
        &self,
        id: &TaskId,
        error: &str,
        retry: bool,
    ) -> Result<Option<Disposition>> {
        let field = id.to_string();
        for _ in 0..MAX_CONTENTION_RETRIES {
            let Some(body) = self.store.hget(self.keys.processing(), &field).await? else {
                return Ok(None);
            };
            let (tx, disposition) =
                self.settle_failure(Transaction::new(), &field, &body, error, retry)?;
            if self.store.execute(tx).await?.is_some() {
                self.log_disposition(&field, error, &disposition);
                return Ok(Some(disposition));
            }
        }
        Err(TollgateError::Internal(format!(
            "task {field} kept changing while recording failure"
        )))
    }

    /// Build the guarded move out of processing for a failed attempt.
    fn settle_failure(
        &self,
        tx: Transaction,
        field: &str,
        body: &str,
        error: &str,
        retry: bool,
    ) -> Result<(Transaction, Disposition)> {
        let tx = tx
            .guard(Guard::FieldEquals {
                key: self.keys.processing().to_string(),
                field: field.to_string(),
                value: body.to_string(),
            })
            .hdel(self.keys.processing(), field)
            .zrem(self.keys.leases(), field);

        let mut task = match serde_json::from_str::<Task>(body) {
            Ok(task) => task,
            Err(_) => {
                let tx = tx.hset(self.keys.failed(), field, body);
                return Ok((tx, Disposition::Malformed));
            }
        };

        task.record_failure(error);
        task.failed_at = Some(self.clock.utc_now());
        let updated = serde_json::to_string(&task)?;

        if retry && task.has_attempts_left() {
            let tx = tx
                .zadd(
                    self.keys.pending(),
                    updated,
                    self.pending_score(task.retry_priority()),
                )
                .notify(self.keys.signal());
            Ok((
                tx,
                Disposition::Requeued {
                    attempts: task.attempts,
                    max_attempts: task.max_attempts,
                },
            ))
        } else {
            let tx = tx.hset(self.keys.failed(), field, updated);
            Ok((
                tx,
                Disposition::Failed {
                    attempts: task.attempts,
                },
            ))
        }
    }

    fn log_disposition(&self, field: &str, error: &str, disposition: &Disposition) {
        match disposition {
            Disposition::Requeued {
                attempts,
                max_attempts,
            } => warn!(
                queue = %self.settings.name,
                task_id = field,
                attempts,
                max_attempts,
                error,
                "Retrying task"
            ),
            Disposition::Failed { attempts } => error!(
                queue = %self.settings.name,
                task_id = field,
                attempts,
                error,
                "Task failed permanently"
            ),
            Disposition::Malformed => error!(
                queue = %self.settings.name,
                task_id = field,
                "Malformed processing entry moved to failed"
            ),
        }
    }

    /// Push a claimed task's lease deadline out by one lease timeout.
    pub async fn renew_lease(&self, id: &TaskId) -> Result<bool> {
        let field = id.to_string();
        let tx = Transaction::new()
            .guard(Guard::FieldExists {
                key: self.keys.processing().to_string(),
                field: field.clone(),
            })
            .zadd(self.keys.leases(), field, self.lease_deadline());
        Ok(self.store.execute(tx).await?.is_some())
    }

    /// Reclaim tasks whose lease ran out. Each reclaim counts as one attempt.
    pub async fn reap_expired(&self) -> Result<ReapReport> {
        let now = clock::unix_seconds(self.clock.utc_now());
        let expired = self
            .store
            .zrange_by_score(
                self.keys.leases(),
                ScoreBound::NegInf,
                ScoreBound::Inclusive(now),
                None,
            )
            .await?;

        let mut report = ReapReport::default();
        for (field, _deadline) in expired {
            let still_expired = Guard::ScoreAtMost {
                key: self.keys.leases().to_string(),
                member: field.clone(),
                max: now,
            };

            let Some(body) = self.store.hget(self.keys.processing(), &field).await? else {
                let tx = Transaction::new()
                    .guard(still_expired)
                    .zrem(self.keys.leases(), field.clone());
                if self.store.execute(tx).await?.is_some() {
                    debug!(queue = %self.settings.name, task_id = field, "Dropped stale lease");
                    report.stale += 1;
                }
                continue;
            };

            let (tx, disposition) = self.settle_failure(
                Transaction::new().guard(still_expired),
                &field,
                &body,
                LEASE_EXPIRED,
                true,
            )?;
            // A failed guard means the lease was renewed or the task settled meanwhile.
            if self.store.execute(tx).await?.is_none() {
                continue;
            }
            self.log_disposition(&field, LEASE_EXPIRED, &disposition);
            match disposition {
                Disposition::Requeued { .. } => report.requeued += 1,
                Disposition::Failed { .. } | Disposition::Malformed => report.failed += 1,
            }
        }

        if !report.is_empty() {
            info!(
                queue = %self.settings.name,
                requeued = report.requeued,
                failed = report.failed,
                stale = report.stale,
                "Expired leases reaped"
            );
        }
        Ok(report)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let tx = Transaction::new()
            .zcard(self.keys.pending())
            .hlen(self.keys.processing())
            .hlen(self.keys.failed());
        let replies = self.execute(tx).await?;
        let count = |index: usize| -> Result<u64> {
            let reply = replies.get(index).ok_or_else(|| {
                StoreError::UnexpectedReply("stats reply missing".into())
            })?;
            Ok(reply.as_int()?.max(0) as u64)
        };
        Ok(QueueStats {
            pending: count(0)?,
            processing: count(1)?,
            failed: count(2)?,
        })
    }

    /// Ids held in each structure, pending in dequeue order.
    ///
    /// The three reads are separate, so a task moving mid-read can show up
    /// twice or not at all. Quiescent queues read exactly.
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let failed = self.failed_ids().await?;
        let pending = self
            .store
            .zrevrange_by_score(self.keys.pending(), ScoreBound::PosInf, ScoreBound::NegInf, None)
            .await?
            .into_iter()
            .filter_map(|(body, _)| serde_json::from_str::<Task>(&body).ok())
            .map(|task| task.id)
            .collect();
        let processing = parse_ids(self.store.hgetall(self.keys.processing()).await?);
        Ok(QueueSnapshot {
            pending,
            processing,
            failed,
        })
    }

    async fn failed_ids(&self) -> Result<Vec<TaskId>> {
        Ok(parse_ids(self.store.hgetall(self.keys.failed()).await?))
    }

    /// Pending tasks in dequeue order.
    pub async fn pending_tasks(&self) -> Result<Vec<Task>> {
        let entries = self
            .store
            .zrevrange_by_score(self.keys.pending(), ScoreBound::PosInf, ScoreBound::NegInf, None)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|(body, _)| serde_json::from_str(&body).ok())
            .collect())
    }

    /// Terminally failed tasks, most recent failure first. Malformed entries are skipped.
    pub async fn failed_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .store
            .hgetall(self.keys.failed())
            .await?
            .into_iter()
            .filter_map(|(field, body)| match serde_json::from_str(&body) {
                Ok(task) => Some(task),
                Err(err) => {
                    debug!(
                        queue = %self.settings.name,
                        field,
                        error = %err,
                        "Skipping malformed failed entry"
                    );
                    None
                }
            })
            .collect();
        tasks.sort_by(|a: &Task, b: &Task| b.failed_at.cmp(&a.failed_at));
        Ok(tasks)
    }

    /// Publish a worker heartbeat that disappears after `ttl` without refresh.
    pub async fn record_heartbeat(&self, beat: &WorkerBeat, ttl: Duration) -> Result<()> {
        let body = serde_json::to_string(beat)?;
        self.store
            .set(&self.keys.worker(&beat.worker_id), &body, Some(ttl))
            .await?;
        Ok(())
    }

    pub async fn clear_heartbeat(&self, worker_id: &Uuid) -> Result<()> {
        self.store.delete(&self.keys.worker(worker_id)).await?;
        Ok(())
    }

    /// Workers whose heartbeat has not expired, oldest first.
    pub async fn active_workers(&self) -> Result<Vec<WorkerBeat>> {
        let keys = self.store.keys(&self.keys.worker_pattern()).await?;
        let mut beats = Vec::with_capacity(keys.len());
        for key in keys {
            // Expired between listing and reading.
            let Some(body) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<WorkerBeat>(&body) {
                Ok(beat) => beats.push(beat),
                Err(err) => warn!(key, error = %err, "Ignoring unreadable worker heartbeat"),
            }
        }
        beats.sort_by_key(|beat| beat.started_at);
        Ok(beats)
    }

    /// Lease deadline of a claimed task.
    pub async fn lease_deadline_of(&self, id: &TaskId) -> Result<Option<DateTime<Utc>>> {
        let field = id.to_string();
        let leases = self
            .store
            .zrange_by_score(self.keys.leases(), ScoreBound::NegInf, ScoreBound::PosInf, None)
            .await?;
        Ok(leases
            .into_iter()
            .find(|(member, _)| *member == field)
            .and_then(|(_, deadline)| clock::from_unix_seconds(deadline)))
    }

    async fn execute(&self, tx: Transaction) -> Result<Vec<Reply>> {
        self.store.execute(tx).await?.ok_or_else(|| {
            TollgateError::Internal("unguarded queue transaction was rejected".into())
        })
    }
}

fn first_int(replies: &[Reply]) -> Result<i64> {
    let reply = replies
        .first()
        .ok_or_else(|| StoreError::UnexpectedReply("reply missing".into()))?;
    Ok(reply.as_int()?)
}

fn parse_ids(fields: Vec<(String, String)>) -> Vec<TaskId> {
    fields
        .into_iter()
        .filter_map(|(field, _)| field.parse().ok())
        .collect()
}
