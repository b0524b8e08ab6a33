use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Attempts granted to a task when neither the request nor the payload says otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Strongly typed task identifier.
///
/// Issued at enqueue time from a UUID v7, so ids are unique across producers
/// and sort roughly by creation time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TaskId)
    }
}

/// Caller supplied description of a unit of work.
///
/// Only the declared `type` is interpreted (it selects the handler); every
/// other key is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl TaskPayload {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            data: Map::new(),
        }
    }

    /// Builder style insert of an opaque field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// `max_attempts` embedded in the payload, if the producer supplied one.
    pub fn requested_max_attempts(&self) -> Option<u32> {
        self.data
            .get("max_attempts")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }
}

/// Durable task record as stored in the pending, processing and failed structures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    /// Priority requested at enqueue time. Retries are scored below it.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(payload: TaskPayload, priority: i64, max_attempts: u32) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            created_at: Utc::now(),
            priority,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            failed_at: None,
        }
    }

    pub fn task_type(&self) -> &str {
        &self.payload.task_type
    }

    /// Record one failed attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        self.failed_at = Some(Utc::now());
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Priority used when re-queueing after a failure: the original priority
    /// minus attempts so far. The queue clamps this to its priority floor, so
    /// a task already at the floor retries at the floor, behind every task
    /// waiting there.
    pub fn retry_priority(&self) -> i64 {
        self.priority.saturating_sub(i64::from(self.attempts))
    }
}

/// Point-in-time sizes of a queue's three structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.failed
    }

    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Task ids held in each structure at the time of reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub pending: Vec<TaskId>,
    pub processing: Vec<TaskId>,
    pub failed: Vec<TaskId>,
}

impl QueueSnapshot {
    /// True when no id shows up in more than one structure.
    pub fn is_disjoint(&self) -> bool {
        let mut seen = HashSet::new();
        self.pending
            .iter()
            .chain(&self.processing)
            .chain(&self.failed)
            .all(|id| seen.insert(*id))
    }
}

/// Outcome of one lease expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    pub requeued: u64,
    pub failed: u64,
    /// Lease entries whose task was already gone.
    pub stale: u64,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0 && self.stale == 0
    }
}

/// Liveness record a worker publishes while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBeat {
    pub worker_id: Uuid,
    pub queue: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_type_and_extra_fields() {
        let payload = TaskPayload::new("send_email")
            .with("to", "user@example.com")
            .with("max_attempts", 5);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "send_email");
        assert_eq!(json["to"], "user@example.com");

        let back: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.requested_max_attempts(), Some(5));
    }

    #[test]
    fn payload_without_type_deserializes_as_empty_type() {
        let payload: TaskPayload =
            serde_json::from_str(r#"{"user_id": 7}"#).unwrap();
        assert_eq!(payload.task_type, "");
        assert_eq!(payload.get("user_id"), Some(&Value::from(7)));
    }

    #[test]
    fn retry_priority_sinks_with_each_attempt() {
        let mut task = Task::new(TaskPayload::new("noop"), 4, 3);
        assert_eq!(task.retry_priority(), 4);
        task.record_failure("boom");
        assert_eq!(task.retry_priority(), 3);
        task.record_failure("boom");
        assert_eq!(task.retry_priority(), 2);
        assert!(task.has_attempts_left());
        task.record_failure("boom");
        assert!(!task.has_attempts_left());
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert!(task.failed_at.is_some());
    }

    #[test]
    fn zero_max_attempts_is_raised_to_one() {
        let task = Task::new(TaskPayload::new("noop"), 0, 0);
        assert_eq!(task.max_attempts, 1);
    }

    #[test]
    fn snapshot_detects_overlap() {
        let a = TaskId::new();
        let b = TaskId::new();
        let clean = QueueSnapshot {
            pending: vec![a],
            processing: vec![b],
            failed: vec![],
        };
        assert!(clean.is_disjoint());

        let overlapping = QueueSnapshot {
            pending: vec![a],
            processing: vec![],
            failed: vec![a],
        };
        assert!(!overlapping.is_disjoint());
    }

    #[test]
    fn task_id_parses_from_display() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
