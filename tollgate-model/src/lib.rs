//! Core data model definitions shared across Tollgate crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod rate_limit;
pub mod task;

// Intentionally curated re-exports for downstream consumers.
pub use rate_limit::{DegradedPolicy, RateLimitDecision, RateLimitRule};
pub use task::{
    DEFAULT_MAX_ATTEMPTS, QueueSnapshot, QueueStats, ReapReport, Task,
    TaskId, TaskPayload, WorkerBeat,
};
