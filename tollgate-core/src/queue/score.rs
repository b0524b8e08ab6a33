//! Pending-set score encoding.
//!
//! A pending score is `priority + 1 - (tick + 1) / 2^42` where `tick` counts
//! milliseconds since 2024-01-01. The fraction stays inside (0, 1), so every
//! score lands strictly between `priority` and `priority + 1` and later ticks
//! score lower. Reading the set highest-first therefore yields priority order
//! with FIFO among equal priorities. Priorities are clamped to ±1023 so one
//! tick is still at least one ulp of the resulting `f64`.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

pub const MAX_PRIORITY: i64 = 1023;
pub const MIN_PRIORITY: i64 = -MAX_PRIORITY;

/// 2024-01-01T00:00:00Z in unix milliseconds.
const TICK_EPOCH_MS: i64 = 1_704_067_200_000;
const TICK_BITS: u32 = 42;
const MAX_TICK: i64 = (1 << TICK_BITS) - 2;

pub fn clamp_priority(priority: i64) -> i64 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

pub fn pending_score(priority: i64, tick: i64) -> f64 {
    let tick = tick.clamp(0, MAX_TICK);
    let fraction = (tick + 1) as f64 / (1u64 << TICK_BITS) as f64;
    clamp_priority(priority) as f64 + 1.0 - fraction
}

/// Priority a pending score was encoded from.
pub fn priority_of(score: f64) -> i64 {
    score.floor() as i64
}

/// Strictly increasing tick source for one producer.
#[derive(Debug, Default)]
pub(crate) struct TieBreaker {
    last: AtomicI64,
}

impl TieBreaker {
    pub(crate) fn next(&self, now: DateTime<Utc>) -> i64 {
        let now_ms = (now.timestamp_millis() - TICK_EPOCH_MS).clamp(0, MAX_TICK);
        let next = |last: i64| now_ms.max(last + 1);
        match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
        {
            Ok(previous) | Err(previous) => next(previous),
        }
    }
}
