//! Wall-clock abstraction.
//!
//! Window scores and lease deadlines are unix timestamps shared through the
//! store, so they come from wall-clock time rather than a monotonic instant.
//! Tests swap in [`ManualTimeProvider`] to move time without sleeping.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current UTC time.
pub trait TimeProvider: Send + Sync + fmt::Debug + 'static {
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Production provider backed by the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Provider that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualTimeProvider {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for ManualTimeProvider {
    fn default() -> Self {
        Self::new_at(Utc::now())
    }
}

impl ManualTimeProvider {
    pub fn new_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Default provider handle.
pub fn system() -> Arc<dyn TimeProvider> {
    Arc::new(SystemTimeProvider)
}

/// Seconds since the unix epoch with microsecond resolution.
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Inverse of [`unix_seconds`].
pub fn from_unix_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
}
