//! Per-process sliding window used while the coordination store is down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Records between sweeps of idle windows.
const SWEEP_EVERY: u64 = 256;

/// Same prune, count, record algorithm as the shared window, held in memory.
///
/// Counts are only approximate across a fleet since every process keeps its
/// own copy. Idle windows are swept every [`SWEEP_EVERY`] records, so the map
/// holds at most the identifiers seen within one window plus one sweep's worth.
#[derive(Debug, Default)]
pub(crate) struct LocalWindow {
    entries: DashMap<String, VecDeque<f64>>,
    records: AtomicU64,
}

impl LocalWindow {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Prune, count and record one request. Returns the count before recording.
    pub(crate) fn record(&self, key: &str, now: f64, per: Duration) -> u32 {
        let cutoff = now - per.as_secs_f64();
        let count = {
            let mut window = self.entries.entry(key.to_string()).or_default();
            window.retain(|&at| at > cutoff);
            let count = window.len();
            window.push_back(now);
            count
        };
        // The entry guard is released above; retain locks every shard.
        if self.records.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.cleanup(now, per);
        }
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// In-window entries without recording anything.
    pub(crate) fn count(&self, key: &str, now: f64, per: Duration) -> u32 {
        let cutoff = now - per.as_secs_f64();
        self.entries
            .get(key)
            .map(|window| window.iter().filter(|&&at| at > cutoff).count())
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    pub(crate) fn oldest(&self, key: &str, now: f64, per: Duration) -> Option<f64> {
        let cutoff = now - per.as_secs_f64();
        self.entries.get(key).and_then(|window| {
            window
                .iter()
                .copied()
                .filter(|&at| at > cutoff)
                .min_by(f64::total_cmp)
        })
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn clear(&self) -> usize {
        let len = self.entries.len();
        self.entries.clear();
        len
    }

    /// Drop windows with nothing left inside them.
    pub(crate) fn cleanup(&self, now: f64, per: Duration) -> usize {
        let cutoff = now - per.as_secs_f64();
        let before = self.entries.len();
        self.entries
            .retain(|_, window| window.iter().any(|&at| at > cutoff));
        before - self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_window_counts_before_recording() {
        let window = LocalWindow::new();
        let per = Duration::from_secs(1);

        for i in 0..3 {
            assert_eq!(window.record("client", 100.0, per), i);
        }
        assert_eq!(window.count("client", 100.5, per), 3);

        // Entries exactly one window old are pruned.
        assert_eq!(window.record("client", 101.0, per), 0);
    }

    #[test]
    fn cleanup_drops_idle_windows() {
        let window = LocalWindow::new();
        let per = Duration::from_secs(10);
        window.record("a", 0.0, per);
        window.record("b", 5.0, per);

        assert_eq!(window.cleanup(12.0, per), 1);
        assert_eq!(window.len(), 1);
        assert_eq!(window.oldest("b", 12.0, per), Some(5.0));
        assert_eq!(window.oldest("a", 12.0, per), None);
    }

    #[test]
    fn recording_sweeps_idle_windows() {
        let window = LocalWindow::new();
        let per = Duration::from_secs(1);

        for i in 0..10_000u32 {
            let now = f64::from(i) * 0.01;
            window.record(&format!("client-{i}"), now, per);
            // One window holds 100 identifiers; sweeps add at most one batch.
            assert!(window.len() <= 100 + SWEEP_EVERY as usize, "{} windows", window.len());
        }
    }
}
