use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::TaskQueue;

/// Periodically returns tasks with expired leases to the queue.
#[derive(Debug)]
pub struct LeaseReaper {
    queue: Arc<TaskQueue>,
    interval: Duration,
    handle: ReaperHandle,
}

/// Cloneable stop switch for a running [`LeaseReaper`].
#[derive(Debug, Clone)]
pub struct ReaperHandle {
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ReaperHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl LeaseReaper {
    pub fn new(queue: Arc<TaskQueue>, interval: Duration) -> Self {
        Self {
            queue,
            interval,
            handle: ReaperHandle {
                running: Arc::new(AtomicBool::new(true)),
                wake: Arc::new(Notify::new()),
            },
        }
    }

    pub fn handle(&self) -> ReaperHandle {
        self.handle.clone()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Sweep until stopped. A reaper stopped before `run` returns at once.
    /// Store errors are logged and the next sweep proceeds.
    pub async fn run(&self) {
        info!(
            queue = %self.queue.name(),
            interval_ms = self.interval.as_millis() as u64,
            "Lease reaper started"
        );

        while self.handle.is_running() {
            match self.queue.reap_expired().await {
                Ok(report) if report.is_empty() => {
                    debug!(queue = %self.queue.name(), "No expired leases")
                }
                Ok(_) => {}
                Err(err) => {
                    error!(queue = %self.queue.name(), error = %err, "Lease sweep failed")
                }
            }

            if !self.handle.is_running() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.handle.wake.notified() => {}
            }
        }

        info!(queue = %self.queue.name(), "Lease reaper stopped");
    }
}
