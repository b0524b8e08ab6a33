//! Shared fixtures for core integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tollgate_core::clock::ManualTimeProvider;
use tollgate_core::queue::{QueueSettings, TaskQueue};
use tollgate_core::store::{
    CoordinationStore, MemoryStore, Reply, ScoreBound, StoreResult, Transaction,
};
use tollgate_core::worker::{HandlerRegistry, TaskHandler, TaskKind};
use tollgate_model::Task;

/// Queue over a private in-memory store with a hand-driven clock.
pub struct QueueHarness {
    pub store: MemoryStore,
    pub clock: ManualTimeProvider,
    pub queue: Arc<TaskQueue>,
}

impl QueueHarness {
    pub fn new(name: &str) -> Self {
        Self::with_lease(name, Duration::from_secs(30))
    }

    pub fn with_lease(name: &str, lease_timeout: Duration) -> Self {
        let store = MemoryStore::new();
        let clock = ManualTimeProvider::default();
        let queue = Arc::new(
            TaskQueue::new(
                Arc::new(store.clone()),
                QueueSettings::named(name).with_lease_timeout(lease_timeout),
            )
            .with_clock(Arc::new(clock.clone())),
        );
        Self { store, clock, queue }
    }
}

/// Task kinds used across the worker tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemoKind {
    SendEmail,
    ProcessAnalytics,
}

impl TaskKind for DemoKind {
    const ALL: &'static [Self] = &[DemoKind::SendEmail, DemoKind::ProcessAnalytics];

    fn as_str(&self) -> &'static str {
        match self {
            DemoKind::SendEmail => "send_email",
            DemoKind::ProcessAnalytics => "process_analytics",
        }
    }
}

/// Store wrapper counting pending-head reads and blocking waits.
#[derive(Debug)]
pub struct CountingStore {
    inner: Arc<dyn CoordinationStore>,
    head_reads: AtomicUsize,
    waits: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn CoordinationStore>) -> Self {
        Self {
            inner,
            head_reads: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
        }
    }

    pub fn head_reads(&self) -> usize {
        self.head_reads.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.head_reads.store(0, Ordering::SeqCst);
        self.waits.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationStore for CountingStore {
    async fn execute(&self, tx: Transaction) -> StoreResult<Option<Vec<Reply>>> {
        self.inner.execute(tx).await
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.inner.keys(pattern).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.inner.zrange_by_score(key, min, max, limit).await
    }

    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: ScoreBound,
        min: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.head_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.zrevrange_by_score(key, max, min, limit).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        self.inner.hgetall(key).await
    }

    async fn wait_for_signal(&self, key: &str, timeout: Duration) -> StoreResult<bool> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        self.inner.wait_for_signal(key, timeout).await
    }
}

/// Handler that fails every time.
pub struct AlwaysFail;

#[async_trait]
impl TaskHandler for AlwaysFail {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        anyhow::bail!("simulated failure for {}", task.id)
    }
}

pub fn failing_registry() -> Arc<HandlerRegistry<DemoKind>> {
    Arc::new(
        HandlerRegistry::builder()
            .register(DemoKind::SendEmail, AlwaysFail)
            .register(DemoKind::ProcessAnalytics, AlwaysFail)
            .build()
            .expect("every kind has a handler"),
    )
}

/// Handler that panics every time.
pub struct AlwaysPanic;

#[async_trait]
impl TaskHandler for AlwaysPanic {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        panic!("simulated panic for {}", task.id)
    }
}
