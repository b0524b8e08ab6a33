//! # Tollgate Core
//!
//! Distributed rate limiting and a durable background task queue, both built
//! on a shared coordination store.
//!
//! ## Overview
//!
//! - **Coordination store**: [`store::CoordinationStore`] with a Redis backend
//!   for shared deployments and an in-process backend for tests
//! - **Rate limiting**: sliding-window admission control keyed by any
//!   identifier, with a per-instance degraded policy when the store is down
//! - **Task queue**: priority ordered, FIFO within a priority, leased claims,
//!   bounded retries and a failed map for terminal tasks
//! - **Workers**: handler dispatch checked at registration, cooperative stop,
//!   lease renewal while a handler runs
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tollgate_core::queue::{QueueSettings, TaskQueue};
//! use tollgate_core::rate_limit::SlidingWindowLimiter;
//! use tollgate_core::store::MemoryStore;
//! use tollgate_model::{RateLimitRule, TaskPayload};
//!
//! async fn example() -> tollgate_core::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let limiter = SlidingWindowLimiter::new(store.clone(), RateLimitRule::api_auth());
//!     if limiter.allow("user:42").await {
//!         let queue = TaskQueue::new(store, QueueSettings::named("emails"));
//!         queue.enqueue(TaskPayload::new("send_email").with("to", "a@b.c"), 0).await?;
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Wall-clock time source used for window scores and lease deadlines
pub mod clock;

/// Error types and error handling utilities
pub mod error;

/// Keyspace conventions shared by the limiter, queue and CLI
pub mod keys;

/// Task queue, leases and the lease reaper
pub mod queue;

/// Sliding-window rate limiting
pub mod rate_limit;

/// Coordination store trait and backends
pub mod store;

/// Task handlers, registry and the worker loop
pub mod worker;

pub use clock::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use error::{Result, TollgateError};
pub use queue::{Disposition, EnqueueRequest, LeaseReaper, QueueSettings, TaskQueue};
pub use rate_limit::{RateLimiterSet, SlidingWindowLimiter};
pub use store::{CoordinationStore, MemoryStore, RedisStore, StoreError};
pub use worker::{
    HandlerRegistry, TaskHandler, TaskKind, TaskOutcome, TaskWorker, WorkerConfig,
    WorkerHandle,
};
