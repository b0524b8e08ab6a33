//! Coordination store access.
//!
//! Every cross-process invariant in Tollgate (prune+count+add+expire for the
//! limiter, pending→processing→{pending|failed} for the queue) is expressed as
//! one [`Transaction`] against a [`CoordinationStore`]. The store is the only
//! synchronization point between workers; no in-process lock coordinates them.
//!
//! Two backends ship with the crate:
//! - [`RedisStore`] for shared deployments (`MULTI/EXEC` pipelines, one Lua
//!   script for guarded transactions, `BLPOP` for blocking waits)
//! - [`MemoryStore`] for tests and single-process use

mod memory;
mod redis_store;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Upper bound on queued wake-up tokens per signal key.
pub const SIGNAL_BACKLOG: usize = 1024;

/// Errors raised by a coordination store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("wrong value type held at key '{key}'")]
    WrongType { key: String },

    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
}

impl StoreError {
    /// Transient infrastructure failure (connection refused, dropped, timed out).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One end of a sorted-set score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    PosInf,
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    pub(crate) fn as_arg(&self) -> String {
        match self {
            ScoreBound::NegInf => "-inf".to_string(),
            ScoreBound::PosInf => "+inf".to_string(),
            ScoreBound::Inclusive(v) => v.to_string(),
            ScoreBound::Exclusive(v) => format!("({v}"),
        }
    }

    /// Whether `score` lies above this bound when used as a range minimum.
    pub(crate) fn admits_as_min(&self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Inclusive(v) => score >= *v,
            ScoreBound::Exclusive(v) => score > *v,
        }
    }

    /// Whether `score` lies below this bound when used as a range maximum.
    pub(crate) fn admits_as_max(&self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Inclusive(v) => score <= *v,
            ScoreBound::Exclusive(v) => score < *v,
        }
    }
}

/// A single write or read executed inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String, ttl: Option<Duration> },
    Delete { key: String },
    Expire { key: String, ttl: Duration },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
    ZRemRangeByScore { key: String, min: ScoreBound, max: ScoreBound },
    ZCard { key: String },
    HSet { key: String, field: String, value: String },
    HGet { key: String, field: String },
    HDel { key: String, field: String },
    HLen { key: String },
    /// Deposit one wake-up token for [`CoordinationStore::wait_for_signal`].
    Notify { key: String },
    /// Drop wake-up tokens at `key` beyond the member count of the sorted set
    /// `pending`, so waiters are never woken for work that is already gone.
    ClampSignal { key: String, pending: String },
}

/// Reply to one [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Text(String),
}

impl Reply {
    pub fn as_int(&self) -> StoreResult<i64> {
        match self {
            Reply::Int(n) => Ok(*n),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected integer, got {other:?}"
            ))),
        }
    }

    pub fn into_text(self) -> StoreResult<Option<String>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Text(text) => Ok(Some(text)),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected text, got {other:?}"
            ))),
        }
    }
}

/// Precondition checked atomically with a transaction's commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Hash field holds exactly `value`.
    FieldEquals { key: String, field: String, value: String },
    /// Hash field is present.
    FieldExists { key: String, field: String },
    /// Sorted-set member is present.
    MemberExists { key: String, member: String },
    /// Sorted-set member is present with a score no greater than `max`.
    ScoreAtMost { key: String, member: String, max: f64 },
}

/// Commands applied with all-or-nothing visibility, optionally behind guards.
///
/// When any guard fails nothing is applied and
/// [`CoordinationStore::execute`] returns `Ok(None)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    guards: Vec<Guard>,
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn push(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn get(self, key: impl Into<String>) -> Self {
        self.push(Command::Get { key: key.into() })
    }

    pub fn set(
        self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        })
    }

    pub fn delete(self, key: impl Into<String>) -> Self {
        self.push(Command::Delete { key: key.into() })
    }

    pub fn expire(self, key: impl Into<String>, ttl: Duration) -> Self {
        self.push(Command::Expire {
            key: key.into(),
            ttl,
        })
    }

    pub fn zadd(
        self,
        key: impl Into<String>,
        member: impl Into<String>,
        score: f64,
    ) -> Self {
        self.push(Command::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        })
    }

    pub fn zrem(self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.push(Command::ZRem {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn zrem_range_by_score(
        self,
        key: impl Into<String>,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Self {
        self.push(Command::ZRemRangeByScore {
            key: key.into(),
            min,
            max,
        })
    }

    pub fn zcard(self, key: impl Into<String>) -> Self {
        self.push(Command::ZCard { key: key.into() })
    }

    pub fn hset(
        self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.push(Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn hget(self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.push(Command::HGet {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn hdel(self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.push(Command::HDel {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn hlen(self, key: impl Into<String>) -> Self {
        self.push(Command::HLen { key: key.into() })
    }

    pub fn notify(self, key: impl Into<String>) -> Self {
        self.push(Command::Notify { key: key.into() })
    }

    pub fn clamp_signal(self, key: impl Into<String>, pending: impl Into<String>) -> Self {
        self.push(Command::ClampSignal {
            key: key.into(),
            pending: pending.into(),
        })
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_guarded(&self) -> bool {
        !self.guards.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Operation contract Tollgate needs from a shared key-value store.
///
/// Implementations must make [`execute`](Self::execute) atomic with respect to
/// every other caller of the same store, and
/// [`wait_for_signal`](Self::wait_for_signal) must block without polling.
#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    /// Run a transaction. `Ok(None)` means a guard failed and nothing was applied.
    async fn execute(&self, tx: Transaction) -> StoreResult<Option<Vec<Reply>>>;

    /// Enumerate keys matching a glob pattern (`*`, `?`).
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Members with scores in ascending order.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Members with scores in descending order.
    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: ScoreBound,
        min: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>>;

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>>;

    /// Block until a token deposited by [`Command::Notify`] can be taken.
    /// Returns `false` when the timeout elapsed first.
    async fn wait_for_signal(&self, key: &str, timeout: Duration) -> StoreResult<bool>;

    /// Run one unguarded command and return its reply.
    async fn run(&self, command: Command) -> StoreResult<Reply> {
        self.execute(Transaction::new().push(command))
            .await?
            .and_then(|mut replies| replies.pop())
            .ok_or_else(|| {
                StoreError::UnexpectedReply("missing reply for single command".into())
            })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run(Command::Get { key: key.into() }).await?.into_text()
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.run(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        })
        .await
        .map(|_| ())
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let removed = self.run(Command::Delete { key: key.into() }).await?.as_int()?;
        Ok(removed.max(0) as u64)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let added = self
            .run(Command::ZAdd {
                key: key.into(),
                member: member.into(),
                score,
            })
            .await?
            .as_int()?;
        Ok(added > 0)
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> StoreResult<u64> {
        let removed = self
            .run(Command::ZRemRangeByScore {
                key: key.into(),
                min,
                max,
            })
            .await?
            .as_int()?;
        Ok(removed.max(0) as u64)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let count = self.run(Command::ZCard { key: key.into() }).await?.as_int()?;
        Ok(count.max(0) as u64)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let created = self
            .run(Command::HSet {
                key: key.into(),
                field: field.into(),
                value: value.into(),
            })
            .await?
            .as_int()?;
        Ok(created > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.run(Command::HGet {
            key: key.into(),
            field: field.into(),
        })
        .await?
        .into_text()
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let removed = self
            .run(Command::HDel {
                key: key.into(),
                field: field.into(),
            })
            .await?
            .as_int()?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        let len = self.run(Command::HLen { key: key.into() }).await?.as_int()?;
        Ok(len.max(0) as u64)
    }
}
