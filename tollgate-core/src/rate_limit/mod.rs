//! Sliding-window rate limiting over the coordination store.
//!
//! Each identifier owns a sorted set at `<key_prefix>:<identifier>` whose
//! members are request timestamps. A check prunes entries older than the
//! window, counts what is left, records the current request and refreshes the
//! key's expiry, all in one transaction so concurrent callers on any number of
//! processes see a consistent count.
//!
//! Admission checks never fail. When the store errors the instance falls back
//! to its [`DegradedPolicy`].

mod local;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tollgate_model::{DegradedPolicy, RateLimitDecision, RateLimitRule};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{self, TimeProvider};
use crate::error::{Result, TollgateError};
use crate::keys;
use crate::store::{CoordinationStore, ScoreBound, StoreError, Transaction};

use local::LocalWindow;

/// One named sliding-window limiter.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CoordinationStore>,
    rule: RateLimitRule,
    local: LocalWindow,
    /// Set while the fallback window holds requests recorded during an outage.
    local_active: AtomicBool,
    clock: Arc<dyn TimeProvider>,
}

impl fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("rule", &self.rule)
            .finish()
    }
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>, rule: RateLimitRule) -> Self {
        Self {
            store,
            rule,
            local: LocalWindow::new(),
            local_active: AtomicBool::new(false),
            clock: clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    pub fn name(&self) -> &str {
        self.rule.name()
    }

    fn key(&self, identifier: &str) -> String {
        keys::limiter_key(&self.rule.key_prefix, identifier)
    }

    fn window_secs(&self) -> f64 {
        self.rule.per.as_secs_f64()
    }

    /// Whether the identifier may proceed. Every call is recorded.
    pub async fn allow(&self, identifier: &str) -> bool {
        self.check(identifier).await.allowed
    }

    /// Record one request and report the decision with its counters.
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        let now = self.clock.utc_now();
        match self.record(identifier, now).await {
            Ok(count) => {
                self.drop_local_after_recovery();
                let decision = RateLimitDecision::from_count(count, self.rule.rate);
                if !decision.allowed {
                    debug!(
                        limiter = %self.rule.key_prefix,
                        identifier,
                        current = count,
                        limit = self.rule.rate,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(err) => self.degraded_check(identifier, now, &err),
        }
    }

    async fn record(&self, identifier: &str, now: DateTime<Utc>) -> Result<u32> {
        let key = self.key(identifier);
        let now_secs = clock::unix_seconds(now);
        let member = format!("{}:{}", now.timestamp_micros(), Uuid::new_v4().simple());

        let tx = Transaction::new()
            .zrem_range_by_score(
                key.clone(),
                ScoreBound::NegInf,
                ScoreBound::Inclusive(now_secs - self.window_secs()),
            )
            .zcard(key.clone())
            .zadd(key.clone(), member, now_secs)
            .expire(key, self.rule.per);

        let replies = self.store.execute(tx).await?.ok_or_else(|| {
            TollgateError::Internal("unguarded window update was rejected".into())
        })?;
        window_count(replies.get(1))
    }

    fn degraded_check(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
        err: &TollgateError,
    ) -> RateLimitDecision {
        warn!(
            limiter = %self.rule.key_prefix,
            identifier,
            policy = self.rule.degraded.as_str(),
            error = %err,
            "Rate limiter store failure; applying degraded policy"
        );
        match self.rule.degraded {
            DegradedPolicy::Local => {
                self.local_active.store(true, Ordering::Relaxed);
                let count = self.local.record(
                    &self.key(identifier),
                    clock::unix_seconds(now),
                    self.rule.per,
                );
                RateLimitDecision {
                    degraded: true,
                    ..RateLimitDecision::from_count(count, self.rule.rate)
                }
            }
            DegradedPolicy::Bypass => RateLimitDecision::bypassed(self.rule.rate),
        }
    }

    /// The shared window is authoritative again once the store answers.
    fn drop_local_after_recovery(&self) {
        if self.local_active.swap(false, Ordering::Relaxed) {
            let dropped = self.local.clear();
            info!(
                limiter = %self.rule.key_prefix,
                dropped,
                "Coordination store reachable again; dropped fallback windows"
            );
        }
    }

    /// Slots left in the identifier's current window.
    pub async fn remaining(&self, identifier: &str) -> u32 {
        let now = self.clock.utc_now();
        let count = match self.count(identifier, now).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    limiter = %self.rule.key_prefix,
                    identifier,
                    error = %err,
                    "Rate limiter store failure while reading remaining"
                );
                match self.rule.degraded {
                    DegradedPolicy::Local => self.local.count(
                        &self.key(identifier),
                        clock::unix_seconds(now),
                        self.rule.per,
                    ),
                    DegradedPolicy::Bypass => 0,
                }
            }
        };
        self.rule.rate.saturating_sub(count)
    }

    async fn count(&self, identifier: &str, now: DateTime<Utc>) -> Result<u32> {
        let key = self.key(identifier);
        let tx = Transaction::new()
            .zrem_range_by_score(
                key.clone(),
                ScoreBound::NegInf,
                ScoreBound::Inclusive(clock::unix_seconds(now) - self.window_secs()),
            )
            .zcard(key);
        let replies = self.store.execute(tx).await?.ok_or_else(|| {
            TollgateError::Internal("unguarded window read was rejected".into())
        })?;
        window_count(replies.get(1))
    }

    /// When the oldest in-window request leaves the window, if there is one.
    pub async fn reset_time(&self, identifier: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.utc_now();
        let now_secs = clock::unix_seconds(now);
        let cutoff = now_secs - self.window_secs();

        let oldest = match self
            .store
            .zrange_by_score(
                &self.key(identifier),
                ScoreBound::Exclusive(cutoff),
                ScoreBound::PosInf,
                Some(1),
            )
            .await
        {
            Ok(entries) => entries.first().map(|(_, score)| *score),
            Err(err) => {
                warn!(
                    limiter = %self.rule.key_prefix,
                    identifier,
                    error = %err,
                    "Rate limiter store failure while reading reset time"
                );
                match self.rule.degraded {
                    DegradedPolicy::Local => {
                        self.local.oldest(&self.key(identifier), now_secs, self.rule.per)
                    }
                    DegradedPolicy::Bypass => None,
                }
            }
        };

        oldest.and_then(|score| clock::from_unix_seconds(score + self.window_secs()))
    }

    /// Forget one identifier's window. Returns whether anything was stored.
    pub async fn reset(&self, identifier: &str) -> Result<bool> {
        let key = self.key(identifier);
        let local = self.local.remove(&key);
        let removed = self.store.delete(&key).await?;
        info!(limiter = %self.rule.key_prefix, identifier, "Rate limit window reset");
        Ok(removed > 0 || local)
    }

    /// Forget every window under this limiter's prefix.
    pub async fn reset_all(&self) -> Result<u64> {
        self.local.clear();
        let keys = self
            .store
            .keys(&keys::limiter_pattern(&self.rule.key_prefix))
            .await?;

        let mut removed = 0;
        for key in keys {
            removed += self.store.delete(&key).await?;
        }
        info!(limiter = %self.rule.key_prefix, removed, "All rate limit windows reset");
        Ok(removed)
    }

    /// Drop idle in-process fallback windows.
    pub fn cleanup_local(&self) -> usize {
        self.local
            .cleanup(clock::unix_seconds(self.clock.utc_now()), self.rule.per)
    }
}

fn window_count(reply: Option<&crate::store::Reply>) -> Result<u32> {
    let reply = reply.ok_or_else(|| {
        StoreError::UnexpectedReply("window count reply missing".into())
    })?;
    let count = reply.as_int()?;
    Ok(u32::try_from(count.max(0)).unwrap_or(u32::MAX))
}

/// Independent limiters addressed by name.
#[derive(Debug, Default)]
pub struct RateLimiterSet {
    limiters: HashMap<String, SlidingWindowLimiter>,
}

impl RateLimiterSet {
    pub fn from_rules(
        store: Arc<dyn CoordinationStore>,
        rules: impl IntoIterator<Item = RateLimitRule>,
    ) -> Result<Self> {
        let mut limiters = HashMap::new();
        for rule in rules {
            if rule.rate == 0 || rule.per.is_zero() {
                return Err(TollgateError::InvalidConfig(format!(
                    "rate limiter '{}' needs a non-zero rate and window",
                    rule.name()
                )));
            }
            let name = rule.name().to_string();
            if limiters.contains_key(&name) {
                return Err(TollgateError::InvalidConfig(format!(
                    "duplicate rate limiter '{name}'"
                )));
            }
            limiters.insert(name, SlidingWindowLimiter::new(store.clone(), rule));
        }
        Ok(Self { limiters })
    }

    /// The built-in api_general, api_auth, api_expensive and global limiters.
    pub fn presets(store: Arc<dyn CoordinationStore>) -> Self {
        let limiters = RateLimitRule::presets()
            .into_iter()
            .map(|rule| {
                (
                    rule.name().to_string(),
                    SlidingWindowLimiter::new(store.clone(), rule),
                )
            })
            .collect();
        Self { limiters }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.limiters = self
            .limiters
            .into_iter()
            .map(|(name, limiter)| (name, limiter.with_clock(clock.clone())))
            .collect();
        self
    }

    pub fn get(&self, name: &str) -> Option<&SlidingWindowLimiter> {
        self.limiters.get(name)
    }

    /// Limiter names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limiters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlidingWindowLimiter> {
        self.limiters.values()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
