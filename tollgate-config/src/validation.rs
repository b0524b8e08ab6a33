use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::models::TollgateConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("queue name must not be empty")]
    EmptyQueueName,
    #[error("queue default_max_attempts must be at least 1")]
    ZeroMaxAttempts,
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("rate limiter name must not be empty")]
    EmptyLimiterName,
    #[error("rate limiter '{name}' must admit at least one request")]
    ZeroRate { name: String },
    #[error("rate limiter '{name}' needs a non-zero window")]
    ZeroWindow { name: String },
    #[error("rate limiter '{name}' is defined more than once")]
    DuplicateLimiter { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hint {
            Some(hint) => write!(f, "{} ({hint})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(&mut self, message: impl Into<String>, hint: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Reject configurations the runtime cannot honour and flag risky ones.
pub fn apply_guard_rails(
    config: &TollgateConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.queue.name.trim().is_empty() {
        return Err(ConfigGuardRailError::EmptyQueueName);
    }
    if config.queue.default_max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroMaxAttempts);
    }
    require_non_zero("queue.lease_timeout", config.queue.lease_timeout)?;
    require_non_zero("worker.poll_interval", config.worker.poll_interval)?;
    require_non_zero("worker.heartbeat_ttl", config.worker.heartbeat_ttl)?;
    require_non_zero("reaper.interval", config.reaper.interval)?;
    if let Some(renewal) = config.worker.lease_renewal {
        require_non_zero("worker.lease_renewal", renewal)?;
        if renewal >= config.queue.lease_timeout {
            warnings.push_with_hint(
                "worker.lease_renewal is not shorter than queue.lease_timeout",
                "leases may expire between renewals; use a third of the timeout",
            );
        }
    }

    let mut seen = HashSet::new();
    for limiter in &config.rate_limiters {
        if limiter.name.trim().is_empty() {
            return Err(ConfigGuardRailError::EmptyLimiterName);
        }
        if limiter.rate == 0 {
            return Err(ConfigGuardRailError::ZeroRate {
                name: limiter.name.clone(),
            });
        }
        if limiter.per.is_zero() {
            return Err(ConfigGuardRailError::ZeroWindow {
                name: limiter.name.clone(),
            });
        }
        if !seen.insert(limiter.name.as_str()) {
            return Err(ConfigGuardRailError::DuplicateLimiter {
                name: limiter.name.clone(),
            });
        }
    }

    if config.redis.is_none() {
        warnings.push_with_hint(
            "No Redis URL configured; using the in-process store",
            "set TOLLGATE_REDIS_URL or [redis] url to share state across processes",
        );
    }

    Ok(warnings)
}

fn require_non_zero(field: &'static str, value: Duration) -> Result<(), ConfigGuardRailError> {
    if value.is_zero() {
        Err(ConfigGuardRailError::ZeroDuration { field })
    } else {
        Ok(())
    }
}
