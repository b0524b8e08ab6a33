use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a limiter does when the coordination store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Keep limiting with a per-process sliding window (approximate but safe).
    #[default]
    Local,
    /// Admit every request until the store comes back (open but available).
    Bypass,
}

impl DegradedPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradedPolicy::Local => "local",
            DegradedPolicy::Bypass => "bypass",
        }
    }
}

/// Configuration for one named sliding-window limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Keyspace prefix; also the limiter's name.
    pub key_prefix: String,
    /// Maximum requests admitted per window.
    pub rate: u32,
    /// Window length.
    pub per: Duration,
    #[serde(default)]
    pub degraded: DegradedPolicy,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self::api_general()
    }
}

impl RateLimitRule {
    pub fn new(key_prefix: impl Into<String>, rate: u32, per: Duration) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            rate,
            per,
            degraded: DegradedPolicy::default(),
        }
    }

    pub fn with_degraded(mut self, degraded: DegradedPolicy) -> Self {
        self.degraded = degraded;
        self
    }

    pub fn name(&self) -> &str {
        &self.key_prefix
    }

    /// 100 requests per minute.
    pub fn api_general() -> Self {
        Self::new("api_general", 100, Duration::from_secs(60))
    }

    /// 5 auth attempts per 5 minutes.
    pub fn api_auth() -> Self {
        Self::new("api_auth", 5, Duration::from_secs(300))
    }

    /// 10 expensive operations per minute.
    pub fn api_expensive() -> Self {
        Self::new("api_expensive", 10, Duration::from_secs(60))
    }

    /// 1000 requests per minute across all callers.
    pub fn global() -> Self {
        Self::new("global", 1000, Duration::from_secs(60))
    }

    /// The built-in limiter set used when configuration names none.
    pub fn presets() -> Vec<Self> {
        vec![
            Self::api_general(),
            Self::api_auth(),
            Self::api_expensive(),
            Self::global(),
        ]
    }
}

/// Decision returned by a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests already in the window before this one was recorded.
    pub current_count: u32,
    pub limit: u32,
    /// Slots left after this request.
    pub remaining: u32,
    /// True when the store was unreachable and the degraded policy decided.
    pub degraded: bool,
}

impl RateLimitDecision {
    pub fn from_count(current_count: u32, limit: u32) -> Self {
        let allowed = current_count < limit;
        Self {
            allowed,
            current_count,
            limit,
            remaining: limit.saturating_sub(current_count.saturating_add(1)),
            degraded: false,
        }
    }

    pub fn bypassed(limit: u32) -> Self {
        Self {
            allowed: true,
            current_count: 0,
            limit,
            remaining: limit,
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_have_distinct_prefixes() {
        let presets = RateLimitRule::presets();
        let mut names: Vec<_> = presets.iter().map(|r| r.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), presets.len());
    }

    #[test]
    fn decision_from_count() {
        let under = RateLimitDecision::from_count(3, 5);
        assert!(under.allowed);
        assert_eq!(under.remaining, 1);

        let last = RateLimitDecision::from_count(4, 5);
        assert!(last.allowed);
        assert_eq!(last.remaining, 0);

        let over = RateLimitDecision::from_count(5, 5);
        assert!(!over.allowed);
        assert_eq!(over.remaining, 0);
    }

    #[test]
    fn degraded_policy_serializes_snake_case() {
        let json = serde_json::to_string(&DegradedPolicy::Bypass).unwrap();
        assert_eq!(json, "\"bypass\"");
    }
}
