use uuid::Uuid;

/// Root prefix for every queue key.
pub const QUEUE_PREFIX: &str = "queue";

/// Key holding one identifier's sliding window.
pub fn limiter_key(prefix: &str, identifier: &str) -> String {
    format!("{prefix}:{identifier}")
}

/// Glob matching every window under a limiter prefix.
pub fn limiter_pattern(prefix: &str) -> String {
    format!("{prefix}:*")
}

/// Keys backing one named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    name: String,
    pending: String,
    processing: String,
    failed: String,
    leases: String,
    signal: String,
}

impl QueueKeys {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let base = format!("{QUEUE_PREFIX}:{name}");
        Self {
            processing: format!("{base}:processing"),
            failed: format!("{base}:failed"),
            leases: format!("{base}:leases"),
            signal: format!("{base}:signal"),
            pending: base,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sorted set of serialized tasks scored by priority.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Hash of task id to serialized task for claimed work.
    pub fn processing(&self) -> &str {
        &self.processing
    }

    /// Hash of task id to serialized task for terminal failures.
    pub fn failed(&self) -> &str {
        &self.failed
    }

    /// Sorted set of task id to lease deadline (unix seconds).
    pub fn leases(&self) -> &str {
        &self.leases
    }

    pub fn signal(&self) -> &str {
        &self.signal
    }

    pub fn worker(&self, worker_id: &Uuid) -> String {
        format!("{}:workers:{worker_id}", self.pending)
    }

    pub fn worker_pattern(&self) -> String {
        format!("{}:workers:*", self.pending)
    }
}
