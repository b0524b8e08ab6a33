use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use tollgate_model::Task;

use crate::error::{Result, TollgateError};

/// Closed set of task types a deployment knows how to run.
///
/// Implemented by a plain enum; [`HandlerRegistry::builder`] refuses to build
/// until every variant listed in [`ALL`](Self::ALL) has a handler.
pub trait TaskKind: Copy + Eq + Hash + Send + Sync + fmt::Debug + 'static {
    const ALL: &'static [Self];

    /// Wire name stored in the payload's `type` field.
    fn as_str(&self) -> &'static str;

    fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == value)
    }
}

/// Executes one task. Errors are recorded on the task and trigger a retry.
///
/// Delivery is at-least-once, so handlers should be idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        (self)(task.clone()).await
    }
}

/// Dispatch table from task kind to handler, complete by construction.
pub struct HandlerRegistry<K: TaskKind> {
    handlers: HashMap<K, Arc<dyn TaskHandler>>,
}

impl<K: TaskKind> fmt::Debug for HandlerRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(|kind| kind.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl<K: TaskKind> HandlerRegistry<K> {
    pub fn builder() -> HandlerRegistryBuilder<K> {
        HandlerRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Resolve a payload's declared type to its kind and handler.
    pub fn route(&self, task_type: &str) -> Option<(K, Arc<dyn TaskHandler>)> {
        let kind = K::parse(task_type)?;
        self.handlers
            .get(&kind)
            .map(|handler| (kind, Arc::clone(handler)))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects handlers for [`HandlerRegistry`].
pub struct HandlerRegistryBuilder<K: TaskKind> {
    handlers: HashMap<K, Arc<dyn TaskHandler>>,
}

impl<K: TaskKind> fmt::Debug for HandlerRegistryBuilder<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistryBuilder")
            .field("registered", &self.handlers.len())
            .finish()
    }
}

impl<K: TaskKind> HandlerRegistryBuilder<K> {
    /// Register (or replace) the handler for `kind`.
    pub fn register(mut self, kind: K, handler: impl TaskHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<HandlerRegistry<K>> {
        let missing: Vec<&str> = K::ALL
            .iter()
            .filter(|kind| !self.handlers.contains_key(*kind))
            .map(|kind| kind.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(TollgateError::InvalidConfig(format!(
                "no handler registered for task kinds: {}",
                missing.join(", ")
            )));
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
