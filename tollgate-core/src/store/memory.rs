//! In-process coordination store.
//!
//! Every operation runs under a single async mutex, so transactions are
//! trivially atomic. Clones share the same state, mirroring how a cloned
//! connection manager talks to the same server.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{
    Command, CoordinationStore, Guard, Reply, SIGNAL_BACKLOG, ScoreBound,
    StoreError, StoreResult, Transaction,
};

#[derive(Debug)]
enum Value {
    Text(String),
    SortedSet(HashMap<String, f64>),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Text(_) => false,
            Value::SortedSet(set) => set.is_empty(),
            Value::Hash(hash) => hash.is_empty(),
            Value::List(list) => list.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<String, Slot>,
}

impl State {
    /// Drop the key if its expiry has passed.
    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        let expired = self
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.slots.remove(key);
        }
    }

    fn value(&mut self, key: &str, now: Instant) -> Option<&mut Value> {
        self.purge_if_expired(key, now);
        self.slots.get_mut(key).map(|slot| &mut slot.value)
    }

    fn sorted_set(
        &mut self,
        key: &str,
        now: Instant,
    ) -> StoreResult<Option<&mut HashMap<String, f64>>> {
        match self.value(key, now) {
            None => Ok(None),
            Some(Value::SortedSet(set)) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash(
        &mut self,
        key: &str,
        now: Instant,
    ) -> StoreResult<Option<&mut HashMap<String, String>>> {
        match self.value(key, now) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted_set_or_insert(
        &mut self,
        key: &str,
        now: Instant,
    ) -> StoreResult<&mut HashMap<String, f64>> {
        self.purge_if_expired(key, now);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::SortedSet(HashMap::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::SortedSet(set) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    fn hash_or_insert(
        &mut self,
        key: &str,
        now: Instant,
    ) -> StoreResult<&mut HashMap<String, String>> {
        self.purge_if_expired(key, now);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Hash(hash) => Ok(hash),
            _ => Err(wrong_type(key)),
        }
    }

    fn list_or_insert(
        &mut self,
        key: &str,
        now: Instant,
    ) -> StoreResult<&mut VecDeque<String>> {
        self.purge_if_expired(key, now);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::List(list) => Ok(list),
            _ => Err(wrong_type(key)),
        }
    }

    /// Remove container keys that became empty, as the server does.
    fn drop_if_empty(&mut self, key: &str) {
        if self.slots.get(key).is_some_and(|slot| slot.value.is_empty()) {
            self.slots.remove(key);
        }
    }

    fn guard_holds(&mut self, guard: &Guard, now: Instant) -> StoreResult<bool> {
        Ok(match guard {
            Guard::FieldEquals { key, field, value } => self
                .hash(key, now)?
                .and_then(|hash| hash.get(field))
                .is_some_and(|current| current == value),
            Guard::FieldExists { key, field } => self
                .hash(key, now)?
                .is_some_and(|hash| hash.contains_key(field)),
            Guard::MemberExists { key, member } => self
                .sorted_set(key, now)?
                .is_some_and(|set| set.contains_key(member)),
            Guard::ScoreAtMost { key, member, max } => self
                .sorted_set(key, now)?
                .and_then(|set| set.get(member))
                .is_some_and(|score| *score <= *max),
        })
    }

    /// Reject a transaction up front if any command targets a key of the wrong type.
    fn check_types(&mut self, command: &Command, now: Instant) -> StoreResult<()> {
        let (key, expected) = match command {
            Command::ClampSignal { key, pending } => {
                self.expect_kind(pending, Kind::SortedSet, now)?;
                (key, Kind::List)
            }
            Command::Get { key } => (key, Kind::Text),
            Command::Set { .. } | Command::Delete { .. } | Command::Expire { .. } => {
                return Ok(());
            }
            Command::ZAdd { key, .. }
            | Command::ZRem { key, .. }
            | Command::ZRemRangeByScore { key, .. }
            | Command::ZCard { key } => (key, Kind::SortedSet),
            Command::HSet { key, .. }
            | Command::HGet { key, .. }
            | Command::HDel { key, .. }
            | Command::HLen { key } => (key, Kind::Hash),
            Command::Notify { key } => (key, Kind::List),
        };
        self.expect_kind(key, expected, now)
    }

    fn expect_kind(&mut self, key: &str, expected: Kind, now: Instant) -> StoreResult<()> {
        let matches = match self.value(key, now) {
            None => true,
            Some(Value::Text(_)) => expected == Kind::Text,
            Some(Value::SortedSet(_)) => expected == Kind::SortedSet,
            Some(Value::Hash(_)) => expected == Kind::Hash,
            Some(Value::List(_)) => expected == Kind::List,
        };
        if matches { Ok(()) } else { Err(wrong_type(key)) }
    }

    fn apply(&mut self, command: &Command, now: Instant) -> StoreResult<Reply> {
        match command {
            Command::Get { key } => match self.value(key, now) {
                None => Ok(Reply::Nil),
                Some(Value::Text(text)) => Ok(Reply::Text(text.clone())),
                Some(_) => Err(wrong_type(key)),
            },
            Command::Set { key, value, ttl } => {
                self.slots.insert(
                    key.clone(),
                    Slot {
                        value: Value::Text(value.clone()),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
                Ok(Reply::Ok)
            }
            Command::Delete { key } => {
                self.purge_if_expired(key, now);
                Ok(Reply::Int(i64::from(self.slots.remove(key).is_some())))
            }
            Command::Expire { key, ttl } => {
                self.purge_if_expired(key, now);
                match self.slots.get_mut(key) {
                    Some(slot) => {
                        slot.expires_at = Some(now + *ttl);
                        Ok(Reply::Int(1))
                    }
                    None => Ok(Reply::Int(0)),
                }
            }
            Command::ZAdd { key, member, score } => {
                let set = self.sorted_set_or_insert(key, now)?;
                let added = set.insert(member.clone(), *score).is_none();
                Ok(Reply::Int(i64::from(added)))
            }
            Command::ZRem { key, member } => {
                let removed = match self.sorted_set(key, now)? {
                    Some(set) => set.remove(member).is_some(),
                    None => false,
                };
                self.drop_if_empty(key);
                Ok(Reply::Int(i64::from(removed)))
            }
            Command::ZRemRangeByScore { key, min, max } => {
                let removed = match self.sorted_set(key, now)? {
                    Some(set) => {
                        let before = set.len();
                        set.retain(|_, score| {
                            !(min.admits_as_min(*score) && max.admits_as_max(*score))
                        });
                        before - set.len()
                    }
                    None => 0,
                };
                self.drop_if_empty(key);
                Ok(Reply::Int(removed as i64))
            }
            Command::ZCard { key } => Ok(Reply::Int(
                self.sorted_set(key, now)?.map_or(0, |set| set.len()) as i64,
            )),
            Command::HSet { key, field, value } => {
                let hash = self.hash_or_insert(key, now)?;
                let created = hash.insert(field.clone(), value.clone()).is_none();
                Ok(Reply::Int(i64::from(created)))
            }
            Command::HGet { key, field } => Ok(self
                .hash(key, now)?
                .and_then(|hash| hash.get(field).cloned())
                .map_or(Reply::Nil, Reply::Text)),
            Command::HDel { key, field } => {
                let removed = match self.hash(key, now)? {
                    Some(hash) => hash.remove(field).is_some(),
                    None => false,
                };
                self.drop_if_empty(key);
                Ok(Reply::Int(i64::from(removed)))
            }
            Command::HLen { key } => Ok(Reply::Int(
                self.hash(key, now)?.map_or(0, |hash| hash.len()) as i64,
            )),
            Command::Notify { key } => {
                let list = self.list_or_insert(key, now)?;
                list.push_back("1".to_string());
                while list.len() > SIGNAL_BACKLOG {
                    list.pop_front();
                }
                Ok(Reply::Int(list.len() as i64))
            }
            Command::ClampSignal { key, pending } => {
                let allowed = self.sorted_set(pending, now)?.map_or(0, |set| set.len());
                let left = match self.value(key, now) {
                    None => 0,
                    Some(Value::List(list)) => {
                        list.truncate(allowed);
                        list.len()
                    }
                    Some(_) => return Err(wrong_type(key)),
                };
                self.drop_if_empty(key);
                Ok(Reply::Int(left as i64))
            }
        }
    }

    fn take_token(&mut self, key: &str, now: Instant) -> StoreResult<bool> {
        let taken = match self.value(key, now) {
            None => false,
            Some(Value::List(list)) => list.pop_front().is_some(),
            Some(_) => return Err(wrong_type(key)),
        };
        self.drop_if_empty(key);
        Ok(taken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    SortedSet,
    Hash,
    List,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

/// Translate a glob pattern (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> StoreResult<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$"))
        .map_err(|e| StoreError::Command(format!("invalid key pattern '{pattern}': {e}")))
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    signals: DashMap<String, Arc<Notify>>,
    offline: AtomicBool,
}

/// Coordination store held entirely in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("offline", &self.inner.offline.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the store. While offline every
    /// operation fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        debug!(offline, "memory store availability changed");
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.is_offline() {
            Err(StoreError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn signal(&self, key: &str) -> Arc<Notify> {
        self.inner
            .signals
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    async fn range(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<usize>,
        descending: bool,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.ensure_online()?;
        let mut state = self.inner.state.lock().await;
        let now = Instant::now();
        let Some(set) = state.sorted_set(key, now)? else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(String, f64)> = set
            .iter()
            .filter(|(_, score)| min.admits_as_min(**score) && max.admits_as_max(**score))
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        // Equal scores order lexicographically by member, as on the server.
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        if descending {
            members.reverse();
        }
        if let Some(limit) = limit {
            members.truncate(limit);
        }
        Ok(members)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn execute(&self, tx: Transaction) -> StoreResult<Option<Vec<Reply>>> {
        self.ensure_online()?;
        let mut notified = Vec::new();
        let replies = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();

            for guard in tx.guards() {
                if !state.guard_holds(guard, now)? {
                    return Ok(None);
                }
            }
            for command in tx.commands() {
                state.check_types(command, now)?;
            }

            let mut replies = Vec::with_capacity(tx.len());
            for command in tx.commands() {
                replies.push(state.apply(command, now)?);
                if let Command::Notify { key } = command {
                    notified.push(key.clone());
                }
            }
            replies
        };

        for key in notified {
            self.signal(&key).notify_one();
        }
        Ok(Some(replies))
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.ensure_online()?;
        let matcher = glob_to_regex(pattern)?;
        let state = self.inner.state.lock().await;
        let now = Instant::now();
        let mut keys: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.expires_at.is_none_or(|at| at > now))
            .map(|(key, _)| key)
            .filter(|key| matcher.is_match(key))
            .cloned()
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.range(key, min, max, limit, false).await
    }

    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: ScoreBound,
        min: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.range(key, min, max, limit, true).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        self.ensure_online()?;
        let mut state = self.inner.state.lock().await;
        let now = Instant::now();
        let mut fields: Vec<(String, String)> = state
            .hash(key, now)?
            .map(|hash| {
                hash.iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        fields.sort_unstable();
        Ok(fields)
    }

    async fn wait_for_signal(&self, key: &str, timeout: Duration) -> StoreResult<bool> {
        let deadline = Instant::now() + timeout;
        let notify = self.signal(key);
        loop {
            self.ensure_online()?;
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before looking at the list so a concurrent
            // notify cannot slip between the check and the wait.
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock().await;
                if state.take_token(key, Instant::now())? {
                    return Ok(true);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(false);
            }
        }
    }
}
