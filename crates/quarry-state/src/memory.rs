//! In-process [`StateStore`] implementation.
//!
//! Mirrors the semantics of the Redis commands the gateway relies on closely
//! enough to serve as the test double for every state-backed component, and
//! as the store for single-process deployments. Expiry is measured on the
//! tokio clock so paused-time tests can advance past TTLs deterministically.
//!
//! Failure injection: [`MemoryStateStore::set_available`] makes every
//! subsequent call fail with [`StateError::Unavailable`], which is how the
//! fail-open and fail-soft paths are exercised.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{Result, StateError};
use crate::store::{Command, Reply, ScoreBound, StateStore};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::ZSet(_) => "sorted set",
            Value::List(_) => "list",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::ZSet(z) => z.is_empty(),
            Value::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at <= now)
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
        }
    }

    fn zset(&mut self, key: &str, now: Instant) -> Result<Option<&mut HashMap<String, f64>>> {
        self.purge_if_expired(key, now);
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(other) => Err(wrong_type(key, "sorted set", &other.value)),
        }
    }

    fn zset_or_create(&mut self, key: &str, now: Instant) -> Result<&mut HashMap<String, f64>> {
        self.purge_if_expired(key, now);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::ZSet(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::ZSet(z) => Ok(z),
            other => Err(wrong_type(key, "sorted set", other)),
        }
    }

    fn list(&mut self, key: &str, now: Instant) -> Result<Option<&mut VecDeque<String>>> {
        self.purge_if_expired(key, now);
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(Some(l)),
            Some(other) => Err(wrong_type(key, "list", &other.value)),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).map(|e| e.value.is_empty()).unwrap_or(false) {
            self.entries.remove(key);
        }
    }

    fn apply(&mut self, command: Command, now: Instant) -> Result<Reply> {
        match command {
            Command::ZRemRangeByScore { key, min, max } => {
                let removed = match self.zset(&key, now)? {
                    Some(z) => {
                        let before = z.len();
                        z.retain(|_, score| !in_range(*score, &min, &max));
                        (before - z.len()) as i64
                    }
                    None => 0,
                };
                self.drop_if_empty(&key);
                Ok(Reply::Int(removed))
            }
            Command::ZAdd { key, member, score } => {
                let z = self.zset_or_create(&key, now)?;
                let added = z.insert(member, score).is_none();
                Ok(Reply::Int(added as i64))
            }
            Command::ZCount { key, min, max } => {
                let count = self
                    .zset(&key, now)?
                    .map(|z| z.values().filter(|s| in_range(**s, &min, &max)).count())
                    .unwrap_or(0);
                Ok(Reply::Int(count as i64))
            }
            Command::ZIncrBy { key, member, delta } => {
                let z = self.zset_or_create(&key, now)?;
                let score = z.entry(member).or_insert(0.0);
                *score += delta;
                Ok(Reply::Float(*score))
            }
            Command::ZRem { key, member } => {
                let removed = match self.zset(&key, now)? {
                    Some(z) => z.remove(&member).is_some() as i64,
                    None => 0,
                };
                self.drop_if_empty(&key);
                Ok(Reply::Int(removed))
            }
            Command::ZRangeByScore { key, min, max } => {
                let mut members: Vec<(String, f64)> = self
                    .zset(&key, now)?
                    .map(|z| {
                        z.iter()
                            .filter(|(_, s)| in_range(**s, &min, &max))
                            .map(|(m, s)| (m.clone(), *s))
                            .collect()
                    })
                    .unwrap_or_default();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(Reply::Members(members.into_iter().map(|(m, _)| m).collect()))
            }
            Command::Get { key } => {
                self.purge_if_expired(&key, now);
                match self.entries.get(&key) {
                    None => Ok(Reply::Nil),
                    Some(Entry {
                        value: Value::Str(s),
                        ..
                    }) => Ok(Reply::Str(s.clone())),
                    Some(other) => Err(wrong_type(&key, "string", &other.value)),
                }
            }
            Command::Set { key, value, ttl } => {
                self.entries.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at: ttl.map(|t| now + t),
                    },
                );
                Ok(Reply::Ok)
            }
            Command::Del { key } => {
                self.purge_if_expired(&key, now);
                Ok(Reply::Int(self.entries.remove(&key).is_some() as i64))
            }
            Command::Expire { key, ttl } => {
                self.purge_if_expired(&key, now);
                match self.entries.get_mut(&key) {
                    Some(entry) => {
                        entry.expires_at = Some(now + ttl);
                        Ok(Reply::Int(1))
                    }
                    None => Ok(Reply::Int(0)),
                }
            }
            Command::LPush { key, value } => {
                self.purge_if_expired(&key, now);
                let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::List(l) => {
                        l.push_front(value);
                        Ok(Reply::Int(l.len() as i64))
                    }
                    other => Err(wrong_type(&key, "list", other)),
                }
            }
            Command::LTrim { key, start, stop } => {
                if let Some(l) = self.list(&key, now)? {
                    match list_range(l.len(), start, stop) {
                        Some((from, to)) => {
                            l.truncate(to + 1);
                            l.drain(..from);
                        }
                        None => l.clear(),
                    }
                }
                self.drop_if_empty(&key);
                Ok(Reply::Ok)
            }
            Command::LRange { key, start, stop } => {
                let members = match self.list(&key, now)? {
                    Some(l) => match list_range(l.len(), start, stop) {
                        Some((from, to)) => l.range(from..=to).cloned().collect(),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                };
                Ok(Reply::Members(members))
            }
        }
    }
}

fn in_range(score: f64, min: &ScoreBound, max: &ScoreBound) -> bool {
    min.admits_from_below(score) && max.admits_from_above(score)
}

fn wrong_type(key: &str, expected: &'static str, found: &Value) -> StateError {
    tracing::debug!(key = %key, found = found.type_name(), "wrong type for key");
    StateError::WrongType {
        key: key.to_string(),
        expected,
    }
}

/// Resolve Redis-style list indices to an inclusive `(from, to)` range.
fn list_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn command_key(command: &Command) -> &str {
    match command {
        Command::ZRemRangeByScore { key, .. }
        | Command::ZAdd { key, .. }
        | Command::ZCount { key, .. }
        | Command::ZIncrBy { key, .. }
        | Command::ZRem { key, .. }
        | Command::ZRangeByScore { key, .. }
        | Command::Get { key }
        | Command::Set { key, .. }
        | Command::Del { key }
        | Command::Expire { key, .. }
        | Command::LPush { key, .. }
        | Command::LTrim { key, .. }
        | Command::LRange { key, .. } => key,
    }
}

/// In-memory state store with failure injection.
#[derive(Debug)]
pub struct MemoryStateStore {
    keyspace: Mutex<Keyspace>,
    available: AtomicBool,
    executions: AtomicU64,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            available: AtomicBool::new(true),
            executions: AtomicU64::new(0),
        }
    }

    /// Simulate the backend going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of successful round trips served so far.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Number of live (non-expired) keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        match self.keyspace.lock() {
            Ok(ks) => ks
                .entries
                .values()
                .filter(|e| e.expires_at.map(|at| at > now).unwrap_or(true))
                .count(),
            Err(poisoned) => poisoned.into_inner().entries.len(),
        }
    }

    /// Remaining time to live of a key, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let ks = self.keyspace.lock().ok()?;
        let at = ks.entries.get(key)?.expires_at?;
        at.checked_duration_since(now)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        if !self.is_available() {
            return Err(StateError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }

        let now = Instant::now();
        let mut ks = self
            .keyspace
            .lock()
            .map_err(|_| StateError::Unavailable("keyspace lock poisoned".to_string()))?;

        // Snapshot touched keys so a failed command leaves the batch unapplied.
        let touched: HashSet<String> = commands.iter().map(|c| command_key(c).to_string()).collect();
        let snapshot: Vec<(String, Option<Entry>)> = touched
            .into_iter()
            .map(|k| {
                let entry = ks.entries.get(&k).cloned();
                (k, entry)
            })
            .collect();

        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            match ks.apply(command, now) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    for (key, entry) in snapshot {
                        match entry {
                            Some(entry) => ks.entries.insert(key, entry),
                            None => ks.entries.remove(&key),
                        };
                    }
                    return Err(e);
                }
            }
        }

        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(replies)
    }
}
