//! Shared atomic key-value / sorted-set store abstraction.
//!
//! Every component that touches shared state (admission control, consistency
//! flags, runtime config, the query log) talks to the store through
//! [`StateStore::execute`], which applies a whole list of [`Command`]s as one
//! atomic round trip. Callers build that list with a [`Pipeline`] so that
//! check-and-insert sequences never race against other processes.
//!
//! The command vocabulary is the small subset of a Redis-like store the
//! gateway needs: sorted sets for rate-limit windows and exclusion sets,
//! strings for flags and config, and lists for the query log.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, StateError};

/// One end of a sorted-set score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    /// Scores greater than or equal to (or less than or equal to) the value.
    Inclusive(f64),
    /// Scores strictly beyond the value.
    Exclusive(f64),
    NegInf,
    PosInf,
}

impl ScoreBound {
    /// Whether `score` satisfies this bound when used as the lower end.
    pub fn admits_from_below(&self, score: f64) -> bool {
        match *self {
            ScoreBound::Inclusive(v) => score >= v,
            ScoreBound::Exclusive(v) => score > v,
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
        }
    }

    /// Whether `score` satisfies this bound when used as the upper end.
    pub fn admits_from_above(&self, score: f64) -> bool {
        match *self {
            ScoreBound::Inclusive(v) => score <= v,
            ScoreBound::Exclusive(v) => score < v,
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
        }
    }
}

/// A single store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Remove sorted-set members whose score lies in `[min, max]`.
    ZRemRangeByScore {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
    },
    /// Add (or re-score) a sorted-set member.
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Count sorted-set members whose score lies in `[min, max]`.
    ZCount {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
    },
    /// Add `delta` to a member's score, creating it at `delta` if absent.
    ZIncrBy {
        key: String,
        member: String,
        delta: f64,
    },
    /// Remove a sorted-set member.
    ZRem { key: String, member: String },
    /// Members whose score lies in `[min, max]`, ordered by score.
    ZRangeByScore {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
    },
    Get { key: String },
    /// Set a string value, optionally expiring after `ttl`.
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del { key: String },
    /// Set a key's time to live. Replies `Int(1)` if the key existed.
    Expire { key: String, ttl: Duration },
    /// Push a value onto the head of a list.
    LPush { key: String, value: String },
    /// Keep only the list elements in `[start, stop]` (negative indices count from the tail).
    LTrim { key: String, start: i64, stop: i64 },
    /// List elements in `[start, stop]` (negative indices count from the tail).
    LRange { key: String, start: i64, stop: i64 },
}

/// The reply to a single [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Float(f64),
    Str(String),
    Members(Vec<String>),
}

impl Reply {
    /// Interpret the reply as an integer count.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Reply::Int(n) => Ok(*n),
            other => Err(StateError::InvalidValue(format!(
                "expected integer reply, got {:?}",
                other
            ))),
        }
    }

    /// Interpret the reply as an optional string (`Nil` maps to `None`).
    pub fn into_string(self) -> Result<Option<String>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Str(s) => Ok(Some(s)),
            other => Err(StateError::InvalidValue(format!(
                "expected string reply, got {:?}",
                other
            ))),
        }
    }

    /// Interpret the reply as a member list.
    pub fn into_members(self) -> Result<Vec<String>> {
        match self {
            Reply::Members(m) => Ok(m),
            Reply::Nil => Ok(Vec::new()),
            other => Err(StateError::InvalidValue(format!(
                "expected member list reply, got {:?}",
                other
            ))),
        }
    }
}

/// Shared atomic store capability.
///
/// Implementations must apply the whole command list atomically with respect
/// to other callers and return exactly one [`Reply`] per command, in order.
/// An unreachable backend is reported as [`StateError::Unavailable`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>>;
}

/// Builder for an atomic batch of commands.
///
/// ```ignore
/// let replies = Pipeline::new()
///     .zadd("bucket", "req-1", now + 60.0)
///     .zcount("bucket", ScoreBound::Exclusive(now), ScoreBound::PosInf)
///     .execute(store.as_ref())
///     .await?;
/// ```
#[derive(Debug, Default, Clone)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn zremrangebyscore(self, key: &str, min: ScoreBound, max: ScoreBound) -> Self {
        self.push(Command::ZRemRangeByScore {
            key: key.to_string(),
            min,
            max,
        })
    }

    pub fn zadd(self, key: &str, member: &str, score: f64) -> Self {
        self.push(Command::ZAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        })
    }

    pub fn zcount(self, key: &str, min: ScoreBound, max: ScoreBound) -> Self {
        self.push(Command::ZCount {
            key: key.to_string(),
            min,
            max,
        })
    }

    pub fn zincrby(self, key: &str, member: &str, delta: f64) -> Self {
        self.push(Command::ZIncrBy {
            key: key.to_string(),
            member: member.to_string(),
            delta,
        })
    }

    pub fn zrem(self, key: &str, member: &str) -> Self {
        self.push(Command::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    pub fn zrangebyscore(self, key: &str, min: ScoreBound, max: ScoreBound) -> Self {
        self.push(Command::ZRangeByScore {
            key: key.to_string(),
            min,
            max,
        })
    }

    pub fn get(self, key: &str) -> Self {
        self.push(Command::Get {
            key: key.to_string(),
        })
    }

    pub fn set(self, key: &str, value: &str, ttl: Option<Duration>) -> Self {
        self.push(Command::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        })
    }

    pub fn del(self, key: &str) -> Self {
        self.push(Command::Del {
            key: key.to_string(),
        })
    }

    pub fn expire(self, key: &str, ttl: Duration) -> Self {
        self.push(Command::Expire {
            key: key.to_string(),
            ttl,
        })
    }

    pub fn lpush(self, key: &str, value: &str) -> Self {
        self.push(Command::LPush {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn ltrim(self, key: &str, start: i64, stop: i64) -> Self {
        self.push(Command::LTrim {
            key: key.to_string(),
            start,
            stop,
        })
    }

    pub fn lrange(self, key: &str, start: i64, stop: i64) -> Self {
        self.push(Command::LRange {
            key: key.to_string(),
            start,
            stop,
        })
    }

    /// Execute the batch as a single atomic round trip.
    pub async fn execute(self, store: &dyn StateStore) -> Result<Vec<Reply>> {
        let expected = self.commands.len();
        let replies = store.execute(self.commands).await?;
        if replies.len() != expected {
            return Err(StateError::InvalidValue(format!(
                "expected {} replies, got {}",
                expected,
                replies.len()
            )));
        }
        Ok(replies)
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}
