//! Module: db::backend
//! Responsibility: the narrow command/pipeline contract the engine consumes.
//! Does not own: transport, wire protocol, or connection pooling.
//! Boundary: the only place the engine suspends; everything above issues
//! whole pipelines and inspects their ordered replies.

mod memory;
mod registry;

pub use memory::{BackendStats, MemoryBackend};
pub use registry::{ConnectionRegistry, ConnectionSpec};

use std::fmt;
use thiserror::Error as ThisError;

///
/// BackendError
///
/// Failure reported by a backend collaborator; propagated verbatim.
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum BackendError {
    #[error("command {command} failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },

    #[error("transaction aborted at command {index}: {message}")]
    Aborted { index: usize, message: String },

    #[error("connection failure: {0}")]
    Connection(String),

    #[error("unexpected reply: expected {expected}, found {found}")]
    UnexpectedReply {
        expected: &'static str,
        found: String,
    },

    #[error("pipeline returned {found} replies for {expected} commands")]
    ReplyCount { expected: usize, found: usize },
}

///
/// SetOp
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetOp {
    Inter,
    Union,
    Diff,
}

///
/// SetFamily
///
/// Plain sets are unordered; scored sets add range-ordered retrieval.
/// Scored algebra accepts plain-set inputs with an implicit score of 1.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetFamily {
    Plain,
    Scored,
}

///
/// Aggregate
/// Score combination for scored intersections and unions.
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Aggregate {
    #[default]
    Sum,
    Min,
    Max,
}

///
/// StoreCommand
/// Set algebra writing into `dest`. An empty result removes `dest`.
///

#[derive(Clone, Debug, PartialEq)]
pub struct StoreCommand {
    pub op: SetOp,
    pub family: SetFamily,
    pub dest: String,
    pub keys: Vec<String>,
    pub weights: Option<Vec<f64>>,
    pub aggregate: Aggregate,
}

///
/// SortBy
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SortBy {
    /// Sort members by their own value.
    Member,
    /// Keep source order.
    NoSort,
    /// Sort by an external key pattern (`prefix:*->field`).
    Pattern(String),
}

///
/// SortStore
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SortStore {
    pub key: String,
    /// Store into a plain set instead of a list.
    pub as_set: bool,
}

///
/// SortCommand
/// Sort/projection over a set, scored set, or list.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SortCommand {
    pub key: String,
    pub by: SortBy,
    /// Project each member through an external key pattern.
    pub get: Option<String>,
    pub descending: bool,
    pub alpha: bool,
    pub store: Option<SortStore>,
}

impl SortCommand {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            by: SortBy::Member,
            get: None,
            descending: false,
            alpha: false,
            store: None,
        }
    }
}

///
/// Command
///
/// One primitive store operation. Replies are documented per variant group.
///

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    // strings and counters: Text | Nil, Ok, Int
    Get { key: String },
    Set { key: String, value: String },
    IncrBy { key: String, delta: i64 },

    // hashes: Int (fields added), Text | Nil, Array, Array (flat pairs), Int (removed)
    HSet { key: String, pairs: Vec<(String, String)> },
    HGet { key: String, field: String },
    HMGet { key: String, fields: Vec<String> },
    HGetAll { key: String },
    HDel { key: String, fields: Vec<String> },

    // plain sets
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    SIsMember { key: String, member: String },
    SCard { key: String },
    SMembers { key: String },

    // scored sets
    ZAdd { key: String, entries: Vec<(f64, String)> },
    ZRem { key: String, members: Vec<String> },
    ZRank { key: String, member: String },
    ZScore { key: String, member: String },
    ZCard { key: String },
    ZRange {
        key: String,
        start: i64,
        stop: i64,
        reverse: bool,
    },

    // algebra: Int (cardinality of dest)
    Store(StoreCommand),

    // lists
    LRange { key: String, start: i64, stop: i64 },

    // keyspace
    Del { keys: Vec<String> },
    Exists { key: String },
    Expire { key: String, seconds: u64 },
    Ttl { key: String },
    Rename { from: String, to: String },
    Keys { pattern: String },
    DelPattern { pattern: String },

    // projection: Int when storing, otherwise Array
    Sort(SortCommand),
}

impl Command {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::IncrBy { .. } => "INCRBY",
            Self::HSet { .. } => "HSET",
            Self::HGet { .. } => "HGET",
            Self::HMGet { .. } => "HMGET",
            Self::HGetAll { .. } => "HGETALL",
            Self::HDel { .. } => "HDEL",
            Self::SAdd { .. } => "SADD",
            Self::SRem { .. } => "SREM",
            Self::SIsMember { .. } => "SISMEMBER",
            Self::SCard { .. } => "SCARD",
            Self::SMembers { .. } => "SMEMBERS",
            Self::ZAdd { .. } => "ZADD",
            Self::ZRem { .. } => "ZREM",
            Self::ZRank { .. } => "ZRANK",
            Self::ZScore { .. } => "ZSCORE",
            Self::ZCard { .. } => "ZCARD",
            Self::ZRange { .. } => "ZRANGE",
            Self::Store(cmd) => match (cmd.family, cmd.op) {
                (SetFamily::Plain, SetOp::Inter) => "SINTERSTORE",
                (SetFamily::Plain, SetOp::Union) => "SUNIONSTORE",
                (SetFamily::Plain, SetOp::Diff) => "SDIFFSTORE",
                (SetFamily::Scored, SetOp::Inter) => "ZINTERSTORE",
                (SetFamily::Scored, SetOp::Union) => "ZUNIONSTORE",
                (SetFamily::Scored, SetOp::Diff) => "ZDIFFSTORE",
            },
            Self::LRange { .. } => "LRANGE",
            Self::Del { .. } => "DEL",
            Self::Exists { .. } => "EXISTS",
            Self::Expire { .. } => "EXPIRE",
            Self::Ttl { .. } => "TTL",
            Self::Rename { .. } => "RENAME",
            Self::Keys { .. } => "KEYS",
            Self::DelPattern { .. } => "DELPATTERN",
            Self::Sort(_) => "SORT",
        }
    }

    /// Whether the command mutates the keyspace.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        match self {
            Self::Set { .. }
            | Self::IncrBy { .. }
            | Self::HSet { .. }
            | Self::HDel { .. }
            | Self::SAdd { .. }
            | Self::SRem { .. }
            | Self::ZAdd { .. }
            | Self::ZRem { .. }
            | Self::Store(_)
            | Self::Del { .. }
            | Self::Expire { .. }
            | Self::Rename { .. }
            | Self::DelPattern { .. } => true,
            Self::Sort(cmd) => cmd.store.is_some(),
            _ => false,
        }
    }
}

///
/// Reply
///

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<Self>),
    /// Per-command failure inside a batch pipeline.
    Error(String),
}

impl Reply {
    fn unexpected(&self, expected: &'static str) -> BackendError {
        match self {
            Self::Error(message) => BackendError::Command {
                command: expected,
                message: message.clone(),
            },
            other => BackendError::UnexpectedReply {
                expected,
                found: other.to_string(),
            },
        }
    }

    pub fn into_int(self) -> Result<i64, BackendError> {
        match self {
            Self::Int(v) => Ok(v),
            other => Err(other.unexpected("integer")),
        }
    }

    /// Integer replies used as booleans (membership, exists, expire).
    pub fn into_bool(self) -> Result<bool, BackendError> {
        self.into_int().map(|v| v > 0)
    }

    #[expect(clippy::cast_precision_loss)]
    pub fn into_opt_float(self) -> Result<Option<f64>, BackendError> {
        match self {
            Self::Nil => Ok(None),
            Self::Float(v) => Ok(Some(v)),
            Self::Int(v) => Ok(Some(v as f64)),
            other => Err(other.unexpected("float")),
        }
    }

    pub fn into_opt_string(self) -> Result<Option<String>, BackendError> {
        match self {
            Self::Nil => Ok(None),
            Self::Text(v) => Ok(Some(v)),
            other => Err(other.unexpected("text")),
        }
    }

    pub fn into_opt_strings(self) -> Result<Vec<Option<String>>, BackendError> {
        match self {
            Self::Array(items) => items.into_iter().map(Self::into_opt_string).collect(),
            other => Err(other.unexpected("array")),
        }
    }

    /// Array of non-nil text replies.
    pub fn into_strings(self) -> Result<Vec<String>, BackendError> {
        match self {
            Self::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Self::Text(v) => Ok(v),
                    other => Err(other.unexpected("text")),
                })
                .collect(),
            other => Err(other.unexpected("array")),
        }
    }

    /// Flat `[field, value, field, value, ...]` array as pairs.
    pub fn into_pairs(self) -> Result<Vec<(String, String)>, BackendError> {
        let flat = self.into_strings()?;
        if flat.len() % 2 != 0 {
            return Err(BackendError::UnexpectedReply {
                expected: "even-length array",
                found: format!("{} items", flat.len()),
            });
        }

        let mut pairs = Vec::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((field, value));
        }
        Ok(pairs)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Ok => write!(f, "OK"),
            Self::Int(v) => write!(f, "(integer) {v}"),
            Self::Float(v) => write!(f, "(float) {v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Array(items) => write!(f, "(array of {})", items.len()),
            Self::Error(message) => write!(f, "(error) {message}"),
        }
    }
}

///
/// PipelineMode
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineMode {
    /// One round-trip; each command succeeds or fails on its own.
    Batch,
    /// One round-trip, applied all-or-nothing.
    Transaction,
}

///
/// Pipeline
/// Ordered batch of commands; replies come back in staging order.
///

#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Stage a command, returning its reply index.
    pub fn push(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub fn extend(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.extend(commands);
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[must_use]
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_write()).count()
    }
}

///
/// Backend
///
/// Store collaborator. Blocking or async transports both fit behind this
/// boundary; the engine never waits anywhere else.
///

pub trait Backend: Send + Sync {
    fn execute(&self, command: Command) -> Result<Reply, BackendError>;

    /// Execute `pipeline`, returning one reply per command in order.
    fn execute_pipeline(
        &self,
        pipeline: Pipeline,
        mode: PipelineMode,
    ) -> Result<Vec<Reply>, BackendError>;
}

/// Execute `pipeline` and check the reply count.
pub(crate) fn run_pipeline<B: Backend + ?Sized>(
    backend: &B,
    pipeline: Pipeline,
    mode: PipelineMode,
) -> Result<Vec<Reply>, BackendError> {
    let expected = pipeline.len();
    if expected == 0 {
        return Ok(Vec::new());
    }

    let replies = backend.execute_pipeline(pipeline, mode)?;
    if replies.len() != expected {
        return Err(BackendError::ReplyCount {
            expected,
            found: replies.len(),
        });
    }

    Ok(replies)
}
