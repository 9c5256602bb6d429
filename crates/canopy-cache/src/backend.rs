//! Cache backend contract
//!
//! Mirrors the subset of Redis the cache layer relies on: hashes, sorted
//! sets and strings with TTLs, atomic multi-command pipelines, and streams
//! with consumer groups.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// One command of an atomic pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    /// Replace a hash wholesale and set its TTL
    ReplaceHash {
        /// Hash key
        key: String,
        /// Field/value pairs
        fields: Vec<(String, String)>,
        /// Time to live
        ttl: Duration,
    },
    /// Replace a sorted set wholesale and set its TTL
    ReplaceSortedSet {
        /// Set key
        key: String,
        /// Member/score pairs
        members: Vec<(String, f64)>,
        /// Time to live
        ttl: Duration,
    },
    /// Set a string value with a TTL
    SetString {
        /// Key
        key: String,
        /// Value
        value: String,
        /// Time to live
        ttl: Duration,
    },
    /// Delete a key of any type
    Delete {
        /// Key
        key: String,
    },
    /// Add to a sorted set only if the set already exists
    ZAddExisting {
        /// Set key
        key: String,
        /// Member
        member: String,
        /// Score
        score: f64,
    },
    /// Remove a member from a sorted set
    ZRem {
        /// Set key
        key: String,
        /// Member
        member: String,
    },
}

impl CacheOp {
    /// Key touched by this command
    pub fn key(&self) -> &str {
        match self {
            CacheOp::ReplaceHash { key, .. }
            | CacheOp::ReplaceSortedSet { key, .. }
            | CacheOp::SetString { key, .. }
            | CacheOp::Delete { key }
            | CacheOp::ZAddExisting { key, .. }
            | CacheOp::ZRem { key, .. } => key,
        }
    }
}

/// Stream entry id, `<millis>-<seq>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    /// Milliseconds part
    pub ms: u64,
    /// Sequence within the millisecond
    pub seq: u64,
}

impl StreamId {
    /// Create an id
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| CacheError::codec(format!("invalid stream id: {}", s)))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|e| CacheError::codec(format!("invalid stream id {}: {}", s, e)))
        };
        Ok(Self::new(parse(ms)?, parse(seq)?))
    }
}

/// Message delivered to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Entry id
    pub id: StreamId,
    /// Field/value pairs
    pub fields: Vec<(String, String)>,
    /// Times this entry was delivered to any consumer of the group
    pub deliveries: u32,
}

impl StreamMessage {
    /// Value of a field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Redis-like cache backend
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// All fields of a hash; empty when the key is missing
    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>>;

    /// Sorted-set members by ascending score; `None` when the key is missing
    async fn sorted_members(&self, key: &str) -> CacheResult<Option<Vec<String>>>;

    /// String value
    async fn string_get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Whether a key exists
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Run commands as one atomic unit (MULTI/EXEC)
    async fn execute(&self, ops: Vec<CacheOp>) -> CacheResult<()>;

    /// Append an entry to a stream
    async fn stream_add(&self, stream: &str, fields: Vec<(String, String)>) -> CacheResult<StreamId>;

    /// Create a consumer group reading from the start; existing groups are kept
    async fn create_group(&self, stream: &str, group: &str) -> CacheResult<()>;

    /// Read never-delivered entries for `consumer`, waiting up to `block`
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CacheResult<Vec<StreamMessage>>;

    /// Acknowledge processed entries; returns how many were pending
    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> CacheResult<usize>;

    /// Take over entries left unacknowledged for at least `min_idle`
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> CacheResult<Vec<StreamMessage>>;

    /// Delivered but unacknowledged entries of a group
    async fn pending_count(&self, stream: &str, group: &str) -> CacheResult<usize>;
}
