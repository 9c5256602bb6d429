//! In-process cache backend with Redis semantics
//!
//! Non-persistent; all data is lost when the process exits. Used by tests,
//! development setups and single-node embeddings. Expired keys are removed
//! lazily on access, empty hashes and sorted sets disappear like they do in
//! Redis, and streams keep per-group pending entries so unacknowledged
//! messages can be claimed again.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

use crate::backend::{CacheBackend, CacheOp, StreamId, StreamMessage};
use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    SortedSet(HashMap<String, f64>),
    Str(String),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<StreamId, Vec<(String, String)>>,
    last_id: StreamId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&mut self) -> StreamId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let id = if now_ms > self.last_id.ms {
            StreamId::new(now_ms, 0)
        } else {
            StreamId::new(self.last_id.ms, self.last_id.seq + 1)
        };
        self.last_id = id;
        id
    }
}

#[derive(Default)]
struct Inner {
    keys: Mutex<HashMap<String, Entry>>,
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    unavailable: AtomicBool,
}

/// In-memory [`CacheBackend`]
///
/// `Clone` shares the same keyspace.
#[derive(Clone, Default)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl MemoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`CacheError::Backend`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining time to live of a key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let keys = self.inner.keys.lock();
        keys.get(key)
            .filter(|e| !e.is_expired())
            .and_then(|e| e.expires_at)
            .map(|exp| exp.saturating_duration_since(Instant::now()))
    }

    /// Number of live keys (streams excluded)
    pub fn len(&self) -> usize {
        self.inner.keys.lock().values().filter(|e| !e.is_expired()).count()
    }

    /// Whether no live keys exist
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every key and stream
    pub fn clear(&self) {
        self.inner.keys.lock().clear();
        self.inner.streams.lock().clear();
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("connection refused".to_string()));
        }
        Ok(())
    }

    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let mut keys = self.inner.keys.lock();
        if keys.get(key).is_some_and(Entry::is_expired) {
            keys.remove(key);
        }
        f(keys.get_mut(key))
    }

    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> CacheResult<Vec<StreamMessage>> {
        let mut streams = self.inner.streams.lock();
        let stream_state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let Stream { entries, groups, .. } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let mut batch = Vec::new();
        let start = group_state.last_delivered;
        for (id, fields) in entries
            .range(start..)
            .filter(|(id, _)| **id > start)
            .take(count)
        {
            group_state.last_delivered = *id;
            group_state.pending.insert(
                *id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
            batch.push(StreamMessage {
                id: *id,
                fields: fields.clone(),
                deliveries: 1,
            });
        }
        Ok(batch)
    }
}

fn no_group(stream: &str, group: &str) -> CacheError {
    CacheError::StreamGroup(format!("NOGROUP no group '{}' on stream '{}'", group, stream))
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Backend(format!("WRONGTYPE operation against key '{}' holding the wrong kind of value", key))
}

fn apply(keys: &mut HashMap<String, Entry>, op: CacheOp) -> CacheResult<()> {
    if keys.get(op.key()).is_some_and(Entry::is_expired) {
        keys.remove(op.key());
    }

    match op {
        CacheOp::ReplaceHash { key, fields, ttl } => {
            if fields.is_empty() {
                keys.remove(&key);
            } else {
                let hash = fields.into_iter().collect();
                keys.insert(key, Entry::new(Value::Hash(hash), ttl));
            }
        }
        CacheOp::ReplaceSortedSet { key, members, ttl } => {
            if members.is_empty() {
                keys.remove(&key);
            } else {
                let set = members.into_iter().collect();
                keys.insert(key, Entry::new(Value::SortedSet(set), ttl));
            }
        }
        CacheOp::SetString { key, value, ttl } => {
            keys.insert(key, Entry::new(Value::Str(value), ttl));
        }
        CacheOp::Delete { key } => {
            keys.remove(&key);
        }
        CacheOp::ZAddExisting { key, member, score } => match keys.get_mut(&key) {
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => {
                set.insert(member, score);
            }
            Some(_) => return Err(wrong_type(&key)),
            None => {}
        },
        CacheOp::ZRem { key, member } => {
            let now_empty = match keys.get_mut(&key) {
                Some(Entry {
                    value: Value::SortedSet(set),
                    ..
                }) => {
                    set.remove(&member);
                    set.is_empty()
                }
                Some(_) => return Err(wrong_type(&key)),
                None => false,
            };
            if now_empty {
                keys.remove(&key);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        self.check_available()?;
        self.with_live(key, |entry| match entry.map(|e| &e.value) {
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        })
    }

    async fn sorted_members(&self, key: &str) -> CacheResult<Option<Vec<String>>> {
        self.check_available()?;
        self.with_live(key, |entry| match entry.map(|e| &e.value) {
            Some(Value::SortedSet(set)) => {
                let mut members: Vec<(&String, &f64)> = set.iter().collect();
                members.sort_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)));
                Ok(Some(members.into_iter().map(|(m, _)| m.clone()).collect()))
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        })
    }

    async fn string_get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check_available()?;
        self.with_live(key, |entry| match entry.map(|e| &e.value) {
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        })
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.check_available()?;
        Ok(self.with_live(key, |entry| entry.is_some()))
    }

    async fn execute(&self, ops: Vec<CacheOp>) -> CacheResult<()> {
        self.check_available()?;
        let mut keys = self.inner.keys.lock();
        // like EXEC, a failing command does not stop the others
        let mut first_error = None;
        for op in ops {
            if let Err(e) = apply(&mut keys, op) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn stream_add(&self, stream: &str, fields: Vec<(String, String)>) -> CacheResult<StreamId> {
        self.check_available()?;
        let id = {
            let mut streams = self.inner.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state.entries.insert(id, fields);
            id
        };
        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> CacheResult<()> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock();
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CacheResult<Vec<StreamMessage>> {
        self.check_available()?;
        let deadline = Instant::now() + block;
        loop {
            // register before checking so an append in between is not missed
            let appended = self.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.deliver_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            if tokio::time::timeout(deadline - now, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> CacheResult<usize> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock();
        let group_state = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(ids
            .iter()
            .filter(|id| group_state.pending.remove(id).is_some())
            .count())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> CacheResult<Vec<StreamMessage>> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock();
        let stream_state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let Stream { entries, groups, .. } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let mut claimed = Vec::new();
        let mut vanished = Vec::new();
        for (id, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if pending.delivered_at.elapsed() < min_idle {
                continue;
            }
            let Some(fields) = entries.get(id) else {
                vanished.push(*id);
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = Instant::now();
            pending.deliveries += 1;
            claimed.push(StreamMessage {
                id: *id,
                fields: fields.clone(),
                deliveries: pending.deliveries,
            });
        }
        for id in vanished {
            group_state.pending.remove(&id);
        }
        Ok(claimed)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> CacheResult<usize> {
        self.check_available()?;
        let streams = self.inner.streams.lock();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .ok_or_else(|| no_group(stream, group))
    }
}
