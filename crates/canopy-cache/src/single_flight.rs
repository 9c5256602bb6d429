//! Per-key miss collapsing
//!
//! When several readers miss the same cache key at once, only the first
//! ("leader") queries the store and populates the cache. The others wait on
//! the same key lock and re-check the cache once the leader is done.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Statistics for miss collapsing
#[derive(Debug, Default)]
pub struct SingleFlightStats {
    /// Acquisitions that found no one else holding the key
    pub leaders: AtomicU64,
    /// Acquisitions that had to wait for another holder
    pub waiters: AtomicU64,
}

/// Key-scoped async locks, removed once nobody holds or awaits them
#[derive(Default)]
pub struct SingleFlight {
    flights: Arc<DashMap<String, Arc<Mutex<()>>>>,
    stats: Arc<SingleFlightStats>,
}

impl SingleFlight {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`
    pub async fn acquire(&self, key: &str) -> FlightGuard {
        let lock = self
            .flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => {
                self.stats.leaders.fetch_add(1, Ordering::Relaxed);
                guard
            }
            Err(_) => {
                self.stats.waiters.fetch_add(1, Ordering::Relaxed);
                lock.clone().lock_owned().await
            }
        };

        FlightGuard {
            key: key.to_string(),
            lock,
            flights: Arc::clone(&self.flights),
            guard: Some(guard),
        }
    }

    /// Keys currently held or awaited
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Collapsing statistics
    pub fn stats(&self) -> &SingleFlightStats {
        &self.stats
    }
}

/// Ownership of one key; released on drop
pub struct FlightGuard {
    key: String,
    lock: Arc<Mutex<()>>,
    flights: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for FlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightGuard")
            .field("key", &self.key)
            .field("held", &self.guard.is_some())
            .finish()
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // map entry + our handle + the owned guard: nobody else is waiting
        self.flights
            .remove_if(&self.key, |_, lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) <= 3);
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_serializes_same_key() {
        let flights = Arc::new(SingleFlight::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            handles.push(tokio::spawn(async move {
                let _guard = flights.acquire("file:metadata:1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
        assert_eq!(flights.stats().leaders.load(Ordering::Relaxed) + flights.stats().waiters.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let flights = SingleFlight::new();
        let _a = flights.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), flights.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(flights.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_waiter_pends_until_leader_releases() {
        let flights = SingleFlight::new();
        let leader = flights.acquire("files:user:1:folder:root").await;

        let mut waiter = tokio_test::task::spawn(flights.acquire("files:user:1:folder:root"));
        tokio_test::assert_pending!(waiter.poll());

        drop(leader);
        assert!(waiter.is_woken());
        let guard = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(flights.stats().waiters.load(Ordering::Relaxed), 1);
        assert!(format!("{:?}", guard).contains("files:user:1:folder:root"));
    }
}
