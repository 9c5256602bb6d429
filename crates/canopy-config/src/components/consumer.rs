//! Stream consumer configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by the invalidation stream consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer-group member name; unique per process
    pub consumer_name: String,
    /// Maximum messages read per poll
    pub batch_size: usize,
    /// How long a poll blocks waiting for new messages
    pub block_ms: u64,
    /// Pending messages idle longer than this are reclaimed from dead members
    pub reclaim_idle_ms: u64,
    /// Base delay for exponential backoff after a failed cycle
    pub base_retry_delay_ms: u64,
    /// Cap for exponential backoff
    pub max_retry_delay_ms: u64,
}

impl ConsumerConfig {
    /// Poll block duration
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    /// Minimum idle time before a pending message is reclaimed
    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_idle_ms)
    }

    /// Base backoff delay
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    /// Maximum backoff delay
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("consumer-{}", uuid::Uuid::new_v4().simple()),
            batch_size: 10,
            block_ms: 2000,
            reclaim_idle_ms: 30_000,
            base_retry_delay_ms: 500,
            max_retry_delay_ms: 30_000,
        }
    }
}
