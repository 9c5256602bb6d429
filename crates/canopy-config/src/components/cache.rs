//! Cache-aside repository configuration
//!
//! TTLs are expressed in seconds. Positive entries get `base + rand(0..=jitter)`
//! so that entries populated together do not expire together.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for cached metadata and listing projections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Base TTL of a single-entity metadata hash
    pub metadata_ttl_secs: u64,
    /// Base TTL of directory and recycle-bin listings
    pub listing_ttl_secs: u64,
    /// Maximum random jitter added to every positive TTL
    pub ttl_jitter_secs: u64,
    /// TTL of `__NOT_FOUND__` sentinels
    pub negative_ttl_secs: u64,
    /// Above this many nodes changed by one mutation, consumers drop the
    /// recycle-bin listing instead of patching it member by member
    pub recycle_patch_limit: usize,
}

impl CacheConfig {
    /// Base metadata TTL as a [`Duration`]
    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    /// Base listing TTL as a [`Duration`]
    pub fn listing_ttl(&self) -> Duration {
        Duration::from_secs(self.listing_ttl_secs)
    }

    /// Jitter bound as a [`Duration`]
    pub fn ttl_jitter(&self) -> Duration {
        Duration::from_secs(self.ttl_jitter_secs)
    }

    /// Negative-cache TTL as a [`Duration`]
    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: 3600,
            listing_ttl_secs: 1800,
            ttl_jitter_secs: 300,
            negative_ttl_secs: 60,
            recycle_patch_limit: 64,
        }
    }
}
