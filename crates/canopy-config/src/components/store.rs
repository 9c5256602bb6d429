//! Relational store configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings for the SQLite-backed file store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database path, or `:memory:`
    pub path: PathBuf,
    /// Enable write-ahead logging
    pub wal_mode: bool,
    /// Enforce foreign keys
    pub foreign_keys: bool,
    /// SQLite busy timeout
    pub busy_timeout_ms: u64,
    /// SQLite page cache size (negative values are KiB)
    pub cache_size: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./canopy.db"),
            wal_mode: true,
            foreign_keys: true,
            busy_timeout_ms: 5000,
            cache_size: -16_000,
        }
    }
}
