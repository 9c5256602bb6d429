//! SQLite connection settings

use canopy_config::StoreConfig;
use std::path::{Path, PathBuf};

/// Connection and pragma settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Database file, or `:memory:`
    pub path: PathBuf,
    /// Enable write-ahead logging
    pub wal_mode: bool,
    /// Enforce foreign keys
    pub foreign_keys: bool,
    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// Page cache size (negative values are KiB)
    pub cache_size: i64,
}

impl SqliteConfig {
    /// Default settings for a database at `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::from(&StoreConfig::default())
        }
    }

    /// In-memory database for tests
    pub fn memory() -> Self {
        Self {
            wal_mode: false,
            ..Self::new(":memory:")
        }
    }

    /// Whether this points at an in-memory database
    pub fn is_memory(&self) -> bool {
        self.path.to_str() == Some(":memory:")
    }
}

impl From<&StoreConfig> for SqliteConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            path: config.path.clone(),
            wal_mode: config.wal_mode,
            foreign_keys: config.foreign_keys,
            busy_timeout_ms: config.busy_timeout_ms,
            cache_size: config.cache_size,
        }
    }
}
