//! Error types for the cache layer

use thiserror::Error;

/// Cache and stream errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache backend failed or is unreachable
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// A cached value or stream message could not be decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Consumer group missing or misconfigured
    #[error("Stream group error: {0}")]
    StreamGroup(String),

    /// The store failed while a handler was repairing projections
    #[error("Store error: {0}")]
    Store(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Create a codec error
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }

    /// Messages failing to decode will never succeed; everything else may
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::Codec(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
