//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config {path}: {error}")]
    Io {
        /// Path that was being read
        path: PathBuf,
        /// Underlying IO error message
        error: String,
    },

    /// The configuration text could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A value is out of its allowed range
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted field name, e.g. `consumer.batch_size`
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
