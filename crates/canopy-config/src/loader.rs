//! Aggregate configuration and file loading

use crate::components::{CacheConfig, ConsumerConfig, EngineConfig, StoreConfig};
use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Top-level configuration for a Canopy deployment
///
/// Every section is optional in the source file; missing sections and fields
/// fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanopyConfig {
    /// Tree mutation engine settings
    pub engine: EngineConfig,
    /// Cache-aside settings
    pub cache: CacheConfig,
    /// Stream consumer settings
    pub consumer: ConsumerConfig,
    /// Relational store settings
    pub store: StoreConfig,
}

impl CanopyConfig {
    /// Load configuration from a `.toml` or `.json` file and validate it
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_toml_str(&content)?,
        };

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON text
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.engine.max_name_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "engine.max_name_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.cache.metadata_ttl_secs == 0 || self.cache.listing_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.*_ttl_secs",
                reason: "positive entries need a non-zero TTL".to_string(),
            });
        }
        if self.cache.negative_ttl_secs > self.cache.metadata_ttl_secs {
            return Err(ConfigError::Invalid {
                field: "cache.negative_ttl_secs",
                reason: "must not exceed metadata_ttl_secs".to_string(),
            });
        }
        if self.consumer.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "consumer.batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.consumer.consumer_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "consumer.consumer_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.consumer.base_retry_delay_ms == 0
            || self.consumer.base_retry_delay_ms > self.consumer.max_retry_delay_ms
        {
            return Err(ConfigError::Invalid {
                field: "consumer.base_retry_delay_ms",
                reason: "must be non-zero and not exceed max_retry_delay_ms".to_string(),
            });
        }

        debug!("Configuration validated");
        Ok(())
    }
}
