//! Tree mutation engine configuration

use serde::{Deserialize, Serialize};

/// Settings for the tree mutation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on `"name (n)"` attempts before a rename fails with a conflict
    pub max_name_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_name_attempts: 1000,
        }
    }
}
