//! # Canopy Configuration
//!
//! Typed configuration for the file-tree metadata core. Each component owns a
//! small settings struct with production defaults; [`CanopyConfig`] aggregates
//! them and is loaded from TOML or JSON.
//!
//! ```rust,no_run
//! use canopy_config::CanopyConfig;
//!
//! let config = CanopyConfig::load_from_file("canopy.toml")?;
//! println!("listing ttl: {}s", config.cache.listing_ttl_secs);
//! # Ok::<(), canopy_config::ConfigError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod components;
mod error;
mod loader;

pub use components::*;
pub use error::{ConfigError, ConfigResult};
pub use loader::CanopyConfig;
