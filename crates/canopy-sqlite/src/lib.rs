//! SQLite file store for Canopy
//!
//! Implements [`canopy_core::FileStore`] over a single `files` table holding
//! every row of every owner, with its materialized path column.
//!
//! ## Features
//!
//! - **Transactions**: `BEGIN IMMEDIATE` per engine operation, rolled back on drop
//! - **Subtree path rewrite**: one recursive-CTE `UPDATE` per moved folder
//! - **WAL Mode**: concurrent readers with a single writer
//!
//! ## Usage
//!
//! ```rust,ignore
//! use canopy_sqlite::{SqliteConfig, SqliteFileStore, SqlitePool};
//!
//! let pool = SqlitePool::new(SqliteConfig::new("./canopy.db"))?;
//! let store = SqliteFileStore::new(pool);
//! ```

pub mod config;
pub mod connection;
pub mod error;
mod rows;
pub mod schema;
pub mod store;

// Re-exports
pub use config::SqliteConfig;
pub use connection::SqlitePool;
pub use error::{SqliteError, SqliteResult};
pub use store::SqliteFileStore;
