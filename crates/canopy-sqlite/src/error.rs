//! Error types for the SQLite store

use canopy_core::StoreError;
use thiserror::Error;

/// SQLite storage error type
#[derive(Error, Debug)]
pub enum SqliteError {
    /// Database connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Schema/migration error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transaction control failed
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Underlying rusqlite error
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

/// Result type for SQLite operations
pub type SqliteResult<T> = Result<T, SqliteError>;

impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Connection(msg) => Self::Backend(msg),
            SqliteError::Schema(msg) => Self::Backend(msg),
            SqliteError::Transaction(msg) => Self::Backend(msg),
            SqliteError::NotFound(msg) => Self::NotFound(msg),
            SqliteError::Rusqlite(rusqlite::Error::FromSqlConversionFailure(_, _, e)) => {
                Self::Serialization(e.to_string())
            }
            SqliteError::Rusqlite(e) => Self::Backend(e.to_string()),
        }
    }
}
