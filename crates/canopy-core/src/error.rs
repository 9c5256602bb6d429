//! Error taxonomy
//!
//! [`TreeError`] is what callers of the tree operations see. Stores report
//! [`StoreError`], which surfaces to callers as [`TreeError::TransientStore`].

use thiserror::Error;

use crate::model::FileId;

/// Caller-actionable errors of tree operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// The referenced node does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Actor is not the owner, or the node is not in the required status
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Name conflict resolution ran out of attempts
    #[error("Name conflict: {0}")]
    Conflict(String),

    /// Structurally invalid request (cycle, no-op move or rename, bad name)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The store failed; the transaction was rolled back
    #[error("Store error: {0}")]
    TransientStore(String),

    /// Reference counting failed before a physical delete
    #[error("Storage reference error: {0}")]
    StorageReference(String),
}

/// Result type for tree operations
pub type TreeResult<T> = Result<T, TreeError>;

impl TreeError {
    /// Node id not found
    pub fn node_not_found(id: FileId) -> Self {
        Self::NotFound(format!("file {} does not exist", id))
    }

    /// Create an invalid operation error
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a permission error
    pub fn denied<S: Into<String>>(msg: S) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Only store failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

/// Errors reported by store implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend failure (connection, query, constraint)
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Row could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Row addressed by an update does not exist
    #[error("Row not found: {0}")]
    NotFound(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Create a generic backend error
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::Backend(msg.into())
    }
}

impl From<StoreError> for TreeError {
    fn from(err: StoreError) -> Self {
        TreeError::TransientStore(err.to_string())
    }
}
