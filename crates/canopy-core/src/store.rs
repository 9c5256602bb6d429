//! Store contracts
//!
//! The relational store is the single source of truth. Reads are available
//! both on the store and inside a transaction through [`FileReader`]; writes
//! exist only on a [`StoreTransaction`]. Dropping a transaction without
//! calling [`StoreTransaction::commit`] rolls it back.
//!
//! Implementations serialize transactions; callers must not issue reads on
//! the store while holding one of its transactions, and must use the
//! transaction's own [`FileReader`] methods instead.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::error::StoreResult;
use crate::model::{FileId, FileNode, FileStatus, NewFileNode, OwnerId};

/// Read-side queries over file rows
pub trait FileReader {
    /// Fetch a row regardless of status
    fn get(&self, id: FileId) -> StoreResult<Option<FileNode>>;

    /// Normal-status children of `parent` (None = root) ordered by creation
    fn list_children(&self, owner: OwnerId, parent: Option<FileId>) -> StoreResult<Vec<FileNode>>;

    /// Every direct child of a folder, any status
    fn children_of(&self, parent: FileId) -> StoreResult<Vec<FileNode>>;

    /// Recycled rows of an owner ordered by deletion time
    fn list_deleted(&self, owner: OwnerId) -> StoreResult<Vec<FileNode>>;

    /// Names of Normal-status siblings of the given type, optionally excluding one id
    fn sibling_names(
        &self,
        owner: OwnerId,
        parent: Option<FileId>,
        is_folder: bool,
        exclude: Option<FileId>,
    ) -> StoreResult<HashSet<String>>;

    /// Rows still referencing a content object (Normal or Recycled status)
    fn count_content_refs(&self, storage_key: &str, content_hash: &str) -> StoreResult<u64>;

    /// One Normal-status file carrying this content hash, if any
    fn find_by_content_hash(&self, content_hash: &str) -> StoreResult<Option<FileNode>>;

    /// Rows of an owner whose materialized path starts with `prefix`
    fn find_by_path_prefix(&self, owner: OwnerId, prefix: &str) -> StoreResult<Vec<FileNode>>;
}

/// A single atomic unit of work against the store
pub trait StoreTransaction: FileReader {
    /// Insert a Normal-status row and return it with its assigned id
    fn insert(&mut self, node: NewFileNode) -> StoreResult<FileNode>;

    /// Overwrite every mutable column of an existing row
    fn update(&mut self, node: &FileNode) -> StoreResult<()>;

    /// Rewrite the leading `old_prefix` of `path` on every descendant of `root`
    ///
    /// Scoped by ancestry rather than by string prefix, so a recycled folder
    /// that once had the same location is left alone. Executes as one
    /// statement; returns the number of rows rewritten.
    fn rewrite_subtree_paths(
        &mut self,
        root: FileId,
        old_prefix: &str,
        new_prefix: &str,
    ) -> StoreResult<u64>;

    /// Set status, deletion timestamp and `updated_at` on a batch of rows
    fn set_status(
        &mut self,
        ids: &[FileId],
        status: FileStatus,
        deleted_at: Option<DateTime<Utc>>,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Delete a batch of rows
    fn delete(&mut self, ids: &[FileId]) -> StoreResult<()>;

    /// Make every change durable
    fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Authoritative relational repository of file rows
pub trait FileStore: FileReader + Send + Sync {
    /// Start a transaction
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>>;
}
