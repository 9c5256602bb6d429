//! `FileStore` implementation for SQLite

use canopy_core::{
    FileId, FileNode, FileReader, FileStatus, FileStore, NewFileNode, OwnerId, StoreResult,
    StoreTransaction,
};
use chrono::{DateTime, Utc};
use parking_lot::MutexGuard;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::connection::SqlitePool;
use crate::error::SqliteError;
use crate::rows::*;

/// SQLite implementation of [`FileStore`]
#[derive(Clone)]
pub struct SqliteFileStore {
    pool: SqlitePool,
}

impl SqliteFileStore {
    /// Create a store over an initialized pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl FileReader for SqliteFileStore {
    fn get(&self, id: FileId) -> StoreResult<Option<FileNode>> {
        Ok(self.pool.with_connection(|conn| get_with_conn(conn, id))?)
    }

    fn list_children(&self, owner: OwnerId, parent: Option<FileId>) -> StoreResult<Vec<FileNode>> {
        Ok(self
            .pool
            .with_connection(|conn| list_children_with_conn(conn, owner, parent))?)
    }

    fn children_of(&self, parent: FileId) -> StoreResult<Vec<FileNode>> {
        Ok(self.pool.with_connection(|conn| children_of_with_conn(conn, parent))?)
    }

    fn list_deleted(&self, owner: OwnerId) -> StoreResult<Vec<FileNode>> {
        Ok(self.pool.with_connection(|conn| list_deleted_with_conn(conn, owner))?)
    }

    fn sibling_names(
        &self,
        owner: OwnerId,
        parent: Option<FileId>,
        is_folder: bool,
        exclude: Option<FileId>,
    ) -> StoreResult<HashSet<String>> {
        Ok(self.pool.with_connection(|conn| {
            sibling_names_with_conn(conn, owner, parent, is_folder, exclude)
        })?)
    }

    fn count_content_refs(&self, storage_key: &str, content_hash: &str) -> StoreResult<u64> {
        Ok(self
            .pool
            .with_connection(|conn| count_content_refs_with_conn(conn, storage_key, content_hash))?)
    }

    fn find_by_content_hash(&self, content_hash: &str) -> StoreResult<Option<FileNode>> {
        Ok(self
            .pool
            .with_connection(|conn| find_by_content_hash_with_conn(conn, content_hash))?)
    }

    fn find_by_path_prefix(&self, owner: OwnerId, prefix: &str) -> StoreResult<Vec<FileNode>> {
        Ok(self
            .pool
            .with_connection(|conn| find_by_path_prefix_with_conn(conn, owner, prefix))?)
    }
}

impl FileStore for SqliteFileStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        let conn = self.pool.lock();
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| SqliteError::Transaction(format!("Failed to begin: {}", e)))?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}

/// Open `BEGIN IMMEDIATE` transaction holding the connection lock
struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl FileReader for SqliteTransaction<'_> {
    fn get(&self, id: FileId) -> StoreResult<Option<FileNode>> {
        Ok(get_with_conn(&self.conn, id)?)
    }

    fn list_children(&self, owner: OwnerId, parent: Option<FileId>) -> StoreResult<Vec<FileNode>> {
        Ok(list_children_with_conn(&self.conn, owner, parent)?)
    }

    fn children_of(&self, parent: FileId) -> StoreResult<Vec<FileNode>> {
        Ok(children_of_with_conn(&self.conn, parent)?)
    }

    fn list_deleted(&self, owner: OwnerId) -> StoreResult<Vec<FileNode>> {
        Ok(list_deleted_with_conn(&self.conn, owner)?)
    }

    fn sibling_names(
        &self,
        owner: OwnerId,
        parent: Option<FileId>,
        is_folder: bool,
        exclude: Option<FileId>,
    ) -> StoreResult<HashSet<String>> {
        Ok(sibling_names_with_conn(&self.conn, owner, parent, is_folder, exclude)?)
    }

    fn count_content_refs(&self, storage_key: &str, content_hash: &str) -> StoreResult<u64> {
        Ok(count_content_refs_with_conn(&self.conn, storage_key, content_hash)?)
    }

    fn find_by_content_hash(&self, content_hash: &str) -> StoreResult<Option<FileNode>> {
        Ok(find_by_content_hash_with_conn(&self.conn, content_hash)?)
    }

    fn find_by_path_prefix(&self, owner: OwnerId, prefix: &str) -> StoreResult<Vec<FileNode>> {
        Ok(find_by_path_prefix_with_conn(&self.conn, owner, prefix)?)
    }
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn insert(&mut self, node: NewFileNode) -> StoreResult<FileNode> {
        Ok(insert_with_conn(&self.conn, node)?)
    }

    fn update(&mut self, node: &FileNode) -> StoreResult<()> {
        Ok(update_with_conn(&self.conn, node)?)
    }

    fn rewrite_subtree_paths(
        &mut self,
        root: FileId,
        old_prefix: &str,
        new_prefix: &str,
    ) -> StoreResult<u64> {
        let rewritten = rewrite_subtree_paths_with_conn(&self.conn, root, old_prefix, new_prefix)?;
        debug!(root, rewritten, "Rewrote subtree paths");
        Ok(rewritten)
    }

    fn set_status(
        &mut self,
        ids: &[FileId],
        status: FileStatus,
        deleted_at: Option<DateTime<Utc>>,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        Ok(set_status_with_conn(&self.conn, ids, status, deleted_at, changed_at)?)
    }

    fn delete(&mut self, ids: &[FileId]) -> StoreResult<()> {
        Ok(delete_with_conn(&self.conn, ids)?)
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut tx = *self;
        tx.conn
            .execute_batch("COMMIT")
            .map_err(|e| SqliteError::Transaction(format!("Failed to commit: {}", e)))?;
        tx.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!(error = %e, "Failed to roll back transaction");
        }
    }
}
