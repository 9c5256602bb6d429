//! Test doubles for the store contracts
//!
//! Available under `cfg(test)` or the `test-utils` feature so downstream
//! crates can exercise the engine and repository without SQLite.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::model::{FileId, FileNode, FileStatus, NewFileNode, OwnerId};
use crate::paths;
use crate::store::{FileReader, FileStore, StoreTransaction};

#[derive(Debug, Clone, Default)]
struct Rows {
    rows: BTreeMap<FileId, FileNode>,
    next_id: FileId,
}

impl Rows {
    fn get(&self, id: FileId) -> Option<FileNode> {
        self.rows.get(&id).cloned()
    }

    fn list_children(&self, owner: OwnerId, parent: Option<FileId>) -> Vec<FileNode> {
        let mut out: Vec<FileNode> = self
            .rows
            .values()
            .filter(|n| n.owner_id == owner && n.parent_id == parent && n.is_visible())
            .cloned()
            .collect();
        out.sort_by_key(|n| (n.created_at, n.id));
        out
    }

    fn children_of(&self, parent: FileId) -> Vec<FileNode> {
        self.rows
            .values()
            .filter(|n| n.parent_id == Some(parent))
            .cloned()
            .collect()
    }

    fn list_deleted(&self, owner: OwnerId) -> Vec<FileNode> {
        let mut out: Vec<FileNode> = self
            .rows
            .values()
            .filter(|n| n.owner_id == owner && n.is_recycled())
            .cloned()
            .collect();
        out.sort_by_key(|n| (n.deleted_at, n.id));
        out
    }

    fn sibling_names(
        &self,
        owner: OwnerId,
        parent: Option<FileId>,
        is_folder: bool,
        exclude: Option<FileId>,
    ) -> HashSet<String> {
        self.rows
            .values()
            .filter(|n| {
                n.owner_id == owner
                    && n.parent_id == parent
                    && n.is_folder == is_folder
                    && n.is_visible()
                    && Some(n.id) != exclude
            })
            .map(|n| n.name.clone())
            .collect()
    }

    fn count_content_refs(&self, storage_key: &str, content_hash: &str) -> u64 {
        self.rows
            .values()
            .filter(|n| n.status != FileStatus::Deleting)
            .filter(|n| {
                n.content
                    .as_ref()
                    .is_some_and(|c| c.key == storage_key && c.hash == content_hash)
            })
            .count() as u64
    }

    fn find_by_content_hash(&self, content_hash: &str) -> Option<FileNode> {
        self.rows
            .values()
            .find(|n| !n.is_folder && n.is_visible() && n.content_hash() == Some(content_hash))
            .cloned()
    }

    fn find_by_path_prefix(&self, owner: OwnerId, prefix: &str) -> Vec<FileNode> {
        self.rows
            .values()
            .filter(|n| n.owner_id == owner && n.path.starts_with(prefix))
            .cloned()
            .collect()
    }
}

macro_rules! impl_reader {
    ($ty:ty, $rows:ident => $access:expr) => {
        impl FileReader for $ty {
            fn get(&self, id: FileId) -> StoreResult<Option<FileNode>> {
                let $rows = self;
                Ok($access.get(id))
            }

            fn list_children(&self, owner: OwnerId, parent: Option<FileId>) -> StoreResult<Vec<FileNode>> {
                let $rows = self;
                Ok($access.list_children(owner, parent))
            }

            fn children_of(&self, parent: FileId) -> StoreResult<Vec<FileNode>> {
                let $rows = self;
                Ok($access.children_of(parent))
            }

            fn list_deleted(&self, owner: OwnerId) -> StoreResult<Vec<FileNode>> {
                let $rows = self;
                Ok($access.list_deleted(owner))
            }

            fn sibling_names(
                &self,
                owner: OwnerId,
                parent: Option<FileId>,
                is_folder: bool,
                exclude: Option<FileId>,
            ) -> StoreResult<HashSet<String>> {
                let $rows = self;
                Ok($access.sibling_names(owner, parent, is_folder, exclude))
            }

            fn count_content_refs(&self, storage_key: &str, content_hash: &str) -> StoreResult<u64> {
                let $rows = self;
                Ok($access.count_content_refs(storage_key, content_hash))
            }

            fn find_by_content_hash(&self, content_hash: &str) -> StoreResult<Option<FileNode>> {
                let $rows = self;
                Ok($access.find_by_content_hash(content_hash))
            }

            fn find_by_path_prefix(&self, owner: OwnerId, prefix: &str) -> StoreResult<Vec<FileNode>> {
                let $rows = self;
                Ok($access.find_by_path_prefix(owner, prefix))
            }
        }
    };
}

/// In-memory [`FileStore`]
///
/// A transaction locks the store, works on a copy of every row and writes
/// the copy back on commit; dropping it discards the copy.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    state: Mutex<Rows>,
    fail_next_commit: Mutex<bool>,
}

impl MemoryFileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, any status
    pub fn all_rows(&self) -> Vec<FileNode> {
        self.state.lock().rows.values().cloned().collect()
    }

    /// Make the next commit fail with a backend error
    pub fn fail_next_commit(&self) {
        *self.fail_next_commit.lock() = true;
    }
}

impl_reader!(MemoryFileStore, store => store.state.lock());

impl FileStore for MemoryFileStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        let guard = self.state.lock();
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            fail_commit: &self.fail_next_commit,
        }))
    }
}

struct MemoryTransaction<'a> {
    guard: MutexGuard<'a, Rows>,
    working: Rows,
    fail_commit: &'a Mutex<bool>,
}

impl_reader!(MemoryTransaction<'_>, tx => tx.working);

impl StoreTransaction for MemoryTransaction<'_> {
    fn insert(&mut self, node: NewFileNode) -> StoreResult<FileNode> {
        self.working.next_id += 1;
        let node = node.into_node(self.working.next_id);
        self.working.rows.insert(node.id, node.clone());
        Ok(node)
    }

    fn update(&mut self, node: &FileNode) -> StoreResult<()> {
        match self.working.rows.get_mut(&node.id) {
            Some(row) => {
                *row = node.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("file {}", node.id))),
        }
    }

    fn rewrite_subtree_paths(
        &mut self,
        root: FileId,
        old_prefix: &str,
        new_prefix: &str,
    ) -> StoreResult<u64> {
        let mut rewritten = 0;
        let mut queue = VecDeque::from([root]);
        let mut seen = HashSet::from([root]);
        while let Some(folder) = queue.pop_front() {
            let children: Vec<FileId> = self
                .working
                .rows
                .values()
                .filter(|n| n.parent_id == Some(folder))
                .map(|n| n.id)
                .collect();
            for id in children {
                if !seen.insert(id) {
                    continue;
                }
                queue.push_back(id);
                if let Some(row) = self.working.rows.get_mut(&id) {
                    if let Some(path) = paths::rewrite_prefix(&row.path, old_prefix, new_prefix) {
                        row.path = path;
                        rewritten += 1;
                    }
                }
            }
        }
        Ok(rewritten)
    }

    fn set_status(
        &mut self,
        ids: &[FileId],
        status: FileStatus,
        deleted_at: Option<DateTime<Utc>>,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        for id in ids {
            if let Some(row) = self.working.rows.get_mut(id) {
                row.status = status;
                row.deleted_at = deleted_at;
                row.updated_at = changed_at;
            }
        }
        Ok(())
    }

    fn delete(&mut self, ids: &[FileId]) -> StoreResult<()> {
        for id in ids {
            self.working.rows.remove(id);
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        if std::mem::take(&mut *this.fail_commit.lock()) {
            return Err(StoreError::backend("injected commit failure"));
        }
        let MemoryTransaction { mut guard, working, .. } = this;
        *guard = working;
        Ok(())
    }
}

/// Call counters recorded by [`CountingStore`]
#[derive(Debug, Default)]
pub struct StoreCalls {
    /// `get` calls
    pub get: AtomicUsize,
    /// `list_children` calls
    pub list_children: AtomicUsize,
    /// `list_deleted` calls
    pub list_deleted: AtomicUsize,
    /// `find_by_content_hash` calls
    pub find_by_content_hash: AtomicUsize,
    /// `find_by_path_prefix` calls
    pub find_by_path_prefix: AtomicUsize,
}

impl StoreCalls {
    /// Read one counter
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Store wrapper counting read calls, for cache hit/miss assertions
pub struct CountingStore {
    inner: Arc<dyn FileStore>,
    calls: Arc<StoreCalls>,
}

impl CountingStore {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn FileStore>) -> Self {
        Self {
            inner,
            calls: Arc::new(StoreCalls::default()),
        }
    }

    /// Shared counters
    pub fn calls(&self) -> Arc<StoreCalls> {
        Arc::clone(&self.calls)
    }
}

impl FileReader for CountingStore {
    fn get(&self, id: FileId) -> StoreResult<Option<FileNode>> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        self.inner.get(id)
    }

    fn list_children(&self, owner: OwnerId, parent: Option<FileId>) -> StoreResult<Vec<FileNode>> {
        self.calls.list_children.fetch_add(1, Ordering::SeqCst);
        self.inner.list_children(owner, parent)
    }

    fn children_of(&self, parent: FileId) -> StoreResult<Vec<FileNode>> {
        self.inner.children_of(parent)
    }

    fn list_deleted(&self, owner: OwnerId) -> StoreResult<Vec<FileNode>> {
        self.calls.list_deleted.fetch_add(1, Ordering::SeqCst);
        self.inner.list_deleted(owner)
    }

    fn sibling_names(
        &self,
        owner: OwnerId,
        parent: Option<FileId>,
        is_folder: bool,
        exclude: Option<FileId>,
    ) -> StoreResult<HashSet<String>> {
        self.inner.sibling_names(owner, parent, is_folder, exclude)
    }

    fn count_content_refs(&self, storage_key: &str, content_hash: &str) -> StoreResult<u64> {
        self.inner.count_content_refs(storage_key, content_hash)
    }

    fn find_by_content_hash(&self, content_hash: &str) -> StoreResult<Option<FileNode>> {
        self.calls.find_by_content_hash.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_content_hash(content_hash)
    }

    fn find_by_path_prefix(&self, owner: OwnerId, prefix: &str) -> StoreResult<Vec<FileNode>> {
        self.calls.find_by_path_prefix.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_path_prefix(owner, prefix)
    }
}

impl FileStore for CountingStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        self.inner.begin()
    }
}
