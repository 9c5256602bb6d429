//! Tree Mutation Engine
//!
//! Validates and executes structural changes against a [`FileStore`]. Each
//! operation:
//!
//! 1. opens one store transaction,
//! 2. validates ownership and status (fail closed, nothing written yet),
//! 3. applies every row change, including subtree cascades,
//! 4. commits and returns a [`MutationOutcome`] describing what changed.
//!
//! Cache invalidation is not the engine's concern: callers feed the outcome
//! to the cache layer after commit. Any store error drops the transaction,
//! which rolls it back.

use chrono::Utc;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use canopy_config::EngineConfig;

use crate::error::{TreeError, TreeResult};
use crate::events::{PathRenameEvent, PhysicalDeletionTask, PriorState, UpdateEvent};
use crate::model::{ContentRef, FileId, FileNode, FileStatus, NewFileNode, OwnerId};
use crate::naming::{resolve_conflict, validate_name};
use crate::paths::{self, ROOT_PATH};
use crate::store::{FileReader, FileStore, StoreTransaction};

/// Before/after pair for one row touched by a mutation
#[derive(Debug, Clone, PartialEq)]
pub struct NodeChange {
    /// Row before the mutation; `None` when created
    pub before: Option<FileNode>,
    /// Row after the mutation; `None` when permanently deleted
    pub after: Option<FileNode>,
}

impl NodeChange {
    fn created(node: FileNode) -> Self {
        Self {
            before: None,
            after: Some(node),
        }
    }

    fn updated(before: FileNode, after: FileNode) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    fn removed(before: FileNode) -> Self {
        Self {
            before: Some(before),
            after: None,
        }
    }

    fn any(&self) -> Option<&FileNode> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Id of the changed row
    pub fn file_id(&self) -> FileId {
        self.any().map(|n| n.id).unwrap_or_default()
    }

    /// Owner of the changed row
    pub fn owner_id(&self) -> OwnerId {
        self.any().map(|n| n.owner_id).unwrap_or_default()
    }

    /// Notification for the update stream
    pub fn to_event(&self, batch_size: usize) -> UpdateEvent {
        UpdateEvent {
            file_id: self.file_id(),
            owner_id: self.owner_id(),
            node: self.after.clone(),
            prior: self.before.as_ref().map(PriorState::from),
            batch_size,
        }
    }
}

/// Everything a committed mutation changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutcome {
    /// The primary node after the mutation (absent for permanent deletes)
    pub node: Option<FileNode>,
    /// Every row changed, primary node first
    pub changes: Vec<NodeChange>,
    /// Folders whose descendants' materialized paths were rewritten
    pub path_renames: Vec<PathRenameEvent>,
    /// Physical objects that lost their last reference
    pub deletion_tasks: Vec<PhysicalDeletionTask>,
}

impl MutationOutcome {
    fn single(change: NodeChange) -> Self {
        Self {
            node: change.after.clone(),
            changes: vec![change],
            ..Default::default()
        }
    }

    /// Update-stream notifications, one per changed row
    pub fn update_events(&self) -> Vec<UpdateEvent> {
        let batch_size = self.changes.len();
        self.changes
            .iter()
            .map(|change| change.to_event(batch_size))
            .collect()
    }

    /// Content hashes referenced before or after the mutation
    pub fn touched_hashes(&self) -> BTreeSet<String> {
        self.changes
            .iter()
            .flat_map(|c| [c.before.as_ref(), c.after.as_ref()])
            .flatten()
            .filter_map(|n| n.content_hash().map(str::to_string))
            .collect()
    }
}

/// A completed upload to register in the tree
#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    /// Desired name; adjusted on conflict
    pub name: String,
    /// Destination folder (None = root)
    pub parent_id: Option<FileId>,
    /// Size in bytes
    pub size: u64,
    /// Stored object
    pub content: ContentRef,
    /// Version pointer
    pub version_id: Option<String>,
}

/// Executes tree operations against a store
#[derive(Clone)]
pub struct TreeEngine {
    store: Arc<dyn FileStore>,
    config: EngineConfig,
}

impl TreeEngine {
    /// Create an engine over `store`
    pub fn new(store: Arc<dyn FileStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Create a folder under `parent_id` (None = root)
    pub fn create_folder(
        &self,
        actor: OwnerId,
        name: &str,
        parent_id: Option<FileId>,
    ) -> TreeResult<MutationOutcome> {
        validate_name(name)?;
        let mut tx = self.store.begin()?;

        let dir_path = resolve_parent(&*tx, actor, parent_id)?;
        let taken = tx.sibling_names(actor, parent_id, true, None)?;
        let name = resolve_conflict(name, true, &taken, self.config.max_name_attempts)?;

        let node = tx.insert(NewFileNode {
            owner_id: actor,
            parent_id,
            name,
            path: dir_path,
            is_folder: true,
            size: 0,
            content: None,
            version_id: None,
            created_at: Utc::now(),
        })?;
        tx.commit()?;

        info!(file_id = node.id, owner = actor, path = %node.full_path(), "Created folder");
        Ok(MutationOutcome::single(NodeChange::created(node)))
    }

    /// Register a completed upload as a file row
    pub fn create_file(&self, actor: OwnerId, file: NewFile) -> TreeResult<MutationOutcome> {
        validate_name(&file.name)?;
        let mut tx = self.store.begin()?;

        let dir_path = resolve_parent(&*tx, actor, file.parent_id)?;
        let taken = tx.sibling_names(actor, file.parent_id, false, None)?;
        let name = resolve_conflict(&file.name, false, &taken, self.config.max_name_attempts)?;

        let node = tx.insert(NewFileNode {
            owner_id: actor,
            parent_id: file.parent_id,
            name,
            path: dir_path,
            is_folder: false,
            size: file.size,
            content: Some(file.content),
            version_id: file.version_id,
            created_at: Utc::now(),
        })?;
        tx.commit()?;

        info!(file_id = node.id, owner = actor, path = %node.full_path(), "Created file");
        Ok(MutationOutcome::single(NodeChange::created(node)))
    }

    /// Point a file at new content (a new version)
    pub fn update_content(
        &self,
        actor: OwnerId,
        id: FileId,
        size: u64,
        content: ContentRef,
        version_id: Option<String>,
    ) -> TreeResult<MutationOutcome> {
        let mut tx = self.store.begin()?;

        let before = load_owned(&*tx, actor, id)?;
        require_normal(&before)?;
        if before.is_folder {
            return Err(TreeError::invalid(format!("file {} is a folder", id)));
        }

        let mut after = before.clone();
        after.size = size;
        after.content = Some(content);
        after.version_id = version_id;
        after.updated_at = Utc::now();
        tx.update(&after)?;
        tx.commit()?;

        info!(file_id = id, owner = actor, version = ?after.version_id, "Updated content");
        Ok(MutationOutcome::single(NodeChange::updated(before, after)))
    }

    /// Rename a node in place
    ///
    /// Renaming to the current name is rejected with
    /// [`TreeError::InvalidOperation`].
    pub fn rename(&self, actor: OwnerId, id: FileId, new_name: &str) -> TreeResult<MutationOutcome> {
        validate_name(new_name)?;
        let mut tx = self.store.begin()?;

        let before = load_owned(&*tx, actor, id)?;
        require_normal(&before)?;
        if before.name == new_name {
            return Err(TreeError::invalid(format!(
                "file {} is already named '{}'",
                id, new_name
            )));
        }

        let taken = tx.sibling_names(actor, before.parent_id, before.is_folder, Some(id))?;
        let name = resolve_conflict(new_name, before.is_folder, &taken, self.config.max_name_attempts)?;

        let mut after = before.clone();
        after.name = name;
        after.updated_at = Utc::now();
        tx.update(&after)?;

        let mut outcome = MutationOutcome::single(NodeChange::updated(before.clone(), after.clone()));
        if after.is_folder {
            if let Some(rename) = rewrite_descendants(&mut *tx, &before, &after)? {
                outcome.path_renames.push(rename);
            }
        }
        tx.commit()?;

        info!(file_id = id, owner = actor, from = %before.name, to = %after.name, "Renamed");
        Ok(outcome)
    }

    /// Move a node under `new_parent_id` (None = root)
    pub fn move_node(
        &self,
        actor: OwnerId,
        id: FileId,
        new_parent_id: Option<FileId>,
    ) -> TreeResult<MutationOutcome> {
        let mut tx = self.store.begin()?;

        let before = load_owned(&*tx, actor, id)?;
        require_normal(&before)?;
        if before.parent_id == new_parent_id {
            return Err(TreeError::invalid(format!(
                "file {} is already in the destination folder",
                id
            )));
        }
        if new_parent_id == Some(id) {
            return Err(TreeError::invalid("cannot move a folder into itself"));
        }

        let dest_dir = resolve_parent(&*tx, actor, new_parent_id)?;
        if before.is_folder && paths::is_within(&dest_dir, &before.child_path()) {
            return Err(TreeError::invalid(format!(
                "cannot move '{}' into its own subtree '{}'",
                before.full_path(),
                dest_dir
            )));
        }

        let taken = tx.sibling_names(actor, new_parent_id, before.is_folder, Some(id))?;
        let name = resolve_conflict(&before.name, before.is_folder, &taken, self.config.max_name_attempts)?;

        let mut after = before.clone();
        after.parent_id = new_parent_id;
        after.path = dest_dir;
        after.name = name;
        after.updated_at = Utc::now();
        tx.update(&after)?;

        let mut outcome = MutationOutcome::single(NodeChange::updated(before.clone(), after.clone()));
        if after.is_folder {
            if let Some(rename) = rewrite_descendants(&mut *tx, &before, &after)? {
                outcome.path_renames.push(rename);
            }
        }
        tx.commit()?;

        info!(
            file_id = id,
            owner = actor,
            from = %before.full_path(),
            to = %after.full_path(),
            "Moved"
        );
        Ok(outcome)
    }

    /// Move a node and its Normal descendants to the recycle bin
    pub fn soft_delete(&self, actor: OwnerId, id: FileId) -> TreeResult<MutationOutcome> {
        let mut tx = self.store.begin()?;

        let root = load_owned(&*tx, actor, id)?;
        require_normal(&root)?;

        let nodes = collect_subtree(&*tx, &root, |n| n.status == FileStatus::Normal)?;
        let ids: Vec<FileId> = nodes.iter().map(|n| n.id).collect();
        let now = Utc::now();
        tx.set_status(&ids, FileStatus::Recycled, Some(now), now)?;
        tx.commit()?;

        let changes: Vec<NodeChange> = nodes
            .into_iter()
            .map(|before| {
                let mut after = before.clone();
                after.status = FileStatus::Recycled;
                after.deleted_at = Some(now);
                after.updated_at = now;
                NodeChange::updated(before, after)
            })
            .collect();

        info!(file_id = id, owner = actor, count = changes.len(), "Soft-deleted subtree");
        Ok(MutationOutcome {
            node: changes.first().and_then(|c| c.after.clone()),
            changes,
            ..Default::default()
        })
    }

    /// Bring a recycled node and its recycled descendants back
    ///
    /// Only descendants recycled together with the node come back. The node
    /// returns to its original parent when that folder is still Normal,
    /// otherwise to the root. Its name is re-resolved against the
    /// siblings it returns to.
    pub fn restore(&self, actor: OwnerId, id: FileId) -> TreeResult<MutationOutcome> {
        let mut tx = self.store.begin()?;

        let root = load_owned(&*tx, actor, id)?;
        if root.status != FileStatus::Recycled {
            return Err(TreeError::invalid(format!(
                "file {} is not in the recycle bin",
                id
            )));
        }

        let (target_parent, dir_path) = match root.parent_id {
            None => (None, ROOT_PATH.to_string()),
            Some(pid) => match tx.get(pid)? {
                Some(parent)
                    if parent.is_folder
                        && parent.owner_id == actor
                        && parent.status == FileStatus::Normal =>
                {
                    (Some(pid), parent.child_path())
                }
                _ => {
                    debug!(file_id = id, parent = pid, "Original parent gone, restoring to root");
                    (None, ROOT_PATH.to_string())
                }
            },
        };

        // descendants recycled on their own belong to another batch and stay put
        let batch = root.deleted_at;
        let nodes = collect_subtree(&*tx, &root, |n| {
            n.status == FileStatus::Recycled && n.deleted_at == batch
        })?;
        let taken = tx.sibling_names(actor, target_parent, root.is_folder, Some(id))?;
        let name = resolve_conflict(&root.name, root.is_folder, &taken, self.config.max_name_attempts)?;

        let now = Utc::now();
        let ids: Vec<FileId> = nodes.iter().map(|n| n.id).collect();
        tx.set_status(&ids, FileStatus::Normal, None, now)?;

        let mut restored = root.clone();
        restored.status = FileStatus::Normal;
        restored.deleted_at = None;
        restored.parent_id = target_parent;
        restored.path = dir_path;
        restored.name = name;
        restored.updated_at = now;
        tx.update(&restored)?;

        let mut path_renames = Vec::new();
        if root.is_folder {
            if let Some(rename) = rewrite_descendants(&mut *tx, &root, &restored)? {
                path_renames.push(rename);
            }
        }
        tx.commit()?;

        let mut changes = vec![NodeChange::updated(root.clone(), restored.clone())];
        changes.extend(nodes.into_iter().skip(1).map(|before| {
            let mut after = before.clone();
            after.status = FileStatus::Normal;
            after.deleted_at = None;
            after.updated_at = now;
            for rename in &path_renames {
                if let Some(path) = paths::rewrite_prefix(&after.path, &rename.old_prefix, &rename.new_prefix) {
                    after.path = path;
                }
            }
            NodeChange::updated(before, after)
        }));

        info!(
            file_id = id,
            owner = actor,
            path = %restored.full_path(),
            count = changes.len(),
            "Restored subtree"
        );
        Ok(MutationOutcome {
            node: Some(restored),
            changes,
            path_renames,
            deletion_tasks: Vec::new(),
        })
    }

    /// Remove a node and its subtree for good
    ///
    /// Physical objects are released only when no remaining row references
    /// them; the returned tasks are meant for the cleanup worker after commit.
    pub fn permanent_delete(&self, actor: OwnerId, id: FileId) -> TreeResult<MutationOutcome> {
        let mut tx = self.store.begin()?;

        let root = load_owned(&*tx, actor, id)?;
        if root.status == FileStatus::Deleting {
            return Err(TreeError::invalid(format!("file {} is already being deleted", id)));
        }

        let mut outcome = MutationOutcome::default();
        let mut released = HashSet::new();
        purge_subtree(&mut *tx, &root, &mut outcome, &mut released)?;
        tx.commit()?;

        info!(
            file_id = id,
            owner = actor,
            count = outcome.changes.len(),
            released = outcome.deletion_tasks.len(),
            "Permanently deleted subtree"
        );
        Ok(outcome)
    }

    /// Permanently delete everything in an owner's recycle bin
    pub fn empty_recycle_bin(&self, actor: OwnerId) -> TreeResult<MutationOutcome> {
        let mut tx = self.store.begin()?;

        let deleted = tx.list_deleted(actor)?;
        let recycled: HashSet<FileId> = deleted.iter().map(|n| n.id).collect();
        let tops: Vec<FileNode> = deleted
            .into_iter()
            .filter(|n| n.parent_id.map_or(true, |p| !recycled.contains(&p)))
            .collect();

        let mut outcome = MutationOutcome::default();
        let mut released = HashSet::new();
        for top in &tops {
            purge_subtree(&mut *tx, top, &mut outcome, &mut released)?;
        }
        tx.commit()?;

        info!(
            owner = actor,
            entries = tops.len(),
            count = outcome.changes.len(),
            released = outcome.deletion_tasks.len(),
            "Emptied recycle bin"
        );
        Ok(outcome)
    }
}

/// Load a node and check the actor owns it
fn load_owned<R: FileReader + ?Sized>(reader: &R, actor: OwnerId, id: FileId) -> TreeResult<FileNode> {
    let node = reader.get(id)?.ok_or_else(|| TreeError::node_not_found(id))?;
    if node.owner_id != actor {
        return Err(TreeError::denied(format!(
            "user {} does not own file {}",
            actor, id
        )));
    }
    Ok(node)
}

fn require_normal(node: &FileNode) -> TreeResult<()> {
    if node.status != FileStatus::Normal {
        return Err(TreeError::denied(format!(
            "file {} is {}",
            node.id, node.status
        )));
    }
    Ok(())
}

/// Directory path for children of `parent_id`, after validating the parent
fn resolve_parent<R: FileReader + ?Sized>(
    reader: &R,
    actor: OwnerId,
    parent_id: Option<FileId>,
) -> TreeResult<String> {
    let Some(pid) = parent_id else {
        return Ok(ROOT_PATH.to_string());
    };
    let parent = load_owned(reader, actor, pid)?;
    require_normal(&parent)?;
    if !parent.is_folder {
        return Err(TreeError::invalid(format!("file {} is not a folder", pid)));
    }
    Ok(parent.child_path())
}

/// Breadth-first subtree walk, root first
///
/// Children failing `include` are skipped together with their descendants.
fn collect_subtree<R, F>(reader: &R, root: &FileNode, include: F) -> TreeResult<Vec<FileNode>>
where
    R: FileReader + ?Sized,
    F: Fn(&FileNode) -> bool,
{
    let mut collected = vec![root.clone()];
    if !root.is_folder {
        return Ok(collected);
    }

    let mut seen = HashSet::from([root.id]);
    let mut queue = VecDeque::from([root.id]);
    while let Some(folder_id) = queue.pop_front() {
        for child in reader.children_of(folder_id)? {
            if !include(&child) || !seen.insert(child.id) {
                continue;
            }
            if child.is_folder {
                queue.push_back(child.id);
            }
            collected.push(child);
        }
    }
    Ok(collected)
}

/// Rewrite descendant paths after a folder's location changed
fn rewrite_descendants(
    tx: &mut (dyn StoreTransaction + '_),
    before: &FileNode,
    after: &FileNode,
) -> TreeResult<Option<PathRenameEvent>> {
    let old_prefix = before.child_path();
    let new_prefix = after.child_path();
    if old_prefix == new_prefix {
        return Ok(None);
    }

    let rewritten = tx.rewrite_subtree_paths(after.id, &old_prefix, &new_prefix)?;
    debug!(
        file_id = after.id,
        old_prefix = %old_prefix,
        new_prefix = %new_prefix,
        rewritten,
        "Rewrote descendant paths"
    );
    Ok(Some(PathRenameEvent {
        owner_id: after.owner_id,
        old_prefix,
        new_prefix,
    }))
}

/// Delete a subtree inside `tx`, releasing unreferenced content
///
/// Rows are first marked Deleting so that reference counts ignore every row
/// of the set; `released` keeps one task per physical object even when
/// several rows of the set shared it.
fn purge_subtree(
    tx: &mut (dyn StoreTransaction + '_),
    root: &FileNode,
    outcome: &mut MutationOutcome,
    released: &mut HashSet<(String, String)>,
) -> TreeResult<()> {
    let nodes = collect_subtree(&*tx, root, |n| n.status != FileStatus::Deleting)?;
    let ids: Vec<FileId> = nodes.iter().map(|n| n.id).collect();
    let now = Utc::now();
    tx.set_status(&ids, FileStatus::Deleting, Some(now), now)?;

    for node in &nodes {
        let Some(content) = &node.content else {
            continue;
        };
        let remaining = tx
            .count_content_refs(&content.key, &content.hash)
            .map_err(|e| TreeError::StorageReference(e.to_string()))?;
        if remaining > 0 {
            debug!(
                file_id = node.id,
                storage_key = %content.key,
                remaining,
                "Content still referenced, keeping object"
            );
            continue;
        }
        if released.insert((content.key.clone(), content.hash.clone())) {
            outcome.deletion_tasks.push(PhysicalDeletionTask {
                file_id: node.id,
                owner_id: node.owner_id,
                bucket: content.bucket.clone(),
                storage_key: content.key.clone(),
                content_hash: content.hash.clone(),
                version_id: node.version_id.clone(),
            });
        }
    }

    tx.delete(&ids)?;
    outcome.changes.extend(nodes.into_iter().map(NodeChange::removed));
    Ok(())
}
