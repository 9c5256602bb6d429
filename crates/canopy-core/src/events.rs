//! Mutation notifications and physical-deletion hand-off
//!
//! After a transaction commits, every changed row becomes an
//! [`UpdateEvent`] and every folder whose location changed becomes a
//! [`PathRenameEvent`]. Both carry enough state for a consumer to recompute
//! cache projections without reading them back, so redelivery is harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{TreeError, TreeResult};
use crate::model::{FileId, FileNode, OwnerId};

/// State of a node before the mutation that produced an [`UpdateEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorState {
    /// Parent before the mutation
    pub parent_id: Option<FileId>,
    /// Content hash before the mutation
    pub content_hash: Option<String>,
    /// Soft-delete timestamp before the mutation
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<&FileNode> for PriorState {
    fn from(node: &FileNode) -> Self {
        Self {
            parent_id: node.parent_id,
            content_hash: node.content_hash().map(str::to_string),
            deleted_at: node.deleted_at,
        }
    }
}

/// One mutated row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// Row id
    pub file_id: FileId,
    /// Owner of the row
    pub owner_id: OwnerId,
    /// Snapshot after the mutation; `None` when the row was permanently deleted
    pub node: Option<FileNode>,
    /// State before the mutation; `None` when the row was created
    pub prior: Option<PriorState>,
    /// Number of rows changed by the same mutation
    pub batch_size: usize,
}

impl UpdateEvent {
    /// Whether the row no longer exists
    pub fn is_removal(&self) -> bool {
        self.node.is_none()
    }

    /// Soft-delete state before and after the mutation
    pub fn recycle_transition(&self) -> (bool, bool) {
        let before = self
            .prior
            .as_ref()
            .map(|p| p.deleted_at.is_some())
            .unwrap_or(false);
        let after = self
            .node
            .as_ref()
            .map(|n| n.deleted_at.is_some())
            .unwrap_or(false);
        (before, after)
    }
}

/// A folder moved or renamed; descendants' materialized paths changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRenameEvent {
    /// Owner of the subtree
    pub owner_id: OwnerId,
    /// Descendant path prefix before the change, e.g. `/Docs/`
    pub old_prefix: String,
    /// Descendant path prefix after the change, e.g. `/Archive/Docs/`
    pub new_prefix: String,
}

/// Notification published on the invalidation bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// Row-level change
    Update(UpdateEvent),
    /// Subtree path prefix change
    PathRename(PathRenameEvent),
}

/// Request to remove a physical object nobody references any more
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDeletionTask {
    /// Row that held the last reference
    pub file_id: FileId,
    /// Owner of that row
    pub owner_id: OwnerId,
    /// Object-storage bucket
    pub bucket: String,
    /// Object key
    pub storage_key: String,
    /// Content hash of the object
    pub content_hash: String,
    /// Version pointer of the row
    pub version_id: Option<String>,
}

/// Outbound queue consumed by the external cleanup worker
///
/// Retry and backoff of the actual deletion belong to the worker.
pub trait DeletionQueue: Send + Sync {
    /// Hand a task to the worker
    fn enqueue(&self, task: PhysicalDeletionTask) -> TreeResult<()>;
}

/// In-process [`DeletionQueue`] backed by an unbounded channel
#[derive(Clone)]
pub struct ChannelDeletionQueue {
    sender: mpsc::UnboundedSender<PhysicalDeletionTask>,
}

impl ChannelDeletionQueue {
    /// Create the queue and the receiver the worker drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PhysicalDeletionTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl DeletionQueue for ChannelDeletionQueue {
    fn enqueue(&self, task: PhysicalDeletionTask) -> TreeResult<()> {
        self.sender
            .send(task)
            .map_err(|e| TreeError::StorageReference(format!("deletion queue closed: {}", e)))
    }
}
