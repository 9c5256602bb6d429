//! File service facade
//!
//! Wires the engine, the cache-aside repository, the event bus and the
//! physical-deletion queue together. Every dependency is passed in; there is
//! no global state. A mutation runs its store transaction on the blocking
//! pool, then clears the mutated entries, publishes events and hands
//! released objects to the deletion queue.

use canopy_config::CanopyConfig;
use canopy_core::{
    ContentRef, DeletionQueue, FileId, FileNode, FileStatus, FileStore, MutationOutcome, NewFile, OwnerId,
    TreeEngine, TreeError, TreeResult,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::backend::CacheBackend;
use crate::consumer::{PathRenameHandler, StreamConsumer, UpdateHandler};
use crate::error::CacheResult;
use crate::repository::CachedFileRepository;

/// Errors surfaced by [`FileService`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The tree operation failed
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// The blocking task running the operation panicked or was cancelled
    #[error("Blocking task failed: {0}")]
    Join(String),
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Tree(e) => e.is_retryable(),
            Self::Join(_) => false,
        }
    }
}

/// Entry point for tree operations and cached reads
#[derive(Clone)]
pub struct FileService {
    engine: TreeEngine,
    repo: CachedFileRepository,
    deletions: Arc<dyn DeletionQueue>,
    config: CanopyConfig,
}

impl FileService {
    /// Create a service over the given store, cache and deletion queue
    pub fn new(
        store: Arc<dyn FileStore>,
        cache: Arc<dyn CacheBackend>,
        deletions: Arc<dyn DeletionQueue>,
        config: CanopyConfig,
    ) -> Self {
        let engine = TreeEngine::new(Arc::clone(&store), config.engine.clone());
        let repo = CachedFileRepository::new(store, cache, config.cache.clone());
        Self {
            engine,
            repo,
            deletions,
            config,
        }
    }

    /// The mutation engine
    pub fn engine(&self) -> &TreeEngine {
        &self.engine
    }

    /// The cache-aside repository
    pub fn repository(&self) -> &CachedFileRepository {
        &self.repo
    }

    /// Create a folder; the name is suffixed on conflict
    pub async fn create_folder(
        &self,
        actor: OwnerId,
        name: &str,
        parent_id: Option<FileId>,
    ) -> ServiceResult<FileNode> {
        let name = name.to_string();
        let outcome = self
            .mutate(move |engine| engine.create_folder(actor, &name, parent_id))
            .await?;
        primary(outcome)
    }

    /// Register a completed upload
    pub async fn create_file(&self, actor: OwnerId, file: NewFile) -> ServiceResult<FileNode> {
        let outcome = self.mutate(move |engine| engine.create_file(actor, file)).await?;
        primary(outcome)
    }

    /// Point a file at new content
    pub async fn update_content(
        &self,
        actor: OwnerId,
        id: FileId,
        size: u64,
        content: ContentRef,
        version_id: Option<String>,
    ) -> ServiceResult<FileNode> {
        let outcome = self
            .mutate(move |engine| engine.update_content(actor, id, size, content, version_id))
            .await?;
        primary(outcome)
    }

    /// Rename a node in place
    pub async fn rename(&self, actor: OwnerId, id: FileId, new_name: &str) -> ServiceResult<FileNode> {
        let new_name = new_name.to_string();
        let outcome = self
            .mutate(move |engine| engine.rename(actor, id, &new_name))
            .await?;
        primary(outcome)
    }

    /// Move a node under another folder (None = root)
    pub async fn move_node(
        &self,
        actor: OwnerId,
        id: FileId,
        new_parent_id: Option<FileId>,
    ) -> ServiceResult<FileNode> {
        let outcome = self
            .mutate(move |engine| engine.move_node(actor, id, new_parent_id))
            .await?;
        primary(outcome)
    }

    /// Move a node and its subtree to the recycle bin
    pub async fn soft_delete(&self, actor: OwnerId, id: FileId) -> ServiceResult<FileNode> {
        let outcome = self.mutate(move |engine| engine.soft_delete(actor, id)).await?;
        primary(outcome)
    }

    /// Bring a recycled node back
    pub async fn restore(&self, actor: OwnerId, id: FileId) -> ServiceResult<FileNode> {
        let outcome = self.mutate(move |engine| engine.restore(actor, id)).await?;
        primary(outcome)
    }

    /// Remove a node and its subtree for good
    pub async fn permanent_delete(&self, actor: OwnerId, id: FileId) -> ServiceResult<MutationOutcome> {
        self.mutate(move |engine| engine.permanent_delete(actor, id)).await
    }

    /// Purge the actor's recycle bin; returns the number of rows removed
    pub async fn empty_recycle_bin(&self, actor: OwnerId) -> ServiceResult<usize> {
        let outcome = self.mutate(move |engine| engine.empty_recycle_bin(actor)).await?;
        Ok(outcome.changes.len())
    }

    /// A node the actor owns, including recycled ones
    pub async fn get(&self, actor: OwnerId, id: FileId) -> ServiceResult<FileNode> {
        let node = self
            .repo
            .find_by_id(id)
            .await?
            .filter(|n| n.status != FileStatus::Deleting)
            .ok_or_else(|| TreeError::node_not_found(id))?;
        if node.owner_id != actor {
            return Err(TreeError::denied(format!("user {} does not own file {}", actor, id)).into());
        }
        Ok(node)
    }

    /// Visible children of a folder the actor owns (None = root)
    pub async fn list_children(&self, actor: OwnerId, parent_id: Option<FileId>) -> ServiceResult<Vec<FileNode>> {
        if let Some(parent) = parent_id {
            let folder = self.get(actor, parent).await?;
            if !folder.is_folder {
                return Err(TreeError::invalid(format!("file {} is not a folder", parent)).into());
            }
            if !folder.is_visible() {
                return Err(TreeError::node_not_found(parent).into());
            }
        }
        Ok(self.repo.list_children(actor, parent_id).await?)
    }

    /// The actor's recycle bin, oldest deletion first
    pub async fn list_deleted(&self, actor: OwnerId) -> ServiceResult<Vec<FileNode>> {
        Ok(self.repo.list_deleted(actor).await?)
    }

    /// A visible file with the given content hash, for upload deduplication
    pub async fn find_by_content_hash(&self, hash: &str) -> ServiceResult<Option<FileNode>> {
        Ok(self.repo.find_by_content_hash(hash).await?)
    }

    /// Consumer of the update stream; not started
    pub fn update_consumer(&self, cancel: CancellationToken) -> StreamConsumer<UpdateHandler> {
        let cache = Arc::clone(self.repo.cache());
        let handler = UpdateHandler::new(Arc::clone(&cache), self.config.cache.clone());
        StreamConsumer::new(cache, handler, self.config.consumer.clone(), cancel)
    }

    /// Consumer of the path rename stream; not started
    pub fn path_consumer(&self, cancel: CancellationToken) -> StreamConsumer<PathRenameHandler> {
        let cache = Arc::clone(self.repo.cache());
        let handler = PathRenameHandler::new(Arc::clone(self.repo.store()), Arc::clone(&cache));
        StreamConsumer::new(cache, handler, self.config.consumer.clone(), cancel)
    }

    /// Run both consumers as tasks until `cancel` fires
    pub fn spawn_consumers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<CacheResult<()>>> {
        vec![
            tokio::spawn(self.update_consumer(cancel.child_token()).run()),
            tokio::spawn(self.path_consumer(cancel.child_token()).run()),
        ]
    }

    async fn mutate<F>(&self, op: F) -> ServiceResult<MutationOutcome>
    where
        F: FnOnce(&TreeEngine) -> TreeResult<MutationOutcome> + Send + 'static,
    {
        let engine = self.engine.clone();
        let outcome = tokio::task::spawn_blocking(move || op(&engine))
            .await
            .map_err(|e| ServiceError::Join(e.to_string()))??;

        self.repo.after_commit(&outcome).await;

        for task in &outcome.deletion_tasks {
            match self.deletions.enqueue(task.clone()) {
                Ok(()) => debug!(file_id = task.file_id, key = %task.storage_key, "Queued physical deletion"),
                // the task is still returned in the outcome for the caller to re-drive
                Err(e) => error!(
                    file_id = task.file_id,
                    bucket = %task.bucket,
                    key = %task.storage_key,
                    hash = %task.content_hash,
                    error = %e,
                    "Failed to queue physical deletion; object left orphaned"
                ),
            }
        }
        Ok(outcome)
    }
}

fn primary(outcome: MutationOutcome) -> ServiceResult<FileNode> {
    outcome
        .node
        .ok_or_else(|| TreeError::NotFound("mutation produced no node".to_string()).into())
}
