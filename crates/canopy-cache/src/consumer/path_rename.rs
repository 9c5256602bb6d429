//! Descendant metadata invalidation after a folder rename or move
//!
//! The engine rewrites descendant paths in the store without emitting one
//! row event per descendant; this handler drops their cached metadata so the
//! next read reloads the new path.

use async_trait::async_trait;
use canopy_core::{FileStore, InvalidationEvent, PathRenameEvent};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::StreamHandler;
use crate::backend::{CacheBackend, CacheOp};
use crate::error::{CacheError, CacheResult};
use crate::keys;
use crate::repository::blocking_read;

/// Consumer of [`keys::PATH_STREAM`]
pub struct PathRenameHandler {
    store: Arc<dyn FileStore>,
    cache: Arc<dyn CacheBackend>,
}

impl PathRenameHandler {
    /// Create a handler resolving descendants through `store`
    pub fn new(store: Arc<dyn FileStore>, cache: Arc<dyn CacheBackend>) -> Self {
        Self { store, cache }
    }

    async fn invalidate(&self, event: PathRenameEvent) -> CacheResult<usize> {
        let PathRenameEvent {
            owner_id,
            old_prefix,
            new_prefix,
        } = event;

        // rows still under the old prefix were created after the move
        let ids = blocking_read(&self.store, move |store| {
            let mut ids = BTreeSet::new();
            for prefix in [&new_prefix, &old_prefix] {
                ids.extend(store.find_by_path_prefix(owner_id, prefix)?.into_iter().map(|n| n.id));
            }
            Ok(ids)
        })
        .await
        .map_err(|e| CacheError::Store(e.to_string()))?;

        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        let ops = ids
            .into_iter()
            .map(|id| CacheOp::Delete { key: keys::metadata(id) })
            .collect();
        self.cache.execute(ops).await?;
        Ok(count)
    }
}

#[async_trait]
impl StreamHandler for PathRenameHandler {
    fn stream(&self) -> &'static str {
        keys::PATH_STREAM
    }

    fn group(&self) -> &'static str {
        keys::PATH_GROUP
    }

    async fn handle(&self, event: InvalidationEvent) -> CacheResult<()> {
        let InvalidationEvent::PathRename(event) = event else {
            return Err(CacheError::codec("update event on the path rename stream"));
        };
        let owner = event.owner_id;
        let count = self.invalidate(event).await?;
        debug!(owner, count, "Invalidated descendant metadata");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCache;
    use canopy_config::EngineConfig;
    use canopy_core::test_support::MemoryFileStore;
    use canopy_core::TreeEngine;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drops_descendant_metadata() {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        let engine = TreeEngine::new(Arc::clone(&store), EngineConfig::default());
        let docs = engine.create_folder(1, "Docs", None).unwrap().node.unwrap();
        let inner = engine.create_folder(1, "Inner", Some(docs.id)).unwrap().node.unwrap();
        let archive = engine.create_folder(1, "Archive", None).unwrap().node.unwrap();

        let cache = Arc::new(MemoryCache::new());
        let ops = [docs.id, inner.id, archive.id]
            .iter()
            .map(|id| CacheOp::SetString {
                key: keys::metadata(*id),
                value: "stale".into(),
                ttl: Duration::from_secs(60),
            })
            .collect();
        cache.execute(ops).await.unwrap();

        let moved = engine.move_node(1, docs.id, Some(archive.id)).unwrap();
        let handler = PathRenameHandler::new(Arc::clone(&store), cache.clone());
        for event in moved.path_renames {
            handler.handle(InvalidationEvent::PathRename(event)).await.unwrap();
        }

        assert!(!cache.exists(&keys::metadata(inner.id)).await.unwrap());
        // the moved folder itself is covered by the update stream
        assert!(cache.exists(&keys::metadata(docs.id)).await.unwrap());
        assert!(cache.exists(&keys::metadata(archive.id)).await.unwrap());
    }
}
