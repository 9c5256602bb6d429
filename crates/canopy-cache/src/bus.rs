//! Invalidation event bus
//!
//! Row-level changes go to [`keys::UPDATE_STREAM`]; subtree path changes go
//! to [`keys::PATH_STREAM`]. Publishing happens after the store commit and
//! is best-effort: TTLs bound the staleness of anything lost.

use canopy_core::{InvalidationEvent, MutationOutcome, PathRenameEvent, UpdateEvent};
use std::sync::Arc;
use tracing::debug;

use crate::backend::{CacheBackend, StreamId};
use crate::codec;
use crate::error::CacheResult;
use crate::keys;

/// Publisher for invalidation events
#[derive(Clone)]
pub struct EventBus {
    cache: Arc<dyn CacheBackend>,
}

impl EventBus {
    /// Create a bus over `cache`
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache }
    }

    /// Publish one row change
    pub async fn publish_update(&self, event: UpdateEvent) -> CacheResult<StreamId> {
        let file_id = event.file_id;
        let fields = codec::encode_event(&InvalidationEvent::Update(event))?;
        let id = self.cache.stream_add(keys::UPDATE_STREAM, fields).await?;
        debug!(file_id, stream_id = %id, "Published update event");
        Ok(id)
    }

    /// Publish one subtree path change
    pub async fn publish_path_rename(&self, event: PathRenameEvent) -> CacheResult<StreamId> {
        let fields = codec::encode_event(&InvalidationEvent::PathRename(event.clone()))?;
        let id = self.cache.stream_add(keys::PATH_STREAM, fields).await?;
        debug!(
            owner = event.owner_id,
            old_prefix = %event.old_prefix,
            new_prefix = %event.new_prefix,
            stream_id = %id,
            "Published path rename event"
        );
        Ok(id)
    }

    /// Publish every event of a committed mutation; returns how many were sent
    ///
    /// Stops at the first failure.
    pub async fn publish_outcome(&self, outcome: &MutationOutcome) -> CacheResult<usize> {
        let mut published = 0;
        for event in outcome.update_events() {
            self.publish_update(event).await?;
            published += 1;
        }
        for event in &outcome.path_renames {
            self.publish_path_rename(event.clone()).await?;
            published += 1;
        }
        Ok(published)
    }
}
