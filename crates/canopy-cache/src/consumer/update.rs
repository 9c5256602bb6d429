//! Row-level projection repair
//!
//! Desired state is computed from the event snapshot alone; no store reads.
//! Listings are patched only if they are already cached so that a partial
//! set is never created.

use async_trait::async_trait;
use canopy_config::CacheConfig;
use canopy_core::{InvalidationEvent, UpdateEvent};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::StreamHandler;
use crate::backend::{CacheBackend, CacheOp};
use crate::codec;
use crate::error::{CacheError, CacheResult};
use crate::keys;
use crate::repository::jittered;

/// Consumer of [`keys::UPDATE_STREAM`]
pub struct UpdateHandler {
    cache: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl UpdateHandler {
    /// Create a handler writing to `cache`
    pub fn new(cache: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { cache, config }
    }
}

/// Pipeline that brings every projection of one row in line with `event`
pub fn repair_ops(event: &UpdateEvent, config: &CacheConfig) -> Vec<CacheOp> {
    let member = event.file_id.to_string();
    let mut ops = Vec::new();

    let metadata_key = keys::metadata(event.file_id);
    match &event.node {
        Some(node) => ops.push(CacheOp::ReplaceHash {
            key: metadata_key,
            fields: codec::encode_node(node),
            ttl: jittered(config.metadata_ttl(), config.ttl_jitter()),
        }),
        None => ops.push(CacheOp::Delete { key: metadata_key }),
    }

    let hashes: BTreeSet<&str> = event
        .prior
        .iter()
        .filter_map(|p| p.content_hash.as_deref())
        .chain(event.node.iter().filter_map(|n| n.content_hash()))
        .collect();
    ops.extend(hashes.into_iter().map(|hash| CacheOp::Delete {
        key: keys::content_hash(hash),
    }));

    let listed = event.node.as_ref().filter(|n| n.is_visible());
    if let Some(prior) = &event.prior {
        // removing first could empty and drop a set we are about to add to
        if listed.map(|n| n.parent_id) != Some(prior.parent_id) {
            ops.push(CacheOp::ZRem {
                key: keys::listing(event.owner_id, prior.parent_id),
                member: member.clone(),
            });
        }
    }
    if let Some(node) = listed {
        let key = keys::listing(node.owner_id, node.parent_id);
        ops.push(CacheOp::ZAddExisting {
            key: key.clone(),
            member: member.clone(),
            score: node.listing_score(),
        });
        ops.push(CacheOp::ZRem {
            key,
            member: keys::EMPTY_LIST.to_string(),
        });
    }

    let recycle_key = keys::recycle_bin(event.owner_id);
    if event.batch_size > config.recycle_patch_limit {
        ops.push(CacheOp::Delete { key: recycle_key });
    } else {
        match event.recycle_transition() {
            (false, true) => {
                if let Some(score) = event.node.as_ref().and_then(|n| n.recycle_score()) {
                    ops.push(CacheOp::ZAddExisting {
                        key: recycle_key.clone(),
                        member,
                        score,
                    });
                    ops.push(CacheOp::ZRem {
                        key: recycle_key,
                        member: keys::EMPTY_LIST.to_string(),
                    });
                }
            }
            (true, false) => ops.push(CacheOp::ZRem {
                key: recycle_key,
                member,
            }),
            _ => {}
        }
    }

    ops
}

#[async_trait]
impl StreamHandler for UpdateHandler {
    fn stream(&self) -> &'static str {
        keys::UPDATE_STREAM
    }

    fn group(&self) -> &'static str {
        keys::UPDATE_GROUP
    }

    async fn handle(&self, event: InvalidationEvent) -> CacheResult<()> {
        let InvalidationEvent::Update(event) = event else {
            return Err(CacheError::codec("path rename event on the update stream"));
        };
        let ops = repair_ops(&event, &self.config);
        debug!(file_id = event.file_id, ops = ops.len(), "Repairing cache projections");
        self.cache.execute(ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ListingEntry, MetadataEntry};
    use crate::memory::MemoryCache;
    use canopy_core::{FileNode, FileStatus, NewFileNode, PathRenameEvent, PriorState};
    use chrono::{Duration, Utc};

    fn node(id: i64, parent: Option<i64>) -> FileNode {
        NewFileNode {
            owner_id: 1,
            parent_id: parent,
            name: format!("n{}", id),
            path: "/".into(),
            is_folder: true,
            size: 0,
            content: None,
            version_id: None,
            created_at: Utc::now() + Duration::seconds(id),
        }
        .into_node(id)
    }

    fn recycled(mut node: FileNode) -> FileNode {
        node.status = FileStatus::Recycled;
        node.deleted_at = Some(Utc::now());
        node
    }

    async fn listing(cache: &MemoryCache, key: &str) -> Option<ListingEntry> {
        codec::decode_listing(cache.sorted_members(key).await.unwrap()).unwrap()
    }

    async fn seed_empty(cache: &MemoryCache, key: &str) {
        cache
            .execute(vec![CacheOp::ReplaceSortedSet {
                key: key.to_string(),
                members: codec::encode_listing(Vec::new()),
                ttl: std::time::Duration::from_secs(60),
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_creation_patches_cached_listing_only() {
        let cache = Arc::new(MemoryCache::new());
        let handler = UpdateHandler::new(cache.clone(), CacheConfig::default());
        seed_empty(&cache, &keys::listing(1, None)).await;

        let created = node(5, None);
        let event = UpdateEvent {
            file_id: 5,
            owner_id: 1,
            node: Some(created.clone()),
            prior: None,
            batch_size: 1,
        };
        handler.handle(InvalidationEvent::Update(event.clone())).await.unwrap();
        // redelivery converges to the same state
        handler.handle(InvalidationEvent::Update(event)).await.unwrap();

        assert_eq!(listing(&cache, &keys::listing(1, None)).await, Some(ListingEntry::Members(vec![5])));
        let fields = cache.hash_get_all(&keys::metadata(5)).await.unwrap();
        assert_eq!(codec::decode_metadata(&fields).unwrap(), Some(MetadataEntry::Present(created)));
        // the recycle bin was never cached, so it stays absent
        assert!(!cache.exists(&keys::recycle_bin(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete_moves_between_listings() {
        let cache = Arc::new(MemoryCache::new());
        let handler = UpdateHandler::new(cache.clone(), CacheConfig::default());
        let before = node(5, Some(2));
        cache
            .execute(vec![CacheOp::ReplaceSortedSet {
                key: keys::listing(1, Some(2)),
                members: codec::encode_listing(vec![(5, before.listing_score())]),
                ttl: std::time::Duration::from_secs(60),
            }])
            .await
            .unwrap();
        seed_empty(&cache, &keys::recycle_bin(1)).await;

        let after = recycled(before.clone());
        handler
            .handle(InvalidationEvent::Update(UpdateEvent {
                file_id: 5,
                owner_id: 1,
                node: Some(after),
                prior: Some(PriorState::from(&before)),
                batch_size: 1,
            }))
            .await
            .unwrap();

        // removing the last member drops the set; the next read reloads it
        assert_eq!(listing(&cache, &keys::listing(1, Some(2))).await, None);
        assert_eq!(listing(&cache, &keys::recycle_bin(1)).await, Some(ListingEntry::Members(vec![5])));
    }

    #[tokio::test]
    async fn test_rename_keeps_single_member_listing() {
        let cache = Arc::new(MemoryCache::new());
        let handler = UpdateHandler::new(cache.clone(), CacheConfig::default());
        let before = node(5, Some(2));
        cache
            .execute(vec![CacheOp::ReplaceSortedSet {
                key: keys::listing(1, Some(2)),
                members: codec::encode_listing(vec![(5, before.listing_score())]),
                ttl: std::time::Duration::from_secs(60),
            }])
            .await
            .unwrap();

        let mut after = before.clone();
        after.name = "renamed".into();
        handler
            .handle(InvalidationEvent::Update(UpdateEvent {
                file_id: 5,
                owner_id: 1,
                node: Some(after),
                prior: Some(PriorState::from(&before)),
                batch_size: 1,
            }))
            .await
            .unwrap();

        assert_eq!(listing(&cache, &keys::listing(1, Some(2))).await, Some(ListingEntry::Members(vec![5])));
    }

    #[test]
    fn test_large_batch_drops_recycle_bin() {
        let config = CacheConfig {
            recycle_patch_limit: 2,
            ..CacheConfig::default()
        };
        let before = node(5, None);
        let event = UpdateEvent {
            file_id: 5,
            owner_id: 1,
            node: Some(recycled(before.clone())),
            prior: Some(PriorState::from(&before)),
            batch_size: 3,
        };
        let ops = repair_ops(&event, &config);
        assert!(ops.contains(&CacheOp::Delete {
            key: keys::recycle_bin(1)
        }));
        assert!(!ops
            .iter()
            .any(|op| matches!(op, CacheOp::ZAddExisting { key, .. } if *key == keys::recycle_bin(1))));
    }

    #[test]
    fn test_removal_deletes_metadata() {
        let before = recycled(node(5, None));
        let event = UpdateEvent {
            file_id: 5,
            owner_id: 1,
            node: None,
            prior: Some(PriorState::from(&before)),
            batch_size: 1,
        };
        let ops = repair_ops(&event, &CacheConfig::default());
        assert_eq!(ops[0], CacheOp::Delete { key: keys::metadata(5) });
        assert!(ops.contains(&CacheOp::ZRem {
            key: keys::recycle_bin(1),
            member: "5".into()
        }));
    }

    #[tokio::test]
    async fn test_wrong_event_kind_is_poison() {
        let handler = UpdateHandler::new(Arc::new(MemoryCache::new()), CacheConfig::default());
        let err = handler
            .handle(InvalidationEvent::PathRename(PathRenameEvent {
                owner_id: 1,
                old_prefix: "/a/".into(),
                new_prefix: "/b/".into(),
            }))
            .await
            .unwrap_err();
        assert!(err.is_poison());
    }
}
