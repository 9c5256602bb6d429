//! Cache-aside repository
//!
//! Reads check the cache first and fall back to the store on a miss,
//! populating the cache with a jittered TTL. Store misses are cached as
//! negative entries with a short TTL. A cache that errors is treated as a
//! miss: reads degrade to the store, never fail because of the cache.
//!
//! After a mutation commits, [`CachedFileRepository::after_commit`] drops
//! the mutated entities' metadata synchronously (read-your-own-write) and
//! publishes events for the stream consumers to repair everything else.

use canopy_config::CacheConfig;
use canopy_core::{
    FileId, FileNode, FileStore, MutationOutcome, OwnerId, TreeError, TreeResult,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{CacheBackend, CacheOp};
use crate::bus::EventBus;
use crate::codec::{self, ListingEntry, MetadataEntry};
use crate::keys;
use crate::single_flight::SingleFlight;

/// Base TTL plus a random share of the jitter window
pub(crate) fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let extra_ms = rand::rng().random_range(0..=jitter.as_millis() as u64);
    base + Duration::from_millis(extra_ms)
}

/// Run a store read on the blocking pool
pub(crate) async fn blocking_read<T, F>(store: &Arc<dyn FileStore>, f: F) -> TreeResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn FileStore) -> TreeResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| TreeError::TransientStore(format!("blocking store task failed: {}", e)))?
}

/// Cache-aside view over a [`FileStore`]
#[derive(Clone)]
pub struct CachedFileRepository {
    store: Arc<dyn FileStore>,
    cache: Arc<dyn CacheBackend>,
    bus: EventBus,
    config: CacheConfig,
    flights: Arc<SingleFlight>,
}

impl CachedFileRepository {
    /// Create a repository
    pub fn new(store: Arc<dyn FileStore>, cache: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        let bus = EventBus::new(Arc::clone(&cache));
        Self {
            store,
            cache,
            bus,
            config,
            flights: Arc::new(SingleFlight::new()),
        }
    }

    /// The event bus mutations are published on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The authoritative store
    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// The cache backend
    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    /// Node by id, any status
    ///
    /// Recycled nodes are returned so they can be restored; callers that
    /// serve normal reads filter on [`FileNode::is_visible`].
    pub async fn find_by_id(&self, id: FileId) -> TreeResult<Option<FileNode>> {
        if let Some(entry) = self.cached_metadata(id).await {
            return Ok(entry.into_node());
        }

        let _flight = self.flights.acquire(&keys::metadata(id)).await;
        if let Some(entry) = self.cached_metadata(id).await {
            debug!(file_id = id, "Metadata populated by concurrent reader");
            return Ok(entry.into_node());
        }

        let node = blocking_read(&self.store, move |store| Ok(store.get(id)?)).await?;
        self.populate_metadata(id, node.as_ref()).await;
        Ok(node)
    }

    /// Visible children of a folder (None = root), oldest first
    pub async fn list_children(&self, owner: OwnerId, parent: Option<FileId>) -> TreeResult<Vec<FileNode>> {
        let key = keys::listing(owner, parent);
        let ids = match self.cached_listing(&key).await {
            Some(entry) => entry.into_ids(),
            None => {
                let _flight = self.flights.acquire(&key).await;
                match self.cached_listing(&key).await {
                    Some(entry) => entry.into_ids(),
                    None => {
                        let nodes = blocking_read(&self.store, move |store| {
                            Ok(store.list_children(owner, parent)?)
                        })
                        .await?;
                        let scored = nodes.iter().map(|n| (n.id, n.listing_score()));
                        self.populate_listing(&key, codec::encode_listing(scored)).await;
                        self.warm_metadata(&nodes).await;
                        return Ok(nodes);
                    }
                }
            }
        };

        // the set may lag behind the store until the consumer catches up;
        // per-entity metadata is authoritative for status and placement
        let mut nodes = self.load_members(&ids).await?;
        nodes.retain(|n| n.is_visible() && n.owner_id == owner && n.parent_id == parent);
        nodes.sort_by_key(|n| (n.created_at, n.id));
        Ok(nodes)
    }

    /// Recycled nodes of an owner, oldest deletion first
    pub async fn list_deleted(&self, owner: OwnerId) -> TreeResult<Vec<FileNode>> {
        let key = keys::recycle_bin(owner);
        let ids = match self.cached_listing(&key).await {
            Some(entry) => entry.into_ids(),
            None => {
                let _flight = self.flights.acquire(&key).await;
                match self.cached_listing(&key).await {
                    Some(entry) => entry.into_ids(),
                    None => {
                        let nodes =
                            blocking_read(&self.store, move |store| Ok(store.list_deleted(owner)?)).await?;
                        let scored = nodes
                            .iter()
                            .filter_map(|n| n.recycle_score().map(|score| (n.id, score)));
                        self.populate_listing(&key, codec::encode_listing(scored)).await;
                        self.warm_metadata(&nodes).await;
                        return Ok(nodes);
                    }
                }
            }
        };

        let mut nodes = self.load_members(&ids).await?;
        nodes.retain(|n| n.is_recycled() && n.owner_id == owner);
        nodes.sort_by_key(|n| (n.deleted_at, n.id));
        Ok(nodes)
    }

    /// One visible file carrying `hash`, for upload deduplication
    pub async fn find_by_content_hash(&self, hash: &str) -> TreeResult<Option<FileNode>> {
        let key = keys::content_hash(hash);
        if let Some(found) = self.cached_hash_lookup(&key, hash).await? {
            return Ok(found);
        }

        let _flight = self.flights.acquire(&key).await;
        if let Some(found) = self.cached_hash_lookup(&key, hash).await? {
            return Ok(found);
        }

        let owned = hash.to_string();
        let node = blocking_read(&self.store, move |store| Ok(store.find_by_content_hash(&owned)?)).await?;
        let op = match &node {
            Some(node) => CacheOp::SetString {
                key: key.clone(),
                value: node.id.to_string(),
                ttl: jittered(self.config.metadata_ttl(), self.config.ttl_jitter()),
            },
            None => CacheOp::SetString {
                key: key.clone(),
                value: keys::NOT_FOUND.to_string(),
                ttl: self.config.negative_ttl(),
            },
        };
        if let Err(e) = self.cache.execute(vec![op]).await {
            warn!(key = %key, error = %e, "Failed to populate content hash lookup");
        }
        Ok(node)
    }

    /// Apply the cache side of a committed mutation
    ///
    /// Never fails: the store is already committed, so cache and bus errors
    /// are logged and left to TTL expiry and the consumers.
    pub async fn after_commit(&self, outcome: &MutationOutcome) {
        let mut ops: Vec<CacheOp> = outcome
            .changes
            .iter()
            .map(|change| CacheOp::Delete {
                key: keys::metadata(change.file_id()),
            })
            .collect();
        ops.extend(
            outcome
                .touched_hashes()
                .iter()
                .map(|hash| CacheOp::Delete { key: keys::content_hash(hash) }),
        );

        if !ops.is_empty() {
            if let Err(e) = self.cache.execute(ops).await {
                warn!(error = %e, changes = outcome.changes.len(), "Failed to invalidate metadata after commit");
            }
        }

        if let Err(e) = self.bus.publish_outcome(outcome).await {
            warn!(error = %e, "Failed to publish invalidation events");
        }
    }

    async fn cached_metadata(&self, id: FileId) -> Option<MetadataEntry> {
        let key = keys::metadata(id);
        let decoded = match self.cache.hash_get_all(&key).await {
            Ok(fields) => codec::decode_metadata(&fields),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, falling back to store");
                return None;
            }
        };
        match decoded {
            Ok(Some(entry)) => {
                debug!(key = %key, "Metadata cache hit");
                Some(entry)
            }
            Ok(None) => {
                debug!(key = %key, "Metadata cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt metadata entry, reloading");
                None
            }
        }
    }

    async fn cached_listing(&self, key: &str) -> Option<ListingEntry> {
        match self.cache.sorted_members(key).await.map(codec::decode_listing) {
            Ok(Ok(Some(entry))) => {
                debug!(key = %key, "Listing cache hit");
                Some(entry)
            }
            Ok(Ok(None)) => {
                debug!(key = %key, "Listing cache miss");
                None
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Corrupt listing entry, reloading");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, falling back to store");
                None
            }
        }
    }

    /// `Some(result)` on a usable hit, `None` on a miss or stale entry
    async fn cached_hash_lookup(&self, key: &str, hash: &str) -> TreeResult<Option<Option<FileNode>>> {
        let cached = match self.cache.string_get(key).await.map(codec::decode_hash_lookup) {
            Ok(Ok(cached)) => cached,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Corrupt content hash lookup, reloading");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, falling back to store");
                None
            }
        };

        match cached {
            None => Ok(None),
            Some(None) => Ok(Some(None)),
            Some(Some(id)) => {
                let node = self.find_by_id(id).await?;
                match node {
                    Some(node) if node.is_visible() && node.content_hash() == Some(hash) => {
                        Ok(Some(Some(node)))
                    }
                    _ => {
                        debug!(key = %key, file_id = id, "Stale content hash lookup");
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn load_members(&self, ids: &[FileId]) -> TreeResult<Vec<FileNode>> {
        let mut nodes = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(node) = self.find_by_id(id).await? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    async fn populate_metadata(&self, id: FileId, node: Option<&FileNode>) {
        let key = keys::metadata(id);
        let op = match node {
            Some(node) => CacheOp::ReplaceHash {
                key: key.clone(),
                fields: codec::encode_node(node),
                ttl: jittered(self.config.metadata_ttl(), self.config.ttl_jitter()),
            },
            None => CacheOp::ReplaceHash {
                key: key.clone(),
                fields: codec::encode_not_found(),
                ttl: self.config.negative_ttl(),
            },
        };
        if let Err(e) = self.cache.execute(vec![op]).await {
            warn!(key = %key, error = %e, "Failed to populate metadata");
        }
    }

    async fn populate_listing(&self, key: &str, members: Vec<(String, f64)>) {
        let op = CacheOp::ReplaceSortedSet {
            key: key.to_string(),
            members,
            ttl: jittered(self.config.listing_ttl(), self.config.ttl_jitter()),
        };
        if let Err(e) = self.cache.execute(vec![op]).await {
            warn!(key = %key, error = %e, "Failed to populate listing");
        }
    }

    async fn warm_metadata(&self, nodes: &[FileNode]) {
        if nodes.is_empty() {
            return;
        }
        let ops = nodes
            .iter()
            .map(|node| CacheOp::ReplaceHash {
                key: keys::metadata(node.id),
                fields: codec::encode_node(node),
                ttl: jittered(self.config.metadata_ttl(), self.config.ttl_jitter()),
            })
            .collect();
        if let Err(e) = self.cache.execute(ops).await {
            warn!(error = %e, count = nodes.len(), "Failed to warm metadata");
        }
    }
}
