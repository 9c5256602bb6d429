//! End-to-end behavior of the file service over the in-memory cache

use std::sync::Arc;

use canopy_cache::{keys, CacheBackend, FileService, MemoryCache, ServiceError};
use canopy_config::CanopyConfig;
use canopy_core::test_support::{CountingStore, MemoryFileStore, StoreCalls};
use canopy_core::{
    ChannelDeletionQueue, ContentRef, FileReader, FileStatus, FileStore, NewFile, PhysicalDeletionTask,
    TreeError,
};
use canopy_sqlite::{SqliteConfig, SqliteFileStore, SqlitePool};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

const OWNER: i64 = 1;

struct Harness {
    service: FileService,
    store: Arc<dyn FileStore>,
    cache: MemoryCache,
    deletions: UnboundedReceiver<PhysicalDeletionTask>,
}

impl Harness {
    fn new(store: Arc<dyn FileStore>) -> Self {
        let cache = MemoryCache::new();
        let (queue, deletions) = ChannelDeletionQueue::new();
        let service = FileService::new(
            Arc::clone(&store),
            Arc::new(cache.clone()),
            Arc::new(queue),
            CanopyConfig::default(),
        );
        Self {
            service,
            store,
            cache,
            deletions,
        }
    }

    fn in_memory() -> Self {
        Self::new(Arc::new(MemoryFileStore::new()))
    }

    /// Raw members of a cached listing set
    async fn raw_listing(&self, parent: Option<i64>) -> Option<Vec<String>> {
        self.cache.sorted_members(&keys::listing(OWNER, parent)).await.unwrap()
    }

    /// Let both consumers catch up with everything published so far
    async fn drain(&self) {
        let cancel = CancellationToken::new();
        self.service.update_consumer(cancel.clone()).drain().await.unwrap();
        self.service.path_consumer(cancel).drain().await.unwrap();
    }
}

fn upload(name: &str, parent_id: Option<i64>, hash: &str) -> NewFile {
    NewFile {
        name: name.to_string(),
        parent_id,
        size: 2048,
        content: ContentRef::new("uploads", format!("objects/{}", hash), hash),
        version_id: None,
    }
}

async fn scenario(harness: &Harness) {
    let service = &harness.service;

    let docs = service.create_folder(OWNER, "Docs", None).await.unwrap();
    let file = service
        .create_file(OWNER, upload("a.txt", Some(docs.id), "h1"))
        .await
        .unwrap();
    // populate the listing so the consumers have something to patch
    assert_eq!(service.list_children(OWNER, Some(docs.id)).await.unwrap().len(), 1);

    let err = service.rename(OWNER, file.id, "a.txt").await.unwrap_err();
    assert!(matches!(err, ServiceError::Tree(TreeError::InvalidOperation(_))));

    service.rename(OWNER, file.id, "b.txt").await.unwrap();
    let archive = service.create_folder(OWNER, "Archive", None).await.unwrap();
    assert_eq!(service.list_children(OWNER, None).await.unwrap().len(), 2);
    service.move_node(OWNER, docs.id, Some(archive.id)).await.unwrap();
    service.soft_delete(OWNER, docs.id).await.unwrap();
    assert!(service.list_children(OWNER, Some(archive.id)).await.unwrap().is_empty());
    service.restore(OWNER, docs.id).await.unwrap();

    harness.drain().await;

    let file = service.get(OWNER, file.id).await.unwrap();
    assert_eq!(file.full_path(), "/Archive/Docs/b.txt");
    assert_eq!(file.status, FileStatus::Normal);

    let expected = harness.store.list_children(OWNER, Some(docs.id)).unwrap();
    assert_eq!(service.list_children(OWNER, Some(docs.id)).await.unwrap(), expected);
    let expected = harness.store.list_children(OWNER, Some(archive.id)).unwrap();
    assert_eq!(service.list_children(OWNER, Some(archive.id)).await.unwrap(), expected);
    assert!(service.list_deleted(OWNER).await.unwrap().is_empty());

    let root = harness.raw_listing(None).await.unwrap_or_default();
    assert!(!root.contains(&docs.id.to_string()));
    assert_eq!(root, vec![archive.id.to_string()]);
    let root_nodes = service.list_children(OWNER, None).await.unwrap();
    assert_eq!(root_nodes, harness.store.list_children(OWNER, None).unwrap());
}

#[tokio::test]
async fn test_docs_scenario_converges() {
    let harness = Harness::in_memory();
    scenario(&harness).await;
}

#[tokio::test]
async fn test_docs_scenario_converges_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let pool = SqlitePool::new(SqliteConfig::new(dir.path().join("canopy.db"))).unwrap();
    let harness = Harness::new(Arc::new(SqliteFileStore::new(pool)));
    scenario(&harness).await;
}

#[tokio::test]
async fn test_read_your_write_before_consumers_run() {
    let harness = Harness::in_memory();
    let service = &harness.service;

    let folder = service.create_folder(OWNER, "Reports", None).await.unwrap();
    assert_eq!(service.get(OWNER, folder.id).await.unwrap().name, "Reports");

    service.rename(OWNER, folder.id, "Q3").await.unwrap();
    assert_eq!(service.get(OWNER, folder.id).await.unwrap().name, "Q3");

    service.soft_delete(OWNER, folder.id).await.unwrap();
    assert!(service.get(OWNER, folder.id).await.unwrap().is_recycled());
}

#[tokio::test]
async fn test_listing_converges_after_update_stream() {
    let harness = Harness::in_memory();
    let service = &harness.service;

    // confirmed-empty listing is now cached
    assert!(service.list_children(OWNER, None).await.unwrap().is_empty());

    let a = service.create_folder(OWNER, "A", None).await.unwrap();
    let b = service.create_folder(OWNER, "B", None).await.unwrap();
    // stale until the consumer repairs the set
    assert!(service.list_children(OWNER, None).await.unwrap().is_empty());

    harness.drain().await;

    let listed: Vec<i64> = service
        .list_children(OWNER, None)
        .await
        .unwrap()
        .iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(listed, vec![a.id, b.id]);
    assert_eq!(
        service.list_children(OWNER, None).await.unwrap(),
        harness.store.list_children(OWNER, None).unwrap()
    );
}

#[tokio::test]
async fn test_move_between_cached_listings_converges() {
    let harness = Harness::in_memory();
    let service = &harness.service;
    let src = service.create_folder(OWNER, "Src", None).await.unwrap();
    let dst = service.create_folder(OWNER, "Dst", None).await.unwrap();
    let item = service.create_folder(OWNER, "Item", Some(src.id)).await.unwrap();
    let keep = service.create_folder(OWNER, "Keep", Some(src.id)).await.unwrap();

    assert_eq!(service.list_children(OWNER, Some(src.id)).await.unwrap().len(), 2);
    assert!(service.list_children(OWNER, Some(dst.id)).await.unwrap().is_empty());

    service.move_node(OWNER, item.id, Some(dst.id)).await.unwrap();
    harness.drain().await;

    assert_eq!(harness.raw_listing(Some(src.id)).await, Some(vec![keep.id.to_string()]));
    assert_eq!(harness.raw_listing(Some(dst.id)).await, Some(vec![item.id.to_string()]));

    let moved: Vec<i64> = service
        .list_children(OWNER, Some(dst.id))
        .await
        .unwrap()
        .iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(moved, vec![item.id]);
    assert_eq!(
        service.list_children(OWNER, Some(src.id)).await.unwrap(),
        harness.store.list_children(OWNER, Some(src.id)).unwrap()
    );
}

#[tokio::test]
async fn test_name_conflicts_resolve_deterministically() {
    let harness = Harness::in_memory();
    let service = &harness.service;

    let names: Vec<String> = [
        service.create_file(OWNER, upload("a.txt", None, "x")).await.unwrap(),
        service.create_file(OWNER, upload("a.txt", None, "y")).await.unwrap(),
        service.create_file(OWNER, upload("a.txt", None, "z")).await.unwrap(),
    ]
    .into_iter()
    .map(|n| n.name)
    .collect();
    assert_eq!(names, vec!["a.txt", "a (1).txt", "a (2).txt"]);
}

#[tokio::test]
async fn test_shared_content_released_exactly_once() {
    for reverse in [false, true] {
        let mut harness = Harness::in_memory();
        let service = &harness.service;
        let first = service.create_file(OWNER, upload("one.bin", None, "shared")).await.unwrap();
        let second = service.create_file(OWNER, upload("two.bin", None, "shared")).await.unwrap();
        let order = if reverse { [second.id, first.id] } else { [first.id, second.id] };

        for id in order {
            service.permanent_delete(OWNER, id).await.unwrap();
        }

        let task = harness.deletions.try_recv().unwrap();
        assert_eq!(task.storage_key, "objects/shared");
        assert_eq!(task.file_id, order[1]);
        assert!(harness.deletions.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_closed_deletion_queue_keeps_tasks_in_outcome() {
    let harness = Harness::in_memory();
    let file = harness
        .service
        .create_file(OWNER, upload("solo.bin", None, "solo"))
        .await
        .unwrap();
    drop(harness.deletions);

    let outcome = harness.service.permanent_delete(OWNER, file.id).await.unwrap();
    assert_eq!(outcome.deletion_tasks.len(), 1);
    assert_eq!(outcome.deletion_tasks[0].storage_key, "objects/solo");
    let row = harness.store.get(file.id).unwrap().unwrap();
    assert_eq!(row.status, FileStatus::Deleting);
}

#[tokio::test]
async fn test_negative_cache_skips_store() {
    let counting = CountingStore::new(Arc::new(MemoryFileStore::new()));
    let calls = counting.calls();
    let harness = Harness::new(Arc::new(counting));

    assert!(harness.service.repository().find_by_id(404).await.unwrap().is_none());
    assert!(harness.service.repository().find_by_id(404).await.unwrap().is_none());
    assert_eq!(StoreCalls::count(&calls.get), 1);

    let err = harness.service.get(OWNER, 404).await.unwrap_err();
    assert!(matches!(err, ServiceError::Tree(TreeError::NotFound(_))));
    assert_eq!(StoreCalls::count(&calls.get), 1);
}

#[tokio::test]
async fn test_content_hash_lookup_is_cached() {
    let counting = CountingStore::new(Arc::new(MemoryFileStore::new()));
    let calls = counting.calls();
    let harness = Harness::new(Arc::new(counting));
    let service = &harness.service;

    let file = service.create_file(OWNER, upload("a.txt", None, "cafe")).await.unwrap();
    assert_eq!(service.find_by_content_hash("cafe").await.unwrap().map(|n| n.id), Some(file.id));
    assert_eq!(service.find_by_content_hash("cafe").await.unwrap().map(|n| n.id), Some(file.id));
    assert_eq!(StoreCalls::count(&calls.find_by_content_hash), 1);

    // deleting the row drops the lookup after commit
    service.soft_delete(OWNER, file.id).await.unwrap();
    assert!(service.find_by_content_hash("cafe").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cache_outage_degrades_to_store() {
    let harness = Harness::in_memory();
    let service = &harness.service;
    harness.cache.set_unavailable(true);

    let folder = service.create_folder(OWNER, "Offline", None).await.unwrap();
    assert_eq!(service.get(OWNER, folder.id).await.unwrap().name, "Offline");
    assert_eq!(service.list_children(OWNER, None).await.unwrap().len(), 1);

    harness.cache.set_unavailable(false);
    assert!(harness.cache.is_empty());
}

#[tokio::test]
async fn test_reads_check_ownership() {
    let harness = Harness::in_memory();
    let service = &harness.service;
    let folder = service.create_folder(OWNER, "Private", None).await.unwrap();

    let err = service.get(OWNER + 1, folder.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Tree(TreeError::PermissionDenied(_))));
    let err = service.list_children(OWNER + 1, Some(folder.id)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Tree(TreeError::PermissionDenied(_))));
}

#[tokio::test]
async fn test_moved_folder_descendants_reload_paths() {
    let harness = Harness::in_memory();
    let service = &harness.service;
    let docs = service.create_folder(OWNER, "Docs", None).await.unwrap();
    let file = service.create_file(OWNER, upload("a.txt", Some(docs.id), "h")).await.unwrap();
    let archive = service.create_folder(OWNER, "Archive", None).await.unwrap();

    // cache the descendant under its old path
    assert_eq!(service.get(OWNER, file.id).await.unwrap().path, "/Docs/");

    service.move_node(OWNER, docs.id, Some(archive.id)).await.unwrap();
    harness.drain().await;

    assert_eq!(service.get(OWNER, file.id).await.unwrap().path, "/Archive/Docs/");
}

#[tokio::test]
async fn test_spawned_consumers_stop_on_cancel() {
    let harness = Harness::in_memory();
    let cancel = CancellationToken::new();
    let handles = harness.service.spawn_consumers(&cancel);

    cancel.cancel();
    for handle in handles {
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
