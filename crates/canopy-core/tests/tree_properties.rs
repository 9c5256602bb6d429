//! Property-based tests for tree invariants
//!
//! Random sequences of structural operations must never produce a cycle,
//! a stale materialized path, or two visible same-type siblings sharing a
//! name, whether each operation succeeds or is rejected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use canopy_config::EngineConfig;
use canopy_core::engine::NewFile;
use canopy_core::test_support::MemoryFileStore;
use canopy_core::{ContentRef, FileId, FileNode, TreeEngine, TreeError};
use proptest::prelude::*;

const OWNER: i64 = 1;
const NAMES: [&str; 4] = ["Docs", "a.txt", "Archive", "b"];

#[derive(Debug, Clone)]
enum Op {
    CreateFolder { name: usize, parent: usize },
    CreateFile { name: usize, parent: usize },
    Rename { target: usize, name: usize },
    Move { target: usize, parent: usize },
    SoftDelete { target: usize },
    Restore { target: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..NAMES.len(), 0usize..16).prop_map(|(name, parent)| Op::CreateFolder { name, parent }),
        (0..NAMES.len(), 0usize..16).prop_map(|(name, parent)| Op::CreateFile { name, parent }),
        (0usize..16, 0..NAMES.len()).prop_map(|(target, name)| Op::Rename { target, name }),
        (0usize..16, 0usize..16).prop_map(|(target, parent)| Op::Move { target, parent }),
        (0usize..16).prop_map(|target| Op::SoftDelete { target }),
        (0usize..16).prop_map(|target| Op::Restore { target }),
    ]
}

/// Pick an existing id by index; index 0 and out-of-range indexes mean root
fn pick(ids: &[FileId], idx: usize) -> Option<FileId> {
    if idx == 0 || ids.is_empty() {
        None
    } else {
        Some(ids[(idx - 1) % ids.len()])
    }
}

fn apply(engine: &TreeEngine, ids: &mut Vec<FileId>, op: &Op) -> Result<(), TreeError> {
    let outcome = match *op {
        Op::CreateFolder { name, parent } => engine.create_folder(OWNER, NAMES[name], pick(ids, parent))?,
        Op::CreateFile { name, parent } => engine.create_file(
            OWNER,
            NewFile {
                name: NAMES[name].to_string(),
                parent_id: pick(ids, parent),
                size: 1,
                content: ContentRef::new("bucket", "key", "hash"),
                version_id: None,
            },
        )?,
        Op::Rename { target, name } => match pick(ids, target + 1) {
            Some(id) => engine.rename(OWNER, id, NAMES[name])?,
            None => return Ok(()),
        },
        Op::Move { target, parent } => match pick(ids, target + 1) {
            Some(id) => engine.move_node(OWNER, id, pick(ids, parent))?,
            None => return Ok(()),
        },
        Op::SoftDelete { target } => match pick(ids, target + 1) {
            Some(id) => engine.soft_delete(OWNER, id)?,
            None => return Ok(()),
        },
        Op::Restore { target } => match pick(ids, target + 1) {
            Some(id) => engine.restore(OWNER, id)?,
            None => return Ok(()),
        },
    };
    if let Some(node) = outcome.node {
        if !ids.contains(&node.id) {
            ids.push(node.id);
        }
    }
    Ok(())
}

fn check_invariants(rows: &[FileNode]) -> Result<(), TestCaseError> {
    let by_id: HashMap<FileId, &FileNode> = rows.iter().map(|n| (n.id, n)).collect();

    for node in rows {
        // parent chain terminates within the number of rows
        let mut seen = HashSet::new();
        let mut cursor = node.parent_id;
        while let Some(pid) = cursor {
            prop_assert!(seen.insert(pid), "cycle through {}", pid);
            cursor = by_id.get(&pid).and_then(|p| p.parent_id);
        }

        let expected = match node.parent_id.and_then(|pid| by_id.get(&pid)) {
            Some(parent) => parent.child_path(),
            None => "/".to_string(),
        };
        prop_assert_eq!(&node.path, &expected, "stale path on {}", node.id);
    }

    let mut names = HashSet::new();
    for node in rows.iter().filter(|n| n.is_visible()) {
        prop_assert!(
            names.insert((node.parent_id, node.is_folder, node.name.clone())),
            "duplicate sibling name {:?}",
            node.name
        );
    }
    Ok(())
}

proptest! {
    /// Property: every operation sequence leaves the tree acyclic with fresh paths
    #[test]
    fn operations_preserve_tree_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let store = Arc::new(MemoryFileStore::new());
        let engine = TreeEngine::new(store.clone(), EngineConfig::default());
        let mut ids = Vec::new();

        for op in &ops {
            match apply(&engine, &mut ids, op) {
                Ok(()) => {}
                Err(TreeError::TransientStore(msg)) | Err(TreeError::StorageReference(msg)) => {
                    prop_assert!(false, "unexpected store failure: {}", msg);
                }
                Err(_) => {}
            }
            check_invariants(&store.all_rows())?;
        }
    }

    /// Property: moving a folder into itself or any descendant always fails
    #[test]
    fn move_into_own_subtree_rejected(depth in 1usize..6, pick_target in 0usize..6) {
        let store = Arc::new(MemoryFileStore::new());
        let engine = TreeEngine::new(store.clone(), EngineConfig::default());

        let mut chain = Vec::new();
        let mut parent = None;
        for level in 0..depth {
            let node = engine
                .create_folder(OWNER, &format!("level{}", level), parent)
                .unwrap()
                .node
                .unwrap();
            parent = Some(node.id);
            chain.push(node.id);
        }

        let target = chain[pick_target % chain.len()];
        let err = engine.move_node(OWNER, chain[0], Some(target)).unwrap_err();
        prop_assert!(matches!(err, TreeError::InvalidOperation(_)));
        check_invariants(&store.all_rows())?;
    }
}

#[test]
fn moved_folder_rewrites_every_descendant_path() {
    let store = Arc::new(MemoryFileStore::new());
    let engine = TreeEngine::new(store.clone(), EngineConfig::default());

    let docs = engine.create_folder(OWNER, "Docs", None).unwrap().node.unwrap();
    let deep = engine.create_folder(OWNER, "deep", Some(docs.id)).unwrap().node.unwrap();
    let deeper = engine.create_folder(OWNER, "deeper", Some(deep.id)).unwrap().node.unwrap();
    let archive = engine.create_folder(OWNER, "Archive", None).unwrap().node.unwrap();

    let outcome = engine.move_node(OWNER, docs.id, Some(archive.id)).unwrap();
    assert_eq!(outcome.path_renames.len(), 1);
    assert_eq!(outcome.path_renames[0].old_prefix, "/Docs/");
    assert_eq!(outcome.path_renames[0].new_prefix, "/Archive/Docs/");

    let rows = store.all_rows();
    let deeper = rows.iter().find(|n| n.id == deeper.id).unwrap();
    assert_eq!(deeper.full_path(), "/Archive/Docs/deep/deeper");
    check_invariants(&rows).unwrap();
}
