//! Core of the Canopy file-tree metadata service
//!
//! The namespace is an arena of rows addressed by integer id. Each row keeps
//! a materialized `path` (the ancestry of its containing directory) which the
//! [`engine::TreeEngine`] recomputes transactionally on every structural
//! change. Stores implement [`store::FileStore`]; the engine never walks
//! in-memory parent pointers.
//!
//! ## Modules
//!
//! - [`model`]: `FileNode`, status and content reference types
//! - [`store`]: store and transaction contracts
//! - [`engine`]: create/rename/move/soft-delete/restore/permanent-delete
//! - [`naming`]: name validation and `"name (n).ext"` conflict resolution
//! - [`events`]: invalidation events and physical-deletion hand-off

pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod naming;
pub mod paths;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use engine::{MutationOutcome, NewFile, NodeChange, TreeEngine};
pub use error::{StoreError, StoreResult, TreeError, TreeResult};
pub use events::{
    ChannelDeletionQueue, DeletionQueue, InvalidationEvent, PathRenameEvent,
    PhysicalDeletionTask, PriorState, UpdateEvent,
};
pub use model::{ContentRef, FileId, FileNode, FileStatus, NewFileNode, OwnerId};
pub use store::{FileReader, FileStore, StoreTransaction};
