//! Cache key layout
//!
//! These strings are shared with every other process reading the cache and
//! must not change.

use canopy_core::{FileId, OwnerId};

/// Member marking a listing confirmed empty
pub const EMPTY_LIST: &str = "__EMPTY_LIST__";

/// Field (and string value) marking an id or hash confirmed absent
pub const NOT_FOUND: &str = "__NOT_FOUND__";

/// Row-level update stream
pub const UPDATE_STREAM: &str = "file_cache_updates";

/// Consumer group of [`UPDATE_STREAM`]
pub const UPDATE_GROUP: &str = "file_cache_group";

/// Subtree path change stream
pub const PATH_STREAM: &str = "cache_path_invalidation_stream";

/// Consumer group of [`PATH_STREAM`]
pub const PATH_GROUP: &str = "path_invalidation_group";

/// Field carrying the JSON event in stream messages
pub const EVENT_FIELD: &str = "event";

/// `file:metadata:<id>`
pub fn metadata(id: FileId) -> String {
    format!("file:metadata:{}", id)
}

/// `files:user:<owner>:folder:root` or `files:user:<owner>:folder:<parent>`
pub fn listing(owner: OwnerId, parent: Option<FileId>) -> String {
    match parent {
        Some(parent) => format!("files:user:{}:folder:{}", owner, parent),
        None => format!("files:user:{}:folder:root", owner),
    }
}

/// `files:deleted:user:<owner>`
pub fn recycle_bin(owner: OwnerId) -> String {
    format!("files:deleted:user:{}", owner)
}

/// `file:md5:<hash>`
pub fn content_hash(hash: &str) -> String {
    format!("file:md5:{}", hash)
}
