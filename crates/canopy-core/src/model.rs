//! File-tree data model
//!
//! A [`FileNode`] is one row of the namespace. Its `path` is the materialized
//! path of the directory that contains it, always ending in `/`; the node's
//! own location is [`FileNode::full_path`]. Root-level nodes have `path == "/"`
//! and `parent_id == None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::paths;

/// Row identifier of a file or folder
pub type FileId = i64;

/// Tenant identifier owning a subtree
pub type OwnerId = i64;

/// Lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Visible to listings and reads
    Normal,
    /// In the recycle bin; hidden from listings, addressable for restore
    Recycled,
    /// Being permanently removed inside a transaction
    Deleting,
}

impl FileStatus {
    /// Stable storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Normal => "normal",
            FileStatus::Recycled => "recycled",
            FileStatus::Deleting => "deleting",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(FileStatus::Normal),
            "recycled" => Ok(FileStatus::Recycled),
            "deleting" => Ok(FileStatus::Deleting),
            other => Err(format!("unknown file status: {}", other)),
        }
    }
}

/// Location of a file's bytes in object storage
///
/// Several rows may share one reference when uploads are deduplicated by
/// content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef {
    /// Object-storage bucket
    pub bucket: String,
    /// Object key inside the bucket
    pub key: String,
    /// Content hash (hex MD5 in the upload pipeline)
    pub hash: String,
}

impl ContentRef {
    /// Create a content reference
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            hash: hash.into(),
        }
    }
}

/// A file or folder row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    /// Primary key
    pub id: FileId,
    /// Owning tenant
    pub owner_id: OwnerId,
    /// Containing folder; `None` for root-level nodes
    pub parent_id: Option<FileId>,
    /// Entry name, unique among same-type siblings
    pub name: String,
    /// Materialized path of the containing directory, ending in `/`
    pub path: String,
    /// Folder flag
    pub is_folder: bool,
    /// Size in bytes (0 for folders)
    pub size: u64,
    /// Content reference; `None` for folders
    pub content: Option<ContentRef>,
    /// Lifecycle status
    pub status: FileStatus,
    /// When the node entered the recycle bin
    pub deleted_at: Option<DateTime<Utc>>,
    /// Current version pointer maintained by the versioning subsystem
    pub version_id: Option<String>,
    /// Creation time; ordering key of directory listings
    pub created_at: DateTime<Utc>,
    /// Last metadata change
    pub updated_at: DateTime<Utc>,
}

impl FileNode {
    /// Absolute location of this node, e.g. `/Archive/Docs`
    pub fn full_path(&self) -> String {
        paths::full_path(&self.path, &self.name)
    }

    /// Materialized `path` value of this node's children
    pub fn child_path(&self) -> String {
        paths::child_path(&self.path, &self.name)
    }

    /// Content hash, if the node carries content
    pub fn content_hash(&self) -> Option<&str> {
        self.content.as_ref().map(|c| c.hash.as_str())
    }

    /// Whether normal listings and reads should show this node
    pub fn is_visible(&self) -> bool {
        self.status == FileStatus::Normal
    }

    /// Whether the node is in the recycle bin
    pub fn is_recycled(&self) -> bool {
        self.status == FileStatus::Recycled
    }

    /// Ordering score inside a directory listing (microseconds, exact in f64)
    pub fn listing_score(&self) -> f64 {
        self.created_at.timestamp_micros() as f64
    }

    /// Ordering score inside the recycle-bin listing
    pub fn recycle_score(&self) -> Option<f64> {
        self.deleted_at.map(|at| at.timestamp_micros() as f64)
    }
}

/// Row to insert; the store assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewFileNode {
    /// Owning tenant
    pub owner_id: OwnerId,
    /// Containing folder
    pub parent_id: Option<FileId>,
    /// Resolved, conflict-free name
    pub name: String,
    /// Materialized path of the containing directory
    pub path: String,
    /// Folder flag
    pub is_folder: bool,
    /// Size in bytes
    pub size: u64,
    /// Content reference for files
    pub content: Option<ContentRef>,
    /// Version pointer for files
    pub version_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl NewFileNode {
    /// Materialize the row once the store has assigned `id`
    pub fn into_node(self, id: FileId) -> FileNode {
        FileNode {
            id,
            owner_id: self.owner_id,
            parent_id: self.parent_id,
            name: self.name,
            path: self.path,
            is_folder: self.is_folder,
            size: self.size,
            content: self.content,
            status: FileStatus::Normal,
            deleted_at: None,
            version_id: self.version_id,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &str, name: &str) -> FileNode {
        NewFileNode {
            owner_id: 1,
            parent_id: None,
            name: name.to_string(),
            path: path.to_string(),
            is_folder: true,
            size: 0,
            content: None,
            version_id: None,
            created_at: Utc::now(),
        }
        .into_node(7)
    }

    #[test]
    fn test_status_round_trip() {
        for status in [FileStatus::Normal, FileStatus::Recycled, FileStatus::Deleting] {
            assert_eq!(status.as_str().parse::<FileStatus>().unwrap(), status);
        }
        assert!("gone".parse::<FileStatus>().is_err());
    }

    #[test]
    fn test_full_and_child_paths() {
        let root_level = node("/", "Docs");
        assert_eq!(root_level.full_path(), "/Docs");
        assert_eq!(root_level.child_path(), "/Docs/");

        let nested = node("/Archive/", "Docs");
        assert_eq!(nested.full_path(), "/Archive/Docs");
        assert_eq!(nested.child_path(), "/Archive/Docs/");
    }

    #[test]
    fn test_new_node_starts_normal() {
        let n = node("/", "a");
        assert_eq!(n.status, FileStatus::Normal);
        assert!(n.is_visible());
        assert!(n.recycle_score().is_none());
        assert_eq!(n.created_at, n.updated_at);
    }
}
