//! Wire encoding of cached values and stream messages
//!
//! Sentinels stay strings on the wire (other readers of the cache expect
//! them) but never leave this module: callers see [`MetadataEntry`] and
//! [`ListingEntry`].

use canopy_core::{ContentRef, FileId, FileNode, FileStatus, InvalidationEvent};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

use crate::backend::StreamMessage;
use crate::error::{CacheError, CacheResult};
use crate::keys::{EMPTY_LIST, EVENT_FIELD, NOT_FOUND};

/// Decoded metadata hash
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataEntry {
    /// Cached attributes
    Present(FileNode),
    /// The id is confirmed absent
    NotFound,
}

impl MetadataEntry {
    /// The node, if present
    pub fn into_node(self) -> Option<FileNode> {
        match self {
            MetadataEntry::Present(node) => Some(node),
            MetadataEntry::NotFound => None,
        }
    }
}

/// Decoded listing set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingEntry {
    /// Member ids by ascending score
    Members(Vec<FileId>),
    /// The listing is confirmed empty
    ConfirmedEmpty,
}

impl ListingEntry {
    /// Member ids (none when confirmed empty)
    pub fn into_ids(self) -> Vec<FileId> {
        match self {
            ListingEntry::Members(ids) => ids,
            ListingEntry::ConfirmedEmpty => Vec::new(),
        }
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Hash fields for a node
pub fn encode_node(node: &FileNode) -> Vec<(String, String)> {
    let mut fields = vec![
        ("id".to_string(), node.id.to_string()),
        ("owner_id".to_string(), node.owner_id.to_string()),
        ("name".to_string(), node.name.clone()),
        ("path".to_string(), node.path.clone()),
        ("is_folder".to_string(), if node.is_folder { "1" } else { "0" }.to_string()),
        ("size".to_string(), node.size.to_string()),
        ("status".to_string(), node.status.as_str().to_string()),
        ("created_at".to_string(), ts(&node.created_at)),
        ("updated_at".to_string(), ts(&node.updated_at)),
    ];
    if let Some(parent) = node.parent_id {
        fields.push(("parent_id".to_string(), parent.to_string()));
    }
    if let Some(content) = &node.content {
        fields.push(("bucket".to_string(), content.bucket.clone()));
        fields.push(("storage_key".to_string(), content.key.clone()));
        fields.push(("content_hash".to_string(), content.hash.clone()));
    }
    if let Some(deleted_at) = &node.deleted_at {
        fields.push(("deleted_at".to_string(), ts(deleted_at)));
    }
    if let Some(version) = &node.version_id {
        fields.push(("version_id".to_string(), version.clone()));
    }
    fields
}

/// Hash fields of a negative entry
pub fn encode_not_found() -> Vec<(String, String)> {
    vec![(NOT_FOUND.to_string(), "1".to_string())]
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> CacheResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| CacheError::codec(format!("metadata field '{}' missing", name)))
}

fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> CacheResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| CacheError::codec(format!("metadata field '{}': {}", name, e)))
}

fn parse_ts(name: &str, raw: &str) -> CacheResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CacheError::codec(format!("metadata field '{}': {}", name, e)))
}

/// Decode a metadata hash; `None` when the key was missing
pub fn decode_metadata(fields: &HashMap<String, String>) -> CacheResult<Option<MetadataEntry>> {
    if fields.is_empty() {
        return Ok(None);
    }
    if fields.contains_key(NOT_FOUND) {
        return Ok(Some(MetadataEntry::NotFound));
    }

    let content = match (
        fields.get("bucket"),
        fields.get("storage_key"),
        fields.get("content_hash"),
    ) {
        (Some(bucket), Some(key), Some(hash)) => Some(ContentRef::new(bucket, key, hash)),
        _ => None,
    };

    let node = FileNode {
        id: parse("id", required(fields, "id")?)?,
        owner_id: parse("owner_id", required(fields, "owner_id")?)?,
        parent_id: fields
            .get("parent_id")
            .map(|raw| parse("parent_id", raw))
            .transpose()?,
        name: required(fields, "name")?.to_string(),
        path: required(fields, "path")?.to_string(),
        is_folder: required(fields, "is_folder")? == "1",
        size: parse("size", required(fields, "size")?)?,
        content,
        status: parse::<FileStatus>("status", required(fields, "status")?)?,
        deleted_at: fields
            .get("deleted_at")
            .map(|raw| parse_ts("deleted_at", raw))
            .transpose()?,
        version_id: fields.get("version_id").cloned(),
        created_at: parse_ts("created_at", required(fields, "created_at")?)?,
        updated_at: parse_ts("updated_at", required(fields, "updated_at")?)?,
    };
    Ok(Some(MetadataEntry::Present(node)))
}

/// Sorted-set members for a listing (the empty sentinel when no nodes)
pub fn encode_listing(entries: impl IntoIterator<Item = (FileId, f64)>) -> Vec<(String, f64)> {
    let members: Vec<(String, f64)> = entries
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    if members.is_empty() {
        vec![(EMPTY_LIST.to_string(), 0.0)]
    } else {
        members
    }
}

/// Decode listing members; `None` when the key was missing
pub fn decode_listing(members: Option<Vec<String>>) -> CacheResult<Option<ListingEntry>> {
    let Some(members) = members else {
        return Ok(None);
    };
    let ids = members
        .iter()
        .filter(|m| m.as_str() != EMPTY_LIST)
        .map(|m| {
            m.parse::<FileId>()
                .map_err(|e| CacheError::codec(format!("listing member '{}': {}", m, e)))
        })
        .collect::<CacheResult<Vec<_>>>()?;

    if ids.is_empty() {
        Ok(Some(ListingEntry::ConfirmedEmpty))
    } else {
        Ok(Some(ListingEntry::Members(ids)))
    }
}

/// Decode the dedup lookup value; `Some(None)` for a negative entry
pub fn decode_hash_lookup(value: Option<String>) -> CacheResult<Option<Option<FileId>>> {
    match value.as_deref() {
        None => Ok(None),
        Some(NOT_FOUND) => Ok(Some(None)),
        Some(raw) => Ok(Some(Some(parse("file:md5", raw)?))),
    }
}

/// Stream fields for an event
pub fn encode_event(event: &InvalidationEvent) -> CacheResult<Vec<(String, String)>> {
    Ok(vec![(EVENT_FIELD.to_string(), serde_json::to_string(event)?)])
}

/// Event carried by a stream message
pub fn decode_event(message: &StreamMessage) -> CacheResult<InvalidationEvent> {
    let raw = message
        .field(EVENT_FIELD)
        .ok_or_else(|| CacheError::codec(format!("message {} has no event field", message.id)))?;
    Ok(serde_json::from_str(raw)?)
}
