//! Row mapping and `_with_conn` query helpers
//!
//! Every query takes a plain `&Connection` so the same SQL serves reads on
//! the store and reads inside an open transaction.

use canopy_core::{ContentRef, FileId, FileNode, FileStatus, NewFileNode, OwnerId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;

use crate::error::{SqliteError, SqliteResult};

/// Id lists are bound in chunks below SQLite's variable limit
const ID_CHUNK: usize = 500;

const COLUMNS: &str = "id, owner_id, parent_id, name, path, is_folder, size, bucket, storage_key, \
                       content_hash, status, deleted_at, version_id, created_at, updated_at";

/// Fixed-width UTC timestamps keep text ordering equal to time ordering
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_node(row: &Row) -> rusqlite::Result<FileNode> {
    let bucket: Option<String> = row.get(7)?;
    let storage_key: Option<String> = row.get(8)?;
    let content_hash: Option<String> = row.get(9)?;
    let status: String = row.get(10)?;
    let deleted_at: Option<String> = row.get(11)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    let size: i64 = row.get(6)?;

    let content = match (bucket, storage_key, content_hash) {
        (Some(bucket), Some(key), Some(hash)) => Some(ContentRef { bucket, key, hash }),
        _ => None,
    };

    Ok(FileNode {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        path: row.get(4)?,
        is_folder: row.get(5)?,
        size: size.max(0) as u64,
        content,
        status: status
            .parse::<FileStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, e.into()))?,
        deleted_at: deleted_at.as_deref().map(|s| parse_ts(11, s)).transpose()?,
        version_id: row.get(12)?,
        created_at: parse_ts(13, &created_at)?,
        updated_at: parse_ts(14, &updated_at)?,
    })
}

fn query_nodes<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> SqliteResult<Vec<FileNode>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, row_to_node)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub(crate) fn get_with_conn(conn: &Connection, id: FileId) -> SqliteResult<Option<FileNode>> {
    let sql = format!("SELECT {} FROM files WHERE id = ?1", COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.query_row([id], row_to_node).optional().map_err(Into::into)
}

pub(crate) fn list_children_with_conn(
    conn: &Connection,
    owner: OwnerId,
    parent: Option<FileId>,
) -> SqliteResult<Vec<FileNode>> {
    let sql = format!(
        "SELECT {} FROM files
         WHERE owner_id = ?1 AND parent_id IS ?2 AND status = 'normal'
         ORDER BY created_at, id",
        COLUMNS
    );
    query_nodes(conn, &sql, params![owner, parent])
}

pub(crate) fn children_of_with_conn(conn: &Connection, parent: FileId) -> SqliteResult<Vec<FileNode>> {
    let sql = format!("SELECT {} FROM files WHERE parent_id = ?1 ORDER BY id", COLUMNS);
    query_nodes(conn, &sql, [parent])
}

pub(crate) fn list_deleted_with_conn(conn: &Connection, owner: OwnerId) -> SqliteResult<Vec<FileNode>> {
    let sql = format!(
        "SELECT {} FROM files
         WHERE owner_id = ?1 AND status = 'recycled'
         ORDER BY deleted_at, id",
        COLUMNS
    );
    query_nodes(conn, &sql, [owner])
}

pub(crate) fn sibling_names_with_conn(
    conn: &Connection,
    owner: OwnerId,
    parent: Option<FileId>,
    is_folder: bool,
    exclude: Option<FileId>,
) -> SqliteResult<HashSet<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name FROM files
         WHERE owner_id = ?1 AND parent_id IS ?2 AND is_folder = ?3
           AND status = 'normal' AND id IS NOT ?4",
    )?;
    let names = stmt.query_map(params![owner, parent, is_folder, exclude], |row| row.get(0))?;
    names.collect::<rusqlite::Result<HashSet<String>>>().map_err(Into::into)
}

pub(crate) fn count_content_refs_with_conn(
    conn: &Connection,
    storage_key: &str,
    content_hash: &str,
) -> SqliteResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM files
         WHERE storage_key = ?1 AND content_hash = ?2 AND status IN ('normal', 'recycled')",
        params![storage_key, content_hash],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

pub(crate) fn find_by_content_hash_with_conn(
    conn: &Connection,
    content_hash: &str,
) -> SqliteResult<Option<FileNode>> {
    let sql = format!(
        "SELECT {} FROM files
         WHERE content_hash = ?1 AND is_folder = 0 AND status = 'normal'
         ORDER BY id LIMIT 1",
        COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.query_row([content_hash], row_to_node)
        .optional()
        .map_err(Into::into)
}

pub(crate) fn find_by_path_prefix_with_conn(
    conn: &Connection,
    owner: OwnerId,
    prefix: &str,
) -> SqliteResult<Vec<FileNode>> {
    // substr comparison instead of LIKE: names may contain % and _
    let sql = format!(
        "SELECT {} FROM files
         WHERE owner_id = ?1 AND substr(path, 1, length(?2)) = ?2
         ORDER BY id",
        COLUMNS
    );
    query_nodes(conn, &sql, params![owner, prefix])
}

pub(crate) fn insert_with_conn(conn: &Connection, node: NewFileNode) -> SqliteResult<FileNode> {
    let content = node.content.as_ref();
    conn.execute(
        "INSERT INTO files (owner_id, parent_id, name, path, is_folder, size, bucket, storage_key,
                            content_hash, status, version_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'normal', ?10, ?11, ?11)",
        params![
            node.owner_id,
            node.parent_id,
            node.name,
            node.path,
            node.is_folder,
            node.size as i64,
            content.map(|c| c.bucket.as_str()),
            content.map(|c| c.key.as_str()),
            content.map(|c| c.hash.as_str()),
            node.version_id,
            fmt_ts(&node.created_at),
        ],
    )?;
    Ok(node.into_node(conn.last_insert_rowid()))
}

pub(crate) fn update_with_conn(conn: &Connection, node: &FileNode) -> SqliteResult<()> {
    let content = node.content.as_ref();
    let changed = conn.execute(
        "UPDATE files SET
             parent_id = ?2, name = ?3, path = ?4, size = ?5, bucket = ?6, storage_key = ?7,
             content_hash = ?8, status = ?9, deleted_at = ?10, version_id = ?11, updated_at = ?12
         WHERE id = ?1",
        params![
            node.id,
            node.parent_id,
            node.name,
            node.path,
            node.size as i64,
            content.map(|c| c.bucket.as_str()),
            content.map(|c| c.key.as_str()),
            content.map(|c| c.hash.as_str()),
            node.status.as_str(),
            node.deleted_at.as_ref().map(fmt_ts),
            node.version_id,
            fmt_ts(&node.updated_at),
        ],
    )?;
    if changed == 0 {
        return Err(SqliteError::NotFound(format!("file {}", node.id)));
    }
    Ok(())
}

pub(crate) fn rewrite_subtree_paths_with_conn(
    conn: &Connection,
    root: FileId,
    old_prefix: &str,
    new_prefix: &str,
) -> SqliteResult<u64> {
    let changed = conn.execute(
        "WITH RECURSIVE subtree(id) AS (
             SELECT id FROM files WHERE parent_id = ?1
             UNION
             SELECT f.id FROM files f JOIN subtree s ON f.parent_id = s.id
         )
         UPDATE files
         SET path = ?3 || substr(path, length(?2) + 1)
         WHERE id IN (SELECT id FROM subtree)
           AND substr(path, 1, length(?2)) = ?2",
        params![root, old_prefix, new_prefix],
    )?;
    Ok(changed as u64)
}

pub(crate) fn set_status_with_conn(
    conn: &Connection,
    ids: &[FileId],
    status: FileStatus,
    deleted_at: Option<DateTime<Utc>>,
    changed_at: DateTime<Utc>,
) -> SqliteResult<()> {
    let deleted_at = deleted_at.as_ref().map(fmt_ts);
    let changed_at = fmt_ts(&changed_at);
    for chunk in ids.chunks(ID_CHUNK) {
        let sql = format!(
            "UPDATE files SET status = ?, deleted_at = ?, updated_at = ? WHERE id IN ({})",
            placeholders(chunk.len())
        );
        let mut values: Vec<rusqlite::types::Value> = vec![
            status.as_str().to_string().into(),
            deleted_at.clone().into(),
            changed_at.clone().into(),
        ];
        values.extend(chunk.iter().map(|id| rusqlite::types::Value::Integer(*id)));
        conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(())
}

pub(crate) fn delete_with_conn(conn: &Connection, ids: &[FileId]) -> SqliteResult<()> {
    for chunk in ids.chunks(ID_CHUNK) {
        let sql = format!("DELETE FROM files WHERE id IN ({})", placeholders(chunk.len()));
        conn.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    Ok(())
}
