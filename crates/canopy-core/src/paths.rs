//! Materialized path helpers
//!
//! Paths are plain strings. A directory path always ends in `/`, which keeps
//! prefix tests exact: `/Docs/` is not a prefix of `/Docs2/`.

/// Materialized path of root-level nodes
pub const ROOT_PATH: &str = "/";

/// Location of a node given its containing directory path and its name
pub fn full_path(dir_path: &str, name: &str) -> String {
    format!("{}{}", dir_path, name)
}

/// Directory path of the children of a node
pub fn child_path(dir_path: &str, name: &str) -> String {
    format!("{}{}/", dir_path, name)
}

/// Whether `candidate_dir` is `ancestor_dir` itself or lies beneath it
///
/// Both arguments are directory paths ending in `/`.
pub fn is_within(candidate_dir: &str, ancestor_dir: &str) -> bool {
    candidate_dir.starts_with(ancestor_dir)
}

/// Replace a leading `old_prefix` with `new_prefix`
///
/// Returns `None` when `path` does not start with `old_prefix`.
pub fn rewrite_prefix(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    path.strip_prefix(old_prefix)
        .map(|rest| format!("{}{}", new_prefix, rest))
}
