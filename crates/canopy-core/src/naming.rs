//! Entry name validation and sibling conflict resolution

use std::collections::HashSet;

use crate::error::{TreeError, TreeResult};

/// Longest accepted name, in bytes
pub const MAX_NAME_BYTES: usize = 255;

/// Reject names that cannot live in a materialized path
pub fn validate_name(name: &str) -> TreeResult<()> {
    if name.is_empty() {
        return Err(TreeError::invalid("name must not be empty"));
    }
    if name == "." || name == ".." {
        return Err(TreeError::invalid(format!("'{}' is a reserved name", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(TreeError::invalid(format!(
            "name '{}' contains a path separator or NUL",
            name
        )));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(TreeError::invalid(format!(
            "name exceeds {} bytes",
            MAX_NAME_BYTES
        )));
    }
    Ok(())
}

/// Split `a.txt` into `("a", ".txt")`
///
/// Dotfiles such as `.env` and names ending in a dot have no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Pick a name that does not collide with `taken`
///
/// Returns `desired` unchanged when it is free. Otherwise tries
/// `"<base> (<n>)<ext>"` for n = 1, 2, ... (folders keep the whole name as
/// base) and fails with [`TreeError::Conflict`] after `max_attempts` attempts.
pub fn resolve_conflict(
    desired: &str,
    is_folder: bool,
    taken: &HashSet<String>,
    max_attempts: u32,
) -> TreeResult<String> {
    if !taken.contains(desired) {
        return Ok(desired.to_string());
    }

    let (base, ext) = if is_folder {
        (desired, "")
    } else {
        split_extension(desired)
    };

    for n in 1..=max_attempts {
        let candidate = format!("{} ({}){}", base, n, ext);
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }

    Err(TreeError::Conflict(format!(
        "no free name for '{}' after {} attempts",
        desired, max_attempts
    )))
}
