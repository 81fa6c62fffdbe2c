//! Dotted-path helpers.
//!
//! Paths address nodes by sibling-unique names joined with `.`, starting at the
//! root name for absolute paths: `qdaq.loop.t`.

use crate::error::{QDaqError, Result};

/// Path separator.
pub const SEPARATOR: char = '.';

/// Check that `name` can be used as a node name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(SEPARATOR) || name.chars().any(char::is_whitespace) {
        return Err(QDaqError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Split a dotted path into segments. Empty segments are reported as missing.
pub fn segments(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split(SEPARATOR).collect();
    if let Some(empty) = parts.iter().find(|s| s.is_empty()) {
        return Err(QDaqError::not_found(path, *empty));
    }
    Ok(parts)
}

/// Join a parent path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    let mut out = String::with_capacity(parent.len() + name.len() + 1);
    out.push_str(parent);
    out.push(SEPARATOR);
    out.push_str(name);
    out
}
