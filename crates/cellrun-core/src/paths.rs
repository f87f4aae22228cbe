//! Path-safety helper used by the file-storage and file-run call sites.
//!
//! Ported from `core/utils/file_utils.py`'s `secure_relative_file_path`: strip
//! every `..` occurrence (string-level, not path-component-aware, which
//! matters for inputs like `..ssh` where the traversal marker is fused to a
//! legitimate segment name), strip every `~` character anywhere in the
//! string, and collapse repeated separators. The result is always relative
//! and never contains a `..` segment or a `~`, so joining it with any root
//! directory cannot escape that root.

use std::path::PathBuf;

/// Neutralise `p` into a path that is safe to join under a root directory.
pub fn secure_relative_file_path(p: &str) -> PathBuf {
    let stripped = p.replace("..", "").replace('~', "");

    let segments: Vec<&str> = stripped.split('/').filter(|s| !s.is_empty()).collect();

    PathBuf::from(segments.join("/"))
}
