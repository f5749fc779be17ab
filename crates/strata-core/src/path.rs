//! Helpers for slash-separated relative storage paths.
//!
//! Paths are always relative to one storage instance; the empty string
//! denotes the storage root. No wrapper may hand a path across a layer
//! boundary without agreeing on which instance it is relative to — the Jail
//! and Encoding wrappers perform that translation explicitly.

/// Normalize a relative path: collapse duplicate slashes, trim leading and
/// trailing slashes, drop `.` segments.
///
/// `..` is not resolved; storages reject it instead of letting a caller
/// climb out of the tree.
#[must_use]
pub fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join two relative paths, tolerating empty sides.
#[must_use]
pub fn join(base: &str, tail: &str) -> String {
    let base = normalize(base);
    let tail = normalize(tail);
    if base.is_empty() {
        tail
    } else if tail.is_empty() {
        base
    } else {
        format!("{base}/{tail}")
    }
}

/// Parent of a path (`""` for top-level entries and the root itself).
#[must_use]
pub fn parent(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// Final segment of a path (`""` for the root).
#[must_use]
pub fn file_name(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(idx) => path[idx + 1..].to_string(),
        None => path,
    }
}

/// Whether `path` equals `prefix` or lives underneath it. An empty prefix
/// contains everything.
#[must_use]
pub fn is_under(path: &str, prefix: &str) -> bool {
    let path = normalize(path);
    let prefix = normalize(prefix);
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

/// Strip `prefix` from `path`, returning the remainder relative to the
/// prefix. `None` when the path is not under the prefix.
#[must_use]
pub fn strip_prefix(path: &str, prefix: &str) -> Option<String> {
    let path = normalize(path);
    let prefix = normalize(prefix);
    if prefix.is_empty() {
        return Some(path);
    }
    if path == prefix {
        return Some(String::new());
    }
    path.strip_prefix(&format!("{prefix}/")).map(str::to_string)
}

/// Whether the path names an in-progress partial upload.
///
/// Part files are exempt from the quota stream limiter; their finalizing
/// rename is quota-checked instead.
#[must_use]
pub fn is_part_file(path: &str) -> bool {
    file_name(path).ends_with(".part")
}
