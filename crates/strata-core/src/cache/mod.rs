//! Metadata/cache store collaborator.
//!
//! The chain consumes a path-keyed metadata record store: sizes, mtimes,
//! mimetypes, permissions, the encrypted flag and version, and checksum
//! tokens. Quota derives its usage totals from it, Encryption keeps the
//! logical (plaintext) size in it, Checksum publishes digest tokens through
//! it, and PermissionsMask exposes a masked view of it.
//!
//! State kept here must be consistent across concurrent call chains, so the
//! reference implementation is a process-shared [`DashMap`] behind an `Arc`,
//! never a per-wrapper map.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::path;
use crate::storage::Permissions;

/// One metadata record, keyed by a storage-relative path.
///
/// `size` is whatever the layer that scanned the file observed — for an
/// encrypted file that is the physical (ciphertext) size, while
/// `unencrypted_size` holds the logical plaintext length. Both are signed:
/// recovery code must be able to represent the implausible negative sizes
/// that trigger it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub size: i64,
    pub mtime: u64,
    pub mimetype: String,
    pub etag: String,
    pub permissions: Permissions,
    pub encrypted: bool,
    pub encrypted_version: u32,
    pub checksum: Option<String>,
    pub unencrypted_size: i64,
}

/// Path-keyed metadata record store.
pub trait MetadataCache: Send + Sync {
    fn get(&self, path: &str) -> Option<CacheEntry>;
    fn put(&self, path: &str, entry: CacheEntry);
    /// In-place update; creates a default entry when none exists.
    fn update(&self, path: &str, apply: &dyn Fn(&mut CacheEntry));
    fn remove(&self, path: &str);
    /// Move a record (and everything under it) to a new path.
    fn move_entry(&self, from: &str, to: &str);
    /// Total size of the file records under `path` (inclusive). `None` when
    /// nothing is known about the subtree.
    fn folder_size(&self, path: &str) -> Option<u64>;
}

/// Process-shared in-memory reference cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MetadataCache for MemoryCache {
    fn get(&self, path: &str) -> Option<CacheEntry> {
        self.entries.get(&path::normalize(path)).map(|e| e.clone())
    }

    fn put(&self, path: &str, entry: CacheEntry) {
        self.entries.insert(path::normalize(path), entry);
    }

    fn update(&self, path: &str, apply: &dyn Fn(&mut CacheEntry)) {
        let mut entry = self.entries.entry(path::normalize(path)).or_default();
        apply(&mut entry);
    }

    fn remove(&self, path: &str) {
        let path = path::normalize(path);
        self.entries
            .retain(|key, _| !(key == &path || key.starts_with(&format!("{path}/"))));
    }

    fn move_entry(&self, from: &str, to: &str) {
        let from = path::normalize(from);
        let to = path::normalize(to);
        let moved: Vec<(String, CacheEntry)> = self
            .entries
            .iter()
            .filter(|kv| path::is_under(kv.key(), &from))
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();
        for (key, entry) in moved {
            let suffix = path::strip_prefix(&key, &from).unwrap_or_default();
            self.entries.remove(&key);
            self.entries.insert(path::join(&to, &suffix), entry);
        }
    }

    fn folder_size(&self, path: &str) -> Option<u64> {
        let path = path::normalize(path);
        let mut total: u64 = 0;
        let mut seen = false;
        for kv in &self.entries {
            if path::is_under(kv.key(), &path) {
                seen = true;
                if kv.value().size > 0 && kv.value().mimetype != crate::storage::DIR_MIMETYPE {
                    total += kv.value().size as u64;
                }
            }
        }
        seen.then_some(total)
    }
}
