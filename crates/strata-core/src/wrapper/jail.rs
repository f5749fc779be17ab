//! Jail: present a subtree of an inner storage as a full storage rooted at
//! `/`.
//!
//! Every primitive translates its path arguments with `unjail` before
//! delegating, and anything that returns paths (search results, the cache,
//! the watcher) is itself wrapped so the values it exposes are re-jailed.
//! Paths outside the root are reported not-found, never silently aliased
//! into the jail.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{CacheEntry, MetadataCache};
use crate::error::StorageError;
use crate::lock::{LockLevel, LockingProvider};
use crate::path;
use crate::storage::{
    ChecksumAlgo, FileType, FreeSpace, Metadata, Permissions, ReadStream, Stat, Storage, Watcher,
    WriteMode, WriteStream,
};

pub struct Jail {
    inner: Arc<dyn Storage>,
    root: String,
}

impl Jail {
    #[must_use]
    pub fn new(inner: Arc<dyn Storage>, root: &str) -> Self {
        Self {
            inner,
            root: path::normalize(root),
        }
    }

    /// The subtree this jail is rooted at, relative to the inner storage.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Translate a jailed-relative path into an inner-storage path.
    #[must_use]
    pub fn unjail(&self, p: &str) -> String {
        path::join(&self.root, p)
    }

    /// Translate an inner-storage path back into the jail; `None` when it
    /// lies outside the root.
    #[must_use]
    pub fn jail(&self, p: &str) -> Option<String> {
        path::strip_prefix(p, &self.root)
    }
}

impl Storage for Jail {
    fn inner(&self) -> Option<&dyn Storage> {
        Some(self.inner.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mkdir(&self, p: &str) -> Result<(), StorageError> {
        self.inner.mkdir(&self.unjail(p))
    }

    fn rmdir(&self, p: &str) -> Result<(), StorageError> {
        self.inner.rmdir(&self.unjail(p))
    }

    fn opendir(&self, p: &str) -> Result<Vec<String>, StorageError> {
        self.inner.opendir(&self.unjail(p))
    }

    fn is_dir(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_dir(&self.unjail(p))
    }

    fn is_file(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_file(&self.unjail(p))
    }

    fn file_exists(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.file_exists(&self.unjail(p))
    }

    fn file_type(&self, p: &str) -> Result<FileType, StorageError> {
        self.inner.file_type(&self.unjail(p))
    }

    fn stat(&self, p: &str) -> Result<Stat, StorageError> {
        self.inner.stat(&self.unjail(p))
    }

    fn filesize(&self, p: &str) -> Result<u64, StorageError> {
        self.inner.filesize(&self.unjail(p))
    }

    fn filemtime(&self, p: &str) -> Result<u64, StorageError> {
        self.inner.filemtime(&self.unjail(p))
    }

    fn get_mimetype(&self, p: &str) -> Result<String, StorageError> {
        self.inner.get_mimetype(&self.unjail(p))
    }

    fn get_etag(&self, p: &str) -> Result<String, StorageError> {
        self.inner.get_etag(&self.unjail(p))
    }

    fn get_owner(&self, p: &str) -> Result<Option<String>, StorageError> {
        self.inner.get_owner(&self.unjail(p))
    }

    fn get_metadata(&self, p: &str) -> Result<Metadata, StorageError> {
        self.inner.get_metadata(&self.unjail(p))
    }

    fn get_permissions(&self, p: &str) -> Result<Permissions, StorageError> {
        self.inner.get_permissions(&self.unjail(p))
    }

    fn is_creatable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_creatable(&self.unjail(p))
    }

    fn is_readable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_readable(&self.unjail(p))
    }

    fn is_updatable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_updatable(&self.unjail(p))
    }

    fn is_deletable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_deletable(&self.unjail(p))
    }

    fn is_sharable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_sharable(&self.unjail(p))
    }

    fn has_updated(&self, p: &str, since: u64) -> Result<bool, StorageError> {
        self.inner.has_updated(&self.unjail(p), since)
    }

    fn file_get_contents(&self, p: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.file_get_contents(&self.unjail(p))
    }

    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        self.inner.file_put_contents(&self.unjail(p), data)
    }

    fn open_read(&self, p: &str) -> Result<Box<dyn ReadStream>, StorageError> {
        self.inner.open_read(&self.unjail(p))
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        self.inner.open_write(&self.unjail(p), mode)
    }

    fn hash(&self, algo: ChecksumAlgo, p: &str) -> Result<String, StorageError> {
        self.inner.hash(algo, &self.unjail(p))
    }

    fn get_local_file(&self, p: &str) -> Result<PathBuf, StorageError> {
        self.inner.get_local_file(&self.unjail(p))
    }

    fn unlink(&self, p: &str) -> Result<(), StorageError> {
        self.inner.unlink(&self.unjail(p))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.rename(&self.unjail(from), &self.unjail(to))
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.copy(&self.unjail(from), &self.unjail(to))
    }

    fn touch(&self, p: &str, mtime: Option<u64>) -> Result<(), StorageError> {
        self.inner.touch(&self.unjail(p), mtime)
    }

    fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        // A copy whose source is this very jail is an intra-storage copy;
        // degrading avoids a needless byte-for-byte transfer.
        if let Some(jail) = source.as_any().downcast_ref::<Jail>() {
            if std::ptr::eq(jail, self) {
                return self.copy(source_path, target_path);
            }
        }
        self.inner
            .copy_from_storage(source, source_path, &self.unjail(target_path))
    }

    fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        if let Some(jail) = source.as_any().downcast_ref::<Jail>() {
            if std::ptr::eq(jail, self) {
                return self.rename(source_path, target_path);
            }
        }
        self.inner
            .move_from_storage(source, source_path, &self.unjail(target_path))
    }

    fn free_space(&self, p: &str) -> Result<FreeSpace, StorageError> {
        self.inner.free_space(&self.unjail(p))
    }

    fn search(&self, query: &str) -> Result<Vec<String>, StorageError> {
        // Results outside the jail must not leak; everything else is
        // re-expressed relative to the jail root.
        Ok(self
            .inner
            .search(query)?
            .iter()
            .filter_map(|hit| self.jail(hit))
            .filter(|hit| !hit.is_empty())
            .collect())
    }

    fn cache(&self) -> Result<Arc<dyn MetadataCache>, StorageError> {
        Ok(Arc::new(JailCache {
            inner: self.inner.cache()?,
            root: self.root.clone(),
        }))
    }

    fn watcher(&self) -> Result<Arc<dyn Watcher>, StorageError> {
        Ok(Arc::new(JailWatcher {
            inner: self.inner.watcher()?,
            root: self.root.clone(),
        }))
    }

    fn acquire_lock(
        &self,
        p: &str,
        level: LockLevel,
        provider: &dyn LockingProvider,
    ) -> Result<(), StorageError> {
        self.inner.acquire_lock(&self.unjail(p), level, provider)
    }

    fn release_lock(
        &self,
        p: &str,
        level: LockLevel,
        provider: &dyn LockingProvider,
    ) -> Result<(), StorageError> {
        self.inner.release_lock(&self.unjail(p), level, provider)
    }

    fn change_lock(
        &self,
        p: &str,
        from: LockLevel,
        to: LockLevel,
        provider: &dyn LockingProvider,
    ) -> Result<(), StorageError> {
        self.inner.change_lock(&self.unjail(p), from, to, provider)
    }
}

/// Metadata cache view scoped to a jail root.
struct JailCache {
    inner: Arc<dyn MetadataCache>,
    root: String,
}

impl JailCache {
    fn unjail(&self, p: &str) -> String {
        path::join(&self.root, p)
    }
}

impl MetadataCache for JailCache {
    fn get(&self, p: &str) -> Option<CacheEntry> {
        self.inner.get(&self.unjail(p))
    }

    fn put(&self, p: &str, entry: CacheEntry) {
        self.inner.put(&self.unjail(p), entry);
    }

    fn update(&self, p: &str, apply: &dyn Fn(&mut CacheEntry)) {
        self.inner.update(&self.unjail(p), apply);
    }

    fn remove(&self, p: &str) {
        self.inner.remove(&self.unjail(p));
    }

    fn move_entry(&self, from: &str, to: &str) {
        self.inner.move_entry(&self.unjail(from), &self.unjail(to));
    }

    fn folder_size(&self, p: &str) -> Option<u64> {
        self.inner.folder_size(&self.unjail(p))
    }
}

struct JailWatcher {
    inner: Arc<dyn Watcher>,
    root: String,
}

impl Watcher for JailWatcher {
    fn check_update(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.check_update(&path::join(&self.root, p))
    }
}
