//! PermissionsMask: intersect reported and allowed permissions with a fixed
//! mask.
//!
//! The mask can only narrow, never widen: every ability check is
//! `mask_has(bit) AND inner_check(path)`. Write-class primitives decide
//! whether they are a create or an update by existence and refuse without
//! touching the backend when the corresponding bit is masked out, so a
//! denied write leaves the backend unchanged.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheEntry, MetadataCache};
use crate::error::StorageError;
use crate::storage::{
    Metadata, Permissions, ReadStream, Storage, WriteMode, WriteStream,
};

pub struct PermissionsMask {
    inner: Arc<dyn Storage>,
    mask: Permissions,
}

impl PermissionsMask {
    #[must_use]
    pub fn new(inner: Arc<dyn Storage>, mask: Permissions) -> Self {
        Self { inner, mask }
    }

    #[must_use]
    pub fn mask(&self) -> Permissions {
        self.mask
    }

    fn check(&self, bit: Permissions, op: &'static str, p: &str) -> Result<(), StorageError> {
        if self.mask.contains(bit) {
            Ok(())
        } else {
            debug!(path = p, op, "write refused by permissions mask");
            Err(StorageError::not_permitted(
                op,
                p,
                format!("permission bit {bit} masked out"),
            ))
        }
    }

    /// Create-or-update decision for write-class operations.
    fn check_write(&self, op: &'static str, p: &str) -> Result<(), StorageError> {
        let bit = if self.inner.file_exists(p)? {
            Permissions::UPDATE
        } else {
            Permissions::CREATE
        };
        self.check(bit, op, p)
    }
}

impl Storage for PermissionsMask {
    fn inner(&self) -> Option<&dyn Storage> {
        Some(self.inner.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_permissions(&self, p: &str) -> Result<Permissions, StorageError> {
        Ok(self.inner.get_permissions(p)? & self.mask)
    }

    fn get_metadata(&self, p: &str) -> Result<Metadata, StorageError> {
        let mut meta = self.inner.get_metadata(p)?;
        meta.permissions = meta.permissions & self.mask;
        Ok(meta)
    }

    fn is_creatable(&self, p: &str) -> Result<bool, StorageError> {
        Ok(self.mask.contains(Permissions::CREATE) && self.inner.is_creatable(p)?)
    }

    fn is_readable(&self, p: &str) -> Result<bool, StorageError> {
        Ok(self.mask.contains(Permissions::READ) && self.inner.is_readable(p)?)
    }

    fn is_updatable(&self, p: &str) -> Result<bool, StorageError> {
        Ok(self.mask.contains(Permissions::UPDATE) && self.inner.is_updatable(p)?)
    }

    fn is_deletable(&self, p: &str) -> Result<bool, StorageError> {
        Ok(self.mask.contains(Permissions::DELETE) && self.inner.is_deletable(p)?)
    }

    fn is_sharable(&self, p: &str) -> Result<bool, StorageError> {
        Ok(self.mask.contains(Permissions::SHARE) && self.inner.is_sharable(p)?)
    }

    fn mkdir(&self, p: &str) -> Result<(), StorageError> {
        self.check(Permissions::CREATE, "mkdir", p)?;
        self.inner.mkdir(p)
    }

    fn rmdir(&self, p: &str) -> Result<(), StorageError> {
        self.check(Permissions::DELETE, "rmdir", p)?;
        self.inner.rmdir(p)
    }

    fn unlink(&self, p: &str) -> Result<(), StorageError> {
        self.check(Permissions::DELETE, "unlink", p)?;
        self.inner.unlink(p)
    }

    fn touch(&self, p: &str, mtime: Option<u64>) -> Result<(), StorageError> {
        self.check_write("touch", p)?;
        self.inner.touch(p, mtime)
    }

    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        self.check_write("file_put_contents", p)?;
        self.inner.file_put_contents(p, data)
    }

    fn open_read(&self, p: &str) -> Result<Box<dyn ReadStream>, StorageError> {
        self.check(Permissions::READ, "open_read", p)?;
        self.inner.open_read(p)
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        self.check_write("open_write", p)?;
        self.inner.open_write(p, mode)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.check_write("rename", to)?;
        self.inner.rename(from, to)
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.check_write("copy", to)?;
        self.inner.copy(from, to)
    }

    fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        self.check_write("copy_from_storage", target_path)?;
        self.inner
            .copy_from_storage(source, source_path, target_path)
    }

    fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        self.check_write("move_from_storage", target_path)?;
        self.inner
            .move_from_storage(source, source_path, target_path)
    }

    fn cache(&self) -> Result<Arc<dyn MetadataCache>, StorageError> {
        Ok(Arc::new(MaskedCache {
            inner: self.inner.cache()?,
            mask: self.mask,
        }))
    }
}

/// Cache view that applies the mask at the query layer while leaving the
/// stored scan data untouched, so background reconciliation of the unmasked
/// storage keeps working against the real permissions.
pub struct MaskedCache {
    inner: Arc<dyn MetadataCache>,
    mask: Permissions,
}

impl MaskedCache {
    /// The original ("scan") record without the query-layer mask.
    #[must_use]
    pub fn get_unmasked(&self, p: &str) -> Option<CacheEntry> {
        self.inner.get(p)
    }
}

impl MetadataCache for MaskedCache {
    fn get(&self, p: &str) -> Option<CacheEntry> {
        self.inner.get(p).map(|mut entry| {
            entry.permissions = entry.permissions & self.mask;
            entry
        })
    }

    fn put(&self, p: &str, entry: CacheEntry) {
        self.inner.put(p, entry);
    }

    fn update(&self, p: &str, apply: &dyn Fn(&mut CacheEntry)) {
        self.inner.update(p, apply);
    }

    fn remove(&self, p: &str) {
        self.inner.remove(p);
    }

    fn move_entry(&self, from: &str, to: &str) {
        self.inner.move_entry(from, to);
    }

    fn folder_size(&self, p: &str) -> Option<u64> {
        self.inner.folder_size(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn masked(mask: Permissions) -> (Arc<MemoryStorage>, PermissionsMask) {
        let backend = Arc::new(MemoryStorage::new("base"));
        backend.file_put_contents("a.txt", b"hello").unwrap();
        (backend.clone(), PermissionsMask::new(backend, mask))
    }

    #[test]
    fn permissions_are_intersected() {
        let (backend, read_only) = masked(Permissions::READ);
        let direct = backend.get_permissions("a.txt").unwrap();
        assert_eq!(
            read_only.get_permissions("a.txt").unwrap(),
            direct & Permissions::READ
        );
        assert!(read_only.is_readable("a.txt").unwrap());
        assert!(!read_only.is_updatable("a.txt").unwrap());
        assert!(!read_only.is_sharable("a.txt").unwrap());
    }

    #[test]
    fn denied_write_leaves_backend_unchanged() {
        let (backend, read_only) = masked(Permissions::READ);
        assert!(matches!(
            read_only.file_put_contents("a.txt", b"changed"),
            Err(StorageError::NotPermitted { .. })
        ));
        assert!(read_only.file_put_contents("new.txt", b"x").is_err());
        assert!(read_only.mkdir("dir").is_err());
        assert!(read_only.unlink("a.txt").is_err());
        assert_eq!(backend.file_get_contents("a.txt").unwrap(), b"hello");
        assert!(!backend.file_exists("new.txt").unwrap());
    }

    #[test]
    fn create_versus_update_bits() {
        // CREATE but not UPDATE: new files are fine, overwrites are not.
        let (_, create_only) = masked(
            Permissions::READ | Permissions::CREATE,
        );
        create_only.file_put_contents("new.txt", b"x").unwrap();
        assert!(create_only.file_put_contents("a.txt", b"y").is_err());

        // UPDATE but not CREATE: the reverse.
        let (_, update_only) = masked(Permissions::READ | Permissions::UPDATE);
        update_only.file_put_contents("a.txt", b"y").unwrap();
        assert!(update_only.file_put_contents("other.txt", b"x").is_err());
    }

    #[test]
    fn rename_checks_target_existence() {
        let (_, mask) = masked(Permissions::READ | Permissions::CREATE);
        // Target does not exist: a create, allowed.
        mask.rename("a.txt", "b.txt").unwrap();
    }

    #[test]
    fn metadata_permissions_are_masked() {
        let (_, read_only) = masked(Permissions::READ);
        let meta = read_only.get_metadata("a.txt").unwrap();
        assert_eq!(meta.permissions, Permissions::READ);
    }

    #[test]
    fn masked_cache_keeps_scan_permissions() {
        let (backend, read_only) = masked(Permissions::READ);
        let cache = read_only.cache().unwrap();
        // Query layer sees the mask applied.
        assert_eq!(cache.get("a.txt").unwrap().permissions, Permissions::READ);

        // The scan view stays unmasked for background reconciliation.
        let typed = MaskedCache {
            inner: backend.cache().unwrap(),
            mask: Permissions::READ,
        };
        assert_eq!(
            typed.get_unmasked("a.txt").unwrap().permissions,
            Permissions::ALL
        );
        assert_eq!(typed.get("a.txt").unwrap().permissions, Permissions::READ);
    }
}
