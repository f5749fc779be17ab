//! Quota: byte budget enforced against cache-derived usage.
//!
//! Usage is the aggregated file size under the accounting root as the
//! metadata cache knows it, not a live backend walk; exempt subtrees are
//! excluded from the total. When the cache knows nothing about the root the
//! usage is unknown: free space reports unknown and checks pass. Sized
//! operations are checked up front; open-ended streams go through a
//! [`QuotaLimiter`] that aborts the chain the moment the budget is crossed.
//! Part files bypass the limiter so chunked uploads can assemble, and pay at
//! the finalizing rename instead. Paths outside the accounting root and
//! paths under the exempt prefixes delegate untouched.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::path;
use crate::storage::{FreeSpace, Storage, WriteMode, WriteStream};

fn default_root() -> String {
    "files".to_string()
}

fn default_exempt() -> Vec<String> {
    vec!["cache".to_string(), "uploads".to_string(), "tmp".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Byte budget for everything under the accounting root.
    pub limit: u64,
    /// Subtree the budget applies to.
    #[serde(default = "default_root")]
    pub root: String,
    /// Prefixes under the root that never count against the budget.
    #[serde(default = "default_exempt")]
    pub exempt: Vec<String>,
}

impl QuotaConfig {
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            root: default_root(),
            exempt: default_exempt(),
        }
    }
}

pub struct Quota {
    inner: Arc<dyn Storage>,
    config: QuotaConfig,
}

impl Quota {
    #[must_use]
    pub fn new(inner: Arc<dyn Storage>, config: QuotaConfig) -> Self {
        Self { inner, config }
    }

    /// Whether the budget applies to this path at all.
    fn accounted(&self, p: &str) -> bool {
        let p = path::normalize(p);
        let Some(rel) = path::strip_prefix(&p, &self.config.root) else {
            return false;
        };
        !self
            .config
            .exempt
            .iter()
            .any(|zone| path::is_under(&rel, zone))
    }

    /// Bytes the cache says are already spent under the accounting root,
    /// excluding the exempt subtrees. `None` when the cache knows nothing
    /// about the root.
    fn usage(&self) -> Option<u64> {
        let cache = self.inner.cache().ok()?;
        let mut used = cache.folder_size(&self.config.root)?;
        for zone in &self.config.exempt {
            let exempt = cache
                .folder_size(&path::join(&self.config.root, zone))
                .unwrap_or(0);
            used = used.saturating_sub(exempt);
        }
        Some(used)
    }

    fn free_bytes(&self) -> Option<u64> {
        Some(self.config.limit.saturating_sub(self.usage()?))
    }

    /// Unknown usage passes: without accounting there is nothing to enforce.
    fn check_fits(&self, op: &'static str, p: &str, need: u64) -> Result<(), StorageError> {
        let Some(free) = self.free_bytes() else {
            return Ok(());
        };
        if need > free {
            debug!(path = p, need, free, "quota refusal");
            return Err(StorageError::not_permitted(
                op,
                p,
                format!("insufficient quota, {need} bytes needed, {free} free"),
            ));
        }
        Ok(())
    }
}

impl Storage for Quota {
    fn inner(&self) -> Option<&dyn Storage> {
        Some(self.inner.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn free_space(&self, p: &str) -> Result<FreeSpace, StorageError> {
        let backend = self.inner.free_space(p)?;
        if !self.accounted(p) {
            return Ok(backend);
        }
        let Some(free) = self.free_bytes() else {
            return Ok(FreeSpace::Unknown);
        };
        Ok(match backend {
            FreeSpace::Unknown | FreeSpace::Unlimited => FreeSpace::Bytes(free),
            FreeSpace::Bytes(b) => FreeSpace::Bytes(b.min(free)),
        })
    }

    fn mkdir(&self, p: &str) -> Result<(), StorageError> {
        if self.accounted(p) {
            self.check_fits("mkdir", p, 1)?;
        }
        self.inner.mkdir(p)
    }

    fn touch(&self, p: &str, mtime: Option<u64>) -> Result<(), StorageError> {
        if self.accounted(p) && !path::is_part_file(p) {
            self.check_fits("touch", p, 1)?;
        }
        self.inner.touch(p, mtime)
    }

    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        if self.accounted(p) && !path::is_part_file(p) {
            self.check_fits("file_put_contents", p, data.len() as u64)?;
        }
        self.inner.file_put_contents(p, data)
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        let stream = self.inner.open_write(p, mode)?;
        if !self.accounted(p) || path::is_part_file(p) {
            return Ok(stream);
        }
        let Some(mut remaining) = self.free_bytes() else {
            return Ok(stream);
        };
        if mode == WriteMode::Overwrite {
            // The bytes of the file being replaced come back to the budget.
            if let Ok(existing) = self.inner.filesize(p) {
                remaining = remaining.saturating_add(existing);
            }
        }
        Ok(Box::new(QuotaLimiter {
            inner: Some(stream),
            remaining,
            path: path::normalize(p),
        }))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        // The finalizing rename of a part file is where its bytes start
        // counting.
        if path::is_part_file(from) && !path::is_part_file(to) && self.accounted(to) {
            let need = self.inner.filesize(from)?;
            self.check_fits("rename", to, need)?;
        }
        self.inner.rename(from, to)
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        if self.accounted(to) {
            let need = if self.inner.is_dir(from)? {
                self.inner
                    .cache()
                    .ok()
                    .and_then(|cache| cache.folder_size(from))
                    .unwrap_or(0)
            } else {
                self.inner.filesize(from)?
            };
            self.check_fits("copy", to, need)?;
        }
        self.inner.copy(from, to)
    }

    fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        if self.accounted(target_path) && source.is_file(source_path)? {
            let need = source.filesize(source_path)?;
            self.check_fits("copy_from_storage", target_path, need)?;
        }
        self.inner
            .copy_from_storage(source, source_path, target_path)
    }

    fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        if self.accounted(target_path) && source.is_file(source_path)? {
            let need = source.filesize(source_path)?;
            self.check_fits("move_from_storage", target_path, need)?;
        }
        self.inner
            .move_from_storage(source, source_path, target_path)
    }
}

/// Stream transform that caps the bytes a write may add.
///
/// Crossing the cap aborts the wrapped chain immediately so no partial
/// target survives, then reports the refusal.
pub struct QuotaLimiter {
    inner: Option<Box<dyn WriteStream>>,
    remaining: u64,
    path: String,
}

impl WriteStream for QuotaLimiter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let Some(stream) = self.inner.as_mut() else {
            return Err(StorageError::not_permitted(
                "write",
                &self.path,
                "stream already aborted".to_string(),
            ));
        };
        if data.len() as u64 > self.remaining {
            if let Some(stream) = self.inner.take() {
                let _ = stream.abort();
            }
            return Err(StorageError::not_permitted(
                "write",
                &self.path,
                "insufficient quota".to_string(),
            ));
        }
        stream.write_all(data)?;
        self.remaining -= data.len() as u64;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<u64, StorageError> {
        match self.inner.take() {
            Some(stream) => stream.commit(),
            None => Err(StorageError::not_permitted(
                "commit",
                &self.path,
                "stream already aborted".to_string(),
            )),
        }
    }

    fn abort(mut self: Box<Self>) -> Result<(), StorageError> {
        match self.inner.take() {
            Some(stream) => stream.abort(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn quota(limit: u64) -> (Arc<MemoryStorage>, Quota) {
        let backend = Arc::new(MemoryStorage::new("quota"));
        backend.mkdir("files").unwrap();
        backend.mkdir("files/cache").unwrap();
        (
            backend.clone(),
            Quota::new(backend, QuotaConfig::new(limit)),
        )
    }

    #[test]
    fn exact_fit_boundary() {
        let (_, q) = quota(10);
        assert!(q.file_put_contents("files/big.bin", &[0u8; 11]).is_err());
        q.file_put_contents("files/big.bin", &[0u8; 10]).unwrap();
        assert_eq!(q.free_space("files").unwrap(), FreeSpace::Bytes(0));
        assert!(q.file_put_contents("files/more.bin", &[0u8; 1]).is_err());
    }

    #[test]
    fn free_space_is_clamped() {
        let (_, q) = quota(100);
        assert_eq!(q.free_space("files").unwrap(), FreeSpace::Bytes(100));
        q.file_put_contents("files/a.bin", &[0u8; 30]).unwrap();
        assert_eq!(q.free_space("files").unwrap(), FreeSpace::Bytes(70));
    }

    #[test]
    fn backend_report_wins_when_smaller() {
        let backend = Arc::new(MemoryStorage::with_capacity("small", 40));
        backend.mkdir("files").unwrap();
        let q = Quota::new(backend, QuotaConfig::new(1000));
        assert_eq!(q.free_space("files").unwrap(), FreeSpace::Bytes(40));
    }

    #[test]
    fn exempt_zones_delegate() {
        let (_, q) = quota(5);
        // Outside the accounting root.
        q.file_put_contents("scratch.bin", &[0u8; 50]).unwrap();
        // Under an exempt prefix.
        q.file_put_contents("files/cache/tmp.bin", &[0u8; 50])
            .unwrap();
        // Exempt bytes never count against the budget.
        assert_eq!(q.free_space("files").unwrap(), FreeSpace::Bytes(5));
        // Still full budget for accounted paths.
        q.file_put_contents("files/a.bin", &[0u8; 5]).unwrap();
    }

    #[test]
    fn mkdir_and_touch_require_free_space() {
        let (_, q) = quota(4);
        q.mkdir("files/docs").unwrap();
        q.touch("files/empty.txt", None).unwrap();

        q.file_put_contents("files/full.bin", &[0u8; 4]).unwrap();
        assert!(matches!(
            q.mkdir("files/late"),
            Err(StorageError::NotPermitted { .. })
        ));
        assert!(matches!(
            q.touch("files/late.txt", None),
            Err(StorageError::NotPermitted { .. })
        ));
        // Part files assemble unbudgeted and pay at the rename.
        q.touch("files/upload.bin.part", None).unwrap();
    }

    #[test]
    fn unknown_usage_fails_open() {
        // No scan has ever touched the accounting root, so the cache cannot
        // say what is spent.
        let backend = Arc::new(MemoryStorage::new("blank"));
        let q = Quota::new(backend, QuotaConfig::new(100));
        assert_eq!(q.free_space("files").unwrap(), FreeSpace::Unknown);

        // Once accounting exists the budget applies again.
        q.mkdir("files").unwrap();
        assert_eq!(q.free_space("files").unwrap(), FreeSpace::Bytes(100));
    }

    #[test]
    fn config_defaults_fill_in_from_json() {
        let config: QuotaConfig = serde_json::from_str(r#"{"limit": 512}"#).unwrap();
        assert_eq!(config.limit, 512);
        assert_eq!(config.root, "files");
        assert_eq!(
            config.exempt,
            vec!["cache".to_string(), "uploads".to_string(), "tmp".to_string()]
        );
    }

    #[test]
    fn limiter_aborts_mid_stream() {
        let (backend, q) = quota(8);
        let mut w = q
            .open_write("files/s.bin", WriteMode::Overwrite)
            .unwrap();
        w.write_all(&[0u8; 5]).unwrap();
        assert!(matches!(
            w.write_all(&[0u8; 5]),
            Err(StorageError::NotPermitted { .. })
        ));
        // Nothing became observable.
        assert!(!backend.file_exists("files/s.bin").unwrap());
        // The handle is dead after the refusal.
        assert!(w.write_all(&[0u8; 1]).is_err());
        assert!(w.commit().is_err());
    }

    #[test]
    fn overwrite_reclaims_replaced_bytes() {
        let (_, q) = quota(10);
        q.file_put_contents("files/a.bin", &[0u8; 10]).unwrap();
        let mut w = q
            .open_write("files/a.bin", WriteMode::Overwrite)
            .unwrap();
        w.write_all(&[1u8; 10]).unwrap();
        assert_eq!(w.commit().unwrap(), 10);
    }

    #[test]
    fn part_files_pay_at_rename() {
        let (_, q) = quota(4);
        // Assembling the part file is unbudgeted.
        let mut w = q
            .open_write("files/upload.bin.part", WriteMode::Overwrite)
            .unwrap();
        w.write_all(&[0u8; 16]).unwrap();
        w.commit().unwrap();

        assert!(matches!(
            q.rename("files/upload.bin.part", "files/upload.bin"),
            Err(StorageError::NotPermitted { .. })
        ));

        let mut w = q
            .open_write("files/small.bin.part", WriteMode::Overwrite)
            .unwrap();
        w.write_all(&[0u8; 3]).unwrap();
        w.commit().unwrap();
        q.rename("files/small.bin.part", "files/small.bin").unwrap();
        assert_eq!(q.filesize("files/small.bin").unwrap(), 3);
    }

    #[test]
    fn sized_copies_are_checked() {
        let (_, q) = quota(6);
        q.file_put_contents("files/a.bin", &[0u8; 4]).unwrap();
        assert!(q.copy("files/a.bin", "files/b.bin").is_err());

        let other = MemoryStorage::new("other");
        other.file_put_contents("src.bin", &[0u8; 4]).unwrap();
        assert!(
            q.copy_from_storage(&other, "src.bin", "files/c.bin")
                .is_err()
        );
        other.file_put_contents("tiny.bin", &[0u8; 2]).unwrap();
        q.copy_from_storage(&other, "tiny.bin", "files/c.bin")
            .unwrap();
    }
}
