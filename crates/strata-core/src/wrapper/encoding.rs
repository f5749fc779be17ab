//! Encoding: Unicode normalization-form repair for path lookups.
//!
//! Backends disagree about whether composed (NFC) or decomposed (NFD) forms
//! of the same visible name exist on disk. This wrapper probes each path
//! segment left to right against the forms the backend might hold and
//! settles on the one that exists. Segments that exist in no form stay as
//! the caller wrote them, so creations are untouched. Pure-ASCII paths skip
//! probing entirely. Resolved forms are kept in a bounded
//! per-instance cache, dropped whenever a mutation could change which form
//! exists.

use std::any::Any;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, trace};
use unicode_normalization::UnicodeNormalization;

use crate::error::StorageError;
use crate::path;
use crate::storage::{
    ChecksumAlgo, FileType, FreeSpace, Metadata, Permissions, ReadStream, Stat, Storage,
    WriteMode, WriteStream,
};

const FORM_CACHE_CAPACITY: usize = 2048;

fn nfc(s: &str) -> String {
    s.nfc().collect()
}

fn nfd(s: &str) -> String {
    s.nfd().collect()
}

pub struct Encoding {
    inner: Arc<dyn Storage>,
    forms: Mutex<LruCache<String, String>>,
}

impl Encoding {
    /// Panics only if the cache capacity constant is zero, which it is not.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        let capacity = NonZeroUsize::new(FORM_CACHE_CAPACITY).unwrap();
        Self {
            inner,
            forms: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.forms.lock().ok()?.get(key).cloned()
    }

    fn remember(&self, key: String, resolved: String) {
        if let Ok(mut forms) = self.forms.lock() {
            forms.put(key, resolved);
        }
    }

    /// Drop cached forms for a path and everything under it.
    fn invalidate(&self, p: &str) {
        let p = path::normalize(p);
        if let Ok(mut forms) = self.forms.lock() {
            let stale: Vec<String> = forms
                .iter()
                .filter(|(key, resolved)| {
                    path::is_under(key, &p) || path::is_under(resolved, &p)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                forms.pop(&key);
            }
        }
    }

    /// Map a caller path onto the form the backend actually holds, probing
    /// segment by segment. Missing segments keep the requested form so that
    /// create operations land exactly where the caller asked.
    fn resolve(&self, p: &str) -> Result<String, StorageError> {
        let p = path::normalize(p);
        if p.is_ascii() || p.is_empty() {
            return Ok(p);
        }
        if let Some(resolved) = self.cached(&p) {
            return Ok(resolved);
        }

        let mut resolved = String::new();
        for segment in p.split('/') {
            if segment.is_ascii() {
                resolved = path::join(&resolved, segment);
                continue;
            }
            let composed = nfc(segment);
            let decomposed = nfd(segment);
            let mut candidates = vec![segment.to_string()];
            if composed != segment {
                candidates.push(composed.clone());
            }
            if decomposed != segment && decomposed != composed {
                candidates.push(decomposed);
            }
            let mut chosen = None;
            for candidate in candidates {
                let probe = path::join(&resolved, &candidate);
                if self.inner.file_exists(&probe)? {
                    trace!(segment, form = %candidate, "existing form found");
                    chosen = Some(candidate);
                    break;
                }
            }
            resolved = path::join(&resolved, &chosen.unwrap_or_else(|| segment.to_string()));
        }

        debug!(caller = %p, backend = %resolved, "path form resolved");
        self.remember(p, resolved.clone());
        Ok(resolved)
    }
}

impl Storage for Encoding {
    fn inner(&self) -> Option<&dyn Storage> {
        Some(self.inner.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mkdir(&self, p: &str) -> Result<(), StorageError> {
        let result = self.inner.mkdir(&self.resolve(p)?);
        self.invalidate(p);
        result
    }

    fn rmdir(&self, p: &str) -> Result<(), StorageError> {
        let result = self.inner.rmdir(&self.resolve(p)?);
        self.invalidate(p);
        result
    }

    fn opendir(&self, p: &str) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self
            .inner
            .opendir(&self.resolve(p)?)?
            .iter()
            .map(|name| nfc(name))
            .collect();
        names.sort();
        Ok(names)
    }

    fn is_dir(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_dir(&self.resolve(p)?)
    }

    fn is_file(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_file(&self.resolve(p)?)
    }

    fn file_exists(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.file_exists(&self.resolve(p)?)
    }

    fn file_type(&self, p: &str) -> Result<FileType, StorageError> {
        self.inner.file_type(&self.resolve(p)?)
    }

    fn stat(&self, p: &str) -> Result<Stat, StorageError> {
        self.inner.stat(&self.resolve(p)?)
    }

    fn filesize(&self, p: &str) -> Result<u64, StorageError> {
        self.inner.filesize(&self.resolve(p)?)
    }

    fn filemtime(&self, p: &str) -> Result<u64, StorageError> {
        self.inner.filemtime(&self.resolve(p)?)
    }

    fn get_mimetype(&self, p: &str) -> Result<String, StorageError> {
        self.inner.get_mimetype(&self.resolve(p)?)
    }

    fn get_etag(&self, p: &str) -> Result<String, StorageError> {
        self.inner.get_etag(&self.resolve(p)?)
    }

    fn get_owner(&self, p: &str) -> Result<Option<String>, StorageError> {
        self.inner.get_owner(&self.resolve(p)?)
    }

    fn get_metadata(&self, p: &str) -> Result<Metadata, StorageError> {
        self.inner.get_metadata(&self.resolve(p)?)
    }

    fn get_permissions(&self, p: &str) -> Result<Permissions, StorageError> {
        self.inner.get_permissions(&self.resolve(p)?)
    }

    fn is_creatable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_creatable(&self.resolve(p)?)
    }

    fn is_readable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_readable(&self.resolve(p)?)
    }

    fn is_updatable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_updatable(&self.resolve(p)?)
    }

    fn is_deletable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_deletable(&self.resolve(p)?)
    }

    fn is_sharable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.is_sharable(&self.resolve(p)?)
    }

    fn has_updated(&self, p: &str, since: u64) -> Result<bool, StorageError> {
        self.inner.has_updated(&self.resolve(p)?, since)
    }

    fn file_get_contents(&self, p: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.file_get_contents(&self.resolve(p)?)
    }

    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        let result = self.inner.file_put_contents(&self.resolve(p)?, data);
        self.invalidate(p);
        result
    }

    fn open_read(&self, p: &str) -> Result<Box<dyn ReadStream>, StorageError> {
        self.inner.open_read(&self.resolve(p)?)
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        let result = self.inner.open_write(&self.resolve(p)?, mode);
        self.invalidate(p);
        result
    }

    fn hash(&self, algo: ChecksumAlgo, p: &str) -> Result<String, StorageError> {
        self.inner.hash(algo, &self.resolve(p)?)
    }

    fn get_local_file(&self, p: &str) -> Result<PathBuf, StorageError> {
        self.inner.get_local_file(&self.resolve(p)?)
    }

    fn unlink(&self, p: &str) -> Result<(), StorageError> {
        let result = self.inner.unlink(&self.resolve(p)?);
        self.invalidate(p);
        result
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let result = self.inner.rename(&self.resolve(from)?, &self.resolve(to)?);
        self.invalidate(from);
        self.invalidate(to);
        result
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let result = self.inner.copy(&self.resolve(from)?, &self.resolve(to)?);
        self.invalidate(to);
        result
    }

    fn touch(&self, p: &str, mtime: Option<u64>) -> Result<(), StorageError> {
        let result = self.inner.touch(&self.resolve(p)?, mtime);
        self.invalidate(p);
        result
    }

    fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        let result =
            self.inner
                .copy_from_storage(source, source_path, &self.resolve(target_path)?);
        self.invalidate(target_path);
        result
    }

    fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        let result =
            self.inner
                .move_from_storage(source, source_path, &self.resolve(target_path)?);
        self.invalidate(target_path);
        result
    }

    fn free_space(&self, p: &str) -> Result<FreeSpace, StorageError> {
        self.inner.free_space(&self.resolve(p)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    // "é" as a single composed scalar vs "e" + combining acute.
    const NFC_NAME: &str = "r\u{e9}sum\u{e9}.txt";
    const NFD_NAME: &str = "re\u{301}sume\u{301}.txt";

    fn wrapped() -> (Arc<MemoryStorage>, Encoding) {
        let backend = Arc::new(MemoryStorage::new("enc"));
        (backend.clone(), Encoding::new(backend))
    }

    #[test]
    fn nfc_lookup_finds_nfd_file() {
        let (backend, enc) = wrapped();
        backend.file_put_contents(NFD_NAME, b"decomposed").unwrap();
        assert_eq!(enc.file_get_contents(NFC_NAME).unwrap(), b"decomposed");
        assert_eq!(enc.filesize(NFC_NAME).unwrap(), 10);
    }

    #[test]
    fn nfd_lookup_finds_nfc_file() {
        let (backend, enc) = wrapped();
        backend.file_put_contents(NFC_NAME, b"composed").unwrap();
        assert_eq!(enc.file_get_contents(NFD_NAME).unwrap(), b"composed");
    }

    #[test]
    fn intermediate_directories_are_probed_too() {
        let (backend, enc) = wrapped();
        backend.mkdir(&nfd("caf\u{e9}")).unwrap();
        backend
            .file_put_contents(&format!("{}/menu.txt", nfd("caf\u{e9}")), b"menu")
            .unwrap();
        assert_eq!(
            enc.file_get_contents("caf\u{e9}/menu.txt").unwrap(),
            b"menu"
        );
    }

    #[test]
    fn missing_paths_keep_the_requested_form() {
        let (backend, enc) = wrapped();
        enc.file_put_contents(NFD_NAME, b"new").unwrap();
        assert!(backend.file_exists(NFD_NAME).unwrap());
        assert!(!backend.file_exists(NFC_NAME).unwrap());

        // The composed spelling still resolves to it afterwards.
        assert_eq!(enc.file_get_contents(NFC_NAME).unwrap(), b"new");
    }

    #[test]
    fn ascii_paths_skip_probing() {
        let (backend, enc) = wrapped();
        backend.file_put_contents("plain.txt", b"x").unwrap();
        let before = backend.backend_calls();
        assert_eq!(enc.file_get_contents("plain.txt").unwrap(), b"x");
        // Exactly the read itself, no existence probes.
        assert_eq!(backend.backend_calls(), before + 1);
    }

    #[test]
    fn listings_are_normalized_to_nfc() {
        let (backend, enc) = wrapped();
        backend.file_put_contents(NFD_NAME, b"x").unwrap();
        backend.file_put_contents("plain.txt", b"y").unwrap();
        assert_eq!(
            enc.opendir("").unwrap(),
            vec!["plain.txt".to_string(), NFC_NAME.to_string()]
        );
    }

    #[test]
    fn form_cache_is_invalidated_on_mutation() {
        let (backend, enc) = wrapped();
        backend.file_put_contents(NFD_NAME, b"old").unwrap();
        // Resolve once so the NFD form is cached.
        assert!(enc.file_exists(NFC_NAME).unwrap());

        enc.unlink(NFC_NAME).unwrap();
        assert!(!backend.file_exists(NFD_NAME).unwrap());

        // The same caller path now creates a fresh NFC file instead of
        // reusing the stale decomposed form.
        enc.file_put_contents(NFC_NAME, b"new").unwrap();
        assert!(backend.file_exists(NFC_NAME).unwrap());
        assert!(!backend.file_exists(NFD_NAME).unwrap());
    }
}
