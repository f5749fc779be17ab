//! KnownMtime: clamp reported mtimes to the local mutation history.
//!
//! Some backends round stored timestamps down or lag behind their own
//! writes. This wrapper remembers when it last mutated each path and serves
//! the later of the remembered and the reported time. The clamp only ever
//! raises a report; a backend timestamp newer than the remembered one wins
//! unchanged.

use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::trace;

use crate::clock::Clock;
use crate::error::StorageError;
use crate::path;
use crate::storage::{Metadata, Stat, Storage, WriteMode, WriteStream};

const KNOWN_CAPACITY: usize = 4096;

type KnownMap = Arc<Mutex<LruCache<String, u64>>>;

pub struct KnownMtime {
    inner: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    known: KnownMap,
}

impl KnownMtime {
    /// Panics only if the cache capacity constant is zero, which it is not.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn new(inner: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(KNOWN_CAPACITY).unwrap();
        Self {
            inner,
            clock,
            known: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    fn remember(&self, p: &str, mtime: u64) {
        trace!(path = p, mtime, "mutation time remembered");
        if let Ok(mut known) = self.known.lock() {
            known.put(path::normalize(p), mtime);
        }
    }

    fn remember_now(&self, p: &str) {
        self.remember(p, self.clock.now());
    }

    fn forget(&self, p: &str) {
        if let Ok(mut known) = self.known.lock() {
            known.pop(&path::normalize(p));
        }
    }

    fn clamp(&self, p: &str, reported: u64) -> u64 {
        let known = self
            .known
            .lock()
            .ok()
            .and_then(|mut known| known.get(&path::normalize(p)).copied());
        match known {
            Some(local) => reported.max(local),
            None => reported,
        }
    }
}

impl Storage for KnownMtime {
    fn inner(&self) -> Option<&dyn Storage> {
        Some(self.inner.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn filemtime(&self, p: &str) -> Result<u64, StorageError> {
        Ok(self.clamp(p, self.inner.filemtime(p)?))
    }

    fn stat(&self, p: &str) -> Result<Stat, StorageError> {
        let mut stat = self.inner.stat(p)?;
        stat.mtime = self.clamp(p, stat.mtime);
        Ok(stat)
    }

    fn get_metadata(&self, p: &str) -> Result<Metadata, StorageError> {
        let mut meta = self.inner.get_metadata(p)?;
        meta.mtime = self.clamp(p, meta.mtime);
        Ok(meta)
    }

    fn mkdir(&self, p: &str) -> Result<(), StorageError> {
        self.inner.mkdir(p)?;
        self.remember_now(p);
        Ok(())
    }

    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        let written = self.inner.file_put_contents(p, data)?;
        self.remember_now(p);
        Ok(written)
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        // The mutation time is only known once the stream commits.
        Ok(Box::new(RememberingWriter {
            inner: Some(self.inner.open_write(p, mode)?),
            clock: self.clock.clone(),
            known: self.known.clone(),
            path: path::normalize(p),
        }))
    }

    fn touch(&self, p: &str, mtime: Option<u64>) -> Result<(), StorageError> {
        self.inner.touch(p, mtime)?;
        match mtime {
            Some(stamp) => self.remember(p, stamp),
            None => self.remember_now(p),
        }
        Ok(())
    }

    fn unlink(&self, p: &str) -> Result<(), StorageError> {
        self.inner.unlink(p)?;
        self.forget(p);
        Ok(())
    }

    fn rmdir(&self, p: &str) -> Result<(), StorageError> {
        self.inner.rmdir(p)?;
        self.forget(p);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.rename(from, to)?;
        self.forget(from);
        self.remember_now(to);
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.copy(from, to)?;
        self.remember_now(to);
        Ok(())
    }

    fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        self.inner
            .copy_from_storage(source, source_path, target_path)?;
        self.remember_now(target_path);
        Ok(())
    }

    fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        self.inner
            .move_from_storage(source, source_path, target_path)?;
        self.remember_now(target_path);
        Ok(())
    }
}

/// Stream transform that records the commit time as the path's mutation
/// time.
struct RememberingWriter {
    inner: Option<Box<dyn WriteStream>>,
    clock: Arc<dyn Clock>,
    known: KnownMap,
    path: String,
}

impl WriteStream for RememberingWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        match self.inner.as_mut() {
            Some(stream) => stream.write_all(data),
            None => Err(StorageError::Unsupported { op: "write" }),
        }
    }

    fn commit(mut self: Box<Self>) -> Result<u64, StorageError> {
        let Some(stream) = self.inner.take() else {
            return Err(StorageError::Unsupported { op: "commit" });
        };
        let written = stream.commit()?;
        if let Ok(mut known) = self.known.lock() {
            known.put(self.path.clone(), self.clock.now());
        }
        Ok(written)
    }

    fn abort(mut self: Box<Self>) -> Result<(), StorageError> {
        match self.inner.take() {
            Some(stream) => stream.abort(),
            None => Ok(()),
        }
    }
}
