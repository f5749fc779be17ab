//! Checksum: streaming content digests recorded at write time.
//!
//! Every write under the designated prefix feeds a digest context as the
//! bytes pass through, and the finished `ALGO:HEX` token lands in the
//! metadata cache when the write commits. Reads are never re-hashed; the
//! token is served back through `get_metadata` and through `hash` when the
//! requested algorithm matches the recorded one.

use std::any::Any;
use std::sync::Arc;

use ring::digest::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::MetadataCache;
use crate::error::StorageError;
use crate::path;
use crate::storage::{ChecksumAlgo, Metadata, Storage, WriteMode, WriteStream};

fn default_prefix() -> String {
    "files".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumConfig {
    /// Digest recorded on writes.
    #[serde(default)]
    pub algo: ChecksumAlgo,
    /// Subtree whose writes are digested.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            algo: ChecksumAlgo::default(),
            prefix: default_prefix(),
        }
    }
}

pub struct Checksum {
    inner: Arc<dyn Storage>,
    config: ChecksumConfig,
}

impl Checksum {
    #[must_use]
    pub fn new(inner: Arc<dyn Storage>, config: ChecksumConfig) -> Self {
        Self { inner, config }
    }

    fn applies(&self, p: &str) -> bool {
        path::is_under(p, &self.config.prefix)
    }

    fn token(&self, hex_digest: &str) -> String {
        format!("{}:{hex_digest}", self.config.algo.as_str())
    }

    fn record(&self, p: &str, token: &str) -> Result<(), StorageError> {
        debug!(path = p, token, "checksum recorded");
        let token = token.to_string();
        self.inner
            .cache()?
            .update(&path::normalize(p), &move |entry| {
                entry.checksum = Some(token.clone());
            });
        Ok(())
    }

    /// The recorded token for a path, when one exists.
    fn recorded(&self, p: &str) -> Option<String> {
        self.inner.cache().ok()?.get(p)?.checksum
    }
}

impl Storage for Checksum {
    fn inner(&self) -> Option<&dyn Storage> {
        Some(self.inner.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        if !self.applies(p) {
            return self.inner.file_put_contents(p, data);
        }
        // The token covers exactly the bytes handed in, before any layer
        // below transforms them.
        let token = self.token(&self.config.algo.digest(data));
        let written = self.inner.file_put_contents(p, data)?;
        self.record(p, &token)?;
        Ok(written)
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        let stream = self.inner.open_write(p, mode)?;
        if !self.applies(p) || mode == WriteMode::Append {
            // An append digest would only cover the tail; leave any old
            // token alone rather than record a wrong one.
            return Ok(stream);
        }
        Ok(Box::new(ChecksumWriter {
            inner: stream,
            context: Context::new(self.config.algo.ring_algorithm()),
            algo: self.config.algo,
            cache: self.inner.cache()?,
            path: path::normalize(p),
        }))
    }

    fn get_metadata(&self, p: &str) -> Result<Metadata, StorageError> {
        let mut meta = self.inner.get_metadata(p)?;
        if let Some(token) = self.recorded(p) {
            meta.checksum = Some(token);
        }
        Ok(meta)
    }

    fn hash(&self, algo: ChecksumAlgo, p: &str) -> Result<String, StorageError> {
        if algo == self.config.algo {
            let wanted = format!("{}:", algo.as_str());
            if let Some(token) = self.recorded(p) {
                if let Some(hex_digest) = token.strip_prefix(&wanted) {
                    return Ok(hex_digest.to_string());
                }
            }
        }
        self.inner.hash(algo, p)
    }
}

/// Stream transform feeding a digest context as bytes pass through.
struct ChecksumWriter {
    inner: Box<dyn WriteStream>,
    context: Context,
    algo: ChecksumAlgo,
    cache: Arc<dyn MetadataCache>,
    path: String,
}

impl WriteStream for ChecksumWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.context.update(data);
        self.inner.write_all(data)
    }

    fn commit(self: Box<Self>) -> Result<u64, StorageError> {
        let written = self.inner.commit()?;
        let token = format!(
            "{}:{}",
            self.algo.as_str(),
            hex::encode(self.context.finish())
        );
        debug!(path = %self.path, token, "checksum recorded");
        self.cache.update(&self.path, &move |entry| {
            entry.checksum = Some(token.clone());
        });
        Ok(written)
    }

    fn abort(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    const HELLO_SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

    fn wrapped() -> (Arc<MemoryStorage>, Checksum) {
        let backend = Arc::new(MemoryStorage::new("ck"));
        backend.mkdir("files").unwrap();
        (
            backend.clone(),
            Checksum::new(backend, ChecksumConfig::default()),
        )
    }

    #[test]
    fn whole_buffer_write_records_token() {
        let (backend, ck) = wrapped();
        ck.file_put_contents("files/a.txt", b"hello").unwrap();
        let entry = backend.memory_cache().get("files/a.txt").unwrap();
        assert_eq!(entry.checksum.as_deref(), Some(format!("SHA1:{HELLO_SHA1}").as_str()));
    }

    #[test]
    fn streaming_write_matches_whole_buffer_digest() {
        let (backend, ck) = wrapped();
        let mut w = ck
            .open_write("files/a.txt", WriteMode::Overwrite)
            .unwrap();
        w.write_all(b"he").unwrap();
        w.write_all(b"llo").unwrap();
        w.commit().unwrap();
        let entry = backend.memory_cache().get("files/a.txt").unwrap();
        assert_eq!(entry.checksum, Some(format!("SHA1:{HELLO_SHA1}")));
    }

    #[test]
    fn metadata_surfaces_the_token() {
        let (_, ck) = wrapped();
        ck.file_put_contents("files/a.txt", b"hello").unwrap();
        let meta = ck.get_metadata("files/a.txt").unwrap();
        assert_eq!(meta.checksum, Some(format!("SHA1:{HELLO_SHA1}")));
    }

    #[test]
    fn hash_serves_the_recorded_token() {
        let (backend, ck) = wrapped();
        ck.file_put_contents("files/a.txt", b"hello").unwrap();
        let before = backend.backend_calls();
        assert_eq!(ck.hash(ChecksumAlgo::Sha1, "files/a.txt").unwrap(), HELLO_SHA1);
        // Served from the cache, never re-read from the backend.
        assert_eq!(backend.backend_calls(), before);

        // A different algorithm has no recorded token and delegates.
        let sha256 = ck.hash(ChecksumAlgo::Sha256, "files/a.txt").unwrap();
        assert_eq!(sha256, ChecksumAlgo::Sha256.digest(b"hello"));
        assert!(backend.backend_calls() > before);
    }

    #[test]
    fn outside_prefix_is_not_digested() {
        let (backend, ck) = wrapped();
        ck.file_put_contents("scratch.txt", b"hello").unwrap();
        let entry = backend.memory_cache().get("scratch.txt").unwrap();
        assert_eq!(entry.checksum, None);
    }

    #[test]
    fn aborted_write_records_nothing() {
        let (backend, ck) = wrapped();
        let mut w = ck
            .open_write("files/a.txt", WriteMode::Overwrite)
            .unwrap();
        w.write_all(b"partial").unwrap();
        w.abort().unwrap();
        assert!(backend.memory_cache().get("files/a.txt").is_none());
        assert!(!backend.file_exists("files/a.txt").unwrap());
    }

    #[test]
    fn overwrite_replaces_stale_token() {
        let (backend, ck) = wrapped();
        ck.file_put_contents("files/a.txt", b"hello").unwrap();
        ck.file_put_contents("files/a.txt", b"changed").unwrap();
        let entry = backend.memory_cache().get("files/a.txt").unwrap();
        assert_eq!(
            entry.checksum,
            Some(format!("SHA1:{}", ChecksumAlgo::Sha1.digest(b"changed")))
        );
    }
}
