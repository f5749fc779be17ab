//! Encryption: transparent at-rest content encryption.
//!
//! Callers read and write plaintext; the backend only ever sees
//! header-prefixed ciphertext blocks. Which cipher wrote a file is recorded
//! in its header and resolved through the [`ModuleRegistry`] on every read;
//! files flagged encrypted in the metadata cache but carrying no header are
//! legacy writes of the default module. The wrapper maintains the logical
//! (plaintext) size next to the physical size the backend reports, and can
//! recover a lost logical size by decrypting only the final block.

pub mod header;
pub mod keys;
pub mod module;
pub mod stream;

use std::any::Any;
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::cache::{CacheEntry, MetadataCache};
use crate::error::StorageError;
use crate::path;
use crate::storage::{
    ChecksumAlgo, Metadata, ReadStream, Stat, Storage, WriteMode, WriteStream, transfer,
};

pub use header::{FileHeader, HEADER_LEN};
pub use keys::{FileKey, FileKeyStorage, MemoryKeyStore, generate_key, source_path_for_key};
pub use module::{AES_GCM_MODULE_ID, AesGcmModule, EncryptionModule, ModuleRegistry};
pub use stream::{DecryptReader, EncryptWriter, decrypted_size, encrypted_size};

const SIZE_CACHE_CAPACITY: usize = 2048;

fn default_excluded() -> Vec<String> {
    vec!["files_encryption".to_string()]
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Whether new writes are encrypted. Reads always decrypt what the
    /// header says, regardless of this flag.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Prefixes that never hold encrypted content (key material lives
    /// there).
    #[serde(default = "default_excluded")]
    pub excluded: Vec<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            excluded: default_excluded(),
        }
    }
}

/// What a raw content stream turned out to contain.
enum Source {
    Plain(Box<dyn ReadStream>),
    Sealed {
        stream: Box<dyn ReadStream>,
        module: Arc<dyn EncryptionModule>,
        nonce: [u8; 12],
        header_len: u64,
    },
}

pub struct Encryption {
    inner: Arc<dyn Storage>,
    config: EncryptionConfig,
    modules: Arc<ModuleRegistry>,
    keys: Arc<dyn FileKeyStorage>,
    sizes: Arc<Mutex<LruCache<String, u64>>>,
    /// Paths currently under size recovery; breaks the recursion when the
    /// recovery itself asks for the size again.
    fixing: Mutex<HashSet<String>>,
}

impl Encryption {
    /// Panics only if the cache capacity constant is zero, which it is not.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn new(
        inner: Arc<dyn Storage>,
        config: EncryptionConfig,
        modules: Arc<ModuleRegistry>,
        keys: Arc<dyn FileKeyStorage>,
    ) -> Self {
        let capacity = NonZeroUsize::new(SIZE_CACHE_CAPACITY).unwrap();
        Self {
            inner,
            config,
            modules,
            keys,
            sizes: Arc::new(Mutex::new(LruCache::new(capacity))),
            fixing: Mutex::new(HashSet::new()),
        }
    }

    fn excluded(&self, p: &str) -> bool {
        self.config
            .excluded
            .iter()
            .any(|prefix| path::is_under(p, prefix))
    }

    fn should_encrypt(&self, p: &str) -> bool {
        self.config.enabled && !self.excluded(p)
    }

    fn entry(&self, p: &str) -> Option<CacheEntry> {
        self.inner.cache().ok()?.get(p)
    }

    fn flagged_encrypted(&self, p: &str) -> bool {
        self.entry(p).is_some_and(|e| e.encrypted)
    }

    fn file_key(&self, p: &str) -> Result<FileKey, StorageError> {
        let key_path = source_path_for_key(p);
        self.keys
            .get_key(&key_path)?
            .ok_or_else(|| StorageError::KeyMissing {
                path: key_path.clone(),
            })
    }

    fn forget_size(&self, p: &str) {
        if let Ok(mut sizes) = self.sizes.lock() {
            sizes.pop(&path::normalize(p));
        }
    }

    /// Open the raw content and classify it by header.
    fn open_source(&self, p: &str) -> Result<Source, StorageError> {
        let mut stream = self.inner.open_read(p)?;
        let mut probe = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = stream
                .read(&mut probe[filled..])
                .map_err(|e| StorageError::io("open_read", e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if FileHeader::is_present(&probe[..filled]) {
            let header = FileHeader::decode(p, &probe[..filled])?;
            let module = self.modules.get(&header.module_id)?;
            return Ok(Source::Sealed {
                stream,
                module,
                nonce: header.nonce,
                header_len: HEADER_LEN as u64,
            });
        }
        if self.flagged_encrypted(p) {
            // Legacy write: default module, no header, zero nonce.
            return Ok(Source::Sealed {
                stream,
                module: self.modules.default_module()?,
                nonce: [0u8; 12],
                header_len: 0,
            });
        }
        stream
            .seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::io("open_read", e))?;
        Ok(Source::Plain(stream))
    }

    /// Logical size of a file flagged encrypted, trusting the stored value
    /// only while it is plausible against the physical size.
    fn logical_size(&self, p: &str) -> Result<u64, StorageError> {
        let p = path::normalize(p);
        if let Ok(mut sizes) = self.sizes.lock() {
            if let Some(size) = sizes.get(&p).copied() {
                return Ok(size);
            }
        }
        let Some(entry) = self.entry(&p) else {
            return self.inner.filesize(&p);
        };
        if !entry.encrypted {
            return self.inner.filesize(&p);
        }
        let physical = self.inner.filesize(&p)?;
        let stored = entry.unencrypted_size;
        if plausible(stored, physical) {
            let logical = stored.unsigned_abs();
            if let Ok(mut sizes) = self.sizes.lock() {
                sizes.put(p, logical);
            }
            return Ok(logical);
        }
        warn!(path = %p, stored, physical, "implausible unencrypted size, recovering");
        self.fix_unencrypted_size(&p, physical, stored)
    }

    /// Recover the logical size by decrypting only the final block, then
    /// repair the stored record.
    #[instrument(level = "debug", skip(self))]
    fn fix_unencrypted_size(
        &self,
        p: &str,
        physical: u64,
        stored: i64,
    ) -> Result<u64, StorageError> {
        {
            let mut fixing = self.fixing.lock().map_err(|_| StorageError::Unsupported {
                op: "size recovery",
            })?;
            if !fixing.insert(p.to_string()) {
                // Already recovering this path further up the stack; serve
                // the stored value rather than recurse.
                return Ok(u64::try_from(stored).unwrap_or(0));
            }
        }
        let result = self.recompute_size(p, physical);
        if let Ok(mut fixing) = self.fixing.lock() {
            fixing.remove(p);
        }
        let logical = result?;
        debug!(path = p, logical, "unencrypted size recovered");
        let fixed = i64::try_from(logical).unwrap_or(i64::MAX);
        self.inner.cache()?.update(p, &move |entry| {
            entry.unencrypted_size = fixed;
        });
        if let Ok(mut sizes) = self.sizes.lock() {
            sizes.put(p.to_string(), logical);
        }
        Ok(logical)
    }

    fn recompute_size(&self, p: &str, physical: u64) -> Result<u64, StorageError> {
        let Source::Sealed {
            mut stream,
            module,
            nonce,
            header_len,
        } = self.open_source(p)?
        else {
            // Not actually ciphertext; the physical size is the truth.
            return Ok(physical);
        };
        let key = self.file_key(p)?;
        let body = physical.saturating_sub(header_len);
        if body == 0 {
            return Ok(0);
        }
        let sealed = module.encrypted_block_size() as u64;
        let plain = module.unencrypted_block_size() as u64;
        let rem = body % sealed;
        let (last_index, tail_len) = if rem > 0 {
            (body / sealed, rem)
        } else {
            (body / sealed - 1, sealed)
        };
        stream
            .seek(SeekFrom::Start(header_len + last_index * sealed))
            .map_err(|e| StorageError::io("size recovery", e))?;
        let mut tail = vec![0u8; tail_len as usize];
        stream
            .read_exact(&mut tail)
            .map_err(|e| StorageError::io("size recovery", e))?;
        let tail_plain = module.decrypt_block(&key, last_index, &nonce, &tail)?;
        Ok(last_index * plain + tail_plain.len() as u64)
    }

    /// Encrypting write stream for `p`, reusing the path's key when one
    /// exists.
    fn encrypt_writer(&self, p: &str) -> Result<Box<dyn WriteStream>, StorageError> {
        let normalized = path::normalize(p);
        let key_path = source_path_for_key(&normalized);
        let (key, new_key) = match self.keys.get_key(&key_path)? {
            Some(key) => (key, false),
            None => (generate_key(), true),
        };
        let module = self.modules.default_module()?;
        let mut nonce = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce);
        let header = FileHeader::new(module.id(), nonce);

        let backing = self.inner.open_write(p, WriteMode::Overwrite)?;
        let cache = self.inner.cache()?;
        let keys = self.keys.clone();
        let sizes = self.sizes.clone();
        let commit_key = key.clone();
        let commit_key_path = key_path.clone();
        let commit_path = normalized;
        let on_commit: stream::Finalize = Box::new(move |logical| {
            keys.set_key(&commit_key_path, &commit_key)?;
            let logical_signed = i64::try_from(logical).unwrap_or(i64::MAX);
            cache.update(&commit_path, &move |entry| {
                entry.encrypted = true;
                entry.encrypted_version += 1;
                entry.unencrypted_size = logical_signed;
            });
            if let Ok(mut sizes) = sizes.lock() {
                sizes.put(commit_path.clone(), logical);
            }
            Ok(())
        });
        let abort_keys = self.keys.clone();
        let on_abort: stream::Cleanup = Box::new(move || {
            if new_key {
                let _ = abort_keys.delete_key(&key_path);
            }
        });

        Ok(Box::new(EncryptWriter::new(
            backing, module, key, &header, on_commit, on_abort,
        )?))
    }

    /// Plain write stream that clears a stale encrypted flag on commit, for
    /// writes performed while encryption is disabled.
    fn plain_writer(
        &self,
        p: &str,
        mode: WriteMode,
    ) -> Result<Box<dyn WriteStream>, StorageError> {
        let stream = self.inner.open_write(p, mode)?;
        if !self.flagged_encrypted(p) {
            return Ok(stream);
        }
        debug!(path = p, "plaintext write onto an encrypted file, flag will clear");
        Ok(Box::new(FlagClearingWriter {
            inner: Some(stream),
            cache: self.inner.cache()?,
            path: path::normalize(p),
        }))
    }
}

fn plausible(stored: i64, physical: u64) -> bool {
    if stored < 0 {
        return false;
    }
    if stored == 0 {
        // An empty plaintext is at most a bare header.
        return physical <= HEADER_LEN as u64;
    }
    stored.unsigned_abs() < physical
}

impl Storage for Encryption {
    fn inner(&self) -> Option<&dyn Storage> {
        Some(self.inner.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn filesize(&self, p: &str) -> Result<u64, StorageError> {
        if self.flagged_encrypted(p) {
            return self.logical_size(p);
        }
        self.inner.filesize(p)
    }

    fn stat(&self, p: &str) -> Result<Stat, StorageError> {
        let mut stat = self.inner.stat(p)?;
        if self.flagged_encrypted(p) {
            stat.size = self.logical_size(p)?;
        }
        Ok(stat)
    }

    fn get_metadata(&self, p: &str) -> Result<Metadata, StorageError> {
        let mut meta = self.inner.get_metadata(p)?;
        if self.flagged_encrypted(p) {
            meta.size = self.logical_size(p)?;
        }
        Ok(meta)
    }

    fn file_get_contents(&self, p: &str) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.open_read(p)?;
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .map_err(|e| StorageError::io("file_get_contents", e))?;
        Ok(out)
    }

    fn open_read(&self, p: &str) -> Result<Box<dyn ReadStream>, StorageError> {
        match self.open_source(p)? {
            Source::Plain(stream) => Ok(stream),
            Source::Sealed {
                stream,
                module,
                nonce,
                header_len,
            } => {
                let physical = self.inner.filesize(p)?;
                let logical = match self.logical_size(p) {
                    Ok(size) => size,
                    // No usable record; fall back to pure block math.
                    Err(_) => decrypted_size(module.as_ref(), physical, header_len)?,
                };
                let key = self.file_key(p)?;
                Ok(Box::new(DecryptReader::new(
                    stream, module, key, nonce, header_len, logical,
                )))
            }
        }
    }

    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        if self.should_encrypt(p) {
            let mut writer = self.encrypt_writer(p)?;
            writer.write_all(data)?;
            return writer.commit();
        }
        let written = self.inner.file_put_contents(p, data)?;
        if self.flagged_encrypted(p) {
            // Written in the clear; only the flag changes, the content was
            // already replaced above.
            self.inner.cache()?.update(&path::normalize(p), &|entry| {
                entry.encrypted = false;
                entry.unencrypted_size = 0;
            });
            self.forget_size(p);
        }
        Ok(written)
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        if !self.should_encrypt(p) {
            return self.plain_writer(p, mode);
        }
        if mode == WriteMode::Append {
            // Appending would require re-sealing the tail block in place.
            return Err(StorageError::Unsupported {
                op: "append to an encrypted file",
            });
        }
        self.encrypt_writer(p)
    }

    fn hash(&self, algo: ChecksumAlgo, p: &str) -> Result<String, StorageError> {
        if self.flagged_encrypted(p) {
            // Digest the plaintext, never the ciphertext.
            return Ok(algo.digest(&self.file_get_contents(p)?));
        }
        self.inner.hash(algo, p)
    }

    fn get_local_file(&self, p: &str) -> Result<PathBuf, StorageError> {
        if !self.flagged_encrypted(p) {
            return self.inner.get_local_file(p);
        }
        let plaintext = self.file_get_contents(p)?;
        let mut file =
            tempfile::NamedTempFile::new().map_err(|e| StorageError::io("get_local_file", e))?;
        file.write_all(&plaintext)
            .map_err(|e| StorageError::io("get_local_file", e))?;
        let (_, local) = file
            .keep()
            .map_err(|e| StorageError::io("get_local_file", e.error))?;
        Ok(local)
    }

    fn unlink(&self, p: &str) -> Result<(), StorageError> {
        self.inner.unlink(p)?;
        self.keys.delete_key(&path::normalize(p))?;
        self.forget_size(p);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.rename(from, to)?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        // Version snapshots resolve to the live key; moving the key with
        // them would strand the live file.
        if source_path_for_key(&to) == to && self.keys.get_key(&from)?.is_some() {
            self.keys.copy_key(&from, &to)?;
            self.keys.delete_key(&from)?;
        }
        self.forget_size(&from);
        self.forget_size(&to);
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.copy(from, to)?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        // Snapshots under files_versions read with the live file's key, so
        // no key material is duplicated for them.
        if source_path_for_key(&to) == to {
            self.keys.copy_key(&from, &to)?;
        }
        // Version counters written before the counter existed read as 0;
        // they mean "first encrypted version".
        self.inner.cache()?.update(&to, &|entry| {
            if entry.encrypted && entry.encrypted_version == 0 {
                entry.encrypted_version = 1;
            }
        });
        self.forget_size(&to);
        Ok(())
    }

    fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        // Stream through both chains: the source side decrypts with its own
        // scheme, this side re-encrypts with ours.
        transfer(source, source_path, self, target_path)?;
        self.inner.cache()?.update(&path::normalize(target_path), &|entry| {
            if entry.encrypted && entry.encrypted_version == 0 {
                entry.encrypted_version = 1;
            }
        });
        Ok(())
    }

    fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        self.copy_from_storage(source, source_path, target_path)?;
        if source.is_dir(source_path)? {
            source.rmdir(source_path)
        } else {
            source.unlink(source_path)
        }
    }
}

/// Plain write stream that drops the encrypted flag once the new cleartext
/// content is committed.
struct FlagClearingWriter {
    inner: Option<Box<dyn WriteStream>>,
    cache: Arc<dyn MetadataCache>,
    path: String,
}

impl WriteStream for FlagClearingWriter {
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
        self.cache.update(&self.path, &|entry| {
            entry.encrypted = false;
            entry.unencrypted_size = 0;
        });
        Ok(written)
    }

    fn abort(mut self: Box<Self>) -> Result<(), StorageError> {
        match self.inner.take() {
            Some(stream) => stream.abort(),
            None => Ok(()),
        }
    }
}
