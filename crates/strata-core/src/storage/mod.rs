//! The wide storage contract shared by backends and wrappers.
//!
//! Every layer of a chain — the concrete backend at the bottom and each
//! decorating wrapper above it — implements [`Storage`]. The trait provides a
//! default pass-through body for every primitive that forwards to
//! [`Storage::inner`], so a wrapper overrides `inner()` plus only the
//! primitives it changes, while a leaf backend overrides everything and
//! leaves `inner()` at its `None` default. Any primitive a wrapper does not
//! override behaves exactly as if the wrapper were transparent.

pub mod memory;

use std::any::Any;
use std::fmt;
use std::io::Read;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::MetadataCache;
use crate::error::StorageError;
use crate::lock::{LockLevel, LockingProvider};
use crate::path;

/// Mimetype reported for directories.
pub const DIR_MIMETYPE: &str = "httpd/unix-directory";

/// Permission bits reported per path.
///
/// Bit values match the original system's constants so persisted metadata
/// stays comparable: READ=1, UPDATE=2, CREATE=4, DELETE=8, SHARE=16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(1);
    pub const UPDATE: Permissions = Permissions(2);
    pub const CREATE: Permissions = Permissions(4);
    pub const DELETE: Permissions = Permissions(8);
    pub const SHARE: Permissions = Permissions(16);
    pub const ALL: Permissions = Permissions(31);

    #[must_use]
    pub fn from_bits(bits: u32) -> Permissions {
        Permissions(bits & Permissions::ALL.0)
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitAnd for Permissions {
    type Output = Permissions;

    fn bitand(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 & rhs.0)
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Permissions) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#07b}", self.0)
    }
}

/// Kind of node at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Dir,
}

/// Minimal stat record (the cheap query).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub mtime: u64,
}

/// Consolidated metadata record served by `get_metadata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    pub size: u64,
    pub mtime: u64,
    pub mimetype: String,
    pub etag: String,
    pub permissions: Permissions,
    /// `ALGO:HEX` token recorded by the checksum layer, when present.
    pub checksum: Option<String>,
}

/// Free-space report. Backends that cannot answer report `Unknown` rather
/// than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpace {
    Unknown,
    Unlimited,
    Bytes(u64),
}

/// Mode for `open_write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Truncate/replace any existing content.
    Overwrite,
    /// Extend existing content.
    Append,
}

/// Digest algorithm for the `hash` primitive and the checksum layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChecksumAlgo {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumAlgo {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgo::Sha1 => "SHA1",
            ChecksumAlgo::Sha256 => "SHA256",
            ChecksumAlgo::Sha512 => "SHA512",
        }
    }

    #[must_use]
    pub(crate) fn ring_algorithm(self) -> &'static ring::digest::Algorithm {
        match self {
            ChecksumAlgo::Sha1 => &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            ChecksumAlgo::Sha256 => &ring::digest::SHA256,
            ChecksumAlgo::Sha512 => &ring::digest::SHA512,
        }
    }

    /// Hex digest of `data`.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> String {
        hex::encode(ring::digest::digest(self.ring_algorithm(), data))
    }
}

/// Readable byte stream returned by `open_read`. Seekable so the encryption
/// layer can jump to block boundaries.
pub trait ReadStream: Read + std::io::Seek + Send {}

impl<T: Read + std::io::Seek + Send> ReadStream for T {}

/// Writable byte stream returned by `open_write`.
///
/// A write is not observable until `commit`; `abort` must undo the partial
/// write entirely (delete the partial target, release reservations, drop any
/// cache or key entries the stream created). Transforms layered by wrappers
/// (quota limiter, checksum accumulator, encrypting writer) wrap another
/// `WriteStream` and propagate failures by aborting the whole chain.
pub trait WriteStream: Send {
    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Finalize the write; returns the number of bytes committed as seen by
    /// this layer (logical bytes for transforming layers).
    fn commit(self: Box<Self>) -> Result<u64, StorageError>;

    /// Undo the write.
    fn abort(self: Box<Self>) -> Result<(), StorageError>;
}

/// Change-detection collaborator handle.
pub trait Watcher: Send + Sync {
    /// Whether the path changed since the watcher last looked at it.
    fn check_update(&self, path: &str) -> Result<bool, StorageError>;
}

fn require<'a>(
    inner: Option<&'a dyn Storage>,
    op: &'static str,
) -> Result<&'a dyn Storage, StorageError> {
    inner.ok_or(StorageError::Unsupported { op })
}

/// The storage primitive set.
///
/// Paths are slash-separated strings relative to this storage instance; the
/// empty string denotes the root. All primitives execute synchronously and
/// may block on backend I/O.
#[allow(clippy::missing_errors_doc)]
pub trait Storage: Send + Sync {
    /// Stable opaque identifier of the concrete backend. Forwards through
    /// wrappers so chain layers over the same backend compare equal.
    fn id(&self) -> String {
        self.inner().map(Storage::id).unwrap_or_default()
    }

    /// The next layer this storage delegates to; `None` for leaf backends.
    fn inner(&self) -> Option<&dyn Storage> {
        None
    }

    /// Downcasting hook for [`crate::wrapper::unwrap_to`].
    fn as_any(&self) -> &dyn Any;

    // ---- directories ----

    fn mkdir(&self, p: &str) -> Result<(), StorageError> {
        require(self.inner(), "mkdir")?.mkdir(p)
    }

    fn rmdir(&self, p: &str) -> Result<(), StorageError> {
        require(self.inner(), "rmdir")?.rmdir(p)
    }

    /// Sorted names of the direct children of a directory.
    fn opendir(&self, p: &str) -> Result<Vec<String>, StorageError> {
        require(self.inner(), "opendir")?.opendir(p)
    }

    // ---- queries ----

    fn is_dir(&self, p: &str) -> Result<bool, StorageError> {
        require(self.inner(), "is_dir")?.is_dir(p)
    }

    fn is_file(&self, p: &str) -> Result<bool, StorageError> {
        require(self.inner(), "is_file")?.is_file(p)
    }

    fn file_exists(&self, p: &str) -> Result<bool, StorageError> {
        require(self.inner(), "file_exists")?.file_exists(p)
    }

    fn file_type(&self, p: &str) -> Result<FileType, StorageError> {
        require(self.inner(), "file_type")?.file_type(p)
    }

    fn stat(&self, p: &str) -> Result<Stat, StorageError> {
        require(self.inner(), "stat")?.stat(p)
    }

    fn filesize(&self, p: &str) -> Result<u64, StorageError> {
        require(self.inner(), "filesize")?.filesize(p)
    }

    fn filemtime(&self, p: &str) -> Result<u64, StorageError> {
        require(self.inner(), "filemtime")?.filemtime(p)
    }

    fn get_mimetype(&self, p: &str) -> Result<String, StorageError> {
        require(self.inner(), "get_mimetype")?.get_mimetype(p)
    }

    fn get_etag(&self, p: &str) -> Result<String, StorageError> {
        require(self.inner(), "get_etag")?.get_etag(p)
    }

    /// Owner of a path, when the backend has a notion of ownership. Never
    /// availability-guarded.
    fn get_owner(&self, p: &str) -> Result<Option<String>, StorageError> {
        require(self.inner(), "get_owner")?.get_owner(p)
    }

    fn get_metadata(&self, p: &str) -> Result<Metadata, StorageError> {
        require(self.inner(), "get_metadata")?.get_metadata(p)
    }

    fn get_permissions(&self, p: &str) -> Result<Permissions, StorageError> {
        require(self.inner(), "get_permissions")?.get_permissions(p)
    }

    fn is_creatable(&self, p: &str) -> Result<bool, StorageError> {
        require(self.inner(), "is_creatable")?.is_creatable(p)
    }

    fn is_readable(&self, p: &str) -> Result<bool, StorageError> {
        require(self.inner(), "is_readable")?.is_readable(p)
    }

    fn is_updatable(&self, p: &str) -> Result<bool, StorageError> {
        require(self.inner(), "is_updatable")?.is_updatable(p)
    }

    fn is_deletable(&self, p: &str) -> Result<bool, StorageError> {
        require(self.inner(), "is_deletable")?.is_deletable(p)
    }

    fn is_sharable(&self, p: &str) -> Result<bool, StorageError> {
        require(self.inner(), "is_sharable")?.is_sharable(p)
    }

    /// Whether the path changed after `since` (seconds since the epoch).
    fn has_updated(&self, p: &str, since: u64) -> Result<bool, StorageError> {
        require(self.inner(), "has_updated")?.has_updated(p, since)
    }

    /// Reachability probe. Availability rechecks go through this.
    fn test(&self) -> Result<bool, StorageError> {
        require(self.inner(), "test")?.test()
    }

    // ---- content ----

    fn file_get_contents(&self, p: &str) -> Result<Vec<u8>, StorageError> {
        require(self.inner(), "file_get_contents")?.file_get_contents(p)
    }

    /// Whole-buffer write; returns the number of logical bytes written.
    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        require(self.inner(), "file_put_contents")?.file_put_contents(p, data)
    }

    fn open_read(&self, p: &str) -> Result<Box<dyn ReadStream>, StorageError> {
        require(self.inner(), "open_read")?.open_read(p)
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        require(self.inner(), "open_write")?.open_write(p, mode)
    }

    /// Hex digest of a file's content.
    fn hash(&self, algo: ChecksumAlgo, p: &str) -> Result<String, StorageError> {
        require(self.inner(), "hash")?.hash(algo, p)
    }

    /// Materialize the content as a local file on disk.
    fn get_local_file(&self, p: &str) -> Result<PathBuf, StorageError> {
        require(self.inner(), "get_local_file")?.get_local_file(p)
    }

    // ---- mutation ----

    fn unlink(&self, p: &str) -> Result<(), StorageError> {
        require(self.inner(), "unlink")?.unlink(p)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        require(self.inner(), "rename")?.rename(from, to)
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        require(self.inner(), "copy")?.copy(from, to)
    }

    /// Create the file when absent; set its mtime (now when `None`).
    fn touch(&self, p: &str, mtime: Option<u64>) -> Result<(), StorageError> {
        require(self.inner(), "touch")?.touch(p, mtime)
    }

    /// Copy `source_path` on another storage into `target_path` on this one.
    fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        require(self.inner(), "copy_from_storage")?.copy_from_storage(
            source,
            source_path,
            target_path,
        )
    }

    /// Move `source_path` on another storage into `target_path` on this one.
    fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        require(self.inner(), "move_from_storage")?.move_from_storage(
            source,
            source_path,
            target_path,
        )
    }

    // ---- capacity / search ----

    fn free_space(&self, p: &str) -> Result<FreeSpace, StorageError> {
        require(self.inner(), "free_space")?.free_space(p)
    }

    /// Paths whose final segment contains `query`.
    fn search(&self, query: &str) -> Result<Vec<String>, StorageError> {
        require(self.inner(), "search")?.search(query)
    }

    // ---- collaborator accessors ----

    /// Metadata cache for this storage. Wrappers that rewrite paths or mask
    /// metadata must wrap the returned handle so callers observe translated
    /// values.
    fn cache(&self) -> Result<Arc<dyn MetadataCache>, StorageError> {
        require(self.inner(), "cache")?.cache()
    }

    /// Change-detection handle, path-scoped like `cache`.
    fn watcher(&self) -> Result<Arc<dyn Watcher>, StorageError> {
        require(self.inner(), "watcher")?.watcher()
    }

    // ---- locking ----

    fn acquire_lock(
        &self,
        p: &str,
        level: LockLevel,
        provider: &dyn LockingProvider,
    ) -> Result<(), StorageError> {
        require(self.inner(), "acquire_lock")?.acquire_lock(p, level, provider)
    }

    fn release_lock(
        &self,
        p: &str,
        level: LockLevel,
        provider: &dyn LockingProvider,
    ) -> Result<(), StorageError> {
        require(self.inner(), "release_lock")?.release_lock(p, level, provider)
    }

    fn change_lock(
        &self,
        p: &str,
        from: LockLevel,
        to: LockLevel,
        provider: &dyn LockingProvider,
    ) -> Result<(), StorageError> {
        require(self.inner(), "change_lock")?.change_lock(p, from, to, provider)
    }
}

/// Generic cross-storage transfer: recursive for directories, streamed for
/// files. The fallback for `copy_from_storage` when no cheaper path exists.
pub fn transfer(
    source: &dyn Storage,
    source_path: &str,
    target: &dyn Storage,
    target_path: &str,
) -> Result<(), StorageError> {
    if source.is_dir(source_path)? {
        if !target.file_exists(target_path)? {
            target.mkdir(target_path)?;
        }
        for entry in source.opendir(source_path)? {
            transfer(
                source,
                &path::join(source_path, &entry),
                target,
                &path::join(target_path, &entry),
            )?;
        }
        return Ok(());
    }

    let mut reader = source.open_read(source_path)?;
    let writer = target.open_write(target_path, WriteMode::Overwrite)?;
    copy_stream(&mut reader, writer).map(|_| ())
}

/// Drain a reader into a write stream, committing on success and aborting on
/// any failure so no partial target survives.
pub fn copy_stream(
    reader: &mut dyn ReadStream,
    mut writer: Box<dyn WriteStream>,
) -> Result<u64, StorageError> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = writer.abort();
                return Err(StorageError::io("copy", e));
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]) {
            // write_all aborts the inner chain itself on transform failures,
            // but the outermost handle still has to be dropped via abort.
            let _ = writer.abort();
            return Err(e);
        }
    }
    writer.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits_compose() {
        let rw = Permissions::READ | Permissions::UPDATE;
        assert!(rw.contains(Permissions::READ));
        assert!(!rw.contains(Permissions::CREATE));
        assert_eq!(rw & Permissions::READ, Permissions::READ);
        assert_eq!(Permissions::ALL.bits(), 31);
        assert_eq!(Permissions::from_bits(0xFF), Permissions::ALL);
    }

    #[test]
    fn checksum_algo_tokens() {
        assert_eq!(ChecksumAlgo::Sha1.as_str(), "SHA1");
        // Known SHA-1 of the empty string.
        assert_eq!(
            ChecksumAlgo::Sha1.digest(b""),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }
}
