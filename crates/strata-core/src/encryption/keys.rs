//! Per-file key material and its storage collaborator.

use dashmap::DashMap;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::StorageError;
use crate::path;

/// A per-file content key. Wiped from memory on drop.
pub type FileKey = Zeroizing<[u8; 32]>;

/// Fresh random content key.
#[must_use]
pub fn generate_key() -> FileKey {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::rng().fill_bytes(key.as_mut());
    key
}

/// Key material store, keyed by the full storage-relative path.
///
/// Key state must survive individual wrapper instances and stay consistent
/// across concurrent chains, so implementations are process-shared.
pub trait FileKeyStorage: Send + Sync {
    fn get_key(&self, path: &str) -> Result<Option<FileKey>, StorageError>;
    fn set_key(&self, path: &str, key: &FileKey) -> Result<(), StorageError>;
    fn copy_key(&self, from: &str, to: &str) -> Result<(), StorageError>;
    fn delete_key(&self, path: &str) -> Result<(), StorageError>;
}

/// Process-shared in-memory reference key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: DashMap<String, [u8; 32]>,
}

impl MemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FileKeyStorage for MemoryKeyStore {
    fn get_key(&self, p: &str) -> Result<Option<FileKey>, StorageError> {
        Ok(self
            .keys
            .get(&path::normalize(p))
            .map(|k| Zeroizing::new(*k)))
    }

    fn set_key(&self, p: &str, key: &FileKey) -> Result<(), StorageError> {
        self.keys.insert(path::normalize(p), **key);
        Ok(())
    }

    fn copy_key(&self, from: &str, to: &str) -> Result<(), StorageError> {
        if let Some(key) = self.keys.get(&path::normalize(from)).map(|k| *k) {
            self.keys.insert(path::normalize(to), key);
        }
        Ok(())
    }

    fn delete_key(&self, p: &str) -> Result<(), StorageError> {
        self.keys.remove(&path::normalize(p));
        Ok(())
    }
}

/// Path whose key material a read of `p` uses.
///
/// Version snapshots (`files_versions/<name>.v<timestamp>`) are ciphertext
/// copies of the live file and were written with its key, so their key
/// lookups resolve to the live path under `files/`.
#[must_use]
pub fn source_path_for_key(p: &str) -> String {
    let p = path::normalize(p);
    let Some(rel) = path::strip_prefix(&p, "files_versions") else {
        return p;
    };
    let name = path::file_name(&rel);
    let Some((base, timestamp)) = name.rsplit_once(".v") else {
        return p;
    };
    if base.is_empty() || timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return p;
    }
    path::join("files", &path::join(&path::parent(&rel), base))
}
