//! In-process leaf backend.
//!
//! `MemoryStorage` implements the full primitive set over a [`DashMap`] node
//! tree and keeps the metadata cache in sync the way a scanner would for an
//! on-disk backend. It is the reference backend for every wrapper test and
//! doubles as a fault-injection point: a storage can be flipped unavailable
//! to exercise the circuit breaker, and it counts how often primitives
//! actually reach it.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;

use crate::cache::{CacheEntry, MemoryCache, MetadataCache};
use crate::clock::{Clock, SystemClock};
use crate::error::StorageError;
use crate::lock::{LockLevel, LockingProvider};
use crate::path;
use crate::storage::{
    ChecksumAlgo, DIR_MIMETYPE, FileType, FreeSpace, Metadata, Permissions, ReadStream, Stat,
    Storage, WriteMode, WriteStream, transfer,
};

#[derive(Debug, Clone)]
enum Node {
    Dir { mtime: u64 },
    File { data: Vec<u8>, mtime: u64 },
}

impl Node {
    fn mtime(&self) -> u64 {
        match self {
            Node::Dir { mtime } | Node::File { mtime, .. } => *mtime,
        }
    }

    fn size(&self) -> u64 {
        match self {
            Node::Dir { .. } => 0,
            Node::File { data, .. } => data.len() as u64,
        }
    }
}

struct MemoryInner {
    id: String,
    nodes: DashMap<String, Node>,
    cache: Arc<MemoryCache>,
    clock: Arc<dyn Clock>,
    owner: Option<String>,
    capacity: Option<u64>,
    fault: Mutex<Option<(String, bool)>>,
    calls: AtomicU64,
    local_dir: Mutex<Option<tempfile::TempDir>>,
    local_seq: AtomicU64,
}

impl MemoryInner {
    /// Availability gate shared by every primitive except `get_owner`.
    fn reach(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.fault.lock().map_err(|_| StorageError::Unsupported {
            op: "fault-injection",
        })?;
        match fault.as_ref() {
            Some((message, auth)) => Err(StorageError::NotAvailable {
                message: message.clone(),
                auth_failure: *auth,
            }),
            None => Ok(()),
        }
    }

    fn node(&self, p: &str) -> Result<Node, StorageError> {
        let p = path::normalize(p);
        if p.is_empty() {
            return Ok(Node::Dir { mtime: 0 });
        }
        self.nodes
            .get(&p)
            .map(|n| n.clone())
            .ok_or_else(|| StorageError::not_found(p))
    }

    fn exists(&self, p: &str) -> bool {
        let p = path::normalize(p);
        p.is_empty() || self.nodes.contains_key(&p)
    }

    fn is_dir(&self, p: &str) -> bool {
        let p = path::normalize(p);
        p.is_empty() || matches!(self.nodes.get(&p).as_deref(), Some(Node::Dir { .. }))
    }

    fn require_parent(&self, p: &str, op: &'static str) -> Result<(), StorageError> {
        let parent = path::parent(p);
        if self.is_dir(&parent) {
            Ok(())
        } else {
            Err(StorageError::not_permitted(
                op,
                p,
                format!("parent directory '{parent}' does not exist"),
            ))
        }
    }

    fn etag(&self, p: &str, mtime: u64, size: u64) -> String {
        let material = format!("{}|{p}|{mtime}|{size}", self.id);
        ChecksumAlgo::Sha256.digest(material.as_bytes())[..16].to_string()
    }

    fn mimetype_of(&self, p: &str) -> String {
        if self.is_dir(p) {
            return DIR_MIMETYPE.to_string();
        }
        mimetype_for(p).to_string()
    }

    /// Refresh the scanner-maintained cache fields for a path, preserving
    /// anything the wrapper layers recorded (encrypted flag, checksum,
    /// unencrypted size). In-progress part files are never indexed.
    fn rescan(&self, p: &str) {
        if path::is_part_file(p) {
            return;
        }
        let Ok(node) = self.node(p) else {
            return;
        };
        let size = node.size() as i64;
        let mtime = node.mtime();
        let mimetype = self.mimetype_of(p);
        let etag = self.etag(p, mtime, size as u64);
        let p = path::normalize(p);
        self.cache.update(&p, &move |entry: &mut CacheEntry| {
            entry.size = size;
            entry.mtime = mtime;
            entry.mimetype = mimetype.clone();
            entry.etag = etag.clone();
            entry.permissions = Permissions::ALL;
        });
    }

    fn insert_file(&self, p: &str, data: Vec<u8>) -> u64 {
        let now = self.clock.now();
        let len = data.len() as u64;
        self.nodes
            .insert(path::normalize(p), Node::File { data, mtime: now });
        self.rescan(p);
        len
    }
}

/// In-memory storage backend.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

impl MemoryStorage {
    /// Create a backend named `name`; the name feeds the storage id, so two
    /// storages created with the same name compare as the same backend.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::build(name, Arc::new(SystemClock), None, None)
    }

    #[must_use]
    pub fn with_clock(name: &str, clock: Arc<dyn Clock>) -> Self {
        Self::build(name, clock, None, None)
    }

    #[must_use]
    pub fn with_owner(name: &str, owner: &str) -> Self {
        Self::build(name, Arc::new(SystemClock), Some(owner.to_string()), None)
    }

    /// Backend with a fixed byte capacity, for free-space clamping tests.
    #[must_use]
    pub fn with_capacity(name: &str, capacity: u64) -> Self {
        Self::build(name, Arc::new(SystemClock), None, Some(capacity))
    }

    fn build(
        name: &str,
        clock: Arc<dyn Clock>,
        owner: Option<String>,
        capacity: Option<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                id: format!("memory::{name}"),
                nodes: DashMap::new(),
                cache: Arc::new(MemoryCache::new()),
                clock,
                owner,
                capacity,
                fault: Mutex::new(None),
                calls: AtomicU64::new(0),
                local_dir: Mutex::new(None),
                local_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Mark the backend unreachable; every primitive except `get_owner`
    /// fails with `NotAvailable` until [`Self::set_available`].
    pub fn set_unavailable(&self, message: &str, auth_failure: bool) {
        if let Ok(mut fault) = self.inner.fault.lock() {
            *fault = Some((message.to_string(), auth_failure));
        }
    }

    pub fn set_available(&self) {
        if let Ok(mut fault) = self.inner.fault.lock() {
            *fault = None;
        }
    }

    /// How many primitives reached this backend (including failed ones).
    #[must_use]
    pub fn backend_calls(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// The shared cache handle, typed. Handy for tests seeding entries.
    #[must_use]
    pub fn memory_cache(&self) -> Arc<MemoryCache> {
        self.inner.cache.clone()
    }
}

impl Storage for MemoryStorage {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn mkdir(&self, p: &str) -> Result<(), StorageError> {
        self.inner.reach()?;
        let p = path::normalize(p);
        if self.inner.exists(&p) {
            return Err(StorageError::not_permitted(
                "mkdir",
                &p,
                "already exists".to_string(),
            ));
        }
        self.inner.require_parent(&p, "mkdir")?;
        self.inner.nodes.insert(
            p.clone(),
            Node::Dir {
                mtime: self.inner.clock.now(),
            },
        );
        self.inner.rescan(&p);
        Ok(())
    }

    fn rmdir(&self, p: &str) -> Result<(), StorageError> {
        self.inner.reach()?;
        let p = path::normalize(p);
        if !self.inner.is_dir(&p) {
            return Err(StorageError::not_found(&p));
        }
        if p.is_empty() {
            return Err(StorageError::not_permitted(
                "rmdir",
                "",
                "cannot remove the storage root".to_string(),
            ));
        }
        self.inner
            .nodes
            .retain(|key, _| !path::is_under(key, &p));
        self.inner.cache.remove(&p);
        Ok(())
    }

    fn opendir(&self, p: &str) -> Result<Vec<String>, StorageError> {
        self.inner.reach()?;
        let p = path::normalize(p);
        if !self.inner.is_dir(&p) {
            return Err(StorageError::not_found(&p));
        }
        let mut names: Vec<String> = self
            .inner
            .nodes
            .iter()
            .filter_map(|kv| path::strip_prefix(kv.key(), &p))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn is_dir(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.reach()?;
        Ok(self.inner.is_dir(p))
    }

    fn is_file(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.reach()?;
        Ok(matches!(
            self.inner.nodes.get(&path::normalize(p)).as_deref(),
            Some(Node::File { .. })
        ))
    }

    fn file_exists(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.reach()?;
        Ok(self.inner.exists(p))
    }

    fn file_type(&self, p: &str) -> Result<FileType, StorageError> {
        self.inner.reach()?;
        match self.inner.node(p)? {
            Node::Dir { .. } => Ok(FileType::Dir),
            Node::File { .. } => Ok(FileType::File),
        }
    }

    fn stat(&self, p: &str) -> Result<Stat, StorageError> {
        self.inner.reach()?;
        let node = self.inner.node(p)?;
        Ok(Stat {
            size: node.size(),
            mtime: node.mtime(),
        })
    }

    fn filesize(&self, p: &str) -> Result<u64, StorageError> {
        self.inner.reach()?;
        Ok(self.inner.node(p)?.size())
    }

    fn filemtime(&self, p: &str) -> Result<u64, StorageError> {
        self.inner.reach()?;
        Ok(self.inner.node(p)?.mtime())
    }

    fn get_mimetype(&self, p: &str) -> Result<String, StorageError> {
        self.inner.reach()?;
        self.inner.node(p)?;
        Ok(self.inner.mimetype_of(p))
    }

    fn get_etag(&self, p: &str) -> Result<String, StorageError> {
        self.inner.reach()?;
        let node = self.inner.node(p)?;
        Ok(self.inner.etag(p, node.mtime(), node.size()))
    }

    fn get_owner(&self, _p: &str) -> Result<Option<String>, StorageError> {
        // Ownership has no availability dependency: answered without
        // touching the node tree or the fault gate.
        Ok(self.inner.owner.clone())
    }

    fn get_metadata(&self, p: &str) -> Result<Metadata, StorageError> {
        self.inner.reach()?;
        let node = self.inner.node(p)?;
        let checksum = self
            .inner
            .cache
            .get(p)
            .and_then(|entry| entry.checksum);
        Ok(Metadata {
            file_type: match node {
                Node::Dir { .. } => FileType::Dir,
                Node::File { .. } => FileType::File,
            },
            size: node.size(),
            mtime: node.mtime(),
            mimetype: self.inner.mimetype_of(p),
            etag: self.inner.etag(p, node.mtime(), node.size()),
            permissions: self.get_permissions(p)?,
            checksum,
        })
    }

    fn get_permissions(&self, p: &str) -> Result<Permissions, StorageError> {
        self.inner.reach()?;
        let p = path::normalize(p);
        if !self.inner.exists(&p) {
            return Err(StorageError::not_found(&p));
        }
        if p.is_empty() {
            // The root itself cannot be deleted.
            return Ok(Permissions::READ
                | Permissions::UPDATE
                | Permissions::CREATE
                | Permissions::SHARE);
        }
        Ok(Permissions::ALL)
    }

    fn is_creatable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.reach()?;
        Ok(self.inner.is_dir(p))
    }

    fn is_readable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.reach()?;
        Ok(self.inner.exists(p))
    }

    fn is_updatable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.reach()?;
        Ok(self.inner.exists(p))
    }

    fn is_deletable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.reach()?;
        let p = path::normalize(p);
        Ok(!p.is_empty() && self.inner.exists(&p))
    }

    fn is_sharable(&self, p: &str) -> Result<bool, StorageError> {
        self.inner.reach()?;
        Ok(self.inner.exists(p))
    }

    fn has_updated(&self, p: &str, since: u64) -> Result<bool, StorageError> {
        self.inner.reach()?;
        Ok(self.inner.node(p)?.mtime() > since)
    }

    fn test(&self) -> Result<bool, StorageError> {
        self.inner.reach()?;
        Ok(true)
    }

    fn file_get_contents(&self, p: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.reach()?;
        match self.inner.node(p)? {
            Node::File { data, .. } => Ok(data),
            Node::Dir { .. } => Err(StorageError::not_permitted(
                "file_get_contents",
                p,
                "is a directory".to_string(),
            )),
        }
    }

    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        self.inner.reach()?;
        self.inner.require_parent(p, "file_put_contents")?;
        if self.inner.is_dir(p) {
            return Err(StorageError::not_permitted(
                "file_put_contents",
                p,
                "is a directory".to_string(),
            ));
        }
        trace!(path = p, bytes = data.len(), "memory write");
        Ok(self.inner.insert_file(p, data.to_vec()))
    }

    fn open_read(&self, p: &str) -> Result<Box<dyn ReadStream>, StorageError> {
        self.inner.reach()?;
        match self.inner.node(p)? {
            Node::File { data, .. } => Ok(Box::new(Cursor::new(data))),
            Node::Dir { .. } => Err(StorageError::not_permitted(
                "open_read",
                p,
                "is a directory".to_string(),
            )),
        }
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        self.inner.reach()?;
        self.inner.require_parent(p, "open_write")?;
        let buffer = match mode {
            WriteMode::Overwrite => Vec::new(),
            WriteMode::Append => match self.inner.node(p) {
                Ok(Node::File { data, .. }) => data,
                _ => Vec::new(),
            },
        };
        Ok(Box::new(MemoryWriter {
            inner: self.inner.clone(),
            path: path::normalize(p),
            buffer,
        }))
    }

    fn hash(&self, algo: ChecksumAlgo, p: &str) -> Result<String, StorageError> {
        self.inner.reach()?;
        let data = self.file_get_contents(p)?;
        Ok(algo.digest(&data))
    }

    fn get_local_file(&self, p: &str) -> Result<PathBuf, StorageError> {
        self.inner.reach()?;
        let data = self.file_get_contents(p)?;
        let seq = self.inner.local_seq.fetch_add(1, Ordering::SeqCst);
        let mut guard = self
            .inner
            .local_dir
            .lock()
            .map_err(|_| StorageError::Unsupported {
                op: "get_local_file",
            })?;
        if guard.is_none() {
            *guard =
                Some(tempfile::TempDir::new().map_err(|e| StorageError::io("get_local_file", e))?);
        }
        let dir = guard.as_ref().ok_or(StorageError::Unsupported {
            op: "get_local_file",
        })?;
        let local = dir.path().join(format!("{seq}-{}", path::file_name(p)));
        std::fs::write(&local, data).map_err(|e| StorageError::io("get_local_file", e))?;
        Ok(local)
    }

    fn unlink(&self, p: &str) -> Result<(), StorageError> {
        self.inner.reach()?;
        let p = path::normalize(p);
        match self.inner.node(&p)? {
            Node::Dir { .. } => Err(StorageError::not_permitted(
                "unlink",
                &p,
                "is a directory".to_string(),
            )),
            Node::File { .. } => {
                self.inner.nodes.remove(&p);
                self.inner.cache.remove(&p);
                Ok(())
            }
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.reach()?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.inner.node(&from)?;
        self.inner.require_parent(&to, "rename")?;
        let moved: Vec<(String, Node)> = self
            .inner
            .nodes
            .iter()
            .filter(|kv| path::is_under(kv.key(), &from))
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();
        for (key, node) in moved {
            let suffix = path::strip_prefix(&key, &from).unwrap_or_default();
            self.inner.nodes.remove(&key);
            self.inner.nodes.insert(path::join(&to, &suffix), node);
        }
        self.inner.cache.move_entry(&from, &to);
        // A finalized part file has no carried entry; index it now.
        self.inner.rescan(&to);
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.reach()?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.inner.node(&from)?;
        self.inner.require_parent(&to, "copy")?;
        let copied: Vec<(String, Node)> = self
            .inner
            .nodes
            .iter()
            .filter(|kv| path::is_under(kv.key(), &from))
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();
        for (key, node) in copied {
            let suffix = path::strip_prefix(&key, &from).unwrap_or_default();
            let target = path::join(&to, &suffix);
            self.inner.nodes.insert(target.clone(), node);
            if let Some(entry) = self.inner.cache.get(&key) {
                self.inner.cache.put(&target, entry);
            }
            self.inner.rescan(&target);
        }
        Ok(())
    }

    fn touch(&self, p: &str, mtime: Option<u64>) -> Result<(), StorageError> {
        self.inner.reach()?;
        let p = path::normalize(p);
        let stamp = mtime.unwrap_or_else(|| self.inner.clock.now());
        match self.inner.nodes.get_mut(&p) {
            Some(mut node) => match node.value_mut() {
                Node::Dir { mtime } | Node::File { mtime, .. } => *mtime = stamp,
            },
            None => {
                self.inner.require_parent(&p, "touch")?;
                self.inner.nodes.insert(
                    p.clone(),
                    Node::File {
                        data: Vec::new(),
                        mtime: stamp,
                    },
                );
            }
        }
        self.inner.rescan(&p);
        Ok(())
    }

    fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        self.inner.reach()?;
        transfer(source, source_path, self, target_path)
    }

    fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        self.inner.reach()?;
        transfer(source, source_path, self, target_path)?;
        if source.is_dir(source_path)? {
            source.rmdir(source_path)
        } else {
            source.unlink(source_path)
        }
    }

    fn free_space(&self, _p: &str) -> Result<FreeSpace, StorageError> {
        self.inner.reach()?;
        match self.inner.capacity {
            None => Ok(FreeSpace::Unlimited),
            Some(cap) => {
                let used: u64 = self.inner.nodes.iter().map(|kv| kv.value().size()).sum();
                Ok(FreeSpace::Bytes(cap.saturating_sub(used)))
            }
        }
    }

    fn search(&self, query: &str) -> Result<Vec<String>, StorageError> {
        self.inner.reach()?;
        let mut hits: Vec<String> = self
            .inner
            .nodes
            .iter()
            .map(|kv| kv.key().clone())
            .filter(|key| path::file_name(key).contains(query))
            .collect();
        hits.sort();
        Ok(hits)
    }

    fn cache(&self) -> Result<Arc<dyn MetadataCache>, StorageError> {
        Ok(self.inner.cache.clone())
    }

    fn watcher(&self) -> Result<Arc<dyn crate::storage::Watcher>, StorageError> {
        Ok(Arc::new(MemoryWatcher {
            storage: self.clone(),
            seen: DashMap::new(),
        }))
    }

    fn acquire_lock(
        &self,
        p: &str,
        level: LockLevel,
        provider: &dyn LockingProvider,
    ) -> Result<(), StorageError> {
        provider.acquire(&path::normalize(p), level)
    }

    fn release_lock(
        &self,
        p: &str,
        level: LockLevel,
        provider: &dyn LockingProvider,
    ) -> Result<(), StorageError> {
        provider.release(&path::normalize(p), level)
    }

    fn change_lock(
        &self,
        p: &str,
        from: LockLevel,
        to: LockLevel,
        provider: &dyn LockingProvider,
    ) -> Result<(), StorageError> {
        provider.change(&path::normalize(p), from, to)
    }
}

struct MemoryWriter {
    inner: Arc<MemoryInner>,
    path: String,
    buffer: Vec<u8>,
}

impl WriteStream for MemoryWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<u64, StorageError> {
        self.inner.reach()?;
        let len = self.buffer.len() as u64;
        self.inner.insert_file(&self.path, self.buffer);
        Ok(len)
    }

    fn abort(self: Box<Self>) -> Result<(), StorageError> {
        // Nothing became observable before commit; dropping the buffer is
        // the whole cleanup.
        Ok(())
    }
}

struct MemoryWatcher {
    storage: MemoryStorage,
    seen: DashMap<String, u64>,
}

impl crate::storage::Watcher for MemoryWatcher {
    fn check_update(&self, p: &str) -> Result<bool, StorageError> {
        let mtime = self.storage.filemtime(p)?;
        let changed = self
            .seen
            .insert(path::normalize(p), mtime)
            .is_none_or(|last| last != mtime);
        Ok(changed)
    }
}

fn mimetype_for(p: &str) -> &'static str {
    let name = path::file_name(p);
    let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
