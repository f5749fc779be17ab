//! Availability: circuit breaker around an unreliable backend.
//!
//! The breaker state is keyed by the backend's storage id and persisted
//! through an [`AvailabilityStore`], never kept solely in wrapper memory:
//! circuit-breaking must hold across concurrent and sequential call chains
//! against the same backend. Once a backend is marked unavailable, every
//! guarded primitive short-circuits with `NotAvailable` until the recheck
//! TTL elapses; the next query after that performs exactly one reachability
//! probe. The state transition is an explicit side effect performed after a
//! failed call, not an implicit catch-all.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::path;
use crate::storage::{
    ChecksumAlgo, FileType, FreeSpace, Metadata, Permissions, ReadStream, Stat, Storage,
    WriteMode, WriteStream,
};

/// Default recheck TTL, seconds.
pub const RECHECK_TTL_SECS: u64 = 600;

/// Last-known availability of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub available: bool,
    pub last_checked: u64,
    /// Whether the failure was an authentication failure; selects the
    /// extended recheck delay.
    pub auth_failure: bool,
}

/// Persistence for availability records, shared across call chains.
pub trait AvailabilityStore: Send + Sync {
    fn get(&self, storage_id: &str) -> Option<AvailabilityRecord>;
    fn set(&self, storage_id: &str, record: AvailabilityRecord);
}

/// Process-shared reference store.
#[derive(Debug, Default)]
pub struct MemoryAvailabilityStore {
    records: DashMap<String, AvailabilityRecord>,
}

impl MemoryAvailabilityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AvailabilityStore for MemoryAvailabilityStore {
    fn get(&self, storage_id: &str) -> Option<AvailabilityRecord> {
        self.records.get(storage_id).map(|r| *r)
    }

    fn set(&self, storage_id: &str, record: AvailabilityRecord) {
        self.records.insert(storage_id.to_string(), record);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    /// Seconds before an unavailable backend is probed again.
    pub recheck_ttl_secs: u64,
    /// Configured delay for authentication failures; the effective auth TTL
    /// is `max(auth_recheck_delay_secs, recheck_ttl_secs)`.
    pub auth_recheck_delay_secs: u64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            recheck_ttl_secs: RECHECK_TTL_SECS,
            auth_recheck_delay_secs: RECHECK_TTL_SECS,
        }
    }
}

impl AvailabilityConfig {
    fn ttl_for(&self, record: AvailabilityRecord) -> u64 {
        if record.auth_failure {
            self.auth_recheck_delay_secs.max(self.recheck_ttl_secs)
        } else {
            self.recheck_ttl_secs
        }
    }
}

pub struct Availability {
    inner: Arc<dyn Storage>,
    store: Arc<dyn AvailabilityStore>,
    clock: Arc<dyn Clock>,
    config: AvailabilityConfig,
}

impl Availability {
    #[must_use]
    pub fn new(
        inner: Arc<dyn Storage>,
        store: Arc<dyn AvailabilityStore>,
        clock: Arc<dyn Clock>,
        config: AvailabilityConfig,
    ) -> Self {
        Self {
            inner,
            store,
            clock,
            config,
        }
    }

    fn mark_unavailable(&self, err: &StorageError) {
        let auth_failure = matches!(
            err,
            StorageError::NotAvailable {
                auth_failure: true,
                ..
            }
        );
        warn!(storage = %self.id(), auth_failure, %err, "marking storage unavailable");
        self.store.set(
            &self.id(),
            AvailabilityRecord {
                available: false,
                last_checked: self.clock.now(),
                auth_failure,
            },
        );
    }

    fn mark_available(&self) {
        self.store.set(
            &self.id(),
            AvailabilityRecord {
                available: true,
                last_checked: self.clock.now(),
                auth_failure: false,
            },
        );
    }

    /// Short-circuit while the breaker is open; probe once when the TTL has
    /// elapsed.
    fn ensure_available(&self) -> Result<(), StorageError> {
        let Some(record) = self.store.get(&self.id()) else {
            return Ok(());
        };
        if record.available {
            return Ok(());
        }
        let age = self.clock.now().saturating_sub(record.last_checked);
        if age <= self.config.ttl_for(record) {
            return Err(StorageError::NotAvailable {
                message: "storage marked unavailable, recheck delay not elapsed".to_string(),
                auth_failure: record.auth_failure,
            });
        }
        debug!(storage = %self.id(), "recheck TTL elapsed, probing backend");
        match self.inner.test() {
            Ok(true) => {
                self.mark_available();
                Ok(())
            }
            Ok(false) => {
                let err = StorageError::not_available("backend probe failed");
                self.mark_unavailable(&err);
                Err(err)
            }
            Err(err) if err.is_not_available() => {
                self.mark_unavailable(&err);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Run one guarded primitive: gate on the breaker, record a fresh
    /// `NotAvailable` from the backend, re-raise everything unchanged.
    fn run<T>(
        &self,
        f: impl FnOnce(&dyn Storage) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.ensure_available()?;
        match f(self.inner.as_ref()) {
            Err(err) if err.is_not_available() => {
                self.mark_unavailable(&err);
                Err(err)
            }
            other => other,
        }
    }
}

impl Storage for Availability {
    fn inner(&self) -> Option<&dyn Storage> {
        Some(self.inner.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn mkdir(&self, p: &str) -> Result<(), StorageError> {
        self.run(|s| s.mkdir(p))
    }

    fn rmdir(&self, p: &str) -> Result<(), StorageError> {
        self.run(|s| s.rmdir(p))
    }

    fn opendir(&self, p: &str) -> Result<Vec<String>, StorageError> {
        self.run(|s| s.opendir(p))
    }

    fn is_dir(&self, p: &str) -> Result<bool, StorageError> {
        self.run(|s| s.is_dir(p))
    }

    fn is_file(&self, p: &str) -> Result<bool, StorageError> {
        self.run(|s| s.is_file(p))
    }

    fn file_exists(&self, p: &str) -> Result<bool, StorageError> {
        // An empty relative path always denotes the storage root; no need
        // to bother an unavailable backend for that.
        if path::normalize(p).is_empty() {
            return Ok(true);
        }
        self.run(|s| s.file_exists(p))
    }

    fn file_type(&self, p: &str) -> Result<FileType, StorageError> {
        self.run(|s| s.file_type(p))
    }

    fn stat(&self, p: &str) -> Result<Stat, StorageError> {
        self.run(|s| s.stat(p))
    }

    fn filesize(&self, p: &str) -> Result<u64, StorageError> {
        self.run(|s| s.filesize(p))
    }

    fn filemtime(&self, p: &str) -> Result<u64, StorageError> {
        self.run(|s| s.filemtime(p))
    }

    fn get_mimetype(&self, p: &str) -> Result<String, StorageError> {
        self.run(|s| s.get_mimetype(p))
    }

    fn get_etag(&self, p: &str) -> Result<String, StorageError> {
        self.run(|s| s.get_etag(p))
    }

    // get_owner is intentionally not overridden: ownership queries have no
    // availability dependency.

    fn get_metadata(&self, p: &str) -> Result<Metadata, StorageError> {
        self.run(|s| s.get_metadata(p))
    }

    fn get_permissions(&self, p: &str) -> Result<Permissions, StorageError> {
        self.run(|s| s.get_permissions(p))
    }

    fn is_creatable(&self, p: &str) -> Result<bool, StorageError> {
        self.run(|s| s.is_creatable(p))
    }

    fn is_readable(&self, p: &str) -> Result<bool, StorageError> {
        self.run(|s| s.is_readable(p))
    }

    fn is_updatable(&self, p: &str) -> Result<bool, StorageError> {
        self.run(|s| s.is_updatable(p))
    }

    fn is_deletable(&self, p: &str) -> Result<bool, StorageError> {
        self.run(|s| s.is_deletable(p))
    }

    fn is_sharable(&self, p: &str) -> Result<bool, StorageError> {
        self.run(|s| s.is_sharable(p))
    }

    fn has_updated(&self, p: &str, since: u64) -> Result<bool, StorageError> {
        self.run(|s| s.has_updated(p, since))
    }

    fn test(&self) -> Result<bool, StorageError> {
        self.run(|s| s.test())
    }

    fn file_get_contents(&self, p: &str) -> Result<Vec<u8>, StorageError> {
        self.run(|s| s.file_get_contents(p))
    }

    fn file_put_contents(&self, p: &str, data: &[u8]) -> Result<u64, StorageError> {
        self.run(|s| s.file_put_contents(p, data))
    }

    fn open_read(&self, p: &str) -> Result<Box<dyn ReadStream>, StorageError> {
        self.run(|s| s.open_read(p))
    }

    fn open_write(&self, p: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>, StorageError> {
        self.run(|s| s.open_write(p, mode))
    }

    fn hash(&self, algo: ChecksumAlgo, p: &str) -> Result<String, StorageError> {
        self.run(|s| s.hash(algo, p))
    }

    fn get_local_file(&self, p: &str) -> Result<PathBuf, StorageError> {
        self.run(|s| s.get_local_file(p))
    }

    fn unlink(&self, p: &str) -> Result<(), StorageError> {
        self.run(|s| s.unlink(p))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.run(|s| s.rename(from, to))
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.run(|s| s.copy(from, to))
    }

    fn touch(&self, p: &str, mtime: Option<u64>) -> Result<(), StorageError> {
        self.run(|s| s.touch(p, mtime))
    }

    fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        self.run(|s| s.copy_from_storage(source, source_path, target_path))
    }

    fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), StorageError> {
        self.run(|s| s.move_from_storage(source, source_path, target_path))
    }

    fn free_space(&self, p: &str) -> Result<FreeSpace, StorageError> {
        self.run(|s| s.free_space(p))
    }

    fn search(&self, query: &str) -> Result<Vec<String>, StorageError> {
        self.run(|s| s.search(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::memory::MemoryStorage;

    fn breaker(
        clock: Arc<ManualClock>,
    ) -> (Arc<MemoryStorage>, Arc<MemoryAvailabilityStore>, Availability) {
        let backend = Arc::new(MemoryStorage::new("flaky"));
        backend.file_put_contents("a.txt", b"hello").unwrap();
        let store = Arc::new(MemoryAvailabilityStore::new());
        let availability = Availability::new(
            backend.clone(),
            store.clone(),
            clock,
            AvailabilityConfig::default(),
        );
        (backend, store, availability)
    }

    #[test]
    fn failure_opens_the_breaker() {
        let clock = ManualClock::new(1_000_000);
        let (backend, store, availability) = breaker(clock);

        backend.set_unavailable("network down", false);
        assert!(availability.filesize("a.txt").is_err());

        let record = store.get(&backend.id()).unwrap();
        assert!(!record.available);
        assert_eq!(record.last_checked, 1_000_000);
    }

    #[test]
    fn short_circuits_within_ttl() {
        let clock = ManualClock::new(1_000_000);
        let (backend, _, availability) = breaker(clock.clone());

        backend.set_unavailable("network down", false);
        let _ = availability.filesize("a.txt");
        backend.set_available();

        // Within the TTL the backend must not be reached at all.
        let calls = backend.backend_calls();
        clock.advance(RECHECK_TTL_SECS - 1);
        for _ in 0..5 {
            assert!(matches!(
                availability.filesize("a.txt"),
                Err(StorageError::NotAvailable { .. })
            ));
        }
        assert_eq!(backend.backend_calls(), calls);
    }

    #[test]
    fn recheck_after_ttl_probes_exactly_once() {
        let clock = ManualClock::new(1_000_000);
        let (backend, _, availability) = breaker(clock.clone());

        backend.set_unavailable("network down", false);
        let _ = availability.filesize("a.txt");
        backend.set_available();

        clock.advance(RECHECK_TTL_SECS + 1);
        let calls = backend.backend_calls();
        assert_eq!(availability.filesize("a.txt").unwrap(), 5);
        // One probe (test) plus the actual operation.
        assert_eq!(backend.backend_calls(), calls + 2);

        // Breaker is closed again; no further probing.
        let calls = backend.backend_calls();
        assert_eq!(availability.filesize("a.txt").unwrap(), 5);
        assert_eq!(backend.backend_calls(), calls + 1);
    }

    #[test]
    fn failed_recheck_rearms_the_breaker() {
        let clock = ManualClock::new(1_000_000);
        let (backend, store, availability) = breaker(clock.clone());

        backend.set_unavailable("still down", false);
        let _ = availability.filesize("a.txt");
        clock.advance(RECHECK_TTL_SECS + 1);
        assert!(availability.filesize("a.txt").is_err());
        let record = store.get(&backend.id()).unwrap();
        assert!(!record.available);
        assert_eq!(record.last_checked, clock.now());
    }

    #[test]
    fn auth_failures_use_extended_ttl() {
        let clock = ManualClock::new(1_000_000);
        let backend = Arc::new(MemoryStorage::new("flaky"));
        backend.file_put_contents("a.txt", b"hello").unwrap();
        let store = Arc::new(MemoryAvailabilityStore::new());
        let availability = Availability::new(
            backend.clone(),
            store,
            clock.clone(),
            AvailabilityConfig {
                recheck_ttl_secs: RECHECK_TTL_SECS,
                auth_recheck_delay_secs: 3_600,
            },
        );

        backend.set_unavailable("bad credentials", true);
        let _ = availability.filesize("a.txt");
        backend.set_available();

        // Past the normal TTL but within the auth delay: still open.
        clock.advance(RECHECK_TTL_SECS + 10);
        assert!(availability.filesize("a.txt").is_err());

        clock.advance(3_600);
        assert_eq!(availability.filesize("a.txt").unwrap(), 5);
    }

    #[test]
    fn test_is_guarded_like_any_primitive() {
        let clock = ManualClock::new(1_000_000);
        let (backend, _, availability) = breaker(clock);

        assert!(availability.test().unwrap());

        backend.set_unavailable("network down", false);
        let _ = availability.filesize("a.txt");
        backend.set_available();

        // Within the TTL even the probe primitive short-circuits.
        assert!(matches!(
            availability.test(),
            Err(StorageError::NotAvailable { .. })
        ));
    }

    #[test]
    fn owner_and_root_existence_bypass_the_breaker() {
        let clock = ManualClock::new(1_000_000);
        let (backend, _, availability) = breaker(clock);

        backend.set_unavailable("network down", false);
        let _ = availability.filesize("a.txt");

        assert!(availability.get_owner("a.txt").is_ok());
        assert!(availability.file_exists("").unwrap());
        assert!(availability.file_exists("/").unwrap());
        assert!(availability.file_exists("a.txt").is_err());
    }
}
