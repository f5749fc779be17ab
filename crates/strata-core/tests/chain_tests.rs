//! Integration tests for full wrapper chains.
//!
//! Every test composes several wrappers over the in-memory backend the way a
//! host application would, then checks the behavior at the top of the chain
//! against the raw state at the bottom.

use std::sync::Arc;

use strata_core::cache::MetadataCache;
use strata_core::clock::ManualClock;
use strata_core::encryption::{
    Encryption, EncryptionConfig, FileHeader, FileKeyStorage, MemoryKeyStore, ModuleRegistry,
};
use strata_core::error::StorageError;
use strata_core::storage::memory::MemoryStorage;
use strata_core::wrapper::availability::{
    Availability, AvailabilityConfig, MemoryAvailabilityStore, RECHECK_TTL_SECS,
};
use strata_core::wrapper::checksum::{Checksum, ChecksumConfig};
use strata_core::wrapper::jail::Jail;
use strata_core::wrapper::permissions::PermissionsMask;
use strata_core::wrapper::quota::{Quota, QuotaConfig};
use strata_core::{
    ChecksumAlgo, FreeSpace, Permissions, Storage, WriteMode, bottom, unwrap_to, wraps,
};

// ============================================================================
// Chain construction
// ============================================================================

struct ChainParts {
    backend: Arc<MemoryStorage>,
    keys: Arc<MemoryKeyStore>,
}

/// The full stack: Jail("files") over PermissionsMask over Quota over
/// Checksum over Encryption over the in-memory backend.
fn full_chain(limit: u64, mask: Permissions) -> (ChainParts, Arc<dyn Storage>) {
    let backend = Arc::new(MemoryStorage::new("chain"));
    backend.mkdir("files").unwrap();
    let keys = Arc::new(MemoryKeyStore::new());

    let encryption = Arc::new(Encryption::new(
        backend.clone(),
        EncryptionConfig::default(),
        Arc::new(ModuleRegistry::new()),
        keys.clone(),
    ));
    let checksum = Arc::new(Checksum::new(encryption, ChecksumConfig::default()));
    let quota = Arc::new(Quota::new(checksum, QuotaConfig::new(limit)));
    let masked = Arc::new(PermissionsMask::new(quota, mask));
    let jail: Arc<dyn Storage> = Arc::new(Jail::new(masked, "files"));

    (ChainParts { backend, keys }, jail)
}

// ============================================================================
// End-to-end behavior
// ============================================================================

#[test]
fn chained_write_encrypts_digests_and_jails() {
    let (parts, chain) = full_chain(1 << 20, Permissions::ALL);
    chain.file_put_contents("doc.txt", b"chained secret").unwrap();

    // The backend holds ciphertext under the jail root.
    let raw = parts.backend.file_get_contents("files/doc.txt").unwrap();
    assert!(FileHeader::is_present(&raw));
    assert!(!raw.windows(14).any(|w| w == b"chained secret"));

    // The chain serves plaintext at the jailed path.
    assert_eq!(chain.file_get_contents("doc.txt").unwrap(), b"chained secret");
    assert_eq!(chain.filesize("doc.txt").unwrap(), 14);

    // The checksum covers the plaintext as handed in.
    let expected = format!("SHA1:{}", ChecksumAlgo::Sha1.digest(b"chained secret"));
    let entry = parts.backend.memory_cache().get("files/doc.txt").unwrap();
    assert_eq!(entry.checksum, Some(expected.clone()));
    assert_eq!(chain.get_metadata("doc.txt").unwrap().checksum, Some(expected));

    // Key material was stored for the unjailed path.
    assert!(parts.keys.get_key("files/doc.txt").unwrap().is_some());
}

#[test]
fn chained_stream_transforms_stack_in_wrap_order() {
    let (parts, chain) = full_chain(1 << 20, Permissions::ALL);
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();

    let mut w = chain.open_write("big.bin", WriteMode::Overwrite).unwrap();
    for chunk in payload.chunks(7919) {
        w.write_all(chunk).unwrap();
    }
    w.commit().unwrap();

    assert_eq!(chain.file_get_contents("big.bin").unwrap(), payload);
    assert_eq!(chain.filesize("big.bin").unwrap(), payload.len() as u64);

    let entry = parts.backend.memory_cache().get("files/big.bin").unwrap();
    assert_eq!(
        entry.checksum,
        Some(format!("SHA1:{}", ChecksumAlgo::Sha1.digest(&payload)))
    );
    assert_eq!(entry.unencrypted_size, payload.len() as i64);
    assert!(entry.encrypted);
}

#[test]
fn aborting_the_chained_stream_undoes_everything() {
    let (parts, chain) = full_chain(1 << 20, Permissions::ALL);
    let mut w = chain.open_write("gone.bin", WriteMode::Overwrite).unwrap();
    w.write_all(&[9u8; 50_000]).unwrap();
    w.abort().unwrap();

    assert!(!parts.backend.file_exists("files/gone.bin").unwrap());
    assert!(parts.backend.memory_cache().get("files/gone.bin").is_none());
    assert!(parts.keys.get_key("files/gone.bin").unwrap().is_none());
}

#[test]
fn quota_refusal_mid_stream_aborts_the_whole_chain() {
    let (parts, chain) = full_chain(1_000, Permissions::ALL);
    let mut w = chain.open_write("big.bin", WriteMode::Overwrite).unwrap();
    assert!(matches!(
        w.write_all(&[0u8; 2_000]),
        Err(StorageError::NotPermitted { .. })
    ));
    // No partial file, no key, no cache entry.
    assert!(!parts.backend.file_exists("files/big.bin").unwrap());
    assert!(parts.keys.get_key("files/big.bin").unwrap().is_none());
}

#[test]
fn mask_denial_stops_before_any_layer_runs() {
    let (parts, chain) = full_chain(1 << 20, Permissions::READ);
    assert!(matches!(
        chain.file_put_contents("doc.txt", b"nope"),
        Err(StorageError::NotPermitted { .. })
    ));
    assert!(!parts.backend.file_exists("files/doc.txt").unwrap());
    assert!(parts.keys.get_key("files/doc.txt").unwrap().is_none());
}

#[test]
fn free_space_reflects_quota_through_the_jail() {
    let (_, chain) = full_chain(10_000, Permissions::ALL);
    let FreeSpace::Bytes(before) = chain.free_space("").unwrap() else {
        panic!("expected a byte-limited report");
    };
    assert_eq!(before, 10_000);

    chain.file_put_contents("doc.txt", b"0123456789").unwrap();
    let FreeSpace::Bytes(after) = chain.free_space("").unwrap() else {
        panic!("expected a byte-limited report");
    };
    // Quota accounts the physical (ciphertext) bytes the cache saw.
    assert!(after < before);
}

// ============================================================================
// Introspection
// ============================================================================

#[test]
fn unwrap_walks_the_whole_chain() {
    let (parts, chain) = full_chain(1 << 20, Permissions::ALL);
    let chain = chain.as_ref();

    assert!(wraps::<Jail>(chain));
    assert!(wraps::<PermissionsMask>(chain));
    assert!(wraps::<Quota>(chain));
    assert!(wraps::<Checksum>(chain));
    assert!(wraps::<Encryption>(chain));
    assert!(wraps::<MemoryStorage>(chain));

    assert_eq!(unwrap_to::<Jail>(chain).unwrap().root(), "files");
    assert_eq!(bottom(chain).id(), parts.backend.id());
    assert_eq!(chain.id(), parts.backend.id());
}

// ============================================================================
// Availability in a chain
// ============================================================================

#[test]
fn breaker_guards_a_jailed_chain() {
    let clock = ManualClock::new(1_000_000);
    let backend = Arc::new(MemoryStorage::with_clock("avail-chain", clock.clone()));
    backend.mkdir("files").unwrap();
    backend.file_put_contents("files/a.txt", b"x").unwrap();

    let jail = Arc::new(Jail::new(backend.clone(), "files"));
    let chain = Availability::new(
        jail,
        Arc::new(MemoryAvailabilityStore::new()),
        clock.clone(),
        AvailabilityConfig::default(),
    );

    assert_eq!(chain.file_get_contents("a.txt").unwrap(), b"x");

    backend.set_unavailable("offline", false);
    assert!(chain.file_get_contents("a.txt").is_err());
    backend.set_available();

    // Short-circuited without touching the backend while the TTL runs.
    let calls = backend.backend_calls();
    assert!(matches!(
        chain.file_get_contents("a.txt"),
        Err(StorageError::NotAvailable { .. })
    ));
    assert_eq!(backend.backend_calls(), calls);

    clock.advance(RECHECK_TTL_SECS + 1);
    assert_eq!(chain.file_get_contents("a.txt").unwrap(), b"x");
}
