//! Locking collaborator.
//!
//! Locking is delegated transparently through the chain: decorative wrappers
//! (Jail, PermissionsMask, Encoding) forward lock calls with translated
//! paths, and whichever layer or backend actually implements locking talks
//! to a [`LockingProvider`].

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Lock level requested against a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockLevel {
    /// Many readers may hold a shared lock at once.
    Shared,
    /// A single writer; excludes all other locks.
    Exclusive,
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockLevel::Shared => write!(f, "shared"),
            LockLevel::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Shared/exclusive lock provider keyed by path.
pub trait LockingProvider: Send + Sync {
    fn acquire(&self, path: &str, level: LockLevel) -> Result<(), StorageError>;
    fn release(&self, path: &str, level: LockLevel) -> Result<(), StorageError>;
    /// Atomically swap the lock held on `path` from one level to the other.
    fn change(&self, path: &str, from: LockLevel, to: LockLevel) -> Result<(), StorageError>;
}

#[derive(Debug, Default, Clone, Copy)]
struct LockState {
    shared: u32,
    exclusive: bool,
}

/// In-process reference provider enforcing shared/exclusive exclusion.
#[derive(Debug, Default)]
pub struct MemoryLockingProvider {
    locks: DashMap<String, LockState>,
}

impl MemoryLockingProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(path: &str, level: LockLevel) -> StorageError {
        StorageError::Locked {
            path: path.to_string(),
            level,
        }
    }
}

impl LockingProvider for MemoryLockingProvider {
    fn acquire(&self, path: &str, level: LockLevel) -> Result<(), StorageError> {
        let mut state = self.locks.entry(path.to_string()).or_default();
        match level {
            LockLevel::Shared => {
                if state.exclusive {
                    return Err(Self::locked(path, LockLevel::Exclusive));
                }
                state.shared += 1;
            }
            LockLevel::Exclusive => {
                if state.exclusive || state.shared > 0 {
                    return Err(Self::locked(path, level));
                }
                state.exclusive = true;
            }
        }
        Ok(())
    }

    fn release(&self, path: &str, level: LockLevel) -> Result<(), StorageError> {
        if let Some(mut state) = self.locks.get_mut(path) {
            match level {
                LockLevel::Shared => state.shared = state.shared.saturating_sub(1),
                LockLevel::Exclusive => state.exclusive = false,
            }
        }
        Ok(())
    }

    fn change(&self, path: &str, from: LockLevel, to: LockLevel) -> Result<(), StorageError> {
        let mut state = self
            .locks
            .get_mut(path)
            .ok_or_else(|| Self::locked(path, from))?;
        match (from, to) {
            (LockLevel::Shared, LockLevel::Exclusive) => {
                // Only the caller's own shared lock may remain.
                if state.exclusive || state.shared != 1 {
                    return Err(Self::locked(path, LockLevel::Shared));
                }
                state.shared = 0;
                state.exclusive = true;
            }
            (LockLevel::Exclusive, LockLevel::Shared) => {
                if !state.exclusive {
                    return Err(Self::locked(path, LockLevel::Exclusive));
                }
                state.exclusive = false;
                state.shared += 1;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_stack() {
        let provider = MemoryLockingProvider::new();
        provider.acquire("a.txt", LockLevel::Shared).unwrap();
        provider.acquire("a.txt", LockLevel::Shared).unwrap();
        assert!(provider.acquire("a.txt", LockLevel::Exclusive).is_err());
        provider.release("a.txt", LockLevel::Shared).unwrap();
        provider.release("a.txt", LockLevel::Shared).unwrap();
        provider.acquire("a.txt", LockLevel::Exclusive).unwrap();
    }

    #[test]
    fn exclusive_excludes_everything() {
        let provider = MemoryLockingProvider::new();
        provider.acquire("a.txt", LockLevel::Exclusive).unwrap();
        assert!(provider.acquire("a.txt", LockLevel::Shared).is_err());
        assert!(provider.acquire("a.txt", LockLevel::Exclusive).is_err());
        // Unrelated path is unaffected.
        provider.acquire("b.txt", LockLevel::Exclusive).unwrap();
    }

    #[test]
    fn change_shared_to_exclusive_requires_sole_holder() {
        let provider = MemoryLockingProvider::new();
        provider.acquire("a.txt", LockLevel::Shared).unwrap();
        provider.acquire("a.txt", LockLevel::Shared).unwrap();
        assert!(
            provider
                .change("a.txt", LockLevel::Shared, LockLevel::Exclusive)
                .is_err()
        );
        provider.release("a.txt", LockLevel::Shared).unwrap();
        provider
            .change("a.txt", LockLevel::Shared, LockLevel::Exclusive)
            .unwrap();
        provider
            .change("a.txt", LockLevel::Exclusive, LockLevel::Shared)
            .unwrap();
        provider.acquire("a.txt", LockLevel::Shared).unwrap();
    }
}
