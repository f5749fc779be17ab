//! Storage wrappers: decorators layering one concern over an inner storage.
//!
//! Every wrapper implements [`Storage`] by overriding `inner()` plus the
//! primitives it changes; everything else falls through the trait's default
//! pass-through bodies. [`Wrapper`] is the plain base decorator — fully
//! transparent — and this module also hosts the chain introspection helpers
//! that replace the original system's reflection-based
//! `instanceOfStorage` checks with an explicit downcast walk.

pub mod availability;
pub mod checksum;
pub mod encoding;
pub mod jail;
pub mod known_mtime;
pub mod permissions;
pub mod quota;

use std::any::Any;
use std::sync::Arc;

use crate::storage::Storage;

/// The generic pass-through decorator.
///
/// Behaves exactly as if it were not there; concrete wrappers embed an
/// `Arc<dyn Storage>` of their own and add behavior on top.
pub struct Wrapper {
    inner: Arc<dyn Storage>,
}

impl Wrapper {
    #[must_use]
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self { inner }
    }

    /// The storage this wrapper delegates to.
    #[must_use]
    pub fn wrapped(&self) -> &Arc<dyn Storage> {
        &self.inner
    }
}

impl Storage for Wrapper {
    fn inner(&self) -> Option<&dyn Storage> {
        Some(self.inner.as_ref())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Walk the chain (outermost first) and return the first layer of concrete
/// type `T`. Callers use this to reach through decoration — e.g. to detect
/// that a cross-storage copy source is really the same jail instance.
#[must_use]
pub fn unwrap_to<T: Any>(storage: &dyn Storage) -> Option<&T> {
    let mut current = Some(storage);
    while let Some(layer) = current {
        if let Some(concrete) = layer.as_any().downcast_ref::<T>() {
            return Some(concrete);
        }
        current = layer.inner();
    }
    None
}

/// Whether the chain contains (or is) a layer of type `T`.
#[must_use]
pub fn wraps<T: Any>(storage: &dyn Storage) -> bool {
    unwrap_to::<T>(storage).is_some()
}

/// The leaf backend at the bottom of a chain.
#[must_use]
pub fn bottom(storage: &dyn Storage) -> &dyn Storage {
    let mut current = storage;
    while let Some(next) = current.inner() {
        current = next;
    }
    current
}

/// Whether two chains are ultimately backed by the same storage instance,
/// compared by backend identity rather than by outer wrapper type.
#[must_use]
pub fn same_backend(a: &dyn Storage, b: &dyn Storage) -> bool {
    let id_a = a.id();
    !id_a.is_empty() && id_a == b.id()
}
