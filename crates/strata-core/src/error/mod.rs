//! Error taxonomy for the storage wrapper chain.
//!
//! Every user-visible failure surfaced by a chain is one of these kinds. A
//! wrapper only intercepts the kinds it is designed to react to (Availability
//! reacts to [`StorageError::NotAvailable`]; PermissionsMask and Quota raise
//! [`StorageError::NotPermitted`] proactively, before delegating); everything
//! else passes through unmodified so the chain never hides a backend error
//! behind a misleading success value.

use std::io;

use thiserror::Error;

use crate::lock::LockLevel;

#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend is unreachable or broken.
    ///
    /// Retried later under the availability TTL, never immediately.
    /// `auth_failure` selects the extended recheck delay: failed credentials
    /// stay bad far longer than a flaky network path.
    #[error("storage not available: {message}")]
    NotAvailable { message: String, auth_failure: bool },

    /// Permission, mask or quota denial. Never retried; surfaced to the
    /// caller as-is.
    #[error("{op} not permitted on '{path}': {reason}")]
    NotPermitted {
        op: &'static str,
        path: String,
        reason: String,
    },

    /// Path absent after all normalization/jailing attempts.
    #[error("path not found: '{path}'")]
    NotFound { path: String },

    /// Concurrent exclusive access; surfaced for caller-level retry.
    #[error("'{path}' is locked ({level})")]
    Locked { path: String, level: LockLevel },

    /// Encryption module missing, broken or refusing the file. The file is
    /// treated as unreadable rather than silently returning ciphertext.
    #[error("encryption module '{module}': {message}")]
    Module { module: String, message: String },

    /// No key material stored for an encrypted file.
    #[error("no file key for '{path}'")]
    KeyMissing { path: String },

    /// An encrypted file's header is malformed or names an unknown format.
    #[error("invalid encryption header for '{path}': {reason}")]
    InvalidHeader { path: String, reason: String },

    /// A primitive was called on a layer that has neither an implementation
    /// nor an inner storage to delegate to.
    #[error("operation '{op}' is not supported by this storage")]
    Unsupported { op: &'static str },

    /// Backend I/O failure that is not an availability condition.
    #[error("I/O error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    #[must_use]
    pub fn not_available(message: impl Into<String>) -> Self {
        StorageError::NotAvailable {
            message: message.into(),
            auth_failure: false,
        }
    }

    #[must_use]
    pub fn auth_failure(message: impl Into<String>) -> Self {
        StorageError::NotAvailable {
            message: message.into(),
            auth_failure: true,
        }
    }

    #[must_use]
    pub fn not_permitted(
        op: &'static str,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        StorageError::NotPermitted {
            op,
            path: path.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn not_found(path: impl Into<String>) -> Self {
        StorageError::NotFound { path: path.into() }
    }

    #[must_use]
    pub fn io(op: &'static str, source: io::Error) -> Self {
        StorageError::Io { op, source }
    }

    /// Whether this error is an availability condition (the only kind the
    /// Availability wrapper reacts to).
    #[must_use]
    pub fn is_not_available(&self) -> bool {
        matches!(self, StorageError::NotAvailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_available_carries_auth_flag() {
        let err = StorageError::auth_failure("bad credentials");
        match err {
            StorageError::NotAvailable { auth_failure, .. } => assert!(auth_failure),
            other => panic!("unexpected error kind: {other}"),
        }
    }

    #[test]
    fn display_includes_path_and_op() {
        let err = StorageError::not_permitted("mkdir", "foo/bar", "create bit masked out");
        let text = err.to_string();
        assert!(text.contains("mkdir"));
        assert!(text.contains("foo/bar"));
    }

    #[test]
    fn is_not_available_only_matches_availability() {
        assert!(StorageError::not_available("gone").is_not_available());
        assert!(!StorageError::not_found("x").is_not_available());
    }
}
