//! Abstract engine traits.
//!
//! These traits define the contract between the sync layer and the host
//! platform: a string-keyed durable store and a channel delivering "a key
//! changed in another context" events. Using traits enables in-memory
//! engines for testing and platform-specific engines in applications.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PersistResult;

/// Errors that can occur during durable store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend error.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The engine refused a write (quota, read-only mode, and similar).
    #[error("write rejected for key '{key}': {reason}")]
    WriteRejected {
        /// The durable key the write targeted.
        key: String,
        /// Engine-reported reason.
        reason: String,
    },
}

/// A durable textual key-value store.
///
/// Implementations must be safe to share across threads. All mutations are
/// synchronous; a write either lands or signals failure, there are no
/// partial states within one call.
pub trait StorageEngine: Send + Sync {
    /// Read the value stored under `key`, if any.
    ///
    /// # Errors
    /// Returns [`StorageError`] when the backend fails.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns [`StorageError`] when the backend rejects the write.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete `key`. Deleting an absent key is not an error.
    ///
    /// # Errors
    /// Returns [`StorageError`] when the backend fails.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Presence test for `key`.
    ///
    /// # Errors
    /// Returns [`StorageError`] when the backend fails.
    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Enumerate every key currently present. Used by hydration scans.
    ///
    /// # Errors
    /// Returns [`StorageError`] when the backend fails.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// A change observed in the durable store, as delivered by a notifier.
///
/// `key: None` signals "everything possibly changed" (bulk clear).
/// `new_value: None` signals deletion of that key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The durable key that changed, or `None` for a bulk clear.
    pub key: Option<String>,
    /// The new textual value, or `None` when the key was removed.
    pub new_value: Option<String>,
}

impl ChangeEvent {
    /// Event for a key that was written.
    #[must_use]
    pub fn changed(key: impl Into<String>, new_value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            new_value: Some(new_value.into()),
        }
    }

    /// Event for a key that was removed.
    #[must_use]
    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            new_value: None,
        }
    }

    /// Bulk-clear event: every key may have changed or vanished.
    #[must_use]
    pub const fn cleared() -> Self {
        Self {
            key: None,
            new_value: None,
        }
    }
}

/// Opaque handle identifying one listener registration.
///
/// Registrations are removed by handle rather than by callback identity;
/// every call to [`ChangeNotifier::add_listener`] yields a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocate a process-unique listener id.
    #[must_use]
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Callback invoked when another context changes a durable key.
///
/// Errors (typically decode failures) propagate to whoever dispatched the
/// event, never back into the binding.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) -> PersistResult<()> + Send + Sync>;

/// Callback invoked on a context-restore event; re-runs hydration so state
/// dropped during suspension is recovered.
pub type ResyncCallback = Arc<dyn Fn() -> PersistResult<()> + Send + Sync>;

/// Delivery channel for changes made by other execution contexts.
///
/// The notifier must never report writes the current context itself
/// performed; self-notification is excluded by construction.
pub trait ChangeNotifier: Send + Sync {
    /// Register a change listener and a resync callback for `key`.
    fn add_listener(
        &self,
        key: &str,
        on_change: ChangeCallback,
        on_resync: ResyncCallback,
    ) -> ListenerId;

    /// Remove a registration previously returned by `add_listener`.
    /// Removing an unknown id is a no-op.
    fn remove_listener(&self, id: ListenerId);

    /// True when this engine cannot deliver a single "any key under this
    /// prefix changed" notification and needs one subscription per concrete
    /// key instead.
    fn per_key_required(&self) -> bool {
        false
    }
}
