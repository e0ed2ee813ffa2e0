//! Engine registry.
//!
//! Process-wide (or injected) state holding the current durable storage
//! handle and change-notification adapter. Both handles are replaced
//! atomically by [`EngineRegistry::set_engine`]; the swap takes effect for
//! subsequently triggered hydration and subscription cycles, while live
//! bindings keep the handles they captured at activation until their next
//! lifecycle transition.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

use super::traits::{
    ChangeCallback, ChangeNotifier, ListenerId, ResyncCallback, StorageEngine, StorageError,
};

/// Inert storage used when no durable engine is installed. All operations
/// succeed and hold nothing, so bindings stay value-complete in memory,
/// simply non-durable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStorage;

impl StorageEngine for NoopStorage {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
}

/// Inert notifier paired with [`NoopStorage`]; never delivers events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn add_listener(
        &self,
        _key: &str,
        _on_change: ChangeCallback,
        _on_resync: ResyncCallback,
    ) -> ListenerId {
        ListenerId::new()
    }

    fn remove_listener(&self, _id: ListenerId) {}
}

struct EngineState {
    storage: Arc<dyn StorageEngine>,
    notifier: Arc<dyn ChangeNotifier>,
}

/// Swappable pair of durable storage + change notifier.
///
/// Cloning yields another handle to the same underlying state. Constructors
/// accept a registry explicitly so tests can swap in a fake engine without
/// touching process-wide state; [`EngineRegistry::global`] provides the
/// shared default for application code.
#[derive(Clone)]
pub struct EngineRegistry {
    inner: Arc<RwLock<EngineState>>,
}

impl EngineRegistry {
    /// New registry with the inert no-op engine installed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(EngineState {
                storage: Arc::new(NoopStorage),
                notifier: Arc::new(NoopNotifier),
            })),
        }
    }

    /// The process-wide registry used by the convenience constructors.
    pub fn global() -> &'static EngineRegistry {
        static GLOBAL: OnceLock<EngineRegistry> = OnceLock::new();
        GLOBAL.get_or_init(EngineRegistry::new)
    }

    /// Replace both handles atomically.
    ///
    /// Currently-live bindings keep their captured handles until they next
    /// re-activate; only subsequent hydration/subscription cycles see the
    /// new engine.
    pub fn set_engine(&self, storage: Arc<dyn StorageEngine>, notifier: Arc<dyn ChangeNotifier>) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.storage = storage;
        state.notifier = notifier;
        debug!("engine registry swapped");
    }

    /// Snapshot of the current (storage, notifier) pair.
    #[must_use]
    pub fn current(&self) -> (Arc<dyn StorageEngine>, Arc<dyn ChangeNotifier>) {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (Arc::clone(&state.storage), Arc::clone(&state.notifier))
    }

    /// The current storage handle.
    #[must_use]
    pub fn storage(&self) -> Arc<dyn StorageEngine> {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state.storage)
    }

    /// The current notifier handle.
    #[must_use]
    pub fn notifier(&self) -> Arc<dyn ChangeNotifier> {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state.notifier)
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
