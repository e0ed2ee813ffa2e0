//! Deterministic in-memory engine for tests.
//!
//! Pairs a `BTreeMap`-backed storage with a synchronous listener fan-out.
//! `set_key` mutates the fake storage and invokes registered listeners in
//! the same call; no timers, no threads, fully deterministic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::trace;

use super::registry::EngineRegistry;
use super::traits::{
    ChangeCallback, ChangeEvent, ChangeNotifier, ListenerId, ResyncCallback, StorageEngine,
    StorageError,
};
use crate::error::PersistResult;

struct ListenerEntry {
    id: ListenerId,
    key: String,
    on_change: ChangeCallback,
    on_resync: ResyncCallback,
}

struct TestEngineInner {
    per_key: bool,
    storage: RwLock<BTreeMap<String, String>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    writes: AtomicU64,
}

/// In-memory fake engine with synchronous notification fan-out.
///
/// In the default mode every listener sees every event, matching a notifier
/// that multiplexes all changes onto one channel. [`TestEngine::per_key`]
/// builds an engine that reports `per_key_required` and delivers an event
/// only to listeners registered for exactly that key, which is what makes
/// the per-key listener lifecycle observable in tests.
#[derive(Clone)]
pub struct TestEngine {
    inner: Arc<TestEngineInner>,
}

impl TestEngine {
    /// Engine whose notifier multiplexes all keys onto one channel.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(false)
    }

    /// Engine whose notifier requires one listener per concrete key.
    #[must_use]
    pub fn per_key() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(per_key: bool) -> Self {
        Self {
            inner: Arc::new(TestEngineInner {
                per_key,
                storage: RwLock::new(BTreeMap::new()),
                listeners: Mutex::new(Vec::new()),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Install this engine's storage and notifier into `registry`.
    pub fn install(&self, registry: &EngineRegistry) {
        registry.set_engine(
            Arc::new(TestStorage(Arc::clone(&self.inner))),
            Arc::new(TestNotifier(Arc::clone(&self.inner))),
        );
    }

    /// Simulate another context writing (`Some`) or deleting (`None`) a key.
    ///
    /// Mutates the fake storage, then synchronously invokes the listeners
    /// the delivery mode selects for this key.
    ///
    /// # Errors
    /// Propagates the first listener failure (typically a decode error).
    pub fn set_key(&self, key: &str, value: Option<&str>) -> PersistResult<()> {
        {
            let mut storage = self
                .inner
                .storage
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match value {
                Some(v) => {
                    storage.insert(key.to_string(), v.to_string());
                }
                None => {
                    storage.remove(key);
                }
            }
        }
        self.dispatch(&ChangeEvent {
            key: Some(key.to_string()),
            new_value: value.map(String::from),
        })
    }

    /// Clear the fake storage and deliver a bulk-clear event (`key: None`).
    ///
    /// # Errors
    /// Propagates the first listener failure.
    pub fn emit_clear(&self) -> PersistResult<()> {
        self.inner
            .storage
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.dispatch(&ChangeEvent::cleared())
    }

    /// Invoke every registered resync callback, simulating a context-restore
    /// event such as returning to a cached page.
    ///
    /// # Errors
    /// Propagates the first resync failure.
    pub fn trigger_resync(&self) -> PersistResult<()> {
        let callbacks: Vec<ResyncCallback> = {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            listeners
                .iter()
                .map(|entry| Arc::clone(&entry.on_resync))
                .collect()
        };

        let mut first_err = None;
        for cb in callbacks {
            if let Err(e) = cb() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Copy of the fake storage contents.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner
            .storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Full reset: deletes every present key through [`TestEngine::set_key`]
    /// so listeners observe the clearing.
    ///
    /// # Errors
    /// Propagates the first listener failure.
    pub fn clear(&self) -> PersistResult<()> {
        let keys: Vec<String> = self.snapshot().into_keys().collect();
        for key in keys {
            self.set_key(&key, None)?;
        }
        Ok(())
    }

    /// Keys the currently registered listeners were registered for.
    #[must_use]
    pub fn listener_keys(&self) -> Vec<String> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Number of active listener registrations.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Writes and removals performed through the [`StorageEngine`] interface.
    ///
    /// `set_key` mutates the backing map directly and does not count; only
    /// bindings writing through the engine do. Lets tests prove an external
    /// change did not loop back into a local write.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    fn dispatch(&self, event: &ChangeEvent) -> PersistResult<()> {
        let targets: Vec<ChangeCallback> = {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            listeners
                .iter()
                .filter(|entry| match (&event.key, self.inner.per_key) {
                    // Bulk clear reaches everyone in both modes.
                    (None, _) => true,
                    (Some(_), false) => true,
                    // Per-key engines deliver only exact-key subscriptions.
                    (Some(key), true) => entry.key == *key,
                })
                .map(|entry| Arc::clone(&entry.on_change))
                .collect()
        };

        let mut first_err = None;
        for cb in targets {
            if let Err(e) = cb(event) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct TestStorage(Arc<TestEngineInner>);

impl StorageEngine for TestStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .0
            .storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.0.writes.fetch_add(1, Ordering::Relaxed);
        self.0
            .storage
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        trace!(key, "test engine write");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.0.writes.fetch_add(1, Ordering::Relaxed);
        self.0
            .storage
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .0
            .storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .0
            .storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

struct TestNotifier(Arc<TestEngineInner>);

impl ChangeNotifier for TestNotifier {
    fn add_listener(
        &self,
        key: &str,
        on_change: ChangeCallback,
        on_resync: ResyncCallback,
    ) -> ListenerId {
        let id = ListenerId::new();
        self.0
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ListenerEntry {
                id,
                key: key.to_string(),
                on_change,
                on_resync,
            });
        trace!(key, %id, "test engine listener added");
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.0
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.id != id);
    }

    fn per_key_required(&self) -> bool {
        self.0.per_key
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    fn recording_listener(log: &Arc<StdMutex<Vec<ChangeEvent>>>) -> ChangeCallback {
        let log = Arc::clone(log);
        Arc::new(move |event: &ChangeEvent| {
            log.lock().unwrap().push(event.clone());
            Ok(())
        })
    }

    fn noop_resync() -> ResyncCallback {
        Arc::new(|| Ok(()))
    }

    #[test]
    fn set_key_mutates_storage_and_fans_out() {
        let engine = TestEngine::new();
        let registry = EngineRegistry::new();
        engine.install(&registry);

        let log = Arc::new(StdMutex::new(Vec::new()));
        registry
            .notifier()
            .add_listener("a", recording_listener(&log), noop_resync());

        engine.set_key("a", Some("1")).unwrap();
        engine.set_key("b", Some("2")).unwrap();
        engine.set_key("a", None).unwrap();

        assert_eq!(engine.snapshot().get("b"), Some(&"2".to_string()));
        assert!(!engine.snapshot().contains_key("a"));

        // Default mode: every listener sees every event, including key "b".
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ChangeEvent::changed("a", "1"));
        assert_eq!(events[1], ChangeEvent::changed("b", "2"));
        assert_eq!(events[2], ChangeEvent::removed("a"));
    }

    #[test]
    fn per_key_mode_filters_delivery_by_exact_key() {
        let engine = TestEngine::per_key();
        let registry = EngineRegistry::new();
        engine.install(&registry);

        let log = Arc::new(StdMutex::new(Vec::new()));
        registry
            .notifier()
            .add_listener("b:one", recording_listener(&log), noop_resync());

        engine.set_key("b:one", Some("1")).unwrap();
        engine.set_key("b:two", Some("2")).unwrap();

        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], ChangeEvent::changed("b:one", "1"));
    }

    #[test]
    fn bulk_clear_reaches_all_listeners_in_per_key_mode() {
        let engine = TestEngine::per_key();
        let registry = EngineRegistry::new();
        engine.install(&registry);

        let log = Arc::new(StdMutex::new(Vec::new()));
        registry
            .notifier()
            .add_listener("b:one", recording_listener(&log), noop_resync());

        engine.set_key("b:one", Some("1")).unwrap();
        engine.emit_clear().unwrap();

        assert!(engine.snapshot().is_empty());
        let events = log.lock().unwrap();
        assert_eq!(events.last().unwrap(), &ChangeEvent::cleared());
    }

    #[test]
    fn clear_deletes_each_key_through_set_key() {
        let engine = TestEngine::new();
        let registry = EngineRegistry::new();
        engine.install(&registry);

        let log = Arc::new(StdMutex::new(Vec::new()));
        registry
            .notifier()
            .add_listener("", recording_listener(&log), noop_resync());

        engine.set_key("a", Some("1")).unwrap();
        engine.set_key("b", Some("2")).unwrap();
        log.lock().unwrap().clear();

        engine.clear().unwrap();

        assert!(engine.snapshot().is_empty());
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.new_value.is_none()));
    }

    #[test]
    fn remove_listener_stops_delivery() {
        let engine = TestEngine::new();
        let registry = EngineRegistry::new();
        engine.install(&registry);

        let log = Arc::new(StdMutex::new(Vec::new()));
        let id = registry
            .notifier()
            .add_listener("a", recording_listener(&log), noop_resync());
        registry.notifier().remove_listener(id);

        engine.set_key("a", Some("1")).unwrap();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(engine.listener_count(), 0);
    }

    #[test]
    fn write_count_tracks_engine_interface_only() {
        let engine = TestEngine::new();
        let registry = EngineRegistry::new();
        engine.install(&registry);

        engine.set_key("a", Some("1")).unwrap();
        assert_eq!(engine.write_count(), 0);

        registry.storage().set("b", "2").unwrap();
        registry.storage().remove("b").unwrap();
        assert_eq!(engine.write_count(), 2);
    }

    #[test]
    fn listener_errors_propagate_to_dispatcher() {
        let engine = TestEngine::new();
        let registry = EngineRegistry::new();
        engine.install(&registry);

        let failing: ChangeCallback = Arc::new(|_| {
            Err(crate::error::PersistError::codec(
                "a",
                crate::error::CodecError::Decode("boom".to_string()),
            ))
        });
        registry.notifier().add_listener("a", failing, noop_resync());

        let result = engine.set_key("a", Some("not-decodable"));
        assert!(result.is_err());
        // Storage mutation still happened before dispatch.
        assert_eq!(engine.snapshot().get("a"), Some(&"not-decodable".to_string()));
    }
}
