//! Reactive keyed container.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::lifecycle::{self, lock, Core, Shared, Subscription, TeardownFn, DEFAULT_UNMOUNT_GRACE};
use crate::error::PersistResult;

type MapListener<T> = dyn Fn(&HashMap<String, T>, Option<&str>) + Send + Sync;

/// A flat reactive key-value container with per-key change notifications.
///
/// Listeners receive the full container plus the changed key, or `None` as
/// the changed key for an aggregate replace. Assigning `None` to an
/// existing key removes it; setting an unchanged value notifies nobody.
pub struct MapStore<T> {
    shared: Arc<Shared<HashMap<String, T>, MapListener<T>>>,
}

impl<T> MapStore<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// New empty container with the default grace delay.
    #[must_use]
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_UNMOUNT_GRACE)
    }

    /// New empty container with an explicit deactivation grace delay.
    #[must_use]
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                grace,
                state: std::sync::Mutex::new(Core::new(HashMap::new())),
            }),
        }
    }

    /// Copy of the current container.
    #[must_use]
    pub fn get(&self) -> HashMap<String, T> {
        lock(&self.shared.state).value.clone()
    }

    /// Current value under `key`, if present.
    #[must_use]
    pub fn get_key(&self, key: &str) -> Option<T> {
        lock(&self.shared.state).value.get(key).cloned()
    }

    /// Set (`Some`) or remove (`None`) one key, notifying listeners with
    /// that key when the container actually changed.
    pub fn set_key(&self, key: &str, value: Option<T>) {
        let (snapshot, listeners) = {
            let mut core = lock(&self.shared.state);
            let changed = match value {
                Some(v) => {
                    if core.value.get(key) == Some(&v) {
                        false
                    } else {
                        core.value.insert(key.to_string(), v);
                        true
                    }
                }
                None => core.value.remove(key).is_some(),
            };
            if !changed {
                return;
            }
            let listeners: Vec<_> = core
                .listeners
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            (core.value.clone(), listeners)
        };
        for listener in listeners {
            listener(&snapshot, Some(key));
        }
    }

    /// Replace the whole container, producing exactly one aggregate
    /// notification (`changed_key` of `None`).
    pub fn replace(&self, new_value: HashMap<String, T>) {
        let (snapshot, listeners) = {
            let mut core = lock(&self.shared.state);
            core.value = new_value;
            let listeners: Vec<_> = core
                .listeners
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            (core.value.clone(), listeners)
        };
        for listener in listeners {
            listener(&snapshot, None);
        }
    }

    /// Attach a listener for future changes.
    ///
    /// # Errors
    /// Propagates a mount-hook failure; the listener is not installed.
    pub fn listen(
        &self,
        cb: impl Fn(&HashMap<String, T>, Option<&str>) + Send + Sync + 'static,
    ) -> PersistResult<Subscription> {
        lifecycle::add_listener(&self.shared, Arc::new(cb))
    }

    /// Attach a listener and immediately replay the current container.
    ///
    /// # Errors
    /// Same failure mode as [`MapStore::listen`].
    pub fn subscribe(
        &self,
        cb: impl Fn(&HashMap<String, T>, Option<&str>) + Send + Sync + 'static,
    ) -> PersistResult<Subscription> {
        let cb: Arc<MapListener<T>> = Arc::new(cb);
        let sub = lifecycle::add_listener(&self.shared, Arc::clone(&cb))?;
        cb(&self.get(), None);
        Ok(sub)
    }

    /// Install the mount hook, as on [`crate::reactive::Atom::on_mount`].
    pub fn on_mount(
        &self,
        hook: impl Fn() -> PersistResult<Option<TeardownFn>> + Send + Sync + 'static,
    ) {
        lifecycle::set_mount_hook(&self.shared, hook);
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.state).listener_count()
    }
}

impl<T> Default for MapStore<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MapStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<(HashMap<String, String>, Option<String>)>>>;

    fn recording(map: &MapStore<String>) -> (Log, Subscription) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let log = Arc::clone(&log);
            map.listen(move |value, key| {
                log.lock()
                    .unwrap()
                    .push((value.clone(), key.map(String::from)));
            })
            .unwrap()
        };
        (log, sub)
    }

    #[test]
    fn set_key_notifies_with_cumulative_state() {
        let map = MapStore::new();
        let (log, _sub) = recording(&map);

        map.set_key("one", Some("1".to_string()));
        map.set_key("two", Some("2".to_string()));

        let events = log.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1.as_deref(), Some("one"));
        assert_eq!(events[0].0.len(), 1);
        assert_eq!(events[1].1.as_deref(), Some("two"));
        assert_eq!(events[1].0.len(), 2);
    }

    #[test]
    fn unchanged_value_does_not_notify() {
        let map = MapStore::new();
        map.set_key("one", Some("1".to_string()));
        let (log, _sub) = recording(&map);

        map.set_key("one", Some("1".to_string()));
        map.set_key("missing", None);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn removal_notifies_only_when_key_existed() {
        let map = MapStore::new();
        map.set_key("one", Some("1".to_string()));
        let (log, _sub) = recording(&map);

        map.set_key("one", None);
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].0.is_empty());
        assert_eq!(events[0].1.as_deref(), Some("one"));
    }

    #[test]
    fn replace_emits_single_aggregate_notification() {
        let map = MapStore::new();
        map.set_key("one", Some("1".to_string()));
        map.set_key("two", Some("2".to_string()));
        let (log, _sub) = recording(&map);

        let mut next = HashMap::new();
        next.insert("one".to_string(), "11".to_string());
        map.replace(next);

        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, None);
        assert_eq!(events[0].0.get("one"), Some(&"11".to_string()));
        assert!(!events[0].0.contains_key("two"));
    }
}
