//! Keyed sync store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use super::PersistentOptions;
use crate::codec::{Codec, JsonCodec, StringCodec};
use crate::engine::{
    ChangeCallback, ChangeEvent, ChangeNotifier, EngineRegistry, ListenerId, ResyncCallback,
    StorageEngine,
};
use crate::error::{PersistError, PersistResult};
use crate::reactive::lifecycle::lock;
use crate::reactive::{MapStore, Subscription, TeardownFn};

/// Engine handles and listener registrations captured at activation.
///
/// `per_key` only fills under a notifier requiring per-key listeners:
/// exactly one entry per key the container manages. Keys appearing in
/// storage under the prefix that the container never asked for gain no
/// entry here and therefore no visibility through events.
struct MapMount {
    storage: Arc<dyn StorageEngine>,
    notifier: Arc<dyn ChangeNotifier>,
    on_change: ChangeCallback,
    on_resync: ResyncCallback,
    prefix_listener: Option<ListenerId>,
    per_key: HashMap<String, ListenerId>,
}

struct MapBinding<T, C> {
    prefix: String,
    initial: HashMap<String, T>,
    codec: C,
    sync_external: bool,
    registry: EngineRegistry,
    map: MapStore<T>,
    mount: Mutex<Option<MapMount>>,
}

/// A reactive keyed container mirrored into the durable store under a
/// shared name prefix, one durable key per container key.
pub struct PersistentMap<T, C = JsonCodec> {
    inner: Arc<MapBinding<T, C>>,
}

impl<T> PersistentMap<T, JsonCodec>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    /// Binding on the global registry storing values as JSON.
    #[must_use]
    pub fn json(prefix: impl Into<String>, initial: HashMap<String, T>) -> Self {
        Self::with_registry(
            EngineRegistry::global(),
            prefix,
            initial,
            JsonCodec,
            PersistentOptions::default(),
        )
    }
}

impl PersistentMap<String, StringCodec> {
    /// Binding on the global registry storing strings as-is.
    #[must_use]
    pub fn plain(prefix: impl Into<String>, initial: HashMap<String, String>) -> Self {
        Self::with_registry(
            EngineRegistry::global(),
            prefix,
            initial,
            StringCodec,
            PersistentOptions::default(),
        )
    }
}

impl<T, C> PersistentMap<T, C>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    C: Codec<T> + Send + Sync + 'static,
{
    /// Binding on the global registry with an explicit codec and options.
    #[must_use]
    pub fn with_codec(
        prefix: impl Into<String>,
        initial: HashMap<String, T>,
        codec: C,
        options: PersistentOptions,
    ) -> Self {
        Self::with_registry(EngineRegistry::global(), prefix, initial, codec, options)
    }

    /// Binding on an injected registry.
    #[must_use]
    pub fn with_registry(
        registry: &EngineRegistry,
        prefix: impl Into<String>,
        initial: HashMap<String, T>,
        codec: C,
        options: PersistentOptions,
    ) -> Self {
        let map = MapStore::with_grace(options.grace_delay);
        let inner = Arc::new(MapBinding {
            prefix: prefix.into(),
            initial,
            codec,
            sync_external: options.sync_external,
            registry: registry.clone(),
            map,
            mount: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner.map.on_mount(move || match weak.upgrade() {
            Some(binding) => MapBinding::activate(&binding),
            None => Ok(None),
        });

        Self { inner }
    }

    /// Copy of the current container.
    #[must_use]
    pub fn get(&self) -> HashMap<String, T> {
        self.inner.map.get()
    }

    /// Current value under `key`, if present.
    #[must_use]
    pub fn get_key(&self, key: &str) -> Option<T> {
        self.inner.map.get_key(key)
    }

    /// Encode and write one key through to storage, then apply the mutation
    /// to the reactive container. Under a per-key notifier, a key becoming
    /// present registers its listener (absent-to-present transition only).
    ///
    /// # Errors
    /// Propagates encode failures and storage write failures.
    pub fn set_key(&self, key: &str, value: T) -> PersistResult<()> {
        self.inner.store_key(key, Some(&value))?;
        self.inner.map.set_key(key, Some(value));
        Ok(())
    }

    /// Delete one key from storage (unregistering its per-key listener) and
    /// remove it from the reactive container.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn delete_key(&self, key: &str) -> PersistResult<()> {
        self.inner.store_key(key, None)?;
        self.inner.map.set_key(key, None);
        Ok(())
    }

    /// Bulk replace: every key in `new_value` behaves as `set_key`, every
    /// current key absent from it as `delete_key`, but container observers
    /// receive exactly one aggregate notification. Per-key listener
    /// registration happens during the per-key storage calls, before that
    /// single notification fires.
    ///
    /// # Errors
    /// Propagates encode and storage failures; keys processed before the
    /// failure have already been written.
    pub fn set_all(&self, new_value: HashMap<String, T>) -> PersistResult<()> {
        for (key, value) in &new_value {
            self.inner.store_key(key, Some(value))?;
        }
        let current = self.inner.map.get();
        for key in current.keys() {
            if !new_value.contains_key(key) {
                self.inner.store_key(key, None)?;
            }
        }
        self.inner.map.replace(new_value);
        Ok(())
    }

    /// Attach a listener. The first listener activates the binding:
    /// hydration overlays stored entries onto the initial values and the
    /// change listeners are registered.
    ///
    /// # Errors
    /// Propagates hydration failures; the binding stays inactive.
    pub fn listen(
        &self,
        cb: impl Fn(&HashMap<String, T>, Option<&str>) + Send + Sync + 'static,
    ) -> PersistResult<Subscription> {
        self.inner.map.listen(cb)
    }

    /// [`PersistentMap::listen`] plus an immediate replay of the hydrated
    /// container.
    ///
    /// # Errors
    /// Same failure mode as [`PersistentMap::listen`].
    pub fn subscribe(
        &self,
        cb: impl Fn(&HashMap<String, T>, Option<&str>) + Send + Sync + 'static,
    ) -> PersistResult<Subscription> {
        self.inner.map.subscribe(cb)
    }
}

impl<T, C> Clone for PersistentMap<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, C> MapBinding<T, C>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    C: Codec<T> + Send + Sync + 'static,
{
    fn activate(binding: &Arc<Self>) -> PersistResult<Option<TeardownFn>> {
        let (storage, notifier) = binding.registry.current();
        binding.hydrate(storage.as_ref())?;
        debug!(prefix = %binding.prefix, "persistent map activated");

        let on_change: ChangeCallback = {
            let weak = Arc::downgrade(binding);
            Arc::new(move |event| match weak.upgrade() {
                Some(binding) => binding.on_change(event),
                None => Ok(()),
            })
        };
        let on_resync: ResyncCallback = {
            let weak = Arc::downgrade(binding);
            Arc::new(move || match weak.upgrade() {
                Some(binding) => binding.resync(),
                None => Ok(()),
            })
        };

        let mut mount = MapMount {
            storage,
            notifier: Arc::clone(&notifier),
            on_change,
            on_resync,
            prefix_listener: None,
            per_key: HashMap::new(),
        };

        if binding.sync_external {
            mount.prefix_listener = Some(notifier.add_listener(
                &binding.prefix,
                Arc::clone(&mount.on_change),
                Arc::clone(&mount.on_resync),
            ));
            if notifier.per_key_required() {
                for key in binding.map.get().keys() {
                    let full = format!("{}{key}", binding.prefix);
                    let id = notifier.add_listener(
                        &full,
                        Arc::clone(&mount.on_change),
                        Arc::clone(&mount.on_resync),
                    );
                    mount.per_key.insert(key.clone(), id);
                }
            }
        }

        *lock(&binding.mount) = Some(mount);

        let weak = Arc::downgrade(binding);
        Ok(Some(Box::new(move || {
            if let Some(binding) = weak.upgrade() {
                binding.deactivate();
            }
        })))
    }

    fn deactivate(&self) {
        let taken = lock(&self.mount).take();
        if let Some(mount) = taken {
            if let Some(id) = mount.prefix_listener {
                mount.notifier.remove_listener(id);
            }
            for id in mount.per_key.into_values() {
                mount.notifier.remove_listener(id);
            }
            debug!(prefix = %self.prefix, "persistent map deactivated");
        }
    }

    /// Overlay stored entries onto the initial values (storage wins) and
    /// install the merged result through the per-key setter, so downstream
    /// subscribers observe the per-key notification pattern. Never writes
    /// back to storage.
    fn hydrate(&self, storage: &dyn StorageEngine) -> PersistResult<()> {
        let mut data = self.initial.clone();
        for full_key in storage.keys()? {
            if let Some(bare) = full_key.strip_prefix(&self.prefix) {
                if let Some(raw) = storage.get(&full_key)? {
                    let value = self
                        .codec
                        .decode(&raw)
                        .map_err(|e| PersistError::codec(&full_key, e))?;
                    data.insert(bare.to_string(), value);
                }
            }
        }
        for (key, value) in data {
            self.map.set_key(&key, Some(value));
        }
        Ok(())
    }

    /// Durable-side half of a key mutation: listener bookkeeping plus the
    /// storage write or delete. Reactive-side mutation is the caller's job,
    /// which is what lets `set_all` batch these under one notification.
    fn store_key(&self, key: &str, value: Option<&T>) -> PersistResult<()> {
        let full = format!("{}{key}", self.prefix);
        let mut mount = lock(&self.mount);
        match value {
            Some(v) => {
                if self.sync_external {
                    if let Some(m) = mount.as_mut() {
                        if m.notifier.per_key_required() && !m.per_key.contains_key(key) {
                            let id = m.notifier.add_listener(
                                &full,
                                Arc::clone(&m.on_change),
                                Arc::clone(&m.on_resync),
                            );
                            m.per_key.insert(key.to_string(), id);
                            trace!(key = %full, "per-key listener registered");
                        }
                    }
                }
                let encoded = self
                    .codec
                    .encode(v)
                    .map_err(|e| PersistError::codec(&full, e))?;
                let storage = mount
                    .as_ref()
                    .map_or_else(|| self.registry.storage(), |m| Arc::clone(&m.storage));
                match encoded {
                    Some(text) => storage.set(&full, &text)?,
                    None => storage.remove(&full)?,
                }
            }
            None => {
                if let Some(m) = mount.as_mut() {
                    if let Some(id) = m.per_key.remove(key) {
                        m.notifier.remove_listener(id);
                        trace!(key = %full, "per-key listener removed");
                    }
                }
                let storage = mount
                    .as_ref()
                    .map_or_else(|| self.registry.storage(), |m| Arc::clone(&m.storage));
                storage.remove(&full)?;
            }
        }
        Ok(())
    }

    fn on_change(&self, event: &ChangeEvent) -> PersistResult<()> {
        match event.key.as_deref() {
            // Bulk clear: everything under the prefix is gone.
            None => self.map.replace(HashMap::new()),
            Some(full_key) => {
                if let Some(bare) = full_key.strip_prefix(&self.prefix) {
                    match &event.new_value {
                        Some(raw) => {
                            let value = self
                                .codec
                                .decode(raw)
                                .map_err(|e| PersistError::codec(full_key, e))?;
                            self.map.set_key(bare, Some(value));
                        }
                        None => self.map.set_key(bare, None),
                    }
                }
            }
        }
        Ok(())
    }

    fn resync(&self) -> PersistResult<()> {
        let storage = {
            let mount = lock(&self.mount);
            match mount.as_ref() {
                Some(m) => Arc::clone(&m.storage),
                None => self.registry.storage(),
            }
        };
        self.hydrate(storage.as_ref())?;

        // Keys that appeared during suspension need listeners too.
        let mut mount = lock(&self.mount);
        if let Some(m) = mount.as_mut() {
            if self.sync_external && m.notifier.per_key_required() {
                for key in self.map.get().keys() {
                    if !m.per_key.contains_key(key) {
                        let full = format!("{}{key}", self.prefix);
                        let id = m.notifier.add_listener(
                            &full,
                            Arc::clone(&m.on_change),
                            Arc::clone(&m.on_resync),
                        );
                        m.per_key.insert(key.clone(), id);
                    }
                }
            }
        }
        Ok(())
    }
}

impl<T, C> Drop for MapBinding<T, C> {
    fn drop(&mut self) {
        let taken = self.mount.get_mut().map(Option::take);
        if let Ok(Some(mount)) = taken {
            if let Some(id) = mount.prefix_listener {
                mount.notifier.remove_listener(id);
            }
            for id in mount.per_key.into_values() {
                mount.notifier.remove_listener(id);
            }
        }
    }
}
