//! Scalar sync store.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::PersistentOptions;
use crate::codec::{Codec, JsonCodec, StringCodec};
use crate::engine::{
    ChangeCallback, ChangeEvent, ChangeNotifier, EngineRegistry, ListenerId, ResyncCallback,
    StorageEngine,
};
use crate::error::{PersistError, PersistResult};
use crate::reactive::lifecycle::lock;
use crate::reactive::{Atom, Subscription, TeardownFn};

/// Engine handles captured at activation. A registry swap only affects the
/// next activation; the live binding keeps these until teardown.
struct AtomMount {
    storage: Arc<dyn StorageEngine>,
    notifier: Arc<dyn ChangeNotifier>,
    listener: Option<ListenerId>,
}

struct AtomBinding<T, C> {
    name: String,
    initial: Option<T>,
    codec: C,
    sync_external: bool,
    registry: EngineRegistry,
    atom: Atom<Option<T>>,
    mount: Mutex<Option<AtomMount>>,
}

/// A reactive scalar mirrored into one durable key.
///
/// `None` is the absence sentinel: `unset` (or a codec encoding to nothing)
/// deletes the durable key. External removal resets the value to the
/// binding's initial value rather than to absence.
pub struct PersistentAtom<T, C = JsonCodec> {
    inner: Arc<AtomBinding<T, C>>,
}

impl<T> PersistentAtom<T, JsonCodec>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    /// Binding on the global registry storing values as JSON.
    #[must_use]
    pub fn json(name: impl Into<String>, initial: Option<T>) -> Self {
        Self::with_registry(
            EngineRegistry::global(),
            name,
            initial,
            JsonCodec,
            PersistentOptions::default(),
        )
    }
}

impl PersistentAtom<String, StringCodec> {
    /// Binding on the global registry storing strings as-is.
    #[must_use]
    pub fn plain(name: impl Into<String>, initial: Option<String>) -> Self {
        Self::with_registry(
            EngineRegistry::global(),
            name,
            initial,
            StringCodec,
            PersistentOptions::default(),
        )
    }
}

impl<T, C> PersistentAtom<T, C>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    C: Codec<T> + Send + Sync + 'static,
{
    /// Binding on the global registry with an explicit codec and options.
    #[must_use]
    pub fn with_codec(
        name: impl Into<String>,
        initial: Option<T>,
        codec: C,
        options: PersistentOptions,
    ) -> Self {
        Self::with_registry(EngineRegistry::global(), name, initial, codec, options)
    }

    /// Binding on an injected registry. Tests use this to swap in a fake
    /// engine without touching process-wide state.
    #[must_use]
    pub fn with_registry(
        registry: &EngineRegistry,
        name: impl Into<String>,
        initial: Option<T>,
        codec: C,
        options: PersistentOptions,
    ) -> Self {
        let atom = Atom::with_grace(initial.clone(), options.grace_delay);
        let inner = Arc::new(AtomBinding {
            name: name.into(),
            initial,
            codec,
            sync_external: options.sync_external,
            registry: registry.clone(),
            atom,
            mount: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner.atom.on_mount(move || match weak.upgrade() {
            Some(binding) => AtomBinding::activate(&binding),
            None => Ok(None),
        });

        Self { inner }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.inner.atom.get()
    }

    /// Encode and write the value through to storage, then propagate to the
    /// reactive store's own listeners. A codec that encodes to nothing
    /// deletes the durable key instead, symmetric with [`PersistentAtom::unset`].
    ///
    /// # Errors
    /// Propagates encode failures and storage write failures. The reactive
    /// store is only updated after the durable step succeeded.
    pub fn set(&self, value: T) -> PersistResult<()> {
        let binding = &self.inner;
        let storage = binding.storage_handle();
        match binding
            .codec
            .encode(&value)
            .map_err(|e| PersistError::codec(&binding.name, e))?
        {
            Some(text) => storage.set(&binding.name, &text)?,
            None => storage.remove(&binding.name)?,
        }
        binding.atom.set(Some(value));
        Ok(())
    }

    /// Delete the durable key and set the reactive value to absent.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn unset(&self) -> PersistResult<()> {
        let binding = &self.inner;
        binding.storage_handle().remove(&binding.name)?;
        binding.atom.set(None);
        Ok(())
    }

    /// Attach a listener. The first listener activates the binding:
    /// hydration runs and, with external sync enabled, the change listener
    /// is registered.
    ///
    /// # Errors
    /// Propagates hydration failures (storage read or decode); the binding
    /// stays inactive in that case.
    pub fn listen(
        &self,
        cb: impl Fn(&Option<T>) + Send + Sync + 'static,
    ) -> PersistResult<Subscription> {
        self.inner.atom.listen(cb)
    }

    /// [`PersistentAtom::listen`] plus an immediate replay of the (freshly
    /// hydrated) current value.
    ///
    /// # Errors
    /// Same failure mode as [`PersistentAtom::listen`].
    pub fn subscribe(
        &self,
        cb: impl Fn(&Option<T>) + Send + Sync + 'static,
    ) -> PersistResult<Subscription> {
        self.inner.atom.subscribe(cb)
    }
}

impl<T, C> Clone for PersistentAtom<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, C> AtomBinding<T, C>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    C: Codec<T> + Send + Sync + 'static,
{
    fn activate(binding: &Arc<Self>) -> PersistResult<Option<TeardownFn>> {
        let (storage, notifier) = binding.registry.current();
        binding.hydrate(storage.as_ref())?;
        debug!(name = %binding.name, "persistent atom activated");

        let listener = if binding.sync_external {
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
            Some(notifier.add_listener(&binding.name, on_change, on_resync))
        } else {
            None
        };

        *lock(&binding.mount) = Some(AtomMount {
            storage,
            notifier,
            listener,
        });

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
            if let Some(id) = mount.listener {
                mount.notifier.remove_listener(id);
            }
            debug!(name = %self.name, "persistent atom deactivated");
        }
    }

    /// Read-from-storage-into-reactive-store. A raw reactive set: hydration
    /// never writes back to storage.
    fn hydrate(&self, storage: &dyn StorageEngine) -> PersistResult<()> {
        let value = match storage.get(&self.name)? {
            Some(raw) => Some(
                self.codec
                    .decode(&raw)
                    .map_err(|e| PersistError::codec(&self.name, e))?,
            ),
            None => self.initial.clone(),
        };
        self.atom.set(value);
        Ok(())
    }

    fn resync(&self) -> PersistResult<()> {
        let storage = self.storage_handle();
        self.hydrate(storage.as_ref())
    }

    fn on_change(&self, event: &ChangeEvent) -> PersistResult<()> {
        match event.key.as_deref() {
            Some(key) if key == self.name => match &event.new_value {
                Some(raw) => {
                    let value = self
                        .codec
                        .decode(raw)
                        .map_err(|e| PersistError::codec(&self.name, e))?;
                    self.atom.set(Some(value));
                }
                // Removed in another context: back to the initial value,
                // not to absence.
                None => self.atom.set(self.initial.clone()),
            },
            // Another key, or a bulk clear: reset only if our entry is gone.
            _ => {
                let storage = self.storage_handle();
                if !storage.contains(&self.name)? {
                    self.atom.set(self.initial.clone());
                }
            }
        }
        Ok(())
    }

    fn storage_handle(&self) -> Arc<dyn StorageEngine> {
        let mount = lock(&self.mount);
        match mount.as_ref() {
            Some(m) => Arc::clone(&m.storage),
            None => self.registry.storage(),
        }
    }
}

impl<T, C> Drop for AtomBinding<T, C> {
    fn drop(&mut self) {
        let taken = self.mount.get_mut().map(Option::take);
        if let Ok(Some(mount)) = taken {
            if let Some(id) = mount.listener {
                mount.notifier.remove_listener(id);
            }
        }
    }
}
