//! Reactive scalar store.

use std::sync::Arc;
use std::time::Duration;

use super::lifecycle::{self, lock, Core, Shared, Subscription, TeardownFn, DEFAULT_UNMOUNT_GRACE};
use crate::error::PersistResult;

type AtomListener<T> = dyn Fn(&T) + Send + Sync;

/// A single reactive value with lazy mount semantics.
///
/// `listen` attaches an observer; the first observer triggers the mount
/// hook (setup), and the last observer leaving schedules teardown after the
/// grace delay. `subscribe` is `listen` plus an immediate replay of the
/// current value.
pub struct Atom<T> {
    shared: Arc<Shared<T, AtomListener<T>>>,
}

impl<T> Atom<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// New atom holding `value`, with the default grace delay.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_grace(value, DEFAULT_UNMOUNT_GRACE)
    }

    /// New atom with an explicit deactivation grace delay.
    #[must_use]
    pub fn with_grace(value: T, grace: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                grace,
                state: std::sync::Mutex::new(Core::new(value)),
            }),
        }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> T {
        lock(&self.shared.state).value.clone()
    }

    /// Replace the value and notify every listener. Setting a value equal
    /// to the current one is a no-op and notifies nobody.
    pub fn set(&self, value: T) {
        let (snapshot, listeners) = {
            let mut core = lock(&self.shared.state);
            if core.value == value {
                return;
            }
            core.value = value;
            let listeners: Vec<_> = core
                .listeners
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            (core.value.clone(), listeners)
        };
        for listener in listeners {
            listener(&snapshot);
        }
    }

    /// Attach a listener for future changes.
    ///
    /// # Errors
    /// Propagates a mount-hook failure (for persistent stores, a hydration
    /// read or decode error); the listener is not installed in that case.
    pub fn listen(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> PersistResult<Subscription> {
        lifecycle::add_listener(&self.shared, Arc::new(cb))
    }

    /// Attach a listener and immediately replay the current value to it.
    ///
    /// # Errors
    /// Same failure mode as [`Atom::listen`].
    pub fn subscribe(
        &self,
        cb: impl Fn(&T) + Send + Sync + 'static,
    ) -> PersistResult<Subscription> {
        let cb: Arc<AtomListener<T>> = Arc::new(cb);
        let sub = lifecycle::add_listener(&self.shared, Arc::clone(&cb))?;
        cb(&self.get());
        Ok(sub)
    }

    /// Install the mount hook. It runs on every inactive-to-active
    /// transition and may return a teardown closure for deactivation.
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

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}
