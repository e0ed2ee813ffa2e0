//! Persistent bindings: reactive stores mirrored into the durable engine.
//!
//! A binding pairs one reactive store with one durable key
//! ([`PersistentAtom`]) or key prefix ([`PersistentMap`]). Local mutations
//! write through to storage; changes made by other contexts arrive through
//! the notifier and flow back into the reactive store. Bindings are lazy:
//! hydration and listener registration happen when the first observer
//! attaches, teardown after the last one leaves plus the grace delay.

use std::time::Duration;

use crate::reactive::DEFAULT_UNMOUNT_GRACE;

mod atom;
mod map;

pub use atom::PersistentAtom;
pub use map::PersistentMap;

/// Behavior switches for a persistent binding, resolved once at
/// construction.
#[derive(Debug, Clone)]
pub struct PersistentOptions {
    /// Subscribe to external-change notifications while active. When false
    /// the binding still hydrates and writes through, but never observes
    /// other contexts.
    pub sync_external: bool,
    /// Grace window between the last observer leaving and the binding
    /// unregistering its listeners.
    pub grace_delay: Duration,
}

impl Default for PersistentOptions {
    fn default() -> Self {
        Self {
            sync_external: true,
            grace_delay: DEFAULT_UNMOUNT_GRACE,
        }
    }
}
