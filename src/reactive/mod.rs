//! Reactive primitives consumed by the sync layer.
//!
//! [`Atom`] holds one value, [`MapStore`] a flat keyed container. Both carry
//! the lazy mount/unmount lifecycle: setup on the first observer, teardown
//! after the last observer leaves and the grace delay elapses.

mod atom;
pub(crate) mod lifecycle;
mod map;

pub use atom::Atom;
pub use lifecycle::{Subscription, TeardownFn, DEFAULT_UNMOUNT_GRACE};
pub use map::MapStore;
