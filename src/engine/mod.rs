//! Durable engine abstractions and the registry that selects them.
//!
//! The sync layer never talks to a concrete store directly; it goes through
//! the [`StorageEngine`] and [`ChangeNotifier`] traits held by an
//! [`EngineRegistry`]. Applications install a platform engine once;
//! tests install a [`TestEngine`].

mod registry;
mod test_engine;
mod traits;

pub use registry::{EngineRegistry, NoopNotifier, NoopStorage};
pub use test_engine::TestEngine;
pub use traits::{
    ChangeCallback, ChangeEvent, ChangeNotifier, ListenerId, ResyncCallback, StorageEngine,
    StorageError,
};
