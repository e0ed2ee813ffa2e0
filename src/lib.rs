//! # persistore - reactive state mirrored into durable storage
//!
//! persistore keeps an in-memory reactive value (a scalar [`PersistentAtom`]
//! or a flat keyed [`PersistentMap`]) synchronized with a durable textual
//! key-value store, and keeps independent execution contexts observing the
//! same store eventually consistent with each other.
//!
//! ## Core Concepts
//!
//! - **Binding**: pairs one reactive store with one durable key or prefix
//! - **Engine**: the durable [`StorageEngine`] plus the [`ChangeNotifier`]
//!   delivering "a key changed in another context" events
//! - **Hydration**: the read-from-storage step performed when the first
//!   observer attaches
//! - **Grace delay**: the deferred teardown window preventing subscription
//!   thrash across rapid unsubscribe/resubscribe
//!
//! ## Usage
//!
//! ```rust,ignore
//! use persistore::{EngineRegistry, PersistentAtom, TestEngine};
//!
//! // Install an engine once; tests use the deterministic fake.
//! let engine = TestEngine::new();
//! engine.install(EngineRegistry::global());
//!
//! let theme = PersistentAtom::plain("theme", Some("light".to_string()));
//! let sub = theme.subscribe(|value| println!("theme is now {value:?}"))?;
//!
//! theme.set("dark".to_string())?;                 // written through
//! engine.set_key("theme", Some("solarized"))?;    // another context wrote
//! assert_eq!(theme.get(), Some("solarized".to_string()));
//! ```
//!
//! Local writes never re-trigger the writing binding's own listener; the
//! notifier only reports changes the current context did not originate.
//! Conflicting writes from different contexts resolve last-writer-wins.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod engine;
pub mod error;
pub mod reactive;
pub mod sync;

// Re-export primary types at crate root for convenience
pub use codec::{Codec, JsonCodec, StringCodec};
pub use engine::{
    ChangeCallback, ChangeEvent, ChangeNotifier, EngineRegistry, ListenerId, NoopNotifier,
    NoopStorage, ResyncCallback, StorageEngine, StorageError, TestEngine,
};
pub use error::{CodecError, PersistError, PersistResult};
pub use reactive::{Atom, MapStore, Subscription, TeardownFn, DEFAULT_UNMOUNT_GRACE};
pub use sync::{PersistentAtom, PersistentMap, PersistentOptions};
