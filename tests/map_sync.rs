//! End-to-end tests for the keyed sync store, including per-key listener
//! mode.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use persistore::{
    EngineRegistry, JsonCodec, PersistentMap, PersistentOptions, StringCodec, Subscription,
    TestEngine,
};

type Log = Arc<Mutex<Vec<(HashMap<String, String>, Option<String>)>>>;

fn quick_options() -> PersistentOptions {
    PersistentOptions {
        sync_external: true,
        grace_delay: Duration::ZERO,
    }
}

fn string_map(
    registry: &EngineRegistry,
    prefix: &str,
    initial: HashMap<String, String>,
) -> PersistentMap<String, StringCodec> {
    PersistentMap::with_registry(registry, prefix, initial, StringCodec, quick_options())
}

fn entries(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn recording(map: &PersistentMap<String, StringCodec>) -> (Log, Subscription) {
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
fn set_key_writes_prefixed_entries_with_cumulative_notifications() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::new();
    engine.install(&registry);

    let map = string_map(&registry, "b:", HashMap::new());
    let (log, _sub) = recording(&map);

    map.set_key("one", "1".to_string()).unwrap();
    map.set_key("two", "2".to_string()).unwrap();

    assert_eq!(engine.snapshot().get("b:one"), Some(&"1".to_string()));
    assert_eq!(engine.snapshot().get("b:two"), Some(&"2".to_string()));

    let events = log.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].1.as_deref(), Some("one"));
    assert_eq!(events[0].0, entries(&[("one", "1")]));
    assert_eq!(events[1].1.as_deref(), Some("two"));
    assert_eq!(events[1].0, entries(&[("one", "1"), ("two", "2")]));
}

#[test]
fn set_all_emits_one_aggregate_notification_and_drops_missing_keys() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::new();
    engine.install(&registry);

    let map = string_map(&registry, "b:", HashMap::new());
    map.set_key("one", "1".to_string()).unwrap();
    map.set_key("two", "2".to_string()).unwrap();
    let (log, _sub) = recording(&map);

    map.set_all(entries(&[("one", "11")])).unwrap();

    let events = log.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, None);
    assert_eq!(events[0].0, entries(&[("one", "11")]));

    assert_eq!(engine.snapshot().get("b:one"), Some(&"11".to_string()));
    assert!(!engine.snapshot().contains_key("b:two"));
}

#[test]
fn hydration_overlays_storage_over_initial_defaults() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::new();
    engine.install(&registry);
    engine.set_key("p:b", Some("stored-b")).unwrap();
    engine.set_key("p:c", Some("stored-c")).unwrap();
    engine.set_key("other:x", Some("ignored")).unwrap();

    let map = string_map(&registry, "p:", entries(&[("a", "0"), ("b", "0")]));
    let (log, _sub) = recording(&map);

    assert_eq!(
        map.get(),
        entries(&[("a", "0"), ("b", "stored-b"), ("c", "stored-c")])
    );
    // Hydration installs the merge per key, never in one bulk replace.
    let events = log.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|(_, key)| key.is_some()));
    // And it never writes back to storage.
    assert_eq!(engine.write_count(), 0);
}

#[test]
fn external_events_route_to_container_keys() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::new();
    engine.install(&registry);

    let map = string_map(&registry, "p:", HashMap::new());
    let _sub = map.subscribe(|_, _| {}).unwrap();

    engine.set_key("p:x", Some("9")).unwrap();
    assert_eq!(map.get_key("x"), Some("9".to_string()));

    engine.set_key("p:x", None).unwrap();
    assert_eq!(map.get_key("x"), None);

    // Events outside the prefix are ignored.
    engine.set_key("q:x", Some("1")).unwrap();
    assert!(map.get().is_empty());
}

#[test]
fn bulk_clear_resets_the_container() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::new();
    engine.install(&registry);

    let map = string_map(&registry, "p:", entries(&[("a", "1")]));
    let _sub = map.subscribe(|_, _| {}).unwrap();
    map.set_key("b", "2".to_string()).unwrap();

    engine.emit_clear().unwrap();
    assert!(map.get().is_empty());
}

#[test]
fn json_map_round_trips_typed_values() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::new();
    engine.install(&registry);

    let map: PersistentMap<i64, JsonCodec> =
        PersistentMap::with_registry(&registry, "n:", HashMap::new(), JsonCodec, quick_options());
    let _sub = map.subscribe(|_, _| {}).unwrap();

    map.set_key("count", 7).unwrap();
    assert_eq!(engine.snapshot().get("n:count"), Some(&"7".to_string()));

    engine.set_key("n:other", Some("8")).unwrap();
    assert_eq!(map.get_key("other"), Some(8));
}

#[test]
fn per_key_mode_registers_one_listener_per_managed_key() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::per_key();
    engine.install(&registry);

    let map = string_map(&registry, "b:", entries(&[("one", "1")]));
    let _sub = map.subscribe(|_, _| {}).unwrap();

    // Prefix-level listener plus one per hydrated key.
    let mut keys = engine.listener_keys();
    keys.sort();
    assert_eq!(keys, vec!["b:".to_string(), "b:one".to_string()]);

    map.set_key("two", "2".to_string()).unwrap();
    let mut keys = engine.listener_keys();
    keys.sort();
    assert_eq!(
        keys,
        vec!["b:".to_string(), "b:one".to_string(), "b:two".to_string()]
    );

    // Re-setting a present key must not duplicate its listener.
    map.set_key("two", "22".to_string()).unwrap();
    assert_eq!(engine.listener_count(), 3);

    map.delete_key("one").unwrap();
    let mut keys = engine.listener_keys();
    keys.sort();
    assert_eq!(keys, vec!["b:".to_string(), "b:two".to_string()]);
}

#[test]
fn per_key_mode_delivers_events_for_managed_keys() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::per_key();
    engine.install(&registry);

    let map = string_map(&registry, "b:", entries(&[("one", "1")]));
    let _sub = map.subscribe(|_, _| {}).unwrap();

    engine.set_key("b:one", Some("remote")).unwrap();
    assert_eq!(map.get_key("one"), Some("remote".to_string()));
}

#[test]
fn per_key_mode_ignores_keys_the_container_never_managed() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::per_key();
    engine.install(&registry);

    let map = string_map(&registry, "b:", entries(&[("one", "1")]));
    let _sub = map.subscribe(|_, _| {}).unwrap();
    let listeners_before = engine.listener_count();

    // A key appears under the prefix without going through the container.
    engine.set_key("b:admin", Some("sneaky")).unwrap();

    assert_eq!(map.get_key("admin"), None);
    assert_eq!(engine.listener_count(), listeners_before);
}

#[test]
fn per_key_mode_set_all_adjusts_listeners_before_the_aggregate_notify() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::per_key();
    engine.install(&registry);

    let map = string_map(&registry, "b:", entries(&[("one", "1"), ("two", "2")]));
    let _sub = map.subscribe(|_, _| {}).unwrap();

    map.set_all(entries(&[("one", "1"), ("three", "3")])).unwrap();

    let mut keys = engine.listener_keys();
    keys.sort();
    assert_eq!(
        keys,
        vec!["b:".to_string(), "b:one".to_string(), "b:three".to_string()]
    );
    assert!(!engine.snapshot().contains_key("b:two"));
}

#[test]
fn per_key_mode_deactivation_unregisters_everything() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::per_key();
    engine.install(&registry);

    let map = string_map(&registry, "b:", entries(&[("one", "1")]));
    let sub = map.subscribe(|_, _| {}).unwrap();
    assert!(engine.listener_count() > 0);

    sub.unsubscribe();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(engine.listener_count(), 0);
}

#[test]
fn resync_overlays_state_changed_during_suspension() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::new();
    engine.install(&registry);

    let map = string_map(&registry, "p:", HashMap::new());
    let _sub = map.subscribe(|_, _| {}).unwrap();
    map.set_key("a", "1".to_string()).unwrap();

    // Storage changed without events while the context was suspended.
    registry.storage().set("p:new", "5").unwrap();
    assert_eq!(map.get_key("new"), None);

    engine.trigger_resync().unwrap();
    assert_eq!(map.get_key("new"), Some("5".to_string()));
    assert_eq!(map.get_key("a"), Some("1".to_string()));
}

#[test]
fn per_key_mode_resync_registers_listeners_for_new_keys() {
    let registry = EngineRegistry::new();
    let engine = TestEngine::per_key();
    engine.install(&registry);

    let map = string_map(&registry, "b:", entries(&[("one", "1")]));
    let _sub = map.subscribe(|_, _| {}).unwrap();

    registry.storage().set("b:two", "2").unwrap();
    engine.trigger_resync().unwrap();

    let mut keys = engine.listener_keys();
    keys.sort();
    assert_eq!(
        keys,
        vec!["b:".to_string(), "b:one".to_string(), "b:two".to_string()]
    );
    assert_eq!(map.get_key("two"), Some("2".to_string()));
}
