//! Property tests for the subscription pattern rules and the config
//! document round-trip.

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use modesp::config::ConfigStore;
use modesp::config::storage::MemStorage;
use modesp::state::SharedState;

/// The documented subscription rule: catch-all, trailing-star prefix, or
/// exact match.
fn expected_match(pattern: &str, key: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return key.starts_with(prefix);
    }
    pattern == key
}

fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,6}"
}

fn dotted_key() -> impl Strategy<Value = String> {
    proptest::collection::vec(segment(), 1..4).prop_map(|parts| parts.join("."))
}

fn pattern() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("*".to_string()),
        Just(String::new()),
        dotted_key(),
        dotted_key().prop_map(|k| format!("{k}.*")),
        dotted_key().prop_map(|k| format!("{k}*")),
    ]
}

proptest! {
    /// For every key and pattern, a state subscription fires exactly
    /// when the documented rule says it should.
    #[test]
    fn subscription_fires_iff_pattern_matches(key in dotted_key(), pat in pattern()) {
        let state = SharedState::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        state.subscribe(&pat, move |_, _| {
            fired2.fetch_add(1, Ordering::Relaxed);
        });
        state.set(&key, 1i64).unwrap();

        let expected = u32::from(expected_match(&pat, &key));
        prop_assert_eq!(fired.load(Ordering::Relaxed), expected);
    }

    /// Change suppression holds for arbitrary integer values.
    #[test]
    fn repeated_equal_sets_fire_once(key in dotted_key(), value in any::<i64>()) {
        let state = SharedState::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        state.subscribe(&key, move |_, _| {
            fired2.fetch_add(1, Ordering::Relaxed);
        });
        state.set(&key, value).unwrap();
        state.set(&key, value).unwrap();
        prop_assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    /// Export → import is a fixed point of the config document.
    #[test]
    fn config_import_of_export_is_noop(
        setpoint in -40.0f64..60.0,
        hostname in "[a-z]{1,12}",
    ) {
        let store = ConfigStore::new(Arc::new(MemStorage::new()));
        store.load().unwrap();
        store.set("climate.setpoint", json!(setpoint)).unwrap();
        store.set("network.hostname", json!(hostname)).unwrap();

        let before = store.export();
        store.import_json(&store.export_json()).unwrap();
        prop_assert_eq!(store.export(), before);
    }
}
