//! Shared key/value state.
//!
//! One process-wide map from dot-separated keys to [`StateValue`]s,
//! guarded by a single mutex. Modules publish readings and observe each
//! other through it instead of holding references to one another.
//!
//! ```text
//! SensorManager ──set──▶ ┌──────────────┐ ──callback──▶ subscribers
//!                        │ SharedState  │
//! ActuatorManager ◀─get──│  (one mutex) │
//!                        └──────────────┘
//! ```
//!
//! ## Callback discipline
//!
//! `set` snapshots the matching subscriptions under the lock and invokes
//! them **after** releasing it, in registration order. A callback may call
//! back into the state (including `set` on the same key); the nested call
//! simply reacquires the free lock. Writes that do not change the stored
//! value fire no callbacks and bump no counters.

use log::{error, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::{pattern, time};

/// Hard cap on the number of keys; exceeding it fails the write.
pub const MAX_KEYS: usize = 256;
/// Maximum key length in characters.
pub const MAX_KEY_LEN: usize = 64;
/// Maximum stored string-value length in characters.
pub const MAX_STRING_LEN: usize = 256;

// ═══════════════════════════════════════════════════════════════
//  Values
// ═══════════════════════════════════════════════════════════════

/// The closed set of value shapes the state can hold.
///
/// Modeled as a tagged sum with explicit accessors; readers always get
/// copies, never references into the map.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Doc(serde_json::Value),
}

impl StateValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: `Int` widens to `f64`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_doc(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Doc(d) => Some(d),
            _ => None,
        }
    }

    /// Serialize any Rust value into a `Doc` variant.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Doc(serde_json::to_value(value)?))
    }

    /// View as a JSON value (the `Doc` variant passes through).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::from(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Str(s) => serde_json::Value::from(s.clone()),
            Self::Doc(d) => d.clone(),
        }
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Doc(v)
    }
}

/// One slot in the map: value plus update bookkeeping.
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub value: StateValue,
    pub last_update_ms: u64,
    pub update_count: u32,
}

// ═══════════════════════════════════════════════════════════════
//  Subscriptions
// ═══════════════════════════════════════════════════════════════

/// Subscription callback. Receives the key that changed and its new value.
pub type StateCallback = Arc<dyn Fn(&str, &StateValue) + Send + Sync>;

struct Subscription {
    handle: u32,
    pattern: String,
    callback: StateCallback,
    call_count: AtomicU32,
}

// ═══════════════════════════════════════════════════════════════
//  SharedState
// ═══════════════════════════════════════════════════════════════

struct Inner {
    entries: HashMap<String, StateEntry>,
    subscriptions: Vec<Arc<Subscription>>,
    next_handle: u32,
}

/// The process-wide shared state.
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                subscriptions: Vec::new(),
                next_handle: 1,
            }),
        }
    }

    // ── Writes ────────────────────────────────────────────────

    /// Upsert `key`. Returns `Ok(true)` if the value changed (and
    /// callbacks fired), `Ok(false)` if the write was suppressed because
    /// the stored value compares equal.
    pub fn set(&self, key: &str, value: impl Into<StateValue>) -> Result<bool> {
        let value = value.into();
        validate_key(key)?;
        if let StateValue::Str(s) = &value {
            if s.chars().count() > MAX_STRING_LEN {
                return Err(Error::invalid_argument(format!(
                    "string value for '{key}' exceeds {MAX_STRING_LEN} chars"
                )));
            }
        }

        let to_invoke = {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(key) {
                Some(entry) => {
                    if entry.value == value {
                        return Ok(false);
                    }
                    entry.value = value.clone();
                    entry.last_update_ms = time::now_ms();
                    entry.update_count = entry.update_count.wrapping_add(1);
                }
                None => {
                    if inner.entries.len() >= MAX_KEYS {
                        return Err(Error::resource_exhausted(format!(
                            "state map full ({MAX_KEYS} keys), rejecting '{key}'"
                        )));
                    }
                    inner.entries.insert(
                        key.to_string(),
                        StateEntry {
                            value: value.clone(),
                            last_update_ms: time::now_ms(),
                            update_count: 1,
                        },
                    );
                }
            }
            // Snapshot matching subscriptions in registration order; the
            // callbacks run with the lock released.
            inner
                .subscriptions
                .iter()
                .filter(|s| pattern::matches(&s.pattern, key))
                .cloned()
                .collect::<Vec<_>>()
        };

        for sub in to_invoke {
            sub.call_count.fetch_add(1, Ordering::Relaxed);
            let result = catch_unwind(AssertUnwindSafe(|| (sub.callback)(key, &value)));
            if result.is_err() {
                error!(
                    "state subscription {} ('{}') panicked on key '{key}'",
                    sub.handle, sub.pattern
                );
            }
        }
        Ok(true)
    }

    /// Remove `key`. Unknown keys are a no-op.
    pub fn remove(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    /// Atomic compare-and-swap on a numeric value.
    ///
    /// Succeeds only if the stored value is numeric and equals `expected`
    /// within `f64` comparison. Returns `Ok(true)` on swap.
    pub fn compare_and_swap(&self, key: &str, expected: f64, new: f64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::not_found(format!("key '{key}'")))?;
        let current = entry
            .value
            .as_float()
            .ok_or_else(|| Error::invalid_argument(format!("key '{key}' is not numeric")))?;
        if current != expected {
            return Ok(false);
        }
        entry.value = StateValue::Float(new);
        entry.last_update_ms = time::now_ms();
        entry.update_count = entry.update_count.wrapping_add(1);
        Ok(true)
    }

    /// Atomically add `delta` to an integer value, creating it at `delta`
    /// if absent. Returns the new value.
    pub fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        validate_key(key)?;
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            let current = entry
                .value
                .as_int()
                .ok_or_else(|| Error::invalid_argument(format!("key '{key}' is not an int")))?;
            let next = current.wrapping_add(delta);
            entry.value = StateValue::Int(next);
            entry.last_update_ms = time::now_ms();
            entry.update_count = entry.update_count.wrapping_add(1);
            return Ok(next);
        }
        if inner.entries.len() >= MAX_KEYS {
            return Err(Error::resource_exhausted(format!(
                "state map full ({MAX_KEYS} keys), rejecting '{key}'"
            )));
        }
        inner.entries.insert(
            key.to_string(),
            StateEntry {
                value: StateValue::Int(delta),
                last_update_ms: time::now_ms(),
                update_count: 1,
            },
        );
        Ok(delta)
    }

    // ── Reads ─────────────────────────────────────────────────

    /// Copy of the value stored at `key`.
    pub fn get(&self, key: &str) -> Option<StateValue> {
        self.inner.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Copy of the full entry (value + bookkeeping).
    pub fn entry(&self, key: &str) -> Option<StateEntry> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_int())
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_float())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| match v {
            StateValue::Str(s) => Some(s),
            _ => None,
        })
    }

    /// Deserialize a `Doc` value into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let doc = self.get(key)?;
        let value = match doc {
            StateValue::Doc(v) => v,
            other => serde_json::to_value(&other).ok()?,
        };
        match serde_json::from_value(value) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("state get_as('{key}'): {e}");
                None
            }
        }
    }

    /// All keys matching `pattern`, unordered.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .keys()
            .filter(|k| pattern::matches(pattern, k))
            .cloned()
            .collect()
    }

    /// True if any key matching `pattern` was updated after `since_ms`.
    pub fn has_changed(&self, pattern: &str, since_ms: u64) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|(k, e)| pattern::matches(pattern, k) && e.last_update_ms > since_ms)
    }

    /// Timestamp of the last change to `key`.
    pub fn last_change_time(&self, key: &str) -> Option<u64> {
        self.inner.lock().entries.get(key).map(|e| e.last_update_ms)
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    // ── Subscriptions ─────────────────────────────────────────

    /// Register a callback for keys matching `pattern`.
    ///
    /// Takes effect for the next `set`; a subscription registered inside a
    /// callback does not see the change that triggered it.
    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> u32
    where
        F: Fn(&str, &StateValue) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.subscriptions.push(Arc::new(Subscription {
            handle,
            pattern: pattern.to_string(),
            callback: Arc::new(callback),
            call_count: AtomicU32::new(0),
        }));
        handle
    }

    /// Remove the subscription with `handle`. Unknown handles are a no-op.
    pub fn unsubscribe(&self, handle: u32) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.subscriptions.iter().position(|s| s.handle == handle) {
            inner.subscriptions.remove(pos);
        }
    }

    /// Times the subscription's callback has been invoked.
    pub fn subscription_call_count(&self, handle: u32) -> Option<u32> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .find(|s| s.handle == handle)
            .map(|s| s.call_count.load(Ordering::Relaxed))
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("empty state key"));
    }
    if key.chars().count() > MAX_KEY_LEN {
        return Err(Error::invalid_argument(format!(
            "state key '{key}' exceeds {MAX_KEY_LEN} chars"
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
