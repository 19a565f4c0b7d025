//! Layered persistent configuration.
//!
//! Configuration is a set of named sections (`system`, `sensors`,
//! `actuators`, `climate`, …), each persisted as an independent JSON blob
//! through a [`SectionStorage`]. The in-memory document is served through
//! dotted paths; the first path segment names the section.
//!
//! ## Boot
//!
//! `load()` reads every recognized section; anything missing or
//! unparsable is replaced by the embedded default and marked dirty so the
//! next save repairs flash. If the stored schema version is older than
//! the firmware's, migrations run in order before the document is served.
//!
//! ## Persistence
//!
//! `save()` writes dirty sections synchronously. `save_async()` hands the
//! serialized blobs to a single FIFO worker thread and returns
//! immediately; writes to the same section never reorder, and a dirty
//! flag is only cleared when the matching generation commits. Section
//! writes are stage-then-commit, so a crash mid-write preserves the
//! previous blob. Multi-section commits are not atomic across sections.

pub mod defaults;
pub mod schema;
pub mod storage;
pub mod worker;

use log::{info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use defaults::{CONFIG_VERSION, RECOGNIZED_SECTIONS, default_section};
use schema::{SectionSchema, ValidationReport, lookup};
use storage::SectionStorage;
use worker::SaveWorker;

// ═══════════════════════════════════════════════════════════════
//  Migrations
// ═══════════════════════════════════════════════════════════════

struct Migration {
    to_version: u32,
    name: &'static str,
    /// Transforms the section map; returns the sections it touched.
    /// Routines must order their writes to tolerate partial completion —
    /// cross-section commits are not atomic.
    apply: fn(&mut HashMap<String, Value>) -> Vec<&'static str>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        to_version: 2,
        name: "add climate.defrost block",
        apply: |sections| {
            if let Some(climate) = sections.get_mut("climate") {
                if climate.get("defrost").is_none() {
                    climate["defrost"] = serde_json::json!({
                        "period_min": 360,
                        "duration_min": 20,
                    });
                    return vec!["climate"];
                }
            }
            vec![]
        },
    },
    Migration {
        to_version: 3,
        name: "rename climate.target_temp to setpoint",
        apply: |sections| {
            if let Some(climate) = sections.get_mut("climate") {
                if let Some(obj) = climate.as_object_mut() {
                    if let Some(old) = obj.remove("target_temp") {
                        obj.insert("setpoint".to_string(), old);
                        return vec!["climate"];
                    }
                }
            }
            vec![]
        },
    },
];

// ═══════════════════════════════════════════════════════════════
//  ConfigStore
// ═══════════════════════════════════════════════════════════════

struct StoreInner {
    sections: HashMap<String, Value>,
    /// Section → generation of its most recent mutation.
    dirty: HashMap<String, u64>,
    schemas: HashMap<String, SectionSchema>,
    generation: u64,
}

struct StoreShared {
    storage: Arc<dyn SectionStorage>,
    inner: Mutex<StoreInner>,
}

/// The configuration store.
pub struct ConfigStore {
    shared: Arc<StoreShared>,
    worker: SaveWorker,
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn SectionStorage>) -> Self {
        let shared = Arc::new(StoreShared {
            storage: storage.clone(),
            inner: Mutex::new(StoreInner {
                sections: HashMap::new(),
                dirty: HashMap::new(),
                schemas: HashMap::new(),
                generation: 0,
            }),
        });
        // The worker clears a dirty flag only when the committed blob's
        // generation still matches — a later mutation keeps its flag.
        let shared_worker = shared.clone();
        let worker = SaveWorker::spawn(
            storage,
            Arc::new(move |section: &str, generation: u64| {
                let mut inner = shared_worker.inner.lock();
                if inner.dirty.get(section) == Some(&generation) {
                    inner.dirty.remove(section);
                }
            }),
        );
        Self { shared, worker }
    }

    // ── Boot ──────────────────────────────────────────────────

    /// Load every recognized section, falling back to embedded defaults,
    /// then run schema migrations.
    pub fn load(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        for &section in RECOGNIZED_SECTIONS {
            let stored = match self.shared.storage.load(section) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!("config: reading '{section}' failed ({e}), using default");
                    None
                }
            };
            let parsed = stored.and_then(|blob| match serde_json::from_str::<Value>(&blob) {
                Ok(doc) if doc.is_object() => Some(doc),
                Ok(_) => {
                    warn!("config: section '{section}' is not an object, using default");
                    None
                }
                Err(e) => {
                    warn!("config: section '{section}' unparsable ({e}), using default");
                    None
                }
            });
            match parsed {
                Some(doc) => {
                    inner.sections.insert(section.to_string(), doc);
                }
                None => {
                    let default =
                        default_section(section).unwrap_or_else(|| serde_json::json!({}));
                    inner.sections.insert(section.to_string(), default);
                    inner.generation += 1;
                    let generation = inner.generation;
                    inner.dirty.insert(section.to_string(), generation);
                }
            }
        }
        drop(inner);
        self.migrate();
        Ok(())
    }

    fn migrate(&self) {
        let mut inner = self.shared.inner.lock();
        let stored_version = inner
            .sections
            .get("system")
            .and_then(|s| s.get("version"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if stored_version >= CONFIG_VERSION {
            return;
        }
        info!("config: migrating v{stored_version} -> v{CONFIG_VERSION}");
        for migration in MIGRATIONS {
            if migration.to_version <= stored_version {
                continue;
            }
            info!("config: applying migration '{}'", migration.name);
            let touched = (migration.apply)(&mut inner.sections);
            for section in touched {
                inner.generation += 1;
                let generation = inner.generation;
                inner.dirty.insert(section.to_string(), generation);
            }
        }
        if let Some(system) = inner.sections.get_mut("system") {
            system["version"] = Value::from(CONFIG_VERSION);
        }
        inner.generation += 1;
        let generation = inner.generation;
        inner.dirty.insert("system".to_string(), generation);
    }

    // ── Reads ─────────────────────────────────────────────────

    /// Copy of the value at a dotted path. The first segment names the
    /// section; the bare section name returns the whole section tree.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        let inner = self.shared.inner.lock();
        let (section, rest) = match path.split_once('.') {
            Some((s, r)) => (s, Some(r)),
            None => (path, None),
        };
        let doc = inner.sections.get(section)?;
        match rest {
            Some(rest) => lookup(doc, rest).cloned(),
            None => Some(doc.clone()),
        }
    }

    /// Typed read with a fallback default.
    pub fn get<T: DeserializeOwned>(&self, path: &str, default: T) -> T {
        self.get_value(path)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }

    /// Whole-document export: `{section: tree, …}`.
    pub fn export(&self) -> Value {
        let inner = self.shared.inner.lock();
        let map: serde_json::Map<String, Value> = inner
            .sections
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }

    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.export()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Sections with unpersisted changes.
    pub fn dirty_sections(&self) -> Vec<String> {
        let inner = self.shared.inner.lock();
        let mut sections: Vec<String> = inner.dirty.keys().cloned().collect();
        sections.sort();
        sections
    }

    // ── Writes ────────────────────────────────────────────────

    /// Register the validation schema for a section.
    pub fn set_schema(&self, section: &str, schema: SectionSchema) {
        self.shared
            .inner
            .lock()
            .schemas
            .insert(section.to_string(), schema);
    }

    /// Write a dotted path and mark the containing section dirty.
    ///
    /// The mutation is applied to a shadow copy and schema-checked before
    /// it becomes visible; a failed check leaves the live document
    /// untouched and returns `ValidationError` with the report summary.
    pub fn set(&self, path: &str, value: Value) -> Result<()> {
        let (section, rest) = match path.split_once('.') {
            Some((s, r)) => (s, Some(r)),
            None => (path, None),
        };
        if !RECOGNIZED_SECTIONS.contains(&section) {
            return Err(Error::not_found(format!("unknown config section '{section}'")));
        }

        let mut inner = self.shared.inner.lock();
        let mut shadow = inner
            .sections
            .get(section)
            .cloned()
            .or_else(|| default_section(section))
            .unwrap_or_else(|| serde_json::json!({}));

        match rest {
            Some(rest) => set_path(&mut shadow, rest, value)?,
            None => {
                if !value.is_object() {
                    return Err(Error::invalid_argument(format!(
                        "section '{section}' must be an object"
                    )));
                }
                shadow = value;
            }
        }

        if let Some(schema) = inner.schemas.get(section) {
            let report = schema.validate(&shadow);
            if !report.is_ok() {
                return Err(Error::validation(format!(
                    "config '{path}': {}",
                    report.summary()
                )));
            }
        }

        inner.sections.insert(section.to_string(), shadow);
        inner.generation += 1;
        let generation = inner.generation;
        inner.dirty.insert(section.to_string(), generation);
        Ok(())
    }

    /// Atomic import of a whole-document JSON string.
    ///
    /// The text is parsed into a shadow document and every section is
    /// schema-checked before anything is swapped in; a failure anywhere
    /// rejects the entire import.
    pub fn import_json(&self, text: &str) -> Result<()> {
        let doc: Value = serde_json::from_str(text)?;
        let Some(map) = doc.as_object() else {
            return Err(Error::validation("import root must be an object"));
        };

        let mut inner = self.shared.inner.lock();
        let mut report = ValidationReport::default();
        for (section, tree) in map {
            if !RECOGNIZED_SECTIONS.contains(&section.as_str()) {
                report.errors.push(format!("unknown section '{section}'"));
                continue;
            }
            if !tree.is_object() {
                report.errors.push(format!("section '{section}' must be an object"));
                continue;
            }
            if let Some(schema) = inner.schemas.get(section.as_str()) {
                report.errors.extend(schema.validate(tree).errors);
            }
        }
        if !report.is_ok() {
            return Err(Error::validation(format!("import: {}", report.summary())));
        }

        for (section, tree) in map {
            inner.sections.insert(section.clone(), tree.clone());
            inner.generation += 1;
            let generation = inner.generation;
            inner.dirty.insert(section.clone(), generation);
        }
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────

    /// Serialize and write every dirty section, clearing flags on
    /// success. Drains the async worker first so the two paths cannot
    /// interleave writes to the same section.
    pub fn save(&self) -> Result<()> {
        self.worker.flush();
        let mut inner = self.shared.inner.lock();
        let dirty: Vec<String> = inner.dirty.keys().cloned().collect();
        let mut first_error = None;
        for section in dirty {
            let blob = match inner.sections.get(&section) {
                Some(doc) => serde_json::to_string_pretty(doc)?,
                None => {
                    inner.dirty.remove(&section);
                    continue;
                }
            };
            match self.shared.storage.store(&section, &blob) {
                Ok(()) => {
                    inner.dirty.remove(&section);
                }
                Err(e) => {
                    warn!("config: save of '{section}' failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queue every dirty section on the writeback worker and return
    /// immediately. Flags clear as the writes commit.
    pub fn save_async(&self) {
        let inner = self.shared.inner.lock();
        for (section, generation) in &inner.dirty {
            if let Some(doc) = inner.sections.get(section) {
                match serde_json::to_string_pretty(doc) {
                    Ok(blob) => self.worker.enqueue(section, blob, *generation),
                    Err(e) => warn!("config: serializing '{section}' failed: {e}"),
                }
            }
        }
    }

    /// Writes queued on the worker but not yet committed.
    pub fn pending_saves(&self) -> usize {
        self.worker.pending_count()
    }

    /// Block until the async worker has drained.
    pub fn flush_async(&self) {
        self.worker.flush();
    }
}

/// Set a dotted path inside a JSON tree, creating intermediate objects.
fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(Error::invalid_argument(format!("bad config path '{path}'")));
        }
        if !current.is_object() {
            return Err(Error::invalid_argument(format!(
                "config path '{path}' crosses a non-object"
            )));
        }
        let obj = current.as_object_mut().expect("checked is_object");
        if i == segments.len() - 1 {
            obj.insert((*segment).to_string(), value);
            return Ok(());
        }
        current = obj
            .entry((*segment).to_string())
            .or_insert_with(|| serde_json::json!({}));
    }
    unreachable!("path has at least one segment")
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
