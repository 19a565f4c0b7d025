//! Section blob persistence.
//!
//! Each configuration section is one independent blob under a stable
//! identifier. [`FileStorage`] is the host backend: a write goes to a
//! staging file first and is committed with an atomic rename, so a crash
//! between stage and commit leaves the previous blob intact.
//! [`MemStorage`] backs tests and the simulator.

use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Persistence contract for configuration sections.
pub trait SectionStorage: Send + Sync {
    /// Read the committed blob for `section`, or `None` if never written.
    fn load(&self, section: &str) -> Result<Option<String>>;

    /// Atomically replace the blob for `section`.
    fn store(&self, section: &str, blob: &str) -> Result<()>;

    /// Remove the blob for `section`. Unknown sections are a no-op.
    fn erase(&self, section: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════
//  FileStorage
// ═══════════════════════════════════════════════════════════════

/// File-per-section storage with stage-then-commit writes.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) the storage directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn blob_path(&self, section: &str) -> PathBuf {
        self.dir.join(format!("{section}.json"))
    }

    fn staging_path(&self, section: &str) -> PathBuf {
        self.dir.join(format!("{section}.json.tmp"))
    }
}

impl SectionStorage for FileStorage {
    fn load(&self, section: &str) -> Result<Option<String>> {
        validate_section_id(section)?;
        // A leftover staging file means a write never committed; the
        // committed blob is the source of truth.
        let staging = self.staging_path(section);
        if staging.exists() {
            warn!("config: discarding uncommitted staging blob for '{section}'");
            let _ = fs::remove_file(&staging);
        }
        match fs::read_to_string(self.blob_path(section)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, section: &str, blob: &str) -> Result<()> {
        validate_section_id(section)?;
        let staging = self.staging_path(section);
        fs::write(&staging, blob)?;
        fs::rename(&staging, self.blob_path(section))?;
        Ok(())
    }

    fn erase(&self, section: &str) -> Result<()> {
        validate_section_id(section)?;
        match fs::remove_file(self.blob_path(section)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_section_id(section: &str) -> Result<()> {
    let ok = !section.is_empty()
        && section
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "bad section identifier '{section}'"
        )))
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemStorage
// ═══════════════════════════════════════════════════════════════

/// In-memory storage for tests. `fail_writes` simulates a full or
/// faulty flash partition.
#[derive(Default)]
pub struct MemStorage {
    blobs: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Direct peek for assertions.
    pub fn raw(&self, section: &str) -> Option<String> {
        self.blobs.lock().get(section).cloned()
    }
}

impl SectionStorage for MemStorage {
    fn load(&self, section: &str) -> Result<Option<String>> {
        Ok(self.blobs.lock().get(section).cloned())
    }

    fn store(&self, section: &str, blob: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::hardware("simulated write failure"));
        }
        self.blobs
            .lock()
            .insert(section.to_string(), blob.to_string());
        Ok(())
    }

    fn erase(&self, section: &str) -> Result<()> {
        self.blobs.lock().remove(section);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("modesp-cfg-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn store_then_load_round_trips() {
        let storage = FileStorage::open(scratch_dir("rt")).unwrap();
        assert_eq!(storage.load("climate").unwrap(), None);
        storage.store("climate", r#"{"setpoint":-18.5}"#).unwrap();
        assert_eq!(
            storage.load("climate").unwrap().as_deref(),
            Some(r#"{"setpoint":-18.5}"#)
        );
    }

    #[test]
    fn uncommitted_staging_blob_is_ignored() {
        let dir = scratch_dir("stage");
        let storage = FileStorage::open(&dir).unwrap();
        storage.store("system", r#"{"version":3}"#).unwrap();
        // Simulate a crash between stage and commit.
        fs::write(dir.join("system.json.tmp"), r#"{"version":999}"#).unwrap();
        assert_eq!(
            storage.load("system").unwrap().as_deref(),
            Some(r#"{"version":3}"#)
        );
        // The stale staging file is cleaned up.
        assert!(!dir.join("system.json.tmp").exists());
    }

    #[test]
    fn erase_is_idempotent() {
        let storage = FileStorage::open(scratch_dir("erase")).unwrap();
        storage.store("net", "{}").unwrap();
        storage.erase("net").unwrap();
        storage.erase("net").unwrap();
        assert_eq!(storage.load("net").unwrap(), None);
    }

    #[test]
    fn section_identifiers_are_restricted() {
        let storage = FileStorage::open(scratch_dir("ids")).unwrap();
        assert!(storage.store("../evil", "{}").is_err());
        assert!(storage.store("", "{}").is_err());
        assert!(storage.store("ok_name2", "{}").is_ok());
    }

    #[test]
    fn mem_storage_simulated_failure() {
        let storage = MemStorage::new();
        storage.store("a", "1").unwrap();
        storage.set_fail_writes(true);
        assert!(storage.store("a", "2").is_err());
        assert_eq!(storage.raw("a").as_deref(), Some("1"));
    }
}
