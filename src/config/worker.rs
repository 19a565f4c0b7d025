//! Asynchronous config writeback worker.
//!
//! A single dedicated thread drains write jobs FIFO, so two writes to the
//! same section can never reorder. The worker touches only config-internal
//! structures: it serializes nothing itself (jobs carry the already
//! serialized blob) and reports completions through a callback that the
//! store uses to clear dirty flags.

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use super::storage::SectionStorage;

/// Called with `(section, generation)` after a job's blob is committed.
pub(crate) type CommitCallback = Arc<dyn Fn(&str, u64) + Send + Sync>;

enum Job {
    Write {
        section: String,
        blob: String,
        generation: u64,
    },
    Flush(Sender<()>),
    Shutdown,
}

/// Handle to the writeback thread.
pub struct SaveWorker {
    tx: Sender<Job>,
    pending: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl SaveWorker {
    pub(crate) fn spawn(storage: Arc<dyn SectionStorage>, on_commit: CommitCallback) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_worker = pending.clone();
        let handle = std::thread::Builder::new()
            .name("config-save".to_string())
            .spawn(move || run(&rx, storage.as_ref(), &on_commit, &pending_worker))
            .expect("spawn config-save worker");
        Self {
            tx,
            pending,
            handle: Some(handle),
        }
    }

    /// Queue one section blob for persistence.
    pub(crate) fn enqueue(&self, section: &str, blob: String, generation: u64) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let job = Job::Write {
            section: section.to_string(),
            blob,
            generation,
        };
        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            warn!("config: save worker gone, write to '{section}' lost");
        }
    }

    /// Number of writes queued but not yet committed.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Block until every previously queued write has been attempted.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(Job::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for SaveWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Job::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    rx: &Receiver<Job>,
    storage: &dyn SectionStorage,
    on_commit: &CommitCallback,
    pending: &AtomicUsize,
) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Write {
                section,
                blob,
                generation,
            } => {
                match storage.store(&section, &blob) {
                    Ok(()) => {
                        debug!("config: async-committed '{section}'");
                        on_commit(&section, generation);
                    }
                    Err(e) => warn!("config: async save of '{section}' failed: {e}"),
                }
                pending.fetch_sub(1, Ordering::Relaxed);
            }
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
            Job::Shutdown => break,
        }
    }
}
