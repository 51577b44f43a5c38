//! Storage engine - top-level handle with background workers

use super::{LsmStore, ScanIterator, StorageOptions, StorageStats};
use crate::{Result, StrataError};
use bytes::Bytes;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// A background worker and the channel that stops it
struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn shutdown(self, name: &str) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            error!("{} thread panicked", name);
        }
    }
}

/// Embedded key-value store
///
/// Writes go to the active memtable; a flush thread moves frozen memtables
/// to disk and, with a leveled policy, a compaction thread merges L0 into L1.
pub struct Storage {
    inner: Arc<LsmStore>,
    flush_notifier: Sender<()>,
    flush_worker: Mutex<Option<Worker>>,
    compaction_worker: Mutex<Option<Worker>>,
}

impl Storage {
    /// Open or create a store in `path` and start its workers
    pub fn open(path: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let inner = Arc::new(LsmStore::open(path, options)?);
        let interval = inner.options().flush_interval;

        let (flush_notifier, notified) = bounded(1);
        let flush_worker = spawn_worker("strata-flush", {
            let inner = inner.clone();
            move |stop| flush_loop(inner, interval, notified, stop)
        })?;

        let compaction_worker = if inner.options().compaction.runs_in_background() {
            let inner = inner.clone();
            Some(spawn_worker("strata-compaction", move |stop| {
                compaction_loop(inner, interval, stop)
            })?)
        } else {
            None
        };

        Ok(Self {
            inner,
            flush_notifier,
            flush_worker: Mutex::new(Some(flush_worker)),
            compaction_worker: Mutex::new(compaction_worker),
        })
    }

    /// Insert or overwrite a key
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)?;
        self.notify_flush();
        Ok(())
    }

    /// Remove a key
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)?;
        self.notify_flush();
        Ok(())
    }

    /// Latest value of a key, or [`StrataError::KeyNotFound`]
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        self.inner.get(key)?.ok_or(StrataError::KeyNotFound)
    }

    /// Live entries with keys in `[start, end]`
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<ScanIterator> {
        self.inner
            .scan(Bound::Included(start), Bound::Included(end))
    }

    /// Live entries within arbitrary bounds
    pub fn scan_range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<ScanIterator> {
        self.inner.scan(lower, upper)
    }

    /// Write every memtable to L0 now
    pub fn force_flush(&self) -> Result<()> {
        self.inner.force_flush()
    }

    /// Merge all of L0 and L1 into a fresh L1
    pub fn force_full_compaction(&self) -> Result<()> {
        self.inner.force_full_compaction()
    }

    pub fn stats(&self) -> StorageStats {
        self.inner.stats()
    }

    /// Underlying tree, for inspection
    pub fn store(&self) -> &Arc<LsmStore> {
        &self.inner
    }

    /// Stop the workers and make all writes durable
    ///
    /// Further calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let flush = self.flush_worker.lock().take();
        let compaction = self.compaction_worker.lock().take();
        if flush.is_none() && compaction.is_none() {
            return Ok(());
        }
        if let Some(worker) = compaction {
            worker.shutdown("compaction");
        }
        if let Some(worker) = flush {
            worker.shutdown("flush");
        }
        self.inner.close()?;
        info!("Closed store at {:?}", self.inner.path());
        Ok(())
    }

    fn notify_flush(&self) {
        if self.inner.needs_flush() {
            // a full channel already holds a pending wakeup
            let _ = self.flush_notifier.try_send(());
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close store: {}", e);
        }
    }
}

fn spawn_worker<F>(name: &str, body: F) -> Result<Worker>
where
    F: FnOnce(Receiver<()>) + Send + 'static,
{
    let (stop, stopped) = bounded(1);
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(stopped))?;
    Ok(Worker { stop, handle })
}

fn flush_loop(inner: Arc<LsmStore>, interval: Duration, notified: Receiver<()>, stop: Receiver<()>) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {}
            recv(notified) -> _ => {}
            recv(stop) -> _ => return,
        }
        if let Err(e) = inner.trigger_flush() {
            error!("Background flush failed: {}", e);
        }
    }
}

fn compaction_loop(inner: Arc<LsmStore>, interval: Duration, stop: Receiver<()>) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {}
            recv(stop) -> _ => return,
        }
        if let Err(e) = inner.trigger_compaction() {
            error!("Background compaction failed: {}", e);
        }
    }
}
