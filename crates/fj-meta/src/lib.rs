#![forbid(unsafe_code)]
//! Metadata journaling: versioned records, a background batcher, and a
//! checksummed read cache.
//!
//! Mutations are submitted as [`MetaRecord`]s and queued; a background
//! batcher drains the queue when the batch fills, the flush interval
//! elapses, or a synchronous caller is waiting, then journals the whole
//! batch through one transaction and refreshes the read cache.
//! Synchronous submissions block on the operation's completion signal.
//!
//! Records live at deterministic home blocks inside a configured metadata
//! region; a lookup misses the cache, reads the home block, verifies the
//! record, and repopulates the cache.

pub mod cache;
pub mod record;

pub use cache::{CacheStats, MetaCache};
pub use record::{MetaRecord, RecordKind, RECORD_OVERHEAD, RECORD_VERSION};

use fj_block::BlockDevice;
use fj_error::{JournalError, Result};
use fj_txn::{IsolationLevel, OpKind, Operation, TxnManager};
use fj_types::BlockNumber;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// Batcher knobs.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Operations drained per batch.
    pub max_batch: usize,
    /// Idle interval after which a partial batch is flushed anyway.
    pub flush_interval: Duration,
    /// How long a synchronous submitter waits before `Timeout`.
    pub sync_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 256,
            flush_interval: Duration::from_millis(50),
            sync_timeout: Duration::from_secs(5),
        }
    }
}

/// Read-cache knobs.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1024 }
    }
}

/// Metadata-layer configuration.
#[derive(Debug, Clone, Copy)]
pub struct MetaConfig {
    /// First block of the metadata region.
    pub region_start: BlockNumber,
    /// Region length in blocks; record home blocks are chosen inside it.
    pub region_blocks: u64,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
}

/// Whether a submission returns immediately or waits for durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Async,
    Sync,
}

/// Metadata-layer statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetaStats {
    pub submitted: u64,
    pub batches: u64,
    pub records_journaled: u64,
    pub batch_failures: u64,
    pub sync_waits: u64,
    pub cache: CacheStats,
}

struct Completion {
    done: Mutex<Option<std::result::Result<(), String>>>,
    cv: Condvar,
}

impl Completion {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn signal(&self, result: std::result::Result<(), String>) {
        *self.done.lock() = Some(result);
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let mut done = self.done.lock();
        while done.is_none() {
            if self.cv.wait_for(&mut done, timeout).timed_out() && done.is_none() {
                return Err(JournalError::Timeout(
                    "metadata batch did not complete".into(),
                ));
            }
        }
        match done.take() {
            Some(Err(detail)) => Err(JournalError::Io(std::io::Error::other(detail))),
            _ => Ok(()),
        }
    }
}

/// A queued submission. `record: None` is a flush barrier: it completes
/// once everything queued before it has been drained.
struct PendingOp {
    record: Option<MetaRecord>,
    completion: Option<Arc<Completion>>,
}

struct Inner<D: BlockDevice> {
    txns: Arc<TxnManager<D>>,
    config: MetaConfig,
    cache: MetaCache,
    pending: Mutex<VecDeque<PendingOp>>,
    pending_cv: Condvar,
    shutdown: AtomicBool,
    submitted: AtomicU64,
    batches: AtomicU64,
    records_journaled: AtomicU64,
    batch_failures: AtomicU64,
    sync_waits: AtomicU64,
}

/// The metadata journaling layer.
pub struct MetadataJournal<D: BlockDevice + 'static> {
    inner: Arc<Inner<D>>,
    batcher: Mutex<Option<JoinHandle<()>>>,
}

impl<D: BlockDevice + 'static> MetadataJournal<D> {
    /// Construct the layer and start its background batcher.
    pub fn new(txns: Arc<TxnManager<D>>, config: MetaConfig) -> Result<Self> {
        if config.region_blocks == 0 {
            return Err(JournalError::InvalidArgument(
                "metadata region must be non-empty".into(),
            ));
        }
        let inner = Arc::new(Inner {
            cache: MetaCache::new(config.cache.max_entries),
            txns,
            config,
            pending: Mutex::new(VecDeque::new()),
            pending_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            records_journaled: AtomicU64::new(0),
            batch_failures: AtomicU64::new(0),
            sync_waits: AtomicU64::new(0),
        });

        let worker = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("fj-meta-batcher".into())
            .spawn(move || batcher_loop(&worker))?;
        Ok(Self {
            inner,
            batcher: Mutex::new(Some(handle)),
        })
    }

    /// Submit a metadata mutation.
    ///
    /// `Sync` blocks until the batch carrying the record has been
    /// journaled (or fails, or times out); `Async` returns once queued.
    pub fn submit(&self, record: MetaRecord, mode: SyncMode) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(JournalError::ReadOnly);
        }
        let max = self.inner.txns.journal().max_payload();
        if record.encoded_len() > max {
            return Err(JournalError::InvalidArgument(format!(
                "metadata record of {} bytes exceeds journal payload limit {max}",
                record.encoded_len()
            )));
        }

        let completion = match mode {
            SyncMode::Async => None,
            SyncMode::Sync => Some(Completion::new()),
        };
        let queued = {
            let mut pending = self.inner.pending.lock();
            pending.push_back(PendingOp {
                record: Some(record),
                completion: completion.clone(),
            });
            pending.len()
        };
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        if queued >= self.inner.config.batch.max_batch || completion.is_some() {
            self.inner.pending_cv.notify_one();
        }

        if let Some(completion) = completion {
            self.inner.sync_waits.fetch_add(1, Ordering::Relaxed);
            completion.wait(self.inner.config.batch.sync_timeout)?;
        }
        Ok(())
    }

    /// Wait until everything queued so far has been journaled.
    pub fn flush(&self) -> Result<()> {
        let completion = Completion::new();
        self.inner.pending.lock().push_back(PendingOp {
            record: None,
            completion: Some(Arc::clone(&completion)),
        });
        self.inner.pending_cv.notify_one();
        completion.wait(self.inner.config.batch.sync_timeout)
    }

    /// Look up the current record for `(entity, kind)`.
    ///
    /// Cache first; on a miss (or after a corrupted cache entry is
    /// evicted) the home block is read and verified, and the cache is
    /// repopulated.
    pub fn lookup(&self, entity: u64, kind: RecordKind) -> Result<Option<MetaRecord>> {
        match self.inner.cache.get(entity, kind) {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => {}
            Err(JournalError::CacheCorruption { .. }) => {
                // Evicted by the cache; fall back to the home block.
            }
            Err(err) => return Err(err),
        }

        let home = home_block(&self.inner.config, entity, kind);
        let block = self.inner.txns.journal().device().read_block(home)?;
        match MetaRecord::decode(block.as_slice())? {
            Some(record) if record.entity == entity && record.kind == kind => {
                self.inner.cache.insert(&record)?;
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    /// Drop the cached copy of `(entity, kind)`; the next lookup reads
    /// the home block.
    pub fn invalidate(&self, entity: u64, kind: RecordKind) {
        self.inner.cache.remove(entity, kind);
    }

    #[must_use]
    pub fn stats(&self) -> MetaStats {
        MetaStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            batches: self.inner.batches.load(Ordering::Relaxed),
            records_journaled: self.inner.records_journaled.load(Ordering::Relaxed),
            batch_failures: self.inner.batch_failures.load(Ordering::Relaxed),
            sync_waits: self.inner.sync_waits.load(Ordering::Relaxed),
            cache: self.inner.cache.stats(),
        }
    }

    /// Stop the batcher after a final drain. Subsequent submissions fail.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.pending_cv.notify_all();
        if let Some(handle) = self.batcher.lock().take() {
            if handle.join().is_err() {
                return Err(JournalError::Io(std::io::Error::other(
                    "metadata batcher thread panicked",
                )));
            }
        }
        Ok(())
    }
}

impl<D: BlockDevice + 'static> Drop for MetadataJournal<D> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl<D: BlockDevice + 'static> std::fmt::Debug for MetadataJournal<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataJournal")
            .field("region_start", &self.inner.config.region_start)
            .field("region_blocks", &self.inner.config.region_blocks)
            .finish_non_exhaustive()
    }
}

/// Deterministic home block for a record inside the metadata region.
fn home_block(config: &MetaConfig, entity: u64, kind: RecordKind) -> BlockNumber {
    let mixed = entity
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(u64::from(kind.to_wire()));
    BlockNumber(config.region_start.0 + mixed % config.region_blocks)
}

fn batcher_loop<D: BlockDevice>(inner: &Arc<Inner<D>>) {
    loop {
        let batch: Vec<PendingOp> = {
            let mut pending = inner.pending.lock();
            if pending.is_empty() {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                inner
                    .pending_cv
                    .wait_for(&mut pending, inner.config.batch.flush_interval);
            }
            let take = pending.len().min(inner.config.batch.max_batch);
            pending.drain(..take).collect()
        };
        if batch.is_empty() {
            continue;
        }
        process_batch(inner, batch);
    }
    info!("metadata batcher stopped");
}

fn process_batch<D: BlockDevice>(inner: &Arc<Inner<D>>, batch: Vec<PendingOp>) {
    let mut records = Vec::new();
    let mut completions = Vec::new();
    for op in batch {
        if let Some(completion) = op.completion {
            completions.push(completion);
        }
        if let Some(record) = op.record {
            records.push(record);
        }
    }

    let result = commit_batch(inner, &records);
    inner.batches.fetch_add(1, Ordering::Relaxed);
    match &result {
        Ok(()) => {
            inner
                .records_journaled
                .fetch_add(records.len() as u64, Ordering::Relaxed);
            for record in &records {
                if inner.cache.insert(record).is_err() {
                    // Encoding just succeeded during commit; failure here
                    // only means the record is not cached.
                    debug!(entity = record.entity, "cache refresh skipped");
                }
            }
            for completion in &completions {
                completion.signal(Ok(()));
            }
        }
        Err(err) => {
            inner.batch_failures.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, records = records.len(), "metadata batch failed");
            let detail = err.to_string();
            for completion in &completions {
                completion.signal(Err(detail.clone()));
            }
        }
    }
}

fn commit_batch<D: BlockDevice>(inner: &Arc<Inner<D>>, records: &[MetaRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let txn = inner.txns.begin(0, IsolationLevel::ReadCommitted)?;
    for record in records {
        let encoded = record.encode()?;
        let target = home_block(&inner.config, record.entity, record.kind);
        let op = Operation::write(OpKind::MetadataWrite, target, encoded);
        if let Err(err) = inner.txns.add_operation(&txn, op) {
            let _ = inner.txns.abort(txn);
            return Err(err);
        }
    }
    let outcome = inner.txns.commit(txn)?;
    debug!(records = records.len(), sequence = ?outcome.sequence, "metadata batch committed");
    Ok(())
}
