#![forbid(unsafe_code)]
//! Crash recovery: scan the journal, re-validate, replay in parallel.
//!
//! [`RecoveryManager::run`] drives a single pass through the state
//! machine `Idle -> Scanning -> Replaying -> ResolvingPartial ->
//! Complete` (or `Failed`). The scan delegates to the journal's log
//! reader; replay re-validates every committed transaction's target
//! checksum first, then fans the home-block writes out over a bounded
//! worker pool. Writes are partitioned by target block, so two workers
//! never touch the same home block and log order is preserved per
//! target.
//!
//! Partial transactions (descriptor without commit) were never applied
//! to home blocks; discarding their log entries is the entire rollback.
//!
//! Replay is idempotent: running the same committed range twice leaves
//! the device byte-identical.

use fj_block::BlockDevice;
use fj_error::{JournalError, Result};
use fj_journal::{apply_data_write, DataPayload, Journal};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Upper bound on replay workers regardless of configuration.
pub const MAX_WORKERS: usize = 8;

/// Recovery state machine. `Complete` and `Failed` are terminal; a
/// manager runs at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    Idle,
    Scanning,
    Replaying,
    ResolvingPartial,
    Complete,
    Failed,
}

impl RecoveryState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Scanning => 1,
            Self::Replaying => 2,
            Self::ResolvingPartial => 3,
            Self::Complete => 4,
            Self::Failed => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Scanning,
            2 => Self::Replaying,
            3 => Self::ResolvingPartial,
            4 => Self::Complete,
            5 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// Recovery knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryConfig {
    /// Replay worker count; 0 means available parallelism, capped at
    /// [`MAX_WORKERS`].
    pub workers: usize,
}

impl RecoveryConfig {
    fn effective_workers(self) -> usize {
        let auto = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let requested = if self.workers == 0 { auto } else { self.workers };
        requested.clamp(1, MAX_WORKERS)
    }
}

/// What a completed recovery did.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub txns_replayed: usize,
    pub writes_replayed: u64,
    /// Partial transactions discarded without replay.
    pub partial_discarded: usize,
    pub blocks_scanned: u64,
    /// The scan stopped at a checksum mismatch instead of the natural
    /// end of the log; everything after the mismatch was discarded.
    pub truncated_tail: bool,
    /// Newest checkpoint the scan honored, if any.
    pub checkpoint: Option<u64>,
    pub workers: usize,
    pub duration_micros: u64,
}

/// Drives one recovery pass over a journal.
pub struct RecoveryManager<D: BlockDevice> {
    journal: Arc<Journal<D>>,
    config: RecoveryConfig,
    state: AtomicU8,
    done: AtomicU64,
    total: AtomicU64,
}

impl<D: BlockDevice> RecoveryManager<D> {
    pub fn new(journal: Arc<Journal<D>>, config: RecoveryConfig) -> Self {
        Self {
            journal,
            config,
            state: AtomicU8::new(RecoveryState::Idle.as_u8()),
            done: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn state(&self) -> RecoveryState {
        RecoveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Replay progress as `(operations done, operations total)`.
    /// Observable from other threads while `run` executes.
    #[must_use]
    pub fn progress(&self) -> (u64, u64) {
        (
            self.done.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// Execute the full recovery pass. Consumes the manager's single
    /// run; a second call fails.
    pub fn run(&self) -> Result<RecoveryReport> {
        let idle = RecoveryState::Idle.as_u8();
        let scanning = RecoveryState::Scanning.as_u8();
        if self
            .state
            .compare_exchange(idle, scanning, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(JournalError::RecoveryFailed(
                "recovery already ran on this manager".into(),
            ));
        }
        let started = Instant::now();

        let scan = match self.journal.recover() {
            Ok(scan) => scan,
            Err(err) => return Err(self.fail(err)),
        };

        // Every entry about to be replayed must still match the checksum
        // its commit block recorded.
        let alg = self.journal.checksum_algorithm();
        for txn in &scan.committed {
            if !txn.verify_targets(alg) {
                return Err(self.fail(JournalError::RecoveryFailed(format!(
                    "transaction {} failed checksum re-validation at sequence {}",
                    txn.txn_id, txn.sequence
                ))));
            }
        }

        self.set_state(RecoveryState::Replaying);
        let total: u64 = scan.committed.iter().map(|t| t.writes.len() as u64).sum();
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);

        if let Err(err) = self.replay(&scan.committed) {
            return Err(self.fail(err));
        }
        // New appends must not reuse sequence numbers still in the log.
        if let Err(err) = self.journal.align_after_replay(&scan) {
            return Err(self.fail(err));
        }

        self.set_state(RecoveryState::ResolvingPartial);
        for txn_id in &scan.partial {
            // Never committed, never applied; dropping the log entries is
            // the rollback.
            debug!(txn = txn_id.0, "partial transaction discarded");
        }

        self.set_state(RecoveryState::Complete);
        let report = RecoveryReport {
            txns_replayed: scan.committed.len(),
            writes_replayed: total,
            partial_discarded: scan.partial.len(),
            blocks_scanned: scan.blocks_scanned,
            truncated_tail: scan.truncated,
            checkpoint: scan.checkpoint.map(|cp| cp.id.0),
            workers: self.config.effective_workers(),
            duration_micros: duration_micros(started),
        };
        info!(
            txns = report.txns_replayed,
            writes = report.writes_replayed,
            partial = report.partial_discarded,
            truncated = report.truncated_tail,
            "recovery complete"
        );
        Ok(report)
    }

    /// Replay committed writes across the worker pool.
    ///
    /// Partitioned by target block: each home block is owned by exactly
    /// one worker, which applies its writes in log order.
    fn replay(&self, committed: &[fj_journal::RecoveredTxn]) -> Result<()> {
        // Per-target write lists, log-ordered because `committed` is.
        let mut by_target: BTreeMap<u64, Vec<&DataPayload>> = BTreeMap::new();
        for txn in committed {
            for write in &txn.writes {
                by_target.entry(write.target.0).or_default().push(write);
            }
        }
        if by_target.is_empty() {
            return Ok(());
        }

        let workers = self.config.effective_workers().min(by_target.len());
        let mut buckets: Vec<Vec<&DataPayload>> = vec![Vec::new(); workers];
        for (i, writes) in by_target.into_values().enumerate() {
            buckets[i % workers].extend(writes);
        }

        let dev = self.journal.device();
        let done = &self.done;
        thread::scope(|scope| {
            let handles: Vec<_> = buckets
                .into_iter()
                .map(|bucket| {
                    scope.spawn(move || -> Result<()> {
                        for write in bucket {
                            apply_data_write(dev, write)?;
                            done.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(())
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(JournalError::RecoveryFailed(
                            "replay worker panicked".into(),
                        ))
                    }
                }
            }
            Ok(())
        })
    }

    fn set_state(&self, state: RecoveryState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn fail(&self, err: JournalError) -> JournalError {
        self.set_state(RecoveryState::Failed);
        warn!(error = %err, "recovery failed");
        err
    }
}

impl<D: BlockDevice> std::fmt::Debug for RecoveryManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn duration_micros(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fj_block::MemBlockDevice;
    use fj_journal::{
        BlockHeader, BlockType, ChecksumAlgorithm, DescriptorPayload, JournalConfig,
        BLOCK_HEADER_SIZE,
    };
    use fj_types::{BlockNumber, SequenceNumber, TxnId};

    const JOURNAL_START: u64 = 4;

    fn journal_on(dev: &Arc<MemBlockDevice>) -> Journal<Arc<MemBlockDevice>> {
        Journal::create(
            Arc::clone(dev),
            JournalConfig {
                start_block: BlockNumber(JOURNAL_START),
                block_count: 64,
                checksum: ChecksumAlgorithm::Crc32c,
                sync_on_commit: false,
            },
        )
        .expect("create journal")
    }

    fn commit_write(
        journal: &Journal<Arc<MemBlockDevice>>,
        txn_id: u64,
        target: u64,
        fill: u8,
    ) {
        let mut txn = journal
            .start_transaction(TxnId(txn_id), 1, 0)
            .expect("start");
        txn.add_write(BlockNumber(target), vec![fill; 64]).expect("add");
        journal.commit(txn).expect("commit");
    }

    #[test]
    fn replay_restores_home_blocks() {
        let dev = Arc::new(MemBlockDevice::new(512, 256));
        let journal = journal_on(&dev);
        commit_write(&journal, 1, 100, 0xAA);
        commit_write(&journal, 2, 101, 0xBB);
        drop(journal);

        // Crash before write-back persisted: home blocks lost.
        let zero = vec![0_u8; 512];
        dev.write_block(BlockNumber(100), &zero).expect("zero");
        dev.write_block(BlockNumber(101), &zero).expect("zero");

        let journal =
            Journal::open(Arc::clone(&dev), BlockNumber(JOURNAL_START), false).expect("open");
        let mgr = RecoveryManager::new(Arc::new(journal), RecoveryConfig::default());
        let report = mgr.run().expect("recover");

        assert_eq!(mgr.state(), RecoveryState::Complete);
        assert_eq!(report.txns_replayed, 2);
        assert_eq!(report.writes_replayed, 2);
        assert_eq!(report.partial_discarded, 0);
        assert!(!report.truncated_tail);
        assert_eq!(mgr.progress(), (2, 2));

        let block = dev.read_block(BlockNumber(100)).expect("read");
        assert_eq!(&block.as_slice()[..64], &[0xAA; 64]);
        let block = dev.read_block(BlockNumber(101)).expect("read");
        assert_eq!(&block.as_slice()[..64], &[0xBB; 64]);
    }

    #[test]
    fn replay_is_idempotent() {
        let dev = Arc::new(MemBlockDevice::new(512, 256));
        let journal = journal_on(&dev);
        for i in 0..4_u64 {
            commit_write(&journal, i + 1, 100 + i % 2, i as u8 + 1);
        }
        drop(journal);

        let run = |dev: &Arc<MemBlockDevice>| {
            let journal = Journal::open(Arc::clone(dev), BlockNumber(JOURNAL_START), false)
                .expect("open");
            RecoveryManager::new(Arc::new(journal), RecoveryConfig::default())
                .run()
                .expect("recover");
            dev.snapshot()
        };
        let first = run(&dev);
        let second = run(&dev);
        assert_eq!(first, second);

        // Last writer per target wins.
        let block = dev.read_block(BlockNumber(100)).expect("read");
        assert_eq!(&block.as_slice()[..64], &[3_u8; 64]);
        let block = dev.read_block(BlockNumber(101)).expect("read");
        assert_eq!(&block.as_slice()[..64], &[4_u8; 64]);
    }

    #[test]
    fn partial_transactions_are_discarded_not_replayed() {
        let dev = Arc::new(MemBlockDevice::new(512, 256));
        let journal = journal_on(&dev);
        commit_write(&journal, 1, 100, 0x11);

        // A descriptor with no commit: crash mid-transaction.
        let stats = journal.stats();
        let desc = DescriptorPayload {
            txn_id: TxnId(2),
            op_type: 0,
            actor_id: 0,
            timestamp_micros: 0,
            targets: vec![BlockNumber(120)],
        };
        let payload = desc.encode().expect("encode");
        let mut block = vec![0_u8; 512];
        BlockHeader {
            block_type: BlockType::Descriptor,
            sequence: SequenceNumber(stats.sequence),
            payload_len: u32::try_from(payload.len()).expect("len"),
            flags: 0,
            checksum: ChecksumAlgorithm::Crc32c.compute(&payload),
        }
        .encode_into(&mut block)
        .expect("header");
        block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload.len()].copy_from_slice(&payload);
        dev.write_block(BlockNumber(JOURNAL_START + 1 + stats.head_pos), &block)
            .expect("write");
        drop(journal);

        let journal =
            Journal::open(Arc::clone(&dev), BlockNumber(JOURNAL_START), false).expect("open");
        let mgr = RecoveryManager::new(Arc::new(journal), RecoveryConfig { workers: 2 });
        let report = mgr.run().expect("recover");

        assert_eq!(report.txns_replayed, 1);
        assert_eq!(report.partial_discarded, 1);
        // The partial transaction's target was never written.
        let block = dev.read_block(BlockNumber(120)).expect("read");
        assert!(block.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn manager_runs_exactly_once() {
        let dev = Arc::new(MemBlockDevice::new(512, 256));
        let journal = Arc::new(journal_on(&dev));
        let mgr = RecoveryManager::new(journal, RecoveryConfig::default());

        mgr.run().expect("first run");
        assert!(matches!(
            mgr.run(),
            Err(JournalError::RecoveryFailed(_))
        ));
        // Terminal state survives the rejected second run.
        assert_eq!(mgr.state(), RecoveryState::Complete);
    }

    #[test]
    fn checksum_revalidation_fails_hard() {
        let txn = fj_journal::RecoveredTxn {
            txn_id: TxnId(7),
            sequence: SequenceNumber(3),
            op_type: 0,
            writes: vec![DataPayload {
                target: BlockNumber(50),
                bytes: vec![1, 2, 3],
            }],
            targets: vec![BlockNumber(50)],
            targets_checksum: 0xDEAD_BEEF,
        };
        assert!(!txn.verify_targets(ChecksumAlgorithm::Crc32c));

        let good = fj_journal::RecoveredTxn {
            targets_checksum: ChecksumAlgorithm::Crc32c.compute(&50_u64.to_le_bytes()),
            ..txn
        };
        assert!(good.verify_targets(ChecksumAlgorithm::Crc32c));
    }

    #[test]
    fn worker_count_is_clamped() {
        assert_eq!(RecoveryConfig { workers: 3 }.effective_workers(), 3);
        assert_eq!(RecoveryConfig { workers: 64 }.effective_workers(), MAX_WORKERS);
        let auto = RecoveryConfig { workers: 0 }.effective_workers();
        assert!((1..=MAX_WORKERS).contains(&auto));
    }
}
