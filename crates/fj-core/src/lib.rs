#![forbid(unsafe_code)]
//! Top-level assembly of the journaling stack.
//!
//! [`JournalingCore::mount`] opens the journal on a device, drives crash
//! recovery to completion if the previous shutdown was unclean, and
//! wires the transaction, metadata and allocation layers over shared
//! handles. A failed recovery aborts the mount; the stack never goes
//! writable over a journal it could not replay.
//!
//! The admin surface is synchronous and returns plain `Serialize` data;
//! rendering is the caller's concern.

use fj_alloc::{AllocStats, AllocationJournal, OrphanConfig};
use fj_block::BlockDevice;
use fj_error::{JournalError, Result};
use fj_journal::{CheckpointKind, Journal, JournalConfig, JournalStats};
use fj_meta::{MetaConfig, MetaStats, MetadataJournal};
use fj_recovery::{RecoveryConfig, RecoveryManager, RecoveryReport};
use fj_txn::{TxnConfig, TxnManager, TxnStats};
use fj_types::CheckpointId;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// How file data relates to the journal.
///
/// `Ordered` writes data blocks home before their metadata commits;
/// `Writeback` lets data trail metadata; `FullData` journals data blocks
/// themselves. The mode is advisory state consulted by upper layers when
/// they stage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JournalingMode {
    Ordered,
    Writeback,
    FullData,
}

impl JournalingMode {
    fn as_u8(self) -> u8 {
        match self {
            Self::Ordered => 0,
            Self::Writeback => 1,
            Self::FullData => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Writeback,
            2 => Self::FullData,
            _ => Self::Ordered,
        }
    }
}

/// Everything a mount needs to know.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    pub journal: JournalConfig,
    pub txn: TxnConfig,
    pub meta: MetaConfig,
    pub orphans: OrphanConfig,
    pub recovery: RecoveryConfig,
    pub mode: JournalingMode,
}

/// Point-in-time view of the mounted stack.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CoreStatus {
    pub mode: JournalingMode,
    pub active_txns: usize,
    pub sequence: u64,
    pub last_committed: u64,
    pub head_pos: u64,
    pub tail_pos: u64,
    pub log_blocks: u64,
    pub utilization_pct: u8,
    /// Present when this mount had to run crash recovery.
    pub recovered: bool,
}

/// Per-layer counters, aggregated.
#[derive(Debug, Clone, Serialize)]
pub struct CoreStatistics {
    pub journal: JournalStats,
    pub txns: TxnStats,
    pub meta: MetaStats,
    pub alloc: AllocStats,
    pub recovery: Option<RecoveryReport>,
}

/// The assembled journaling stack over one device.
pub struct JournalingCore<D: BlockDevice + 'static> {
    journal: Arc<Journal<D>>,
    txns: Arc<TxnManager<D>>,
    meta: MetadataJournal<D>,
    alloc: AllocationJournal<D>,
    mode: AtomicU8,
    recovery: Option<RecoveryReport>,
}

impl<D: BlockDevice + 'static> JournalingCore<D> {
    /// Write a fresh journal extent to the device. Destroys any journal
    /// already there.
    pub fn format(dev: D, config: &CoreConfig) -> Result<()> {
        let journal = Journal::create(dev, config.journal)?;
        journal.write_superblock(true)?;
        Ok(())
    }

    /// Open the journal and bring the stack up.
    ///
    /// An unclean previous shutdown triggers a full recovery pass before
    /// anything else touches the device; recovery failure fails the
    /// mount.
    pub fn mount(dev: D, config: CoreConfig) -> Result<Self> {
        let start = config.journal.start_block;
        let clean = Journal::was_clean_shutdown(&dev, start)?;
        let journal = Arc::new(Journal::open(
            dev,
            start,
            config.journal.sync_on_commit,
        )?);

        let recovery = if clean {
            None
        } else {
            warn!("unclean shutdown detected, running recovery");
            let manager = RecoveryManager::new(Arc::clone(&journal), config.recovery);
            let report = manager.run()?;
            // Replayed state is home; reclaim the log before going live.
            journal.checkpoint(CheckpointKind::Full)?;
            Some(report)
        };

        // Mark the journal in use; a crash from here on is unclean.
        journal.write_superblock(false)?;

        let txns = Arc::new(TxnManager::new(Arc::clone(&journal), config.txn));
        let meta = MetadataJournal::new(Arc::clone(&txns), config.meta)?;
        let alloc = AllocationJournal::new(Arc::clone(&txns), config.orphans);

        info!(
            recovered = recovery.is_some(),
            mode = ?config.mode,
            "journaling core mounted"
        );
        Ok(Self {
            journal,
            txns,
            meta,
            alloc,
            mode: AtomicU8::new(config.mode.as_u8()),
            recovery,
        })
    }

    /// Flush everything, stop background work, and mark the shutdown
    /// clean.
    pub fn unmount(self) -> Result<()> {
        if self.txns.active_count() > 0 {
            return Err(JournalError::TxnState {
                txn: 0,
                state: "live",
                action: "unmount beneath",
            });
        }
        self.meta.shutdown()?;
        self.journal.force_commit()?;
        self.journal.checkpoint(CheckpointKind::Full)?;
        self.journal.write_superblock(true)?;
        info!("journaling core unmounted");
        Ok(())
    }

    #[must_use]
    pub fn mode(&self) -> JournalingMode {
        JournalingMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn set_mode(&self, mode: JournalingMode) {
        self.mode.store(mode.as_u8(), Ordering::Release);
        info!(?mode, "journaling mode changed");
    }

    #[must_use]
    pub fn status(&self) -> CoreStatus {
        let stats = self.journal.stats();
        CoreStatus {
            mode: self.mode(),
            active_txns: self.txns.active_count(),
            sequence: stats.sequence,
            last_committed: stats.last_committed,
            head_pos: stats.head_pos,
            tail_pos: stats.tail_pos,
            log_blocks: stats.log_blocks,
            utilization_pct: stats.utilization_pct,
            recovered: self.recovery.is_some(),
        }
    }

    /// Flush queued metadata and sync the device.
    pub fn force_commit_all(&self) -> Result<()> {
        self.meta.flush()?;
        self.journal.force_commit()
    }

    /// Write a checkpoint, bounding future recovery work.
    pub fn create_checkpoint(&self, kind: CheckpointKind) -> Result<CheckpointId> {
        self.meta.flush()?;
        Ok(self.journal.checkpoint(kind)?.id)
    }

    #[must_use]
    pub fn statistics(&self) -> CoreStatistics {
        CoreStatistics {
            journal: self.journal.stats(),
            txns: self.txns.stats(),
            meta: self.meta.stats(),
            alloc: self.alloc.stats(),
            recovery: self.recovery.clone(),
        }
    }

    /// Recovery report from this mount, if recovery ran.
    #[must_use]
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<Journal<D>> {
        &self.journal
    }

    #[must_use]
    pub fn transactions(&self) -> &Arc<TxnManager<D>> {
        &self.txns
    }

    #[must_use]
    pub fn metadata(&self) -> &MetadataJournal<D> {
        &self.meta
    }

    #[must_use]
    pub fn allocation(&self) -> &AllocationJournal<D> {
        &self.alloc
    }
}

impl<D: BlockDevice + 'static> std::fmt::Debug for JournalingCore<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalingCore")
            .field("mode", &self.mode())
            .field("recovered", &self.recovery.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fj_block::MemBlockDevice;
    use fj_journal::ChecksumAlgorithm;
    use fj_txn::{IsolationLevel, OpKind, Operation};
    use fj_types::{BlockNumber, GroupId};

    fn config() -> CoreConfig {
        CoreConfig {
            journal: JournalConfig {
                start_block: BlockNumber(8),
                block_count: 256,
                checksum: ChecksumAlgorithm::Crc32c,
                sync_on_commit: false,
            },
            txn: TxnConfig::default(),
            meta: MetaConfig {
                region_start: BlockNumber(512),
                region_blocks: 256,
                batch: fj_meta::BatchConfig::default(),
                cache: fj_meta::CacheConfig::default(),
            },
            orphans: OrphanConfig::default(),
            recovery: RecoveryConfig::default(),
            mode: JournalingMode::Ordered,
        }
    }

    fn mounted(dev: &Arc<MemBlockDevice>) -> JournalingCore<Arc<MemBlockDevice>> {
        JournalingCore::mount(Arc::clone(dev), config()).expect("mount")
    }

    #[test]
    fn clean_mount_unmount_cycle() {
        let dev = Arc::new(MemBlockDevice::new(512, 2048));
        JournalingCore::format(Arc::clone(&dev), &config()).expect("format");

        let core = mounted(&dev);
        assert!(core.recovery_report().is_none());
        assert_eq!(core.status().active_txns, 0);
        // Mounted means dirty on disk.
        assert!(!Journal::was_clean_shutdown(&dev, BlockNumber(8)).expect("read sb"));

        core.unmount().expect("unmount");
        assert!(Journal::was_clean_shutdown(&dev, BlockNumber(8)).expect("read sb"));
    }

    #[test]
    fn unclean_mount_runs_recovery_and_restores_state() {
        let dev = Arc::new(MemBlockDevice::new(512, 2048));
        JournalingCore::format(Arc::clone(&dev), &config()).expect("format");

        {
            let core = mounted(&dev);
            let txn = core
                .transactions()
                .begin(0, IsolationLevel::ReadCommitted)
                .expect("begin");
            core.transactions()
                .add_operation(
                    &txn,
                    Operation::write(OpKind::DataWrite, BlockNumber(900), vec![0x5A; 64]),
                )
                .expect("add");
            core.transactions().commit(txn).expect("commit");
            // Crash: core dropped without unmount, home block lost.
            let zero = vec![0_u8; 512];
            dev.write_block(BlockNumber(900), &zero).expect("zero");
        }

        let core = mounted(&dev);
        let report = core.recovery_report().expect("recovery ran");
        assert_eq!(report.txns_replayed, 1);
        assert!(core.status().recovered);

        let block = dev.read_block(BlockNumber(900)).expect("read");
        assert_eq!(&block.as_slice()[..64], &[0x5A; 64]);
        core.unmount().expect("unmount");
    }

    #[test]
    fn unmount_with_live_transaction_is_rejected() {
        let dev = Arc::new(MemBlockDevice::new(512, 2048));
        JournalingCore::format(Arc::clone(&dev), &config()).expect("format");
        let core = mounted(&dev);

        let txn = core
            .transactions()
            .begin(0, IsolationLevel::ReadCommitted)
            .expect("begin");
        // Cannot consume `core` while a transaction is live; check state
        // through status instead.
        assert_eq!(core.status().active_txns, 1);
        core.transactions().abort(txn).expect("abort");
        core.unmount().expect("unmount");
    }

    #[test]
    fn mode_changes_are_visible_in_status() {
        let dev = Arc::new(MemBlockDevice::new(512, 2048));
        JournalingCore::format(Arc::clone(&dev), &config()).expect("format");
        let core = mounted(&dev);

        assert_eq!(core.mode(), JournalingMode::Ordered);
        core.set_mode(JournalingMode::Writeback);
        assert_eq!(core.status().mode, JournalingMode::Writeback);
        core.set_mode(JournalingMode::FullData);
        assert_eq!(core.mode(), JournalingMode::FullData);
        core.unmount().expect("unmount");
    }

    #[test]
    fn statistics_aggregate_all_layers() {
        let dev = Arc::new(MemBlockDevice::new(512, 2048));
        JournalingCore::format(Arc::clone(&dev), &config()).expect("format");
        let core = mounted(&dev);

        core.allocation()
            .create_group(GroupId(0), BlockNumber(1024), 64, 16)
            .expect("group");
        core.allocation()
            .alloc_blocks(GroupId(0), 4, 1, 0)
            .expect("alloc");

        let stats = core.statistics();
        assert_eq!(stats.alloc.block_allocs, 1);
        assert_eq!(stats.alloc.blocks_allocated, 4);
        assert!(stats.journal.commits >= 1);
        assert!(stats.recovery.is_none());

        // The admin surface is data, not text; it must serialize.
        let json = serde_json::to_value(&stats).expect("serialize");
        assert!(json.get("journal").is_some());
        let status = serde_json::to_value(core.status()).expect("serialize");
        assert_eq!(status["mode"], "Ordered");
        core.unmount().expect("unmount");
    }

    #[test]
    fn checkpoints_bound_recovery() {
        let dev = Arc::new(MemBlockDevice::new(512, 2048));
        JournalingCore::format(Arc::clone(&dev), &config()).expect("format");
        let core = mounted(&dev);

        core.allocation()
            .create_group(GroupId(0), BlockNumber(1024), 64, 16)
            .expect("group");
        core.allocation()
            .alloc_blocks(GroupId(0), 2, 1, 0)
            .expect("alloc");
        let first = core.create_checkpoint(CheckpointKind::Full).expect("checkpoint");
        let second = core.create_checkpoint(CheckpointKind::Incremental).expect("checkpoint");
        assert!(second > first);
        core.force_commit_all().expect("force commit");
        core.unmount().expect("unmount");
    }
}
