#![forbid(unsafe_code)]
//! Circular write-ahead journal.
//!
//! The journal owns a reserved extent on the collaborator block device:
//! one superblock followed by a circular log area. A transaction occupies
//! a descriptor block, its data blocks, and a commit block; it is durable
//! only once its commit block is on stable storage with a checksum that
//! matches the descriptor's block-number list.
//!
//! Head/tail cursor updates take a short-held low-level lock distinct from
//! the transaction-layer locks, so commit and log-space reclamation never
//! invert lock order. Commit order equals transaction commit order: the
//! whole descriptor→data→commit write sequence runs under a single commit
//! lock.

pub mod checksum;
pub mod format;

pub use checksum::ChecksumAlgorithm;
pub use format::{
    BlockHeader, BlockType, CheckpointKind, CheckpointPayload, CommitPayload, DataPayload,
    DescriptorPayload, RevocationPayload, JournalSuperblock, BLOCK_HEADER_SIZE, SUPERBLOCK_SIZE,
};

use fj_block::BlockDevice;
use fj_error::{JournalError, Result};
use fj_types::{BlockNumber, CheckpointId, SequenceNumber, TxnId};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Journal geometry and behavior knobs.
#[derive(Debug, Clone, Copy)]
pub struct JournalConfig {
    /// First device block of the journal extent.
    pub start_block: BlockNumber,
    /// Extent length in blocks (superblock + log area). Minimum 8.
    pub block_count: u64,
    pub checksum: ChecksumAlgorithm,
    /// Sync the device before and after the commit block (durable
    /// commits). Tests may disable this.
    pub sync_on_commit: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            start_block: BlockNumber(0),
            block_count: 1024,
            checksum: ChecksumAlgorithm::Crc32c,
            sync_on_commit: true,
        }
    }
}

/// Cursor state guarded by the short-held cursor lock.
#[derive(Debug)]
struct Cursors {
    /// Log-area offset of the next block to write.
    head_pos: u64,
    /// Log-area offset of the oldest live block.
    tail_pos: u64,
    /// Next sequence number to assign.
    sequence: SequenceNumber,
    last_committed: SequenceNumber,
    /// Blocks used by live (not yet checkpointed) log content.
    used: u64,
    /// Blocks promised to open transactions but not yet written.
    reserved: u64,
    commits: u64,
    aborts: u64,
    wraps: u64,
    next_checkpoint: u64,
}

/// Point-in-time journal statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct JournalStats {
    pub commits: u64,
    pub aborts: u64,
    pub wraps: u64,
    pub bytes_journaled: u64,
    pub sequence: u64,
    pub last_committed: u64,
    pub head_pos: u64,
    pub tail_pos: u64,
    pub log_blocks: u64,
    pub used_blocks: u64,
    pub utilization_pct: u8,
}

/// An open journal transaction: reserved log space plus staged writes.
///
/// Obtained from [`Journal::start_transaction`]; consumed by
/// [`Journal::commit`] or [`Journal::abandon`].
#[derive(Debug)]
pub struct JournalTxn {
    txn_id: TxnId,
    op_type: u32,
    actor_id: u32,
    max_blocks: u64,
    writes: Vec<DataPayload>,
}

impl JournalTxn {
    /// Stage an image to be applied at the start of `target`. Images
    /// shorter than a device block leave the tail of the block untouched;
    /// `bytes` must fit one log block alongside the block header and data
    /// framing (see [`Journal::max_payload`]).
    pub fn add_write(&mut self, target: BlockNumber, bytes: Vec<u8>) -> Result<()> {
        if self.writes.len() as u64 >= self.max_blocks {
            return Err(JournalError::InvalidArgument(format!(
                "transaction {} exceeds its {}-block reservation",
                self.txn_id, self.max_blocks
            )));
        }
        self.writes.push(DataPayload { target, bytes });
        Ok(())
    }

    #[must_use]
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }
}

/// A committed transaction recovered from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTxn {
    pub txn_id: TxnId,
    pub sequence: SequenceNumber,
    pub op_type: u32,
    pub writes: Vec<DataPayload>,
    /// The descriptor's full target list, before revocation filtering.
    pub targets: Vec<BlockNumber>,
    /// Checksum the commit block recorded over the descriptor's target
    /// list; replay re-validates against it.
    pub targets_checksum: u64,
}

impl RecoveredTxn {
    /// Re-validate the commit checksum against the descriptor targets.
    #[must_use]
    pub fn verify_targets(&self, alg: ChecksumAlgorithm) -> bool {
        let mut bytes = Vec::with_capacity(self.targets.len() * 8);
        for target in &self.targets {
            bytes.extend_from_slice(&target.0.to_le_bytes());
        }
        alg.compute(&bytes) == self.targets_checksum
    }
}

/// Outcome of a recovery scan over the log area.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    /// Fully committed transactions in log order.
    pub committed: Vec<RecoveredTxn>,
    /// Transactions whose descriptor was found but whose commit was not.
    pub partial: Vec<TxnId>,
    /// Newest checkpoint record seen during the scan.
    pub checkpoint: Option<CheckpointPayload>,
    /// Highest sequence number verified intact.
    pub last_valid_seq: Option<SequenceNumber>,
    pub blocks_scanned: u64,
    /// True when the scan stopped at a checksum mismatch rather than the
    /// natural end of the log.
    pub truncated: bool,
}

/// The circular write-ahead journal.
pub struct Journal<D: BlockDevice> {
    dev: D,
    config: JournalConfig,
    block_size: u32,
    /// Log area length in blocks (extent minus the superblock).
    log_blocks: u64,
    cursors: Mutex<Cursors>,
    /// Serializes the descriptor→data→commit write sequence so journal
    /// commit order equals transaction commit order.
    commit_lock: Mutex<()>,
    bytes_journaled: AtomicU64,
}

impl<D: BlockDevice> std::fmt::Debug for Journal<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("start_block", &self.config.start_block)
            .field("block_count", &self.config.block_count)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice> Journal<D> {
    /// Format a fresh journal on `dev` and open it.
    pub fn create(dev: D, config: JournalConfig) -> Result<Self> {
        validate_geometry(&dev, &config)?;
        let block_size = dev.block_size();

        // Zero the extent so stale headers from a previous life cannot be
        // mistaken for log content.
        let zero = vec![0_u8; block_size as usize];
        for i in 1..config.block_count {
            dev.write_block(BlockNumber(config.start_block.0 + i), &zero)?;
        }

        let journal = Self::from_parts(
            dev,
            config,
            Cursors {
                head_pos: 0,
                tail_pos: 0,
                sequence: SequenceNumber(1),
                last_committed: SequenceNumber(0),
                used: 0,
                reserved: 0,
                commits: 0,
                aborts: 0,
                wraps: 0,
                next_checkpoint: 1,
            },
        );
        journal.write_superblock(false)?;
        info!(
            start = journal.config.start_block.0,
            blocks = journal.config.block_count,
            "formatted journal"
        );
        Ok(journal)
    }

    /// Open an existing journal, validating its superblock.
    pub fn open(dev: D, start_block: BlockNumber, sync_on_commit: bool) -> Result<Self> {
        let raw = dev.read_block(start_block)?;
        let sb = JournalSuperblock::decode(raw.as_slice())?;
        if sb.start_block != start_block {
            return Err(JournalError::Format(format!(
                "superblock start_block {} does not match extent at {}",
                sb.start_block, start_block
            )));
        }
        if sb.block_size != dev.block_size() {
            return Err(JournalError::Format(format!(
                "journal block_size {} does not match device {}",
                sb.block_size,
                dev.block_size()
            )));
        }
        let config = JournalConfig {
            start_block,
            block_count: sb.block_count,
            checksum: sb.checksum_alg,
            sync_on_commit,
        };
        validate_geometry(&dev, &config)?;

        let journal = Self::from_parts(
            dev,
            config,
            Cursors {
                head_pos: sb.head_pos,
                tail_pos: sb.tail_pos,
                sequence: sb.sequence,
                last_committed: sb.last_committed,
                used: circular_distance(sb.tail_pos, sb.head_pos, sb.block_count - 1),
                reserved: 0,
                commits: sb.commits,
                aborts: sb.aborts,
                wraps: sb.wraps,
                next_checkpoint: 1,
            },
        );
        debug!(
            clean = sb.clean_shutdown,
            head = sb.head_pos,
            tail = sb.tail_pos,
            "opened journal"
        );
        Ok(journal)
    }

    /// Whether the superblock at `start_block` records a clean shutdown.
    pub fn was_clean_shutdown(dev: &D, start_block: BlockNumber) -> Result<bool> {
        let raw = dev.read_block(start_block)?;
        Ok(JournalSuperblock::decode(raw.as_slice())?.clean_shutdown)
    }

    fn from_parts(dev: D, config: JournalConfig, cursors: Cursors) -> Self {
        let block_size = dev.block_size();
        Self {
            dev,
            log_blocks: config.block_count - 1,
            config,
            block_size,
            cursors: Mutex::new(cursors),
            commit_lock: Mutex::new(()),
            bytes_journaled: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.config.checksum
    }

    /// Largest data payload a single log block can carry.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.block_size as usize - BLOCK_HEADER_SIZE - 12
    }

    /// Reserve log space for a transaction of up to `max_blocks` writes.
    ///
    /// Fails fast with `JournalFull` when the circular log cannot hold the
    /// reservation; callers are expected to checkpoint and retry.
    pub fn start_transaction(
        &self,
        txn_id: TxnId,
        max_blocks: u64,
        op_type: u32,
    ) -> Result<JournalTxn> {
        if max_blocks == 0 {
            return Err(JournalError::InvalidArgument(
                "max_blocks must be non-zero".into(),
            ));
        }
        // Descriptor + commit bracket the data blocks.
        let needed = max_blocks + 2;

        let mut cursors = self.cursors.lock();
        let free = self
            .log_blocks
            .saturating_sub(1) // one slack block keeps head from catching tail
            .saturating_sub(cursors.used)
            .saturating_sub(cursors.reserved);
        if needed > free {
            return Err(JournalError::JournalFull {
                needed,
                available: free,
            });
        }
        cursors.reserved += needed;
        drop(cursors);

        Ok(JournalTxn {
            txn_id,
            op_type,
            actor_id: 0,
            max_blocks,
            writes: Vec::new(),
        })
    }

    /// Release a transaction's reservation without writing anything.
    pub fn abandon(&self, txn: JournalTxn) {
        let mut cursors = self.cursors.lock();
        cursors.reserved = cursors.reserved.saturating_sub(txn.max_blocks + 2);
        cursors.aborts += 1;
    }

    /// Commit a transaction: descriptor, data blocks, sync, commit block,
    /// sync, then write-back to home locations.
    ///
    /// An I/O failure before the commit block is durable leaves the
    /// partial blocks behind as a descriptor without a commit, which
    /// recovery ignores; the caller sees the error and must roll back its
    /// in-memory state. A write-back failure after the commit block is
    /// durable is logged, not returned: the transaction has committed and
    /// recovery brings the home block up to date.
    pub fn commit(&self, txn: JournalTxn) -> Result<SequenceNumber> {
        let reservation = txn.max_blocks + 2;
        let _commit_guard = self.commit_lock.lock();

        let result = self.commit_inner(&txn);
        let mut cursors = self.cursors.lock();
        cursors.reserved = cursors.reserved.saturating_sub(reservation);
        match &result {
            Ok(seq) => {
                cursors.commits += 1;
                cursors.last_committed = *seq;
            }
            Err(_) => cursors.aborts += 1,
        }
        drop(cursors);

        if result.is_ok() {
            // Write-back after the commit block is durable. The log already
            // holds everything replay needs, so a failed home write must
            // not turn a durable commit into an error; recovery re-applies
            // the image on the next mount.
            for write in &txn.writes {
                if let Err(err) = apply_data_write(&self.dev, write) {
                    warn!(
                        txn = txn.txn_id.0,
                        target = write.target.0,
                        error = %err,
                        "write-back failed, home block left to recovery"
                    );
                }
            }
        }
        result
    }

    fn commit_inner(&self, txn: &JournalTxn) -> Result<SequenceNumber> {
        for write in &txn.writes {
            if write.bytes.len() > self.max_payload() {
                return Err(JournalError::InvalidArgument(format!(
                    "journal write of {} bytes exceeds max payload {}",
                    write.bytes.len(),
                    self.max_payload()
                )));
            }
        }

        let descriptor = DescriptorPayload {
            txn_id: txn.txn_id,
            op_type: txn.op_type,
            actor_id: txn.actor_id,
            timestamp_micros: now_micros(),
            targets: txn.writes.iter().map(|w| w.target).collect(),
        };
        let desc_bytes = descriptor.encode()?;
        self.append_log_block(BlockType::Descriptor, &desc_bytes)?;

        for write in &txn.writes {
            let data_bytes = write.encode()?;
            self.append_log_block(BlockType::Data, &data_bytes)?;
        }

        if self.config.sync_on_commit {
            self.dev.sync()?;
        }

        let commit = CommitPayload {
            txn_id: txn.txn_id,
            targets_checksum: descriptor.targets_checksum(self.config.checksum),
            timestamp_micros: now_micros(),
        };
        let commit_bytes = commit.encode()?;
        let commit_seq = self.append_log_block(BlockType::Commit, &commit_bytes)?;

        if self.config.sync_on_commit {
            self.dev.sync()?;
        }

        debug!(txn = txn.txn_id.0, seq = commit_seq.0, writes = txn.writes.len(), "journal commit");
        Ok(commit_seq)
    }

    /// Append one block to the log, assigning it the next sequence number
    /// and advancing the head cursor.
    fn append_log_block(&self, block_type: BlockType, payload: &[u8]) -> Result<SequenceNumber> {
        let max = self.block_size as usize - BLOCK_HEADER_SIZE;
        if payload.len() > max {
            return Err(JournalError::InvalidArgument(format!(
                "log payload of {} bytes exceeds block capacity {max}",
                payload.len()
            )));
        }

        // Short-held cursor update; the device write happens outside.
        let (pos, sequence) = {
            let mut cursors = self.cursors.lock();
            let pos = cursors.head_pos;
            let sequence = cursors.sequence;
            cursors.sequence = cursors.sequence.next();
            cursors.head_pos = (cursors.head_pos + 1) % self.log_blocks;
            if cursors.head_pos == 0 {
                cursors.wraps += 1;
            }
            cursors.used += 1;
            (pos, sequence)
        };

        let header = BlockHeader {
            block_type,
            sequence,
            payload_len: u32::try_from(payload.len())
                .map_err(|_| JournalError::InvalidArgument("payload exceeds u32".into()))?,
            flags: 0,
            checksum: self.config.checksum.compute(payload),
        };

        let mut block = vec![0_u8; self.block_size as usize];
        header.encode_into(&mut block)?;
        block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload.len()].copy_from_slice(payload);

        self.dev.write_block(self.log_position(pos), &block)?;
        self.bytes_journaled
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(sequence)
    }

    fn log_position(&self, pos: u64) -> BlockNumber {
        BlockNumber(self.config.start_block.0 + 1 + pos)
    }

    /// Write a checkpoint block and advance the tail past everything the
    /// checkpoint covers, reclaiming log space.
    pub fn checkpoint(&self, kind: CheckpointKind) -> Result<CheckpointPayload> {
        let _commit_guard = self.commit_lock.lock();

        let (id, last_committed) = {
            let mut cursors = self.cursors.lock();
            let id = CheckpointId(cursors.next_checkpoint);
            cursors.next_checkpoint += 1;
            (id, cursors.last_committed)
        };

        let payload = CheckpointPayload {
            id,
            kind,
            last_committed,
            live_metadata_blocks: 0,
            live_data_blocks: 0,
            timestamp_micros: now_micros(),
        };
        let bytes = payload.encode()?;
        self.append_log_block(BlockType::Checkpoint, &bytes)?;
        self.dev.sync()?;

        // Everything before the checkpoint is on its home location. The
        // tail moves to the checkpoint block itself so the next scan
        // starts there, sees its sequence floor, and rejects stale
        // content beyond it.
        {
            let mut cursors = self.cursors.lock();
            cursors.tail_pos = (cursors.head_pos + self.log_blocks - 1) % self.log_blocks;
            cursors.used = 1;
        }
        self.write_superblock(false)?;
        info!(checkpoint = payload.id.0, last_committed = last_committed.0, "checkpoint");
        Ok(payload)
    }

    /// Record revoked home blocks so earlier log copies are not replayed.
    pub fn revoke(&self, targets: Vec<BlockNumber>) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let _commit_guard = self.commit_lock.lock();
        let bytes = RevocationPayload { targets }.encode()?;
        self.append_log_block(BlockType::Revocation, &bytes)?;
        Ok(())
    }

    /// Flush the device.
    pub fn force_commit(&self) -> Result<()> {
        self.dev.sync()
    }

    /// Scan the log from the tail, collecting committed transactions.
    ///
    /// The scan ends at the first unwritten block, non-monotonic sequence
    /// (stale content from a previous wrap), or checksum mismatch; in the
    /// checksum case everything after the mismatch is presumed torn and
    /// discarded, and the report is marked truncated.
    pub fn recover(&self) -> Result<ReplayReport> {
        let tail_pos = self.cursors.lock().tail_pos;

        let mut report = ReplayReport::default();
        let mut open: Option<(DescriptorPayload, SequenceNumber, Vec<DataPayload>)> = None;
        let mut revoked: Vec<BlockNumber> = Vec::new();
        let mut last_seq: Option<SequenceNumber> = None;
        let mut pos = tail_pos;

        for _ in 0..self.log_blocks {
            let raw = self.dev.read_block(self.log_position(pos))?;
            let block = raw.as_slice();
            let Some(header) = BlockHeader::decode(block)? else {
                break; // unwritten space: natural end of log
            };

            if let Some(prev) = last_seq {
                if header.sequence <= prev {
                    break; // stale block from a previous wrap
                }
            }

            let payload_len = header.payload_len as usize;
            if BLOCK_HEADER_SIZE + payload_len > block.len() {
                warn!(seq = header.sequence.0, "log block payload length out of range");
                report.truncated = true;
                break;
            }
            let payload = &block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload_len];
            if !self.config.checksum.verify(payload, header.checksum) {
                warn!(seq = header.sequence.0, "log block checksum mismatch, truncating replay");
                report.truncated = true;
                break;
            }

            last_seq = Some(header.sequence);
            report.blocks_scanned += 1;
            report.last_valid_seq = Some(header.sequence);

            match header.block_type {
                BlockType::Descriptor => {
                    if let Some((desc, _, _)) = open.take() {
                        // Previous descriptor never saw its commit.
                        report.partial.push(desc.txn_id);
                    }
                    let desc = DescriptorPayload::decode(payload)?;
                    open = Some((desc, header.sequence, Vec::new()));
                }
                BlockType::Data => {
                    if let Some((_, _, writes)) = open.as_mut() {
                        writes.push(DataPayload::decode(payload)?);
                    }
                    // A data block outside any transaction is stale noise;
                    // ignore it.
                }
                BlockType::Commit => {
                    let commit = CommitPayload::decode(payload)?;
                    match open.take() {
                        Some((desc, desc_seq, writes))
                            if desc.txn_id == commit.txn_id
                                && desc.targets_checksum(self.config.checksum)
                                    == commit.targets_checksum =>
                        {
                            report.committed.push(RecoveredTxn {
                                txn_id: desc.txn_id,
                                sequence: desc_seq,
                                op_type: desc.op_type,
                                writes,
                                targets: desc.targets,
                                targets_checksum: commit.targets_checksum,
                            });
                        }
                        Some((desc, _, _)) => {
                            warn!(
                                txn = desc.txn_id.0,
                                "commit block does not match descriptor, truncating replay"
                            );
                            report.partial.push(desc.txn_id);
                            report.truncated = true;
                            break;
                        }
                        None => {
                            // Commit without descriptor: stale content.
                        }
                    }
                }
                BlockType::Checkpoint => {
                    let checkpoint = CheckpointPayload::decode(payload)?;
                    let newer = report
                        .checkpoint
                        .map_or(true, |existing| checkpoint.id > existing.id);
                    if newer {
                        report.checkpoint = Some(checkpoint);
                    }
                }
                BlockType::Revocation => {
                    revoked.extend(RevocationPayload::decode(payload)?.targets);
                }
                BlockType::Barrier => {
                    // Ordering marker only; nothing to replay.
                }
            }

            pos = (pos + 1) % self.log_blocks;
        }

        if let Some((desc, _, _)) = open.take() {
            report.partial.push(desc.txn_id);
        }

        // Drop writes to revoked home blocks.
        if !revoked.is_empty() {
            for txn in &mut report.committed {
                txn.writes.retain(|w| !revoked.contains(&w.target));
            }
        }

        // Everything at or below the checkpoint is already home.
        if let Some(cp) = report.checkpoint {
            report
                .committed
                .retain(|txn| txn.sequence > cp.last_committed);
        }

        info!(
            committed = report.committed.len(),
            partial = report.partial.len(),
            truncated = report.truncated,
            "journal recovery scan complete"
        );
        Ok(report)
    }

    /// Realign cursors with what a recovery scan actually found.
    ///
    /// A journal reopened after a crash carries cursors from the last
    /// superblock write, which may predate the final commits. Without
    /// realignment, new appends could reuse sequence numbers still
    /// present in the log. Call after [`Journal::recover`], before any
    /// new append.
    pub fn align_after_replay(&self, report: &ReplayReport) -> Result<()> {
        let _commit_guard = self.commit_lock.lock();
        let mut cursors = self.cursors.lock();

        if let Some(last_valid) = report.last_valid_seq {
            if cursors.sequence <= last_valid {
                cursors.sequence = last_valid.next();
            }
        }
        cursors.head_pos = (cursors.tail_pos + report.blocks_scanned) % self.log_blocks;
        cursors.used = report.blocks_scanned;
        if let Some(last) = report.committed.last() {
            if cursors.last_committed < last.sequence {
                cursors.last_committed = last.sequence;
            }
        }
        if let Some(cp) = report.checkpoint {
            if cursors.next_checkpoint <= cp.id.0 {
                cursors.next_checkpoint = cp.id.0 + 1;
            }
        }
        drop(cursors);
        self.write_superblock(false)
    }

    /// Rewrite the superblock with current cursors.
    pub fn write_superblock(&self, clean_shutdown: bool) -> Result<()> {
        let cursors = self.cursors.lock();
        let sb = JournalSuperblock {
            checksum_alg: self.config.checksum,
            start_block: self.config.start_block,
            block_count: self.config.block_count,
            block_size: self.block_size,
            clean_shutdown,
            head_pos: cursors.head_pos,
            tail_pos: cursors.tail_pos,
            sequence: cursors.sequence,
            last_committed: cursors.last_committed,
            commits: cursors.commits,
            aborts: cursors.aborts,
            wraps: cursors.wraps,
        };
        drop(cursors);

        let mut block = vec![0_u8; self.block_size as usize];
        sb.encode_into(&mut block)?;
        self.dev.write_block(self.config.start_block, &block)?;
        self.dev.sync()
    }

    /// Snapshot current statistics.
    #[must_use]
    pub fn stats(&self) -> JournalStats {
        let cursors = self.cursors.lock();
        let used = cursors.used + cursors.reserved;
        #[allow(clippy::cast_possible_truncation)]
        let utilization_pct = if self.log_blocks == 0 {
            0
        } else {
            ((used * 100) / self.log_blocks).min(100) as u8
        };
        JournalStats {
            commits: cursors.commits,
            aborts: cursors.aborts,
            wraps: cursors.wraps,
            bytes_journaled: self.bytes_journaled.load(Ordering::Relaxed),
            sequence: cursors.sequence.0,
            last_committed: cursors.last_committed.0,
            head_pos: cursors.head_pos,
            tail_pos: cursors.tail_pos,
            log_blocks: self.log_blocks,
            used_blocks: cursors.used,
            utilization_pct,
        }
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }
}

/// Apply one journaled write to its home block.
///
/// The image lands at the start of the block; shorter images are merged
/// read-modify-write so the tail of the block is preserved. Both the
/// commit write-back path and recovery replay use this, so applying the
/// same write twice is idempotent.
pub fn apply_data_write<D: BlockDevice>(dev: &D, write: &DataPayload) -> Result<()> {
    let block_size = dev.block_size() as usize;
    if write.bytes.len() > block_size {
        return Err(JournalError::InvalidArgument(format!(
            "journaled image of {} bytes exceeds block size {block_size}",
            write.bytes.len()
        )));
    }
    if write.bytes.len() == block_size {
        return dev.write_block(write.target, &write.bytes);
    }
    let mut block = dev.read_block(write.target)?.into_inner();
    block[..write.bytes.len()].copy_from_slice(&write.bytes);
    dev.write_block(write.target, &block)
}

/// Blocks occupied between `tail` and `head` on a ring of `len` blocks.
fn circular_distance(tail: u64, head: u64, len: u64) -> u64 {
    if head >= tail {
        head - tail
    } else {
        len - tail + head
    }
}

fn validate_geometry<D: BlockDevice>(dev: &D, config: &JournalConfig) -> Result<()> {
    if config.block_count < 8 {
        return Err(JournalError::Format(format!(
            "journal extent too small: {} blocks (minimum 8)",
            config.block_count
        )));
    }
    let end = config
        .start_block
        .checked_add(config.block_count)
        .ok_or_else(|| JournalError::Format("journal extent overflows u64".into()))?;
    if end.0 > dev.block_count() {
        return Err(JournalError::Format(format!(
            "journal extent [{}, {}) exceeds device of {} blocks",
            config.start_block,
            end,
            dev.block_count()
        )));
    }
    if dev.block_size() as usize <= BLOCK_HEADER_SIZE + 12 {
        return Err(JournalError::Format(format!(
            "device block size {} cannot hold a journal block",
            dev.block_size()
        )));
    }
    Ok(())
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
