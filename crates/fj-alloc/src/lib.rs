#![forbid(unsafe_code)]
//! Allocation journaling: bitmap-backed groups whose every mutation
//! commits through the transaction layer.
//!
//! Each [`AllocationGroup`] owns a block bitmap and an inode bitmap and
//! is mutated only under its own mutex; holding that mutex across the
//! journal commit is what makes `Serializable` transactions serializable
//! at the allocation layer. An alloc or free journals a compact record
//! carrying the bitmap checksum before and after the mutation, so
//! recovery and audits can verify the transition.
//!
//! Allocation is all-or-nothing: a contiguous run at the requested
//! alignment, or `NoSpace` with the bitmap untouched. Double frees are
//! logged and skipped, never fatal.

pub mod bitmap;
pub mod orphan;

pub use bitmap::Bitmap;
pub use orphan::{
    AssumeReferenced, DetectionMethod, OrphanConfig, OrphanEntry, OrphanKind, OrphanManager,
    OrphanStats, ReferenceChecker,
};

use fj_block::BlockDevice;
use fj_error::{JournalError, Result};
use fj_txn::{IsolationLevel, OpKind, Operation, TxnManager};
use fj_types::{
    read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64, BlockNumber,
    GroupId, InodeNumber,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Allocation request flags.
pub const ALLOC_FLAG_VECTOR: u32 = 1;

/// Blocks at the front of each group reserved for its bitmap homes.
const RESERVED_GROUP_BLOCKS: u64 = 2;

/// Placement strategy; chosen from the fragmentation score, never
/// changing the allocation contract (contiguous run at the requested
/// alignment, or `NoSpace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocStrategy {
    FirstFit,
    BestFit,
    Buddy,
    VectorOptimized,
}

/// Free-run distribution collapsed to 0.0 (one contiguous free run) ..=
/// 1.0 (maximally fragmented). A full bitmap scores 0.0.
#[must_use]
pub fn fragmentation_score(bm: &Bitmap) -> f64 {
    let free = bm.free();
    if free == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let score = 1.0 - bm.longest_zero_run() as f64 / free as f64;
    score.clamp(0.0, 1.0)
}

/// Strategy for a group at a given fragmentation score.
#[must_use]
pub fn select_strategy(fragmentation: f64) -> AllocStrategy {
    if fragmentation < 0.25 {
        AllocStrategy::FirstFit
    } else if fragmentation < 0.6 {
        AllocStrategy::BestFit
    } else {
        AllocStrategy::Buddy
    }
}

/// Journaled record of one bitmap transition.
///
/// Wire layout (32 bytes, little-endian):
/// `[version u16][kind u16][group u32][start u64][count u64][before crc u32][after crc u32]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRecord {
    pub kind: AllocRecordKind,
    pub group: GroupId,
    /// Absolute block number (or inode bit index for inode records).
    pub start: u64,
    pub count: u64,
    pub bitmap_before: u32,
    pub bitmap_after: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocRecordKind {
    BlocksAlloc,
    BlocksFree,
    InodeAlloc,
    InodeFree,
}

impl AllocRecordKind {
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            Self::BlocksAlloc => 1,
            Self::BlocksFree => 2,
            Self::InodeAlloc => 3,
            Self::InodeFree => 4,
        }
    }

    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::BlocksAlloc),
            2 => Ok(Self::BlocksFree),
            3 => Ok(Self::InodeAlloc),
            4 => Ok(Self::InodeFree),
            other => Err(JournalError::Format(format!(
                "unknown allocation record kind: {other}"
            ))),
        }
    }
}

impl AllocRecord {
    pub const ENCODED_LEN: usize = 32;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; Self::ENCODED_LEN];
        let r: std::result::Result<(), fj_types::ParseError> = (|| {
            write_le_u16(&mut buf, 0, 1)?;
            write_le_u16(&mut buf, 2, self.kind.to_wire())?;
            write_le_u32(&mut buf, 4, self.group.0)?;
            write_le_u64(&mut buf, 8, self.start)?;
            write_le_u64(&mut buf, 16, self.count)?;
            write_le_u32(&mut buf, 24, self.bitmap_before)?;
            write_le_u32(&mut buf, 28, self.bitmap_after)?;
            Ok(())
        })();
        r.map_err(|e| JournalError::Format(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let parse = || -> std::result::Result<Self, fj_types::ParseError> {
            let _version = read_le_u16(buf, 0)?;
            let kind = read_le_u16(buf, 2)?;
            Ok(Self {
                kind: AllocRecordKind::from_wire(kind).map_err(|_| {
                    fj_types::ParseError::InvalidField {
                        field: "kind",
                        reason: "unknown allocation record kind",
                    }
                })?,
                group: GroupId(read_le_u32(buf, 4)?),
                start: read_le_u64(buf, 8)?,
                count: read_le_u64(buf, 16)?,
                bitmap_before: read_le_u32(buf, 24)?,
                bitmap_after: read_le_u32(buf, 28)?,
            })
        };
        parse().map_err(|e| JournalError::Format(e.to_string()))
    }
}

/// One allocation group: bitmaps, counters, placement state.
#[derive(Debug)]
pub struct AllocationGroup {
    pub id: GroupId,
    pub start_block: BlockNumber,
    pub block_count: u64,
    pub inode_count: u64,
    /// First inode number owned by this group.
    pub inode_base: u64,
    block_bitmap: Bitmap,
    inode_bitmap: Bitmap,
    free_blocks: u64,
    free_inodes: u64,
    fragmentation: f64,
    strategy: AllocStrategy,
    pending_ops: u64,
}

impl AllocationGroup {
    /// Bit index for an absolute block number.
    fn bit_of(&self, block: BlockNumber) -> Result<u64> {
        let bit = block
            .checked_sub(self.start_block.0)
            .filter(|b| b.0 < self.block_count)
            .ok_or_else(|| {
                JournalError::InvalidArgument(format!(
                    "block {block} outside group {} extent",
                    self.id
                ))
            })?;
        Ok(bit.0)
    }

    fn refresh_placement(&mut self) {
        self.fragmentation = fragmentation_score(&self.block_bitmap);
        self.strategy = select_strategy(self.fragmentation);
    }
}

/// Read-only snapshot of a group.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GroupInfo {
    pub id: u32,
    pub start_block: u64,
    pub block_count: u64,
    pub free_blocks: u64,
    pub inode_count: u64,
    pub free_inodes: u64,
    pub fragmentation: f64,
    pub strategy: AllocStrategy,
    pub pending_ops: u64,
}

/// Allocation-layer counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AllocStats {
    pub groups: usize,
    pub block_allocs: u64,
    pub block_frees: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub double_frees: u64,
    pub inode_allocs: u64,
    pub inode_frees: u64,
    pub no_space_failures: u64,
    pub consistency_errors: u64,
    pub orphans: OrphanStats,
}

/// Outcome of a consistency check.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub groups_checked: usize,
    pub errors: Vec<String>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The allocation journaling layer.
pub struct AllocationJournal<D: BlockDevice> {
    txns: Arc<TxnManager<D>>,
    groups: RwLock<BTreeMap<GroupId, Arc<Mutex<AllocationGroup>>>>,
    orphans: OrphanManager,
    block_allocs: AtomicU64,
    block_frees: AtomicU64,
    blocks_allocated: AtomicU64,
    blocks_freed: AtomicU64,
    double_frees: AtomicU64,
    inode_allocs: AtomicU64,
    inode_frees: AtomicU64,
    no_space_failures: AtomicU64,
    consistency_errors: AtomicU64,
}

impl<D: BlockDevice> AllocationJournal<D> {
    pub fn new(txns: Arc<TxnManager<D>>, orphan_config: OrphanConfig) -> Self {
        Self {
            txns,
            groups: RwLock::new(BTreeMap::new()),
            orphans: OrphanManager::new(orphan_config),
            block_allocs: AtomicU64::new(0),
            block_frees: AtomicU64::new(0),
            blocks_allocated: AtomicU64::new(0),
            blocks_freed: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            inode_allocs: AtomicU64::new(0),
            inode_frees: AtomicU64::new(0),
            no_space_failures: AtomicU64::new(0),
            consistency_errors: AtomicU64::new(0),
        }
    }

    /// Register a group. The first two blocks of the extent are reserved
    /// as the bitmap home locations and are never handed out.
    pub fn create_group(
        &self,
        id: GroupId,
        start_block: BlockNumber,
        block_count: u64,
        inode_count: u64,
    ) -> Result<()> {
        if block_count <= RESERVED_GROUP_BLOCKS {
            return Err(JournalError::InvalidArgument(format!(
                "group {id} needs more than {RESERVED_GROUP_BLOCKS} blocks"
            )));
        }
        let mut block_bitmap = Bitmap::new(block_count);
        for bit in 0..RESERVED_GROUP_BLOCKS {
            block_bitmap.set(bit)?;
        }
        let inode_bitmap = Bitmap::new(inode_count);
        let fragmentation = fragmentation_score(&block_bitmap);
        let group = AllocationGroup {
            id,
            start_block,
            block_count,
            inode_count,
            inode_base: u64::from(id.0) * inode_count + 1,
            free_blocks: block_count - RESERVED_GROUP_BLOCKS,
            free_inodes: inode_count,
            strategy: select_strategy(fragmentation),
            fragmentation,
            block_bitmap,
            inode_bitmap,
            pending_ops: 0,
        };

        let mut groups = self.groups.write();
        if groups.contains_key(&id) {
            return Err(JournalError::InvalidArgument(format!(
                "group {id} already exists"
            )));
        }
        groups.insert(id, Arc::new(Mutex::new(group)));
        debug!(group = id.0, start = start_block.0, blocks = block_count, "group created");
        Ok(())
    }

    /// Allocate `count` contiguous blocks starting at a multiple of
    /// `alignment`. All-or-nothing: on `NoSpace` the bitmap is untouched.
    pub fn alloc_blocks(
        &self,
        group_id: GroupId,
        count: u64,
        alignment: u64,
        flags: u32,
    ) -> Result<Vec<BlockNumber>> {
        if count == 0 {
            return Err(JournalError::InvalidArgument(
                "cannot allocate zero blocks".into(),
            ));
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(JournalError::InvalidArgument(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let group = self.group(group_id)?;
        let mut group = group.lock();
        group.pending_ops += 1;

        let strategy = if flags & ALLOC_FLAG_VECTOR != 0 {
            AllocStrategy::VectorOptimized
        } else {
            group.strategy
        };
        let found = find_run(&group.block_bitmap, strategy, count, alignment)
            // The strategy is a placement preference; fall back to plain
            // first-fit before declaring the request unsatisfiable.
            .or_else(|| group.block_bitmap.find_zero_run(count, alignment));
        let Some(start_bit) = found else {
            group.pending_ops -= 1;
            self.no_space_failures.fetch_add(1, Ordering::Relaxed);
            return Err(JournalError::NoSpace);
        };

        let before = group.block_bitmap.checksum();
        let mut set_bits = Vec::with_capacity(count as usize);
        for bit in start_bit..start_bit + count {
            match group.block_bitmap.set(bit) {
                Ok(false) => set_bits.push(bit),
                // Found run raced or was miscomputed: undo the provisional
                // sets and fail the whole request.
                Ok(true) | Err(_) => {
                    for undo in &set_bits {
                        let _ = group.block_bitmap.clear(*undo);
                    }
                    group.pending_ops -= 1;
                    return Err(JournalError::Corruption {
                        block: group.start_block.0 + bit,
                        detail: "free run contained a set bit".into(),
                    });
                }
            }
        }
        group.free_blocks -= count;
        let after = group.block_bitmap.checksum();

        let record = AllocRecord {
            kind: AllocRecordKind::BlocksAlloc,
            group: group_id,
            start: group.start_block.0 + start_bit,
            count,
            bitmap_before: before,
            bitmap_after: after,
        };
        if let Err(err) = self.journal_records(group.start_block, &[record]) {
            for bit in start_bit..start_bit + count {
                let _ = group.block_bitmap.clear(bit);
            }
            group.free_blocks += count;
            group.pending_ops -= 1;
            group.refresh_placement();
            return Err(err);
        }

        group.refresh_placement();
        group.pending_ops -= 1;
        self.block_allocs.fetch_add(1, Ordering::Relaxed);
        self.blocks_allocated.fetch_add(count, Ordering::Relaxed);
        debug!(
            group = group_id.0,
            start = record.start,
            count,
            ?strategy,
            "blocks allocated"
        );
        Ok((record.start..record.start + count).map(BlockNumber).collect())
    }

    /// Free blocks. A block that is already free is logged and skipped;
    /// the rest of the request proceeds.
    pub fn free_blocks(&self, group_id: GroupId, blocks: &[BlockNumber]) -> Result<u64> {
        if blocks.is_empty() {
            return Ok(0);
        }
        let group = self.group(group_id)?;
        let mut group = group.lock();
        group.pending_ops += 1;

        let before = group.block_bitmap.checksum();
        let mut freed_bits = Vec::new();
        for block in blocks {
            let bit = match group.bit_of(*block) {
                Ok(bit) if bit >= RESERVED_GROUP_BLOCKS => bit,
                Ok(_) => {
                    group.pending_ops -= 1;
                    return Err(JournalError::InvalidArgument(format!(
                        "block {block} is reserved group metadata"
                    )));
                }
                Err(err) => {
                    group.pending_ops -= 1;
                    return Err(err);
                }
            };
            match group.block_bitmap.clear(bit) {
                Ok(true) => freed_bits.push(bit),
                Ok(false) => {
                    self.double_frees.fetch_add(1, Ordering::Relaxed);
                    warn!(group = group_id.0, block = block.0, "double free skipped");
                }
                Err(err) => {
                    group.pending_ops -= 1;
                    return Err(err);
                }
            }
        }

        if freed_bits.is_empty() {
            group.pending_ops -= 1;
            return Ok(0);
        }
        group.free_blocks += freed_bits.len() as u64;
        let after = group.block_bitmap.checksum();

        let records: Vec<AllocRecord> = contiguous_runs(&freed_bits)
            .into_iter()
            .map(|(start, count)| AllocRecord {
                kind: AllocRecordKind::BlocksFree,
                group: group_id,
                start: group.start_block.0 + start,
                count,
                bitmap_before: before,
                bitmap_after: after,
            })
            .collect();
        if let Err(err) = self.journal_records(group.start_block, &records) {
            for bit in &freed_bits {
                let _ = group.block_bitmap.set(*bit);
            }
            group.free_blocks -= freed_bits.len() as u64;
            group.pending_ops -= 1;
            group.refresh_placement();
            return Err(err);
        }

        group.refresh_placement();
        group.pending_ops -= 1;
        let freed = freed_bits.len() as u64;
        self.block_frees.fetch_add(1, Ordering::Relaxed);
        self.blocks_freed.fetch_add(freed, Ordering::Relaxed);
        Ok(freed)
    }

    /// Allocate one inode from the group.
    pub fn alloc_inode(&self, group_id: GroupId) -> Result<InodeNumber> {
        let group = self.group(group_id)?;
        let mut group = group.lock();
        let Some(bit) = group.inode_bitmap.find_first_zero() else {
            self.no_space_failures.fetch_add(1, Ordering::Relaxed);
            return Err(JournalError::NoSpace);
        };
        let before = group.inode_bitmap.checksum();
        group.inode_bitmap.set(bit)?;
        group.free_inodes -= 1;
        let after = group.inode_bitmap.checksum();

        let record = AllocRecord {
            kind: AllocRecordKind::InodeAlloc,
            group: group_id,
            start: bit,
            count: 1,
            bitmap_before: before,
            bitmap_after: after,
        };
        let home = BlockNumber(group.start_block.0 + 1);
        if let Err(err) = self.journal_records(home, &[record]) {
            let _ = group.inode_bitmap.clear(bit);
            group.free_inodes += 1;
            return Err(err);
        }
        self.inode_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(InodeNumber(group.inode_base + bit))
    }

    /// Free an inode by number; the owning group is located by range.
    pub fn free_inode(&self, inode: InodeNumber) -> Result<()> {
        let group = {
            let groups = self.groups.read();
            groups
                .values()
                .find(|g| {
                    let g = g.lock();
                    inode.0 >= g.inode_base && inode.0 < g.inode_base + g.inode_count
                })
                .cloned()
        }
        .ok_or_else(|| {
            JournalError::InvalidArgument(format!("inode {inode} belongs to no group"))
        })?;

        let mut group = group.lock();
        let bit = inode.0 - group.inode_base;
        let before = group.inode_bitmap.checksum();
        if !group.inode_bitmap.clear(bit)? {
            self.double_frees.fetch_add(1, Ordering::Relaxed);
            warn!(inode = inode.0, "inode double free skipped");
            return Ok(());
        }
        group.free_inodes += 1;
        let after = group.inode_bitmap.checksum();

        let record = AllocRecord {
            kind: AllocRecordKind::InodeFree,
            group: group.id,
            start: bit,
            count: 1,
            bitmap_before: before,
            bitmap_after: after,
        };
        let home = BlockNumber(group.start_block.0 + 1);
        if let Err(err) = self.journal_records(home, &[record]) {
            let _ = group.inode_bitmap.set(bit);
            group.free_inodes -= 1;
            return Err(err);
        }
        self.inode_frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocate storage for a vector payload: `dims * elem_size * count`
    /// bytes rounded up to whole blocks, placed vector-optimized at an
    /// 8-block alignment.
    pub fn alloc_for_vector(
        &self,
        group_id: GroupId,
        dims: u32,
        elem_size: u32,
        count: u64,
    ) -> Result<Vec<BlockNumber>> {
        if dims == 0 || elem_size == 0 || count == 0 {
            return Err(JournalError::InvalidArgument(
                "vector allocation dimensions must be non-zero".into(),
            ));
        }
        let bytes = u64::from(dims)
            .checked_mul(u64::from(elem_size))
            .and_then(|b| b.checked_mul(count))
            .ok_or_else(|| {
                JournalError::InvalidArgument("vector allocation size overflows u64".into())
            })?;
        let block_size = u64::from(self.txns.journal().device().block_size());
        let blocks = bytes.div_ceil(block_size);
        self.alloc_blocks(group_id, blocks, 8, ALLOC_FLAG_VECTOR)
    }

    /// Scan allocated blocks against `checker`; unreferenced blocks enter
    /// the orphan table. Returns the number recorded.
    pub fn detect_orphans(
        &self,
        checker: &dyn ReferenceChecker,
        scope: Option<GroupId>,
    ) -> Result<u64> {
        let mut recorded = 0_u64;
        for group in self.scoped_groups(scope)? {
            let group = group.lock();
            for bit in RESERVED_GROUP_BLOCKS..group.block_count {
                if group.block_bitmap.test(bit)? {
                    let block = BlockNumber(group.start_block.0 + bit);
                    if !checker.is_referenced(group.id, block)
                        && self.orphans.record(OrphanKind::Block, group.id, block)?
                    {
                        recorded += 1;
                    }
                }
            }
        }
        Ok(recorded)
    }

    /// Run one cleanup pass over the orphan table; each entry is
    /// re-verified before its blocks are freed. Returns blocks freed.
    pub fn resolve_orphans(&self, checker: &dyn ReferenceChecker) -> Result<u64> {
        self.orphans
            .resolve(checker, |group, block| {
                self.free_blocks(group, &[block]).map(|_| ())
            })
    }

    /// Verify per-group invariants: free counters against popcounts and
    /// reserved bitmap bits. Errors are reported, counted, and never
    /// repaired silently.
    pub fn consistency_check(&self, scope: Option<GroupId>) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport {
            groups_checked: 0,
            errors: Vec::new(),
        };
        for group in self.scoped_groups(scope)? {
            let group = group.lock();
            report.groups_checked += 1;

            let bm = &group.block_bitmap;
            if bm.popcount() + group.free_blocks != group.block_count {
                report.errors.push(format!(
                    "group {}: block popcount {} + free {} != capacity {}",
                    group.id,
                    bm.popcount(),
                    group.free_blocks,
                    group.block_count
                ));
            }
            let im = &group.inode_bitmap;
            if im.popcount() + group.free_inodes != group.inode_count {
                report.errors.push(format!(
                    "group {}: inode popcount {} + free {} != capacity {}",
                    group.id,
                    im.popcount(),
                    group.free_inodes,
                    group.inode_count
                ));
            }
            for bit in 0..RESERVED_GROUP_BLOCKS {
                if !bm.test(bit)? {
                    report.errors.push(format!(
                        "group {}: reserved bit {bit} is clear",
                        group.id
                    ));
                }
            }
        }
        if !report.errors.is_empty() {
            self.consistency_errors
                .fetch_add(report.errors.len() as u64, Ordering::Relaxed);
            for error in &report.errors {
                warn!(error, "allocation consistency violation");
            }
        }
        Ok(report)
    }

    /// Snapshot of one group.
    pub fn group_info(&self, group_id: GroupId) -> Result<GroupInfo> {
        let group = self.group(group_id)?;
        let group = group.lock();
        Ok(GroupInfo {
            id: group.id.0,
            start_block: group.start_block.0,
            block_count: group.block_count,
            free_blocks: group.free_blocks,
            inode_count: group.inode_count,
            free_inodes: group.free_inodes,
            fragmentation: group.fragmentation,
            strategy: group.strategy,
            pending_ops: group.pending_ops,
        })
    }

    #[must_use]
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            groups: self.groups.read().len(),
            block_allocs: self.block_allocs.load(Ordering::Relaxed),
            block_frees: self.block_frees.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            blocks_freed: self.blocks_freed.load(Ordering::Relaxed),
            double_frees: self.double_frees.load(Ordering::Relaxed),
            inode_allocs: self.inode_allocs.load(Ordering::Relaxed),
            inode_frees: self.inode_frees.load(Ordering::Relaxed),
            no_space_failures: self.no_space_failures.load(Ordering::Relaxed),
            consistency_errors: self.consistency_errors.load(Ordering::Relaxed),
            orphans: self.orphans.stats(),
        }
    }

    #[must_use]
    pub fn orphan_manager(&self) -> &OrphanManager {
        &self.orphans
    }

    fn group(&self, id: GroupId) -> Result<Arc<Mutex<AllocationGroup>>> {
        self.groups
            .read()
            .get(&id)
            .cloned()
            .ok_or(JournalError::GroupNotFound(id.0))
    }

    fn scoped_groups(&self, scope: Option<GroupId>) -> Result<Vec<Arc<Mutex<AllocationGroup>>>> {
        match scope {
            Some(id) => Ok(vec![self.group(id)?]),
            None => Ok(self.groups.read().values().cloned().collect()),
        }
    }

    /// Journal a batch of allocation records as one transaction.
    fn journal_records(&self, home: BlockNumber, records: &[AllocRecord]) -> Result<()> {
        let txn = self.txns.begin(0, IsolationLevel::Serializable)?;
        for record in records {
            let op = Operation::write(OpKind::BitmapUpdate, home, record.encode()?)
                .with_before(
                    AllocRecord {
                        bitmap_after: record.bitmap_before,
                        bitmap_before: record.bitmap_after,
                        ..*record
                    }
                    .encode()?,
                );
            if let Err(err) = self.txns.add_operation(&txn, op) {
                let _ = self.txns.abort(txn);
                return Err(err);
            }
        }
        self.txns.commit(txn)?;
        Ok(())
    }
}

impl<D: BlockDevice> std::fmt::Debug for AllocationJournal<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationJournal")
            .field("groups", &self.groups.read().len())
            .finish_non_exhaustive()
    }
}

/// Run finder for a strategy. Strategies only strengthen placement; the
/// caller's alignment is always honored.
fn find_run(bm: &Bitmap, strategy: AllocStrategy, count: u64, alignment: u64) -> Option<u64> {
    match strategy {
        AllocStrategy::FirstFit => bm.find_zero_run(count, alignment),
        AllocStrategy::BestFit => bm.find_best_zero_run(count, alignment),
        AllocStrategy::Buddy => {
            let buddy = count.next_power_of_two().max(alignment);
            bm.find_zero_run(count, buddy)
        }
        AllocStrategy::VectorOptimized => bm.find_zero_run(count, alignment.max(8)),
    }
}

/// Collapse sorted bit indices into `(start, count)` runs.
fn contiguous_runs(bits: &[u64]) -> Vec<(u64, u64)> {
    let mut sorted = bits.to_vec();
    sorted.sort_unstable();
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for bit in sorted {
        match runs.last_mut() {
            Some((start, count)) if *start + *count == bit => *count += 1,
            _ => runs.push((bit, 1)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use fj_block::MemBlockDevice;
    use fj_journal::{ChecksumAlgorithm, Journal, JournalConfig};
    use fj_txn::TxnConfig;

    fn alloc_stack() -> AllocationJournal<Arc<MemBlockDevice>> {
        let dev = Arc::new(MemBlockDevice::new(512, 2048));
        let journal = Journal::create(
            dev,
            JournalConfig {
                start_block: BlockNumber(8),
                block_count: 512,
                checksum: ChecksumAlgorithm::Crc32c,
                sync_on_commit: false,
            },
        )
        .expect("create journal");
        let txns = Arc::new(TxnManager::new(Arc::new(journal), TxnConfig::default()));
        AllocationJournal::new(txns, OrphanConfig::default())
    }

    fn group_64(alloc: &AllocationJournal<Arc<MemBlockDevice>>) {
        alloc
            .create_group(GroupId(0), BlockNumber(1024), 64, 16)
            .expect("create group");
    }

    struct NeverReferenced;
    impl ReferenceChecker for NeverReferenced {
        fn is_referenced(&self, _group: GroupId, _block: BlockNumber) -> bool {
            false
        }
    }

    #[test]
    fn aligned_allocation_is_aligned_and_contiguous() {
        let alloc = alloc_stack();
        group_64(&alloc);

        // Five blocks at alignment 8: start offset divisible by 8.
        let blocks = alloc
            .alloc_blocks(GroupId(0), 5, 8, 0)
            .expect("alloc");
        assert_eq!(blocks.len(), 5);
        let start_bit = blocks[0].0 - 1024;
        assert_eq!(start_bit % 8, 0);
        assert!(blocks.windows(2).all(|w| w[1].0 == w[0].0 + 1));
    }

    #[test]
    fn allocation_is_all_or_nothing() {
        let alloc = alloc_stack();
        group_64(&alloc);

        let info_before = alloc.group_info(GroupId(0)).expect("info");
        // 64-block group with 2 reserved: 62 free, but no 63-block run.
        assert!(matches!(
            alloc.alloc_blocks(GroupId(0), 63, 1, 0),
            Err(JournalError::NoSpace)
        ));
        let info_after = alloc.group_info(GroupId(0)).expect("info");
        assert_eq!(info_before.free_blocks, info_after.free_blocks);
        assert_eq!(alloc.stats().no_space_failures, 1);
        assert!(alloc.consistency_check(None).expect("check").is_clean());
    }

    #[test]
    fn enospc_then_free_then_realloc() {
        let alloc = alloc_stack();
        group_64(&alloc);

        // Exhaust the group.
        let all = alloc
            .alloc_blocks(GroupId(0), 62, 1, 0)
            .expect("fill group");
        assert!(matches!(
            alloc.alloc_blocks(GroupId(0), 1, 1, 0),
            Err(JournalError::NoSpace)
        ));

        // Free a few and allocate again.
        let freed = alloc
            .free_blocks(GroupId(0), &all[10..14])
            .expect("free");
        assert_eq!(freed, 4);
        let again = alloc.alloc_blocks(GroupId(0), 4, 1, 0).expect("realloc");
        assert_eq!(again.len(), 4);
        assert!(alloc.consistency_check(None).expect("check").is_clean());
    }

    #[test]
    fn double_free_is_logged_and_skipped() {
        let alloc = alloc_stack();
        group_64(&alloc);
        let blocks = alloc.alloc_blocks(GroupId(0), 2, 1, 0).expect("alloc");

        assert_eq!(alloc.free_blocks(GroupId(0), &blocks).expect("free"), 2);
        // Second free of the same blocks frees nothing and is not fatal.
        assert_eq!(alloc.free_blocks(GroupId(0), &blocks).expect("refree"), 0);
        assert_eq!(alloc.stats().double_frees, 2);
        assert!(alloc.consistency_check(None).expect("check").is_clean());
    }

    #[test]
    fn popcount_invariant_survives_mutation_storm() {
        let alloc = alloc_stack();
        group_64(&alloc);

        let mut held: Vec<Vec<BlockNumber>> = Vec::new();
        for i in 0..6_u64 {
            if let Ok(blocks) = alloc.alloc_blocks(GroupId(0), i + 1, 1, 0) {
                held.push(blocks);
            }
            if i % 2 == 0 {
                if let Some(blocks) = held.pop() {
                    alloc.free_blocks(GroupId(0), &blocks).expect("free");
                }
            }
            let report = alloc.consistency_check(Some(GroupId(0))).expect("check");
            assert!(report.is_clean(), "{:?}", report.errors);
        }
    }

    #[test]
    fn inode_alloc_and_free_round_trip() {
        let alloc = alloc_stack();
        group_64(&alloc);

        let a = alloc.alloc_inode(GroupId(0)).expect("inode");
        let b = alloc.alloc_inode(GroupId(0)).expect("inode");
        assert_ne!(a, b);
        assert_eq!(alloc.group_info(GroupId(0)).expect("info").free_inodes, 14);

        alloc.free_inode(a).expect("free");
        alloc.free_inode(a).expect("double free tolerated");
        assert_eq!(alloc.stats().double_frees, 1);
        assert_eq!(alloc.group_info(GroupId(0)).expect("info").free_inodes, 15);
        assert!(alloc.free_inode(InodeNumber(999_999)).is_err());
    }

    #[test]
    fn vector_allocation_computes_blocks_and_alignment() {
        let alloc = alloc_stack();
        group_64(&alloc);

        // 128 dims * 4 bytes * 5 vectors = 2560 bytes = 5 blocks of 512.
        let blocks = alloc
            .alloc_for_vector(GroupId(0), 128, 4, 5)
            .expect("vector alloc");
        assert_eq!(blocks.len(), 5);
        assert_eq!((blocks[0].0 - 1024) % 8, 0);
        assert!(alloc.alloc_for_vector(GroupId(0), 0, 4, 5).is_err());
    }

    #[test]
    fn fragmentation_drives_strategy() {
        let mut bm = Bitmap::new(64);
        assert_eq!(select_strategy(fragmentation_score(&bm)), AllocStrategy::FirstFit);

        // Checkerboard the bitmap: heavy fragmentation.
        for bit in (0..64).step_by(2) {
            bm.set(bit).expect("set");
        }
        let score = fragmentation_score(&bm);
        assert!(score > 0.9, "score = {score}");
        assert_eq!(select_strategy(score), AllocStrategy::Buddy);

        let full = {
            let mut b = Bitmap::new(8);
            for bit in 0..8 {
                b.set(bit).expect("set");
            }
            b
        };
        assert!((fragmentation_score(&full) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn orphan_detection_and_cleanup() {
        let alloc = alloc_stack();
        group_64(&alloc);
        let blocks = alloc.alloc_blocks(GroupId(0), 3, 1, 0).expect("alloc");

        // Conservative checker: nothing is an orphan.
        assert_eq!(
            alloc.detect_orphans(&AssumeReferenced, None).expect("detect"),
            0
        );

        // Nothing references the blocks: all three are orphans.
        let detected = alloc
            .detect_orphans(&NeverReferenced, Some(GroupId(0)))
            .expect("detect");
        assert_eq!(detected, 3);
        // Duplicate scan records nothing new.
        assert_eq!(
            alloc
                .detect_orphans(&NeverReferenced, Some(GroupId(0)))
                .expect("rescan"),
            0
        );

        let freed = alloc.resolve_orphans(&NeverReferenced).expect("resolve");
        assert_eq!(freed, 3);
        let info = alloc.group_info(GroupId(0)).expect("info");
        assert_eq!(info.free_blocks, 62);
        drop(blocks);
        assert!(alloc.consistency_check(None).expect("check").is_clean());
    }

    #[test]
    fn unknown_group_is_reported() {
        let alloc = alloc_stack();
        assert!(matches!(
            alloc.alloc_blocks(GroupId(9), 1, 1, 0),
            Err(JournalError::GroupNotFound(9))
        ));
        assert!(matches!(
            alloc.create_group(GroupId(0), BlockNumber(0), 2, 4),
            Err(JournalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn alloc_record_codec_round_trip() {
        let record = AllocRecord {
            kind: AllocRecordKind::BlocksFree,
            group: GroupId(3),
            start: 4096,
            count: 17,
            bitmap_before: 0xAABB_CCDD,
            bitmap_after: 0x1122_3344,
        };
        let encoded = record.encode().expect("encode");
        assert_eq!(encoded.len(), AllocRecord::ENCODED_LEN);
        assert_eq!(AllocRecord::decode(&encoded).expect("decode"), record);
        assert!(AllocRecord::decode(&encoded[..10]).is_err());
    }

    #[test]
    fn contiguous_runs_coalesce() {
        assert_eq!(
            contiguous_runs(&[5, 3, 4, 9, 10, 20]),
            vec![(3, 3), (9, 2), (20, 1)]
        );
        assert!(contiguous_runs(&[]).is_empty());
    }
}
