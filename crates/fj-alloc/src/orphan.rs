//! Orphaned-allocation tracking and bounded-retry cleanup.
//!
//! An orphan is an allocated unit no live structure references (a crash
//! between allocation and linkage, or a lost free). Detection walks set
//! bitmap bits against a [`ReferenceChecker`]; candidates land in a
//! `BTreeMap`-indexed table (duplicate detection in O(log n)) plus a FIFO
//! cleanup list. Cleanup re-verifies reachability immediately before
//! freeing and retries a bounded number of times before dropping the
//! entry with a warning.

use fj_error::{JournalError, Result};
use fj_types::{BlockNumber, GroupId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Decides whether an allocated unit is still referenced.
///
/// The conservative default treats everything as referenced, so wiring a
/// real checker is strictly an enabling step — absent one, no block is
/// ever reclaimed as an orphan.
pub trait ReferenceChecker: Send + Sync {
    fn is_referenced(&self, group: GroupId, block: BlockNumber) -> bool;
}

/// Conservative default: everything is referenced.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeReferenced;

impl ReferenceChecker for AssumeReferenced {
    fn is_referenced(&self, _group: GroupId, _block: BlockNumber) -> bool {
        true
    }
}

/// Orphan-table knobs.
#[derive(Debug, Clone, Copy)]
pub struct OrphanConfig {
    /// Table capacity; overflow surfaces `OrphanTableFull`.
    pub max_entries: usize,
    /// Free attempts per entry before it is dropped with a warning.
    pub max_attempts: u32,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_attempts: 3,
        }
    }
}

/// What kind of allocated unit went orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrphanKind {
    Block,
    Inode,
    VectorData,
    IndexData,
}

/// How an orphan was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectionMethod {
    /// Found by a bitmap walk against the reference checker.
    BitmapScan,
    /// Registered directly by a caller that already knows the unit is
    /// unreachable.
    Explicit,
}

/// One tracked orphan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanEntry {
    pub kind: OrphanKind,
    pub group: GroupId,
    pub block: BlockNumber,
    pub method: DetectionMethod,
    pub detected_at_micros: u64,
    pub attempts: u32,
    /// Bytes a cleanup may need to restore linkage instead of freeing.
    pub recovery_payload: Option<Vec<u8>>,
}

/// Orphan-manager counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OrphanStats {
    pub detected: u64,
    pub resolved: u64,
    pub rescued: u64,
    pub dropped: u64,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct OrphanTable {
    by_block: BTreeMap<u64, OrphanEntry>,
    cleanup: VecDeque<u64>,
    detected: u64,
    resolved: u64,
    rescued: u64,
    dropped: u64,
}

/// Bounded orphan table with FIFO cleanup.
#[derive(Debug)]
pub struct OrphanManager {
    table: Mutex<OrphanTable>,
    config: OrphanConfig,
}

impl OrphanManager {
    #[must_use]
    pub fn new(config: OrphanConfig) -> Self {
        Self {
            table: Mutex::new(OrphanTable::default()),
            config,
        }
    }

    /// Record an orphan found by a scan. Duplicates are ignored; a full
    /// table is an error so callers notice before orphans silently leak.
    pub fn record(&self, kind: OrphanKind, group: GroupId, block: BlockNumber) -> Result<bool> {
        self.insert(OrphanEntry {
            kind,
            group,
            block,
            method: DetectionMethod::BitmapScan,
            detected_at_micros: now_micros(),
            attempts: 0,
            recovery_payload: None,
        })
    }

    /// Register a unit a caller already knows is unreachable, optionally
    /// with bytes a cleanup could use to relink it.
    pub fn record_explicit(
        &self,
        kind: OrphanKind,
        group: GroupId,
        block: BlockNumber,
        recovery_payload: Option<Vec<u8>>,
    ) -> Result<bool> {
        self.insert(OrphanEntry {
            kind,
            group,
            block,
            method: DetectionMethod::Explicit,
            detected_at_micros: now_micros(),
            attempts: 0,
            recovery_payload,
        })
    }

    fn insert(&self, entry: OrphanEntry) -> Result<bool> {
        let mut table = self.table.lock();
        if table.by_block.contains_key(&entry.block.0) {
            return Ok(false);
        }
        if table.by_block.len() >= self.config.max_entries {
            return Err(JournalError::OrphanTableFull(self.config.max_entries));
        }
        let key = entry.block.0;
        debug!(
            group = entry.group.0,
            block = key,
            kind = ?entry.kind,
            "orphan recorded"
        );
        table.cleanup.push_back(key);
        table.by_block.insert(key, entry);
        table.detected += 1;
        Ok(true)
    }

    /// Process the cleanup list once.
    ///
    /// Each entry is re-verified against `checker` immediately before
    /// `free` runs; entries that became referenced are rescued. A failed
    /// free re-queues the entry until `max_attempts`, then drops it.
    /// Returns the number of orphans actually freed.
    pub fn resolve<F>(&self, checker: &dyn ReferenceChecker, mut free: F) -> Result<u64>
    where
        F: FnMut(GroupId, BlockNumber) -> Result<()>,
    {
        let batch: Vec<u64> = {
            let mut table = self.table.lock();
            table.cleanup.drain(..).collect()
        };

        let mut freed = 0_u64;
        for key in batch {
            let Some(entry) = ({
                let mut table = self.table.lock();
                table.by_block.remove(&key)
            }) else {
                continue;
            };

            if checker.is_referenced(entry.group, entry.block) {
                // Became reachable since detection; not an orphan.
                let mut table = self.table.lock();
                table.rescued += 1;
                continue;
            }

            match free(entry.group, entry.block) {
                Ok(()) => {
                    freed += 1;
                    self.table.lock().resolved += 1;
                }
                Err(err) => {
                    let attempts = entry.attempts + 1;
                    let mut table = self.table.lock();
                    if attempts >= self.config.max_attempts {
                        table.dropped += 1;
                        warn!(
                            block = entry.block.0,
                            attempts,
                            error = %err,
                            "dropping orphan after repeated free failures"
                        );
                    } else {
                        table.by_block.insert(key, OrphanEntry { attempts, ..entry });
                        table.cleanup.push_back(key);
                    }
                }
            }
        }
        Ok(freed)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.table.lock().by_block.len()
    }

    #[must_use]
    pub fn stats(&self) -> OrphanStats {
        let table = self.table.lock();
        OrphanStats {
            detected: table.detected,
            resolved: table.resolved,
            rescued: table.rescued,
            dropped: table.dropped,
            pending: table.by_block.len(),
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
