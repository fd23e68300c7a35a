#![forbid(unsafe_code)]
//! Atomic transaction layer over the write-ahead journal.
//!
//! A transaction collects [`Operation`]s in per-producer buffers (enqueue
//! takes one atomic stamp plus an uncontended slot lock), then drains them
//! in FIFO stamp order at commit and writes descriptor, data, and commit
//! blocks through `fj-journal` as a unit. If the journal commit fails the
//! transaction aborts and its rollback entries are handed back
//! most-recent-first; there is no half-durable outcome.
//!
//! Nesting is bounded: a nested commit merges its operations and rollback
//! entries into the parent, a nested abort unwinds only its own entries.

mod op_buffer;

use fj_block::BlockDevice;
use fj_error::{JournalError, Result};
use fj_journal::Journal;
use fj_types::{BlockNumber, OperationId, SequenceNumber, TxnId};
use op_buffer::OpBufferSet;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Transaction lifecycle states.
///
/// Running → Committing → Finished, or Running/Committing → Aborting →
/// Finished. Finished is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxnState {
    Running,
    Committing,
    Aborting,
    Finished,
}

impl TxnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Committing,
            2 => Self::Aborting,
            _ => Self::Finished,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Committing => 1,
            Self::Aborting => 2,
            Self::Finished => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Committing => "Committing",
            Self::Aborting => "Aborting",
            Self::Finished => "Finished",
        }
    }
}

/// Isolation level recorded on a transaction.
///
/// `Serializable` is enforced at the group/bitmap locks in the allocation
/// layer; the transaction layer records the level and exposes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    Serializable,
}

/// What an operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpKind {
    DataWrite,
    MetadataWrite,
    BitmapUpdate,
    InodeUpdate,
    Barrier,
}

/// Completion state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum OpState {
    #[default]
    Pending,
    Journaled,
    RolledBack,
}

/// One unit of work attached to a transaction.
///
/// `after` is the image journaled and applied at commit; `before` is the
/// pre-image forming the rollback entry, replayed most-recent-first on
/// abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: OperationId,
    pub txn: TxnId,
    pub kind: OpKind,
    pub flags: u32,
    pub target: BlockNumber,
    pub before: Option<Vec<u8>>,
    pub after: Vec<u8>,
    /// FIFO stamp assigned at enqueue.
    pub stamp: u64,
    pub state: OpState,
}

impl Operation {
    /// A write of `after` to `target`. Id, txn, and stamp are assigned
    /// when the operation is attached to a transaction.
    #[must_use]
    pub fn write(kind: OpKind, target: BlockNumber, after: Vec<u8>) -> Self {
        Self {
            id: OperationId(0),
            txn: TxnId(0),
            kind,
            flags: 0,
            target,
            before: None,
            after,
            stamp: 0,
            state: OpState::Pending,
        }
    }

    /// Attach the pre-image used for rollback.
    #[must_use]
    pub fn with_before(mut self, before: Vec<u8>) -> Self {
        self.before = Some(before);
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// A rollback entry: the pre-image of one undone operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackEntry {
    pub op: OperationId,
    pub target: BlockNumber,
    /// `None` when the operation created state that simply ceases to
    /// exist (nothing to restore).
    pub before: Option<Vec<u8>>,
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitOutcome {
    /// Journal sequence of the commit block; `None` for nested commits
    /// (merged into the parent) and empty transactions.
    pub sequence: Option<SequenceNumber>,
    pub operations: usize,
}

/// Result of an abort: rollback entries in replay order
/// (most-recent-first).
#[derive(Debug, Clone)]
pub struct AbortOutcome {
    pub entries: Vec<RollbackEntry>,
}

/// Transaction-layer configuration.
#[derive(Debug, Clone, Copy)]
pub struct TxnConfig {
    /// Live top-level transactions admitted before `begin` fails fast.
    pub max_concurrent: usize,
    /// Maximum nesting depth (top level is depth 0).
    pub max_nesting: usize,
    /// Producer slots per transaction's operation buffer.
    pub producers: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            max_nesting: 4,
            producers: 8,
        }
    }
}

/// Point-in-time transaction-layer statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TxnStats {
    pub begun: u64,
    pub nested_begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub active: usize,
    pub operations_journaled: u64,
    pub operations_rolled_back: u64,
}

/// Handle to a live transaction. Consumed by commit or abort.
#[derive(Debug)]
pub struct TxnHandle {
    id: TxnId,
    shared: Arc<TxnShared>,
}

impl TxnHandle {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.shared.isolation
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.shared.depth
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.shared.buffers.len()
    }
}

#[derive(Debug)]
struct TxnShared {
    id: TxnId,
    parent: Option<TxnId>,
    depth: usize,
    flags: u32,
    isolation: IsolationLevel,
    state: AtomicU8,
    buffers: OpBufferSet,
    children: Mutex<Vec<TxnId>>,
}

impl TxnShared {
    fn transition(&self, from: TxnState, to: TxnState) -> bool {
        self.state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn current(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Internal commit-path error; converts to `JournalError` at the API
/// boundary so callers see the unified taxonomy.
#[derive(Debug, Error)]
enum CommitError {
    #[error("journal write failed: {0}")]
    Journal(#[source] JournalError),
}

impl From<CommitError> for JournalError {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::Journal(inner) => inner,
        }
    }
}

#[derive(Debug, Default)]
struct LiveTable {
    map: HashMap<TxnId, Arc<TxnShared>>,
    top_level: usize,
}

/// The transaction manager: admission control, state machine, and the
/// commit/abort paths over one shared journal.
pub struct TxnManager<D: BlockDevice> {
    journal: Arc<Journal<D>>,
    config: TxnConfig,
    live: Mutex<LiveTable>,
    next_txn: AtomicU64,
    next_op: AtomicU64,
    begun: AtomicU64,
    nested_begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    ops_journaled: AtomicU64,
    ops_rolled_back: AtomicU64,
}

impl<D: BlockDevice> TxnManager<D> {
    pub fn new(journal: Arc<Journal<D>>, config: TxnConfig) -> Self {
        Self {
            journal,
            config,
            live: Mutex::new(LiveTable::default()),
            next_txn: AtomicU64::new(1),
            next_op: AtomicU64::new(1),
            begun: AtomicU64::new(0),
            nested_begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            ops_journaled: AtomicU64::new(0),
            ops_rolled_back: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<Journal<D>> {
        &self.journal
    }

    /// Begin a top-level transaction. Fails fast with `TxnLimit` when the
    /// concurrent-transaction cap is reached.
    pub fn begin(&self, flags: u32, isolation: IsolationLevel) -> Result<TxnHandle> {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(TxnShared {
            id,
            parent: None,
            depth: 0,
            flags,
            isolation,
            state: AtomicU8::new(TxnState::Running.as_u8()),
            buffers: OpBufferSet::new(self.config.producers),
            children: Mutex::new(Vec::new()),
        });

        {
            let mut live = self.live.lock();
            if live.top_level >= self.config.max_concurrent {
                return Err(JournalError::TxnLimit(self.config.max_concurrent));
            }
            live.top_level += 1;
            live.map.insert(id, Arc::clone(&shared));
        }
        self.begun.fetch_add(1, Ordering::Relaxed);
        debug!(txn = id.0, ?isolation, "transaction begun");
        Ok(TxnHandle { id, shared })
    }

    /// Begin a transaction nested under `parent`.
    pub fn begin_nested(&self, parent: &TxnHandle, flags: u32) -> Result<TxnHandle> {
        let parent_state = parent.shared.current();
        if parent_state != TxnState::Running {
            return Err(JournalError::TxnState {
                txn: parent.id.0,
                state: parent_state.name(),
                action: "start a nested transaction",
            });
        }
        let depth = parent.shared.depth + 1;
        if depth >= self.config.max_nesting {
            return Err(JournalError::NestingLimit(self.config.max_nesting));
        }

        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(TxnShared {
            id,
            parent: Some(parent.id),
            depth,
            flags,
            isolation: parent.shared.isolation,
            state: AtomicU8::new(TxnState::Running.as_u8()),
            buffers: OpBufferSet::new(self.config.producers),
            children: Mutex::new(Vec::new()),
        });

        self.live.lock().map.insert(id, Arc::clone(&shared));
        parent.shared.children.lock().push(id);
        self.nested_begun.fetch_add(1, Ordering::Relaxed);
        debug!(txn = id.0, parent = parent.id.0, depth, "nested transaction begun");
        Ok(TxnHandle { id, shared })
    }

    /// Attach an operation to a running transaction.
    pub fn add_operation(&self, handle: &TxnHandle, mut op: Operation) -> Result<OperationId> {
        let state = handle.shared.current();
        if state != TxnState::Running {
            return Err(JournalError::TxnState {
                txn: handle.id.0,
                state: state.name(),
                action: "add operations",
            });
        }
        let id = OperationId(self.next_op.fetch_add(1, Ordering::Relaxed));
        op.id = id;
        op.txn = handle.id;
        handle.shared.buffers.push(op);
        Ok(id)
    }

    /// Commit a transaction.
    ///
    /// A nested commit merges its operations (in stamp order) into the
    /// parent's buffers; only a top-level commit reaches the journal.
    pub fn commit(&self, handle: TxnHandle) -> Result<CommitOutcome> {
        // Live children must commit or abort first.
        if self.has_live_children(&handle.shared) {
            return Err(JournalError::TxnState {
                txn: handle.id.0,
                state: handle.shared.current().name(),
                action: "commit with live child transactions",
            });
        }
        if !handle.shared.transition(TxnState::Running, TxnState::Committing) {
            return Err(JournalError::TxnState {
                txn: handle.id.0,
                state: handle.shared.current().name(),
                action: "commit",
            });
        }

        if let Some(parent_id) = handle.shared.parent {
            return self.merge_into_parent(handle, parent_id);
        }

        let mut ops = handle.shared.buffers.drain();
        if ops.is_empty() {
            self.finish(&handle.shared);
            self.committed.fetch_add(1, Ordering::Relaxed);
            return Ok(CommitOutcome {
                sequence: None,
                operations: 0,
            });
        }

        match self.journal_commit(&handle, &mut ops) {
            Ok(sequence) => {
                self.finish(&handle.shared);
                self.committed.fetch_add(1, Ordering::Relaxed);
                self.ops_journaled
                    .fetch_add(ops.len() as u64, Ordering::Relaxed);
                Ok(CommitOutcome {
                    sequence: Some(sequence),
                    operations: ops.len(),
                })
            }
            Err(err) => {
                // Journal rejected or failed mid-write: the commit block
                // was never written, so recovery sees nothing. Roll back
                // and surface the error.
                warn!(txn = handle.id.0, error = %err, "commit failed, rolling back");
                handle
                    .shared
                    .transition(TxnState::Committing, TxnState::Aborting);
                let entries = Self::rollback_entries(ops);
                self.ops_rolled_back
                    .fetch_add(entries.len() as u64, Ordering::Relaxed);
                self.finish(&handle.shared);
                self.aborted.fetch_add(1, Ordering::Relaxed);
                Err(err.into())
            }
        }
    }

    /// Abort a transaction, returning its rollback entries
    /// most-recent-first. Live children are aborted first; their entries
    /// precede the parent's own.
    pub fn abort(&self, handle: TxnHandle) -> Result<AbortOutcome> {
        let from = handle.shared.current();
        let ok = handle.shared.transition(TxnState::Running, TxnState::Aborting)
            || handle
                .shared
                .transition(TxnState::Committing, TxnState::Aborting);
        if !ok {
            return Err(JournalError::TxnState {
                txn: handle.id.0,
                state: from.name(),
                action: "abort",
            });
        }

        let mut entries = Vec::new();
        self.abort_live_children(&handle.shared, &mut entries);

        let ops = handle.shared.buffers.drain();
        entries.extend(Self::rollback_entries(ops));

        self.ops_rolled_back
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        self.finish(&handle.shared);
        self.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(txn = handle.id.0, rolled_back = entries.len(), "transaction aborted");
        Ok(AbortOutcome { entries })
    }

    #[must_use]
    pub fn stats(&self) -> TxnStats {
        TxnStats {
            begun: self.begun.load(Ordering::Relaxed),
            nested_begun: self.nested_begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            active: self.live.lock().map.len(),
            operations_journaled: self.ops_journaled.load(Ordering::Relaxed),
            operations_rolled_back: self.ops_rolled_back.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.live.lock().map.len()
    }

    fn has_live_children(&self, shared: &TxnShared) -> bool {
        let live = self.live.lock();
        shared
            .children
            .lock()
            .iter()
            .any(|child| live.map.contains_key(child))
    }

    /// Nested commit: re-stamp the child's operations against the
    /// parent's counter (preserving their relative order) and append them
    /// to the parent's buffers.
    fn merge_into_parent(&self, handle: TxnHandle, parent_id: TxnId) -> Result<CommitOutcome> {
        let parent = self
            .live
            .lock()
            .map
            .get(&parent_id)
            .cloned()
            .ok_or(JournalError::TxnState {
                txn: parent_id.0,
                state: "Finished",
                action: "receive a nested commit",
            })?;

        let ops = handle.shared.buffers.drain();
        let count = ops.len();
        for mut op in ops {
            op.stamp = parent.buffers.next_stamp();
            parent.buffers.push_stamped(op);
        }

        self.finish(&handle.shared);
        self.committed.fetch_add(1, Ordering::Relaxed);
        debug!(txn = handle.id.0, parent = parent_id.0, merged = count, "nested commit merged");
        Ok(CommitOutcome {
            sequence: None,
            operations: count,
        })
    }

    fn journal_commit(
        &self,
        handle: &TxnHandle,
        ops: &mut [Operation],
    ) -> std::result::Result<SequenceNumber, CommitError> {
        let mut jtxn = self
            .journal
            .start_transaction(handle.id, ops.len() as u64, handle.shared.flags)
            .map_err(CommitError::Journal)?;
        for op in ops.iter() {
            if let Err(err) = jtxn.add_write(op.target, op.after.clone()) {
                self.journal.abandon(jtxn);
                return Err(CommitError::Journal(err));
            }
        }
        let sequence = self.journal.commit(jtxn).map_err(CommitError::Journal)?;
        for op in ops.iter_mut() {
            op.state = OpState::Journaled;
        }
        Ok(sequence)
    }

    fn abort_live_children(&self, shared: &TxnShared, entries: &mut Vec<RollbackEntry>) {
        let children: Vec<Arc<TxnShared>> = {
            let live = self.live.lock();
            shared
                .children
                .lock()
                .iter()
                .filter_map(|id| live.map.get(id).cloned())
                .collect()
        };
        for child in children {
            if child.transition(TxnState::Running, TxnState::Aborting)
                || child.transition(TxnState::Committing, TxnState::Aborting)
            {
                self.abort_live_children(&child, entries);
                entries.extend(Self::rollback_entries(child.buffers.drain()));
                self.finish(&child);
                self.aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Convert drained operations into rollback entries, newest first.
    fn rollback_entries(mut ops: Vec<Operation>) -> Vec<RollbackEntry> {
        ops.sort_by_key(|op| std::cmp::Reverse(op.stamp));
        ops.into_iter()
            .map(|mut op| {
                op.state = OpState::RolledBack;
                RollbackEntry {
                    op: op.id,
                    target: op.target,
                    before: op.before,
                }
            })
            .collect()
    }

    fn finish(&self, shared: &TxnShared) {
        shared.state.store(TxnState::Finished.as_u8(), Ordering::Release);
        let mut live = self.live.lock();
        if live.map.remove(&shared.id).is_some() && shared.parent.is_none() {
            live.top_level = live.top_level.saturating_sub(1);
        }
    }
}

impl<D: BlockDevice> std::fmt::Debug for TxnManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnManager")
            .field("config", &self.config)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}
