//! Per-producer operation buffers with an atomic stamp counter.
//!
//! Each producer (keyed by thread) appends to its own slot, so the enqueue
//! hot path takes only that slot's uncontended lock plus one atomic
//! fetch-add for the global stamp. Commit drains every slot and merges by
//! stamp, restoring the FIFO order operations were enqueued in.

use crate::Operation;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed set of producer slots sharing one stamp counter.
#[derive(Debug)]
pub(crate) struct OpBufferSet {
    slots: Vec<Mutex<Vec<Operation>>>,
    stamp: AtomicU64,
}

impl OpBufferSet {
    pub(crate) fn new(producers: usize) -> Self {
        let producers = producers.max(1);
        Self {
            slots: (0..producers).map(|_| Mutex::new(Vec::new())).collect(),
            stamp: AtomicU64::new(0),
        }
    }

    /// Stamp `op` and append it to the calling thread's slot.
    pub(crate) fn push(&self, mut op: Operation) -> u64 {
        let stamp = self.stamp.fetch_add(1, Ordering::Relaxed);
        op.stamp = stamp;
        self.slots[self.slot_index()].lock().push(op);
        stamp
    }

    /// Re-insert an already-stamped operation (nested-commit merge).
    pub(crate) fn push_stamped(&self, op: Operation) {
        self.slots[self.slot_index()].lock().push(op);
    }

    /// Reserve a stamp without enqueueing; merged child operations are
    /// re-stamped against the parent's counter to keep its FIFO total
    /// order.
    pub(crate) fn next_stamp(&self) -> u64 {
        self.stamp.fetch_add(1, Ordering::Relaxed)
    }

    /// Drain every slot and return the operations in stamp order.
    pub(crate) fn drain(&self) -> Vec<Operation> {
        let mut ops = Vec::new();
        for slot in &self.slots {
            ops.append(&mut slot.lock());
        }
        ops.sort_by_key(|op| op.stamp);
        ops
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().map(|slot| slot.lock().len()).sum()
    }

    fn slot_index(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.slots.len()
    }
}
