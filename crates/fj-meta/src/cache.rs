//! Checksummed LRU read cache for metadata records.
//!
//! Keyed by `(entity id, record kind)` in a `BTreeMap`; recency is a
//! separate queue so eviction is O(1) amortized. Entries hold the encoded
//! record bytes and are re-verified on every hit: a mismatch evicts the
//! entry, counts a corruption event, and surfaces `CacheCorruption` so
//! the caller falls back to the authoritative structure.

use crate::record::{MetaRecord, RecordKind};
use fj_error::{JournalError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

type CacheKey = (u64, u16);

#[derive(Debug)]
struct CacheEntry {
    encoded: Vec<u8>,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub corruption_events: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    map: BTreeMap<CacheKey, CacheEntry>,
    lru: VecDeque<CacheKey>,
    hits: u64,
    misses: u64,
    evictions: u64,
    corruption_events: u64,
}

/// Bounded LRU cache over encoded metadata records.
#[derive(Debug)]
pub struct MetaCache {
    state: Mutex<CacheState>,
    max_entries: usize,
}

impl MetaCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Look up a record, re-verifying its checksum.
    ///
    /// `Ok(None)` is a miss. `Err(CacheCorruption)` means the entry was
    /// present but failed verification; it has been evicted.
    pub fn get(&self, entity: u64, kind: RecordKind) -> Result<Option<MetaRecord>> {
        let key = (entity, kind.to_wire());
        let mut state = self.state.lock();
        let Some(entry) = state.map.get(&key) else {
            state.misses += 1;
            return Ok(None);
        };

        match MetaRecord::decode(&entry.encoded) {
            Ok(Some(record)) if record.entity == entity && record.kind == kind => {
                state.hits += 1;
                touch(&mut state.lru, key);
                Ok(Some(record))
            }
            _ => {
                // Verification failed: evict, count, and report. The
                // caller must re-read the authoritative structure.
                state.map.remove(&key);
                state.lru.retain(|k| *k != key);
                state.corruption_events += 1;
                warn!(entity, kind = kind.to_wire(), "cached metadata record failed verification");
                Err(JournalError::CacheCorruption {
                    entity,
                    detail: "cached record failed checksum verification".into(),
                })
            }
        }
    }

    /// Insert or refresh a record.
    pub fn insert(&self, record: &MetaRecord) -> Result<()> {
        let encoded = record.encode()?;
        let key = (record.entity, record.kind.to_wire());
        let mut state = self.state.lock();

        if state.map.insert(key, CacheEntry { encoded }).is_none()
            && state.map.len() > self.max_entries
        {
            if let Some(victim) = state.lru.pop_front() {
                state.map.remove(&victim);
                state.evictions += 1;
            }
        }
        touch(&mut state.lru, key);
        Ok(())
    }

    /// Drop a record (entity deleted).
    pub fn remove(&self, entity: u64, kind: RecordKind) {
        let key = (entity, kind.to_wire());
        let mut state = self.state.lock();
        state.map.remove(&key);
        state.lru.retain(|k| *k != key);
    }

    /// Flip bits in a cached entry. Test-only corruption injection.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, entity: u64, kind: RecordKind, byte: usize) {
        let key = (entity, kind.to_wire());
        let mut state = self.state.lock();
        if let Some(entry) = state.map.get_mut(&key) {
            if let Some(b) = entry.encoded.get_mut(byte) {
                *b ^= 0xFF;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            corruption_events: state.corruption_events,
            entries: state.map.len(),
        }
    }
}

fn touch(lru: &mut VecDeque<CacheKey>, key: CacheKey) {
    if let Some(pos) = lru.iter().position(|k| *k == key) {
        lru.remove(pos);
    }
    lru.push_back(key);
}
