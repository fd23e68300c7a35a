#![forbid(unsafe_code)]
//! Error types for FerroJournal.
//!
//! # Error Taxonomy
//!
//! FerroJournal uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `fj-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `JournalError` | `fj-error` (this crate) | User-facing errors for API and admin consumers |
//!
//! The four classes the stack distinguishes:
//!
//! * **Input validation** — `InvalidArgument`, `GroupNotFound`. Rejected
//!   immediately, no state change.
//! * **Resource exhaustion** — `NoSpace`, `TxnLimit`, `NestingLimit`,
//!   `OrphanTableFull`. Surfaced to the caller with no partial effect.
//! * **Integrity failures** — `Corruption`, `CacheCorruption`, `Format`.
//!   The offending state is discarded/evicted and the error propagates;
//!   never silently repaired.
//! * **I/O failures** — `Io`. Propagate as a transaction abort, which
//!   triggers rollback.
//!
//! `fj-error` MUST NOT depend on `fj-types` (no cyclic deps); conversions
//! from `ParseError` happen at the crate boundaries that see both types.
//! All string payloads are owned (`String`) so errors cross thread
//! boundaries without lifetime entanglement.

use thiserror::Error;

/// Unified error type for all FerroJournal operations.
///
/// This is the canonical error returned by the transaction, metadata,
/// allocation, recovery, and admin surfaces. Internal crate-specific
/// errors convert into `JournalError` at crate boundaries.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk corruption detected at a known block.
    ///
    /// Used when a journal block, bitmap, or metadata record fails its
    /// checksum or carries out-of-range field values. The `block` field
    /// enables repair triage.
    #[error("corrupt data at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Structurally invalid on-disk format (bad magic, unsupported
    /// version, impossible geometry).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Caller-supplied argument is invalid (zero-sized request,
    /// out-of-range address, bad alignment).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named allocation group does not exist.
    #[error("allocation group {0} not found")]
    GroupNotFound(u32),

    /// No free blocks or inodes satisfy the request.
    #[error("no space left on device")]
    NoSpace,

    /// The journal extent cannot reserve the requested log space.
    #[error("journal full: need {needed} blocks, {available} available")]
    JournalFull { needed: u64, available: u64 },

    /// The concurrent-transaction cap is reached; `begin` fails fast.
    #[error("transaction limit reached ({0} concurrent)")]
    TxnLimit(usize),

    /// Nested transaction depth would exceed the configured bound.
    #[error("transaction nesting limit reached (depth {0})")]
    NestingLimit(usize),

    /// The transaction is not in a state that permits the operation.
    #[error("transaction {txn} in state {state} cannot {action}")]
    TxnState {
        txn: u64,
        state: &'static str,
        action: &'static str,
    },

    /// A cached metadata record failed checksum verification.
    ///
    /// The entry has been evicted; the caller must fall back to the
    /// authoritative structure.
    #[error("cache corruption for entity {entity}: {detail}")]
    CacheCorruption { entity: u64, detail: String },

    /// The orphan table reached its configured capacity.
    #[error("orphan table full ({0} entries)")]
    OrphanTableFull(usize),

    /// Crash recovery could not complete; the stack must not go writable.
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    /// A synchronous caller timed out waiting for a batch to complete.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The core is mounted read-only (recovery failed or not yet run).
    #[error("journal is read-only")]
    ReadOnly,
}

impl JournalError {
    /// Whether this error is an integrity failure (checksum/format), as
    /// opposed to exhaustion or caller error. Integrity failures are
    /// counted as consistency errors in layer statistics.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::CacheCorruption { .. } | Self::Format(_)
        )
    }

    /// Whether the caller may retry the operation unchanged (transient
    /// exhaustion conditions).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TxnLimit(_) | Self::Timeout(_))
    }
}

/// Result alias using `JournalError`.
pub type Result<T> = std::result::Result<T, JournalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = JournalError::Corruption {
            block: 42,
            detail: "bad checksum".into(),
        };
        assert_eq!(err.to_string(), "corrupt data at block 42: bad checksum");

        let full = JournalError::JournalFull {
            needed: 10,
            available: 3,
        };
        assert_eq!(full.to_string(), "journal full: need 10 blocks, 3 available");

        let limit = JournalError::TxnLimit(64);
        assert_eq!(limit.to_string(), "transaction limit reached (64 concurrent)");

        let state = JournalError::TxnState {
            txn: 7,
            state: "Committing",
            action: "add operations",
        };
        assert_eq!(
            state.to_string(),
            "transaction 7 in state Committing cannot add operations"
        );
    }

    #[test]
    fn integrity_classification() {
        assert!(JournalError::Corruption {
            block: 0,
            detail: String::new()
        }
        .is_integrity());
        assert!(JournalError::CacheCorruption {
            entity: 1,
            detail: String::new()
        }
        .is_integrity());
        assert!(JournalError::Format("x".into()).is_integrity());
        assert!(!JournalError::NoSpace.is_integrity());
        assert!(!JournalError::TxnLimit(4).is_integrity());
    }

    #[test]
    fn retryable_classification() {
        assert!(JournalError::TxnLimit(4).is_retryable());
        assert!(JournalError::Timeout("batch".into()).is_retryable());
        assert!(!JournalError::NoSpace.is_retryable());
        assert!(!JournalError::ReadOnly.is_retryable());
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> Result<()> {
            Err(std::io::Error::other("disk gone"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(matches!(err, JournalError::Io(_)));
    }
}
