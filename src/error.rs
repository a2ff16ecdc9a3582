//! Error types for `logsegment`.

use std::path::PathBuf;

/// Result type for segment operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors returned by the `logsegment` crate.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    /// I/O error from the underlying storage. Never retried inside this crate.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The offset cannot be stored as a 32-bit delta from the segment base offset.
    ///
    /// Raised before any byte is written; the caller must roll to a new segment.
    #[error("offset {offset} is out of range for segment with base offset {base_offset}")]
    OffsetOverflow {
        /// Base offset of the segment that rejected the append.
        base_offset: i64,
        /// The offending absolute offset.
        offset: i64,
    },

    /// Index bytes are structurally invalid; rebuild the index from the record store.
    #[error("corrupt index {path}: {reason}")]
    CorruptIndex {
        /// Path of the index file.
        path: String,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// A record batch failed structural validation.
    #[error("corrupt record batch at position {position}: {reason}")]
    CorruptRecord {
        /// Byte position of the batch in the record store.
        position: u64,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// CRC mismatch (data corruption detected).
    #[error("crc mismatch (expected {expected:#010x}, got {actual:#010x})")]
    CrcMismatch {
        /// CRC stored in the batch header.
        expected: u32,
        /// CRC computed from the bytes that were read.
        actual: u32,
    },

    /// Producer sequence/epoch bookkeeping rejected a batch.
    #[error("sequence violation: {0}")]
    SequenceViolation(#[from] SequenceViolation),

    /// An index has no remaining capacity for another entry.
    #[error("index {path} is full ({entries} entries)")]
    IndexFull {
        /// Path of the index file.
        path: String,
        /// Number of entries held when the append was attempted.
        entries: usize,
    },

    /// An offset argument violates an ordering invariant.
    #[error("invalid offset: {0}")]
    InvalidOffset(String),

    /// Encoding error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Decoding error.
    #[error("decode error: {0}")]
    Decode(String),

    /// Invalid state (operation not allowed in current state).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not supported.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Lock acquisition failed (poisoned lock).
    #[error("lock failed on {resource}: {reason}")]
    LockFailed {
        /// What we were trying to lock.
        resource: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Requested path does not exist.
    #[error("missing path: {0}")]
    MissingPath(PathBuf),
}

impl LogError {
    /// Whether this error describes corrupt bytes in the record store.
    ///
    /// Recovery truncates at the first batch producing such an error; every other error
    /// propagates to the caller.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LogError::CorruptRecord { .. } | LogError::CrcMismatch { .. }
        )
    }
}

/// Producer bookkeeping faults. These indicate a producer bug or a replay and are never
/// silently corrected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceViolation {
    /// The batch does not continue the producer's last sequence.
    #[error("out of order sequence for producer {producer_id}: expected {expected}, got {received}")]
    OutOfOrder {
        /// Producer id.
        producer_id: i64,
        /// The next sequence the tracker expected.
        expected: i32,
        /// The batch's base sequence.
        received: i32,
    },

    /// The batch repeats a recently written sequence range.
    #[error(
        "duplicate sequence {first_seq}..={last_seq} for producer {producer_id} (written at offset {offset})"
    )]
    Duplicate {
        /// Producer id.
        producer_id: i64,
        /// First sequence of the duplicate batch.
        first_seq: i32,
        /// Last sequence of the duplicate batch.
        last_seq: i32,
        /// Last offset of the originally written batch.
        offset: i64,
    },

    /// The batch carries an epoch older than the producer's current epoch.
    #[error("producer {producer_id} fenced: current epoch {current_epoch}, got {received_epoch}")]
    Fenced {
        /// Producer id.
        producer_id: i64,
        /// Epoch held by the tracker.
        current_epoch: i16,
        /// Epoch on the rejected batch.
        received_epoch: i16,
    },

    /// A non-transactional batch arrived while the producer has an open transaction.
    #[error("producer {producer_id} wrote a non-transactional batch inside open transaction starting at {txn_first_offset}")]
    InvalidTxnState {
        /// Producer id.
        producer_id: i64,
        /// First offset of the open transaction.
        txn_first_offset: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_classification() {
        assert!(LogError::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(LogError::CorruptRecord {
            position: 0,
            reason: "short".into()
        }
        .is_corruption());
        assert!(!LogError::OffsetOverflow {
            base_offset: 0,
            offset: -1
        }
        .is_corruption());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(!LogError::from(io).is_corruption());
    }

    #[test]
    fn sequence_violation_message_names_producer() {
        let err: LogError = SequenceViolation::OutOfOrder {
            producer_id: 7,
            expected: 3,
            received: 5,
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("producer 7"));
        assert!(msg.contains("expected 3"));
    }
}
