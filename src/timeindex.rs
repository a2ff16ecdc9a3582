//! Time index: sparse map from timestamp to the offset where it was first reached.
//!
//! Entry layout (12 bytes, little-endian): `timestamp:i64 | relative_offset:i32`.
//!
//! One slot is held back from [`is_full`](SparseIndex::is_full) so the final entry written when
//! the segment stops being active always fits.

use crate::error::{LogError, LogResult};
use crate::formats::NO_TIMESTAMP;
use crate::sparseindex::{IndexEntry, SparseIndex};
use byteorder::{ByteOrder, LittleEndian};

/// Raw time index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeIndexEntry {
    /// Largest timestamp seen up to `relative_offset`.
    pub timestamp: i64,
    /// Offset minus the segment base offset.
    pub relative_offset: i32,
}

impl IndexEntry for TimeIndexEntry {
    const SIZE: usize = 12;
    const RESERVED_SLOTS: usize = 1;

    fn key(&self) -> i64 {
        self.timestamp
    }

    fn relative_offset(&self) -> i32 {
        self.relative_offset
    }

    fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_i64(&mut out[0..8], self.timestamp);
        LittleEndian::write_i32(&mut out[8..12], self.relative_offset);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            timestamp: LittleEndian::read_i64(&buf[0..8]),
            relative_offset: LittleEndian::read_i32(&buf[8..12]),
        }
    }
}

/// A timestamp and an absolute offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampOffset {
    /// Timestamp, or [`NO_TIMESTAMP`].
    pub timestamp: i64,
    /// Absolute offset.
    pub offset: i64,
}

/// Sparse time index file.
pub type TimeIndex = SparseIndex<TimeIndexEntry>;

impl SparseIndex<TimeIndexEntry> {
    /// Record that `timestamp` was reached at `offset`.
    ///
    /// Only a timestamp larger than the last indexed one (or than [`NO_TIMESTAMP`] when empty)
    /// is written. An offset smaller than
    /// the last indexed offset is an error. `skip_full_check` lets the final entry use the
    /// reserved slot.
    pub fn maybe_append(&mut self, timestamp: i64, offset: i64, skip_full_check: bool) -> LogResult<bool> {
        if !skip_full_check && self.is_full() {
            return Err(LogError::IndexFull {
                path: self.path().to_string(),
                entries: self.len(),
            });
        }
        let last = self.last_timestamp_offset();
        if !self.is_empty() && offset < last.offset {
            return Err(LogError::InvalidOffset(format!(
                "time index offset {offset} is below the last indexed offset {} in {}",
                last.offset,
                self.path()
            )));
        }
        if timestamp <= last.timestamp {
            return Ok(false);
        }
        let relative_offset = self.relative_offset(offset)?;
        self.append_entry(TimeIndexEntry {
            timestamp,
            relative_offset,
        })?;
        Ok(true)
    }

    /// Entry with the largest timestamp `<= target_timestamp`, or `(NO_TIMESTAMP, base_offset)`
    /// when the target precedes every entry.
    pub fn lookup(&self, target_timestamp: i64) -> TimestampOffset {
        match self.floor_slot(target_timestamp) {
            Some(slot) => self.timestamp_offset(slot),
            None => TimestampOffset {
                timestamp: NO_TIMESTAMP,
                offset: self.base_offset(),
            },
        }
    }

    /// The `n`th entry as absolute values.
    pub fn timestamp_offset(&self, n: usize) -> TimestampOffset {
        let e = self.entries()[n];
        TimestampOffset {
            timestamp: e.timestamp,
            offset: self.absolute_offset(e.relative_offset),
        }
    }

    /// Last entry, or `(NO_TIMESTAMP, base_offset)` when empty.
    pub fn last_timestamp_offset(&self) -> TimestampOffset {
        match self.len() {
            0 => TimestampOffset {
                timestamp: NO_TIMESTAMP,
                offset: self.base_offset(),
            },
            n => self.timestamp_offset(n - 1),
        }
    }
}
