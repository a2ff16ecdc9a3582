//! Offset index: sparse map from offset to byte position in the record store.
//!
//! Entry layout (8 bytes, little-endian): `relative_offset:i32 | position:i32`.

use crate::error::{LogError, LogResult};
use crate::sparseindex::{IndexEntry, SparseIndex};
use byteorder::{ByteOrder, LittleEndian};

/// Raw offset index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetIndexEntry {
    /// Offset minus the segment base offset.
    pub relative_offset: i32,
    /// Byte position in the record store.
    pub position: i32,
}

impl IndexEntry for OffsetIndexEntry {
    const SIZE: usize = 8;

    fn key(&self) -> i64 {
        i64::from(self.relative_offset)
    }

    fn relative_offset(&self) -> i32 {
        self.relative_offset
    }

    fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_i32(&mut out[0..4], self.relative_offset);
        LittleEndian::write_i32(&mut out[4..8], self.position);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            relative_offset: LittleEndian::read_i32(&buf[0..4]),
            position: LittleEndian::read_i32(&buf[4..8]),
        }
    }
}

/// An absolute offset and the byte position to start scanning from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPosition {
    /// Absolute offset.
    pub offset: i64,
    /// Byte position in the record store.
    pub position: u64,
}

/// Sparse offset index file.
pub type OffsetIndex = SparseIndex<OffsetIndexEntry>;

impl SparseIndex<OffsetIndexEntry> {
    /// Record that `offset` can be found by scanning from `position`.
    ///
    /// Returns `false` without writing when `offset` does not exceed the last indexed offset.
    /// Fails with `IndexFull` when there is no room and with `OffsetOverflow` when the offset
    /// cannot be stored relative to the base offset.
    pub fn maybe_append(&mut self, offset: i64, position: u64) -> LogResult<bool> {
        if self.is_full() {
            return Err(LogError::IndexFull {
                path: self.path().to_string(),
                entries: self.len(),
            });
        }
        if let Some(last) = self.last_entry() {
            if offset <= self.absolute_offset(last.relative_offset) {
                return Ok(false);
            }
        }
        let relative_offset = self.relative_offset(offset)?;
        let position = i32::try_from(position).map_err(|_| {
            LogError::InvalidOffset(format!("position {position} does not fit the offset index"))
        })?;
        self.append_entry(OffsetIndexEntry {
            relative_offset,
            position,
        })?;
        Ok(true)
    }

    /// Entry with the largest offset `<= target_offset`, or the segment start when the target
    /// precedes every entry.
    pub fn lookup(&self, target_offset: i64) -> OffsetPosition {
        match self.floor_slot(target_offset.saturating_sub(self.base_offset())) {
            Some(slot) => self.offset_position(slot),
            None => OffsetPosition {
                offset: self.base_offset(),
                position: 0,
            },
        }
    }

    /// The `n`th entry as absolute values.
    pub fn offset_position(&self, n: usize) -> OffsetPosition {
        let e = self.entries()[n];
        OffsetPosition {
            offset: self.absolute_offset(e.relative_offset),
            position: e.position.max(0) as u64,
        }
    }

    /// Last indexed offset, or the base offset when empty.
    pub fn last_offset(&self) -> i64 {
        self.last_entry()
            .map(|e| self.absolute_offset(e.relative_offset))
            .unwrap_or_else(|| self.base_offset())
    }
}
