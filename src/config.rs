//! Segment configuration.

use crate::error::{LogError, LogResult};
use serde::{Deserialize, Serialize};

/// Default bytes of record data between two sparse index samples (4 KiB).
pub const DEFAULT_INDEX_INTERVAL_BYTES: u32 = 4096;
/// Default capacity of each index file (10 MiB).
pub const DEFAULT_MAX_INDEX_SIZE: u32 = 10 * 1024 * 1024;
/// Default maximum record store size (1 GiB).
pub const DEFAULT_SEGMENT_BYTES: u32 = 1024 * 1024 * 1024;
/// Default maximum segment age (7 days).
pub const DEFAULT_SEGMENT_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Options recognised by a [`Segment`](crate::segment::Segment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Bytes of record data appended between two sparse index samples.
    pub index_interval_bytes: u32,
    /// Capacity in bytes of the offset and time index files; an index at capacity is full.
    pub max_index_size: u32,
    /// Maximum record store size before the segment should roll.
    pub segment_bytes: u32,
    /// Maximum segment age in milliseconds before it should roll.
    pub segment_ms: i64,
    /// Random jitter subtracted from `segment_ms`, fixed per segment.
    pub segment_jitter_ms: i64,
    /// Size to preallocate the record store to. `0` means `segment_bytes`.
    pub initial_file_size: u32,
    /// Whether to preallocate the record store on creation.
    pub preallocate: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            index_interval_bytes: DEFAULT_INDEX_INTERVAL_BYTES,
            max_index_size: DEFAULT_MAX_INDEX_SIZE,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            segment_ms: DEFAULT_SEGMENT_MS,
            segment_jitter_ms: 0,
            initial_file_size: 0,
            preallocate: false,
        }
    }
}

impl SegmentConfig {
    /// Reject values the segment cannot honour.
    pub fn validate(&self) -> LogResult<()> {
        // Time index entries are the wider of the two (12 bytes).
        if self.max_index_size < 12 {
            return Err(LogError::InvalidConfig(format!(
                "max_index_size {} cannot hold a single index entry",
                self.max_index_size
            )));
        }
        if self.segment_bytes > i32::MAX as u32 {
            return Err(LogError::InvalidConfig(format!(
                "segment_bytes {} exceeds the 32-bit position range",
                self.segment_bytes
            )));
        }
        if self.initial_file_size > i32::MAX as u32 {
            return Err(LogError::InvalidConfig(format!(
                "initial_file_size {} exceeds the 32-bit position range",
                self.initial_file_size
            )));
        }
        if self.segment_ms <= 0 {
            return Err(LogError::InvalidConfig(format!(
                "segment_ms must be positive (got {})",
                self.segment_ms
            )));
        }
        if self.segment_jitter_ms < 0 || self.segment_jitter_ms >= self.segment_ms {
            return Err(LogError::InvalidConfig(format!(
                "segment_jitter_ms {} must be in [0, segment_ms)",
                self.segment_jitter_ms
            )));
        }
        Ok(())
    }

    /// Bytes to preallocate for a new record store, or `0` when preallocation is off.
    pub fn preallocation_size(&self) -> u32 {
        match (self.preallocate, self.initial_file_size) {
            (false, _) => 0,
            (true, 0) => self.segment_bytes,
            (true, n) => n,
        }
    }
}

/// Inputs to a roll decision for one prospective append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollParams {
    /// Maximum segment age in milliseconds.
    pub max_segment_ms: i64,
    /// Maximum record store size in bytes.
    pub max_segment_bytes: u32,
    /// Max timestamp of the batches about to be appended.
    pub max_timestamp_in_messages: i64,
    /// Largest offset of the batches about to be appended.
    pub max_offset_in_messages: i64,
    /// Size in bytes of the batches about to be appended.
    pub messages_size: u32,
    /// Current time in milliseconds.
    pub now: i64,
}

impl RollParams {
    /// Roll parameters derived from `config` for an append.
    pub fn new(
        config: &SegmentConfig,
        max_timestamp_in_messages: i64,
        max_offset_in_messages: i64,
        messages_size: u32,
        now: i64,
    ) -> Self {
        Self {
            max_segment_ms: config.segment_ms,
            max_segment_bytes: config.segment_bytes,
            max_timestamp_in_messages,
            max_offset_in_messages,
            messages_size,
            now,
        }
    }
}
