//! Helpers shared by the integration tests.

#![allow(dead_code)]

pub mod faulty_directory;

pub use faulty_directory::{FaultConfig, FaultyDirectory};

use logsegment::batch::{MemoryRecords, RecordBatch, RecordBatchBuilder};
use logsegment::epochcache::LeaderEpochCache;
use logsegment::error::LogResult;
use logsegment::segment::Segment;

/// A data batch at `base_offset` with one record per value, all stamped `timestamp`.
pub fn data_batch(base_offset: i64, timestamp: i64, values: &[&str]) -> RecordBatch {
    let mut b = RecordBatchBuilder::new(base_offset);
    for v in values {
        b.append(timestamp, None, v.as_bytes());
    }
    b.build().unwrap()
}

/// Append `batches` to `seg` as a single write.
pub fn append_batches(
    seg: &mut Segment,
    batches: &[&RecordBatch],
    cache: Option<&mut dyn LeaderEpochCache>,
) -> LogResult<()> {
    let records = MemoryRecords::with_batches(batches.iter().copied());
    let info = records.append_info()?.unwrap();
    seg.append(
        info.last_offset,
        info.max_timestamp,
        info.shallow_offset_of_max_timestamp,
        &records,
        cache,
    )
}

/// Every `(offset, value)` readable from `start_offset` to the end of the segment.
pub fn read_all_from(seg: &Segment, start_offset: i64) -> Vec<(i64, String)> {
    let Some(info) = seg.read(start_offset, usize::MAX, None, true).unwrap() else {
        return Vec::new();
    };
    info.records
        .batches()
        .unwrap()
        .iter()
        .flat_map(|b| b.records().unwrap())
        .filter(|r| r.offset >= start_offset)
        .map(|r| (r.offset, String::from_utf8(r.value.unwrap()).unwrap()))
        .collect()
}
