//! `logsegment`: the storage engine for one segment of a partitioned commit log.
//!
//! Scope:
//! - record batch format and in-memory batch sequences (`batch`)
//! - the append-only record store (`filerecords`)
//! - sparse offset and time indexes (`sparseindex`, `offsetindex`, `timeindex`)
//! - aborted transaction index (`txnindex`)
//! - producer sequence/epoch/transaction bookkeeping (`producerstate`)
//! - leader epoch history (`epochcache`)
//! - the segment orchestrator with append, read, truncate, recover and roll (`segment`)
//!
//! Non-goal: multi-segment log management, retention, compaction, replication.
//!
//! ## Contract (what you can rely on)
//!
//! - **Offset range**: a segment only stores offsets within `i32` of its base offset. An append
//!   outside that range fails with [`LogError::OffsetOverflow`] before any byte is written.
//! - **Indexes are hints**: lookups return the floor entry and callers scan the record store
//!   forward. A missing or corrupt index is rebuilt from the record store, never from the
//!   other index.
//! - **Recovery is a prefix**: [`Segment::recover`] keeps the longest prefix of structurally
//!   valid, checksum-clean batches and truncates the rest. It only fails for conditions it
//!   cannot repair, such as I/O errors.
//! - **Producer faults surface**: out-of-order or duplicate sequences and fenced epochs are
//!   returned as [`LogError::SequenceViolation`], never corrected silently.
//!
//! Terminology:
//! - "base offset": the first offset a segment may hold; it names all of the segment's files.
//! - "relative offset": an offset minus the base offset, stored as `i32` in the indexes.
//! - `flush()` is a visibility boundary; callers that need stable storage sync the directory.
//!
//! Callers own the partition layout: which segments exist, which one is active, and the
//! producer state tracker and epoch cache threaded through `append` and `recover`.

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod epochcache;
pub mod error;
pub mod filerecords;
pub mod formats;
pub mod offsetindex;
pub mod producerstate;
pub mod segment;
pub mod sparseindex;
pub mod storage;
pub mod time;
pub mod timeindex;
pub mod txnindex;

pub use batch::{MemoryRecords, RecordBatch, RecordBatchBuilder};
pub use config::{RollParams, SegmentConfig};
pub use epochcache::{
    CheckpointedLeaderEpochCache, EpochEntry, LeaderEpochCache, MemoryLeaderEpochCache,
};
pub use error::{LogError, LogResult, SequenceViolation};
pub use filerecords::FileRecords;
pub use producerstate::{AppendOrigin, ProducerStateTracker};
pub use segment::{FetchDataInfo, LogOffsetMetadata, Segment};
pub use storage::{Directory, FsDirectory, MemoryDirectory};
pub use time::{MockTime, SystemTime, Time};
