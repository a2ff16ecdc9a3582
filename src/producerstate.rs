//! Per-producer sequence, epoch and open-transaction bookkeeping for one partition.
//!
//! The tracker is an explicit value owned by the caller and threaded through appends and
//! segment recovery; each partition has its own instance.
//!
//! Validation depends on where a batch comes from ([`AppendOrigin`]):
//! - `Client`: epoch fencing, duplicate detection over the last [`NUM_BATCHES_TO_RETAIN`]
//!   batches, sequence continuity and transactional state are all checked.
//! - `Replication`: only epoch fencing; the leader already validated sequences.
//! - `Recovery`: nothing is checked; the bytes were accepted when first written.

use crate::batch::{increment_sequence, ControlRecordType, RecordBatch};
use crate::checkpoint::CheckpointFile;
use crate::error::{LogError, LogResult, SequenceViolation};
use crate::formats::{
    offset_from_file_name, segment_file_path, NO_PRODUCER_EPOCH, NO_SEQUENCE, NO_TIMESTAMP,
    PRODUCER_SNAPSHOT_FILE_SUFFIX,
};
use crate::storage::Directory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Number of recent batches kept per producer for duplicate detection.
pub const NUM_BATCHES_TO_RETAIN: usize = 5;

/// Where an appended batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOrigin {
    /// Written by a producer through this broker.
    Client,
    /// Copied from the partition leader.
    Replication,
    /// Re-read from disk while rebuilding state.
    Recovery,
}

/// Sequence range and location of one appended batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetadata {
    /// Sequence of the first record.
    pub first_seq: i32,
    /// Sequence of the last record.
    pub last_seq: i32,
    /// Last offset of the batch.
    pub last_offset: i64,
    /// `last_offset - base_offset`.
    pub offset_delta: i32,
    /// Max timestamp of the batch.
    pub timestamp: i64,
}

/// State of one producer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerStateEntry {
    /// Producer id.
    pub producer_id: i64,
    /// Latest epoch seen.
    pub producer_epoch: i16,
    /// Timestamp of the latest batch or marker.
    pub last_timestamp: i64,
    /// First offset of the open transaction, if any.
    pub current_txn_first_offset: Option<i64>,
    /// Most recent batches, oldest first.
    pub batch_metadata: VecDeque<BatchMetadata>,
}

impl ProducerStateEntry {
    /// An entry that has seen nothing yet.
    pub fn empty(producer_id: i64) -> Self {
        Self {
            producer_id,
            producer_epoch: NO_PRODUCER_EPOCH,
            last_timestamp: NO_TIMESTAMP,
            current_txn_first_offset: None,
            batch_metadata: VecDeque::new(),
        }
    }

    /// Whether no batch has been recorded.
    pub fn is_empty(&self) -> bool {
        self.batch_metadata.is_empty()
    }

    /// First sequence of the oldest retained batch.
    pub fn first_seq(&self) -> i32 {
        self.batch_metadata.front().map_or(NO_SEQUENCE, |b| b.first_seq)
    }

    /// Last sequence of the newest batch.
    pub fn last_seq(&self) -> i32 {
        self.batch_metadata.back().map_or(NO_SEQUENCE, |b| b.last_seq)
    }

    /// Last offset of the newest batch, or -1.
    pub fn last_data_offset(&self) -> i64 {
        self.batch_metadata.back().map_or(-1, |b| b.last_offset)
    }

    fn find_duplicate_batch(&self, batch: &RecordBatch) -> Option<&BatchMetadata> {
        if batch.producer_epoch() != self.producer_epoch {
            return None;
        }
        self.batch_metadata
            .iter()
            .find(|m| m.first_seq == batch.base_sequence() && m.last_seq == batch.last_sequence())
    }

    fn add_batch(&mut self, epoch: i16, meta: BatchMetadata) {
        if epoch != self.producer_epoch {
            self.batch_metadata.clear();
            self.producer_epoch = epoch;
        }
        self.batch_metadata.push_back(meta);
        while self.batch_metadata.len() > NUM_BATCHES_TO_RETAIN {
            self.batch_metadata.pop_front();
        }
        self.last_timestamp = meta.timestamp;
    }
}

/// A transaction closed by a commit or abort marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedTxn {
    /// Producer id.
    pub producer_id: i64,
    /// First offset of the transaction (marker offset when it was never seen open).
    pub first_offset: i64,
    /// Offset of the marker.
    pub last_offset: i64,
    /// Whether the marker was an abort.
    pub is_aborted: bool,
    /// Timestamp of the marker.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TxnMetadata {
    producer_id: i64,
    first_offset: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProducerSnapshot {
    entries: Vec<ProducerStateEntry>,
}

fn in_sequence(last_seq: i32, next_seq: i32) -> bool {
    next_seq == increment_sequence(last_seq, 1) || (next_seq == 0 && last_seq == i32::MAX)
}

/// Producer state for one partition.
pub struct ProducerStateTracker {
    snapshots: CheckpointFile,
    parent: String,
    producers: HashMap<i64, ProducerStateEntry>,
    ongoing_txns: BTreeMap<i64, TxnMetadata>,
    last_map_offset: i64,
    last_snap_offset: i64,
}

impl std::fmt::Debug for ProducerStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerStateTracker")
            .field("parent", &self.parent)
            .field("producers", &self.producers.len())
            .field("ongoing_txns", &self.ongoing_txns.len())
            .field("last_map_offset", &self.last_map_offset)
            .finish()
    }
}

impl ProducerStateTracker {
    /// Empty tracker keeping snapshots under `parent` in `dir`.
    pub fn new(dir: impl Into<Arc<dyn Directory>>, parent: impl Into<String>) -> Self {
        Self {
            snapshots: CheckpointFile::new(dir),
            parent: parent.into(),
            producers: HashMap::new(),
            ongoing_txns: BTreeMap::new(),
            last_map_offset: 0,
            last_snap_offset: 0,
        }
    }

    /// Validate `batch` for `origin` and apply it.
    ///
    /// Returns the transaction a control batch closed. Nothing is changed when validation
    /// fails. Batches without a producer id are ignored.
    pub fn update(&mut self, batch: &RecordBatch, origin: AppendOrigin) -> LogResult<Option<CompletedTxn>> {
        if !batch.has_producer_id() {
            return Ok(None);
        }
        let producer_id = batch.producer_id();
        let mut entry = self
            .producers
            .get(&producer_id)
            .cloned()
            .unwrap_or_else(|| ProducerStateEntry::empty(producer_id));

        if origin != AppendOrigin::Recovery && batch.producer_epoch() < entry.producer_epoch {
            return Err(SequenceViolation::Fenced {
                producer_id,
                current_epoch: entry.producer_epoch,
                received_epoch: batch.producer_epoch(),
            }
            .into());
        }

        if batch.is_control_batch() {
            let kind = batch.control_record_type()?.ok_or_else(|| {
                LogError::InvalidState("control batch without a marker type".into())
            })?;
            let completed = CompletedTxn {
                producer_id,
                first_offset: entry.current_txn_first_offset.unwrap_or(batch.base_offset()),
                last_offset: batch.last_offset(),
                is_aborted: kind == ControlRecordType::Abort,
                timestamp: batch.max_timestamp(),
            };
            entry.producer_epoch = batch.producer_epoch();
            entry.current_txn_first_offset = None;
            entry.last_timestamp = batch.max_timestamp();
            self.producers.insert(producer_id, entry);
            return Ok(Some(completed));
        }

        if origin == AppendOrigin::Client {
            self.validate_client_batch(&entry, batch)?;
        }

        entry.add_batch(
            batch.producer_epoch(),
            BatchMetadata {
                first_seq: batch.base_sequence(),
                last_seq: batch.last_sequence(),
                last_offset: batch.last_offset(),
                offset_delta: (batch.last_offset() - batch.base_offset()) as i32,
                timestamp: batch.max_timestamp(),
            },
        );
        if batch.is_transactional() && entry.current_txn_first_offset.is_none() {
            let first_offset = batch.base_offset();
            entry.current_txn_first_offset = Some(first_offset);
            self.ongoing_txns.insert(
                first_offset,
                TxnMetadata {
                    producer_id,
                    first_offset,
                },
            );
        }
        self.producers.insert(producer_id, entry);
        Ok(None)
    }

    fn validate_client_batch(&self, entry: &ProducerStateEntry, batch: &RecordBatch) -> LogResult<()> {
        let producer_id = entry.producer_id;
        if let Some(dup) = entry.find_duplicate_batch(batch) {
            return Err(SequenceViolation::Duplicate {
                producer_id,
                first_seq: dup.first_seq,
                last_seq: dup.last_seq,
                offset: dup.last_offset,
            }
            .into());
        }
        let first_seq = batch.base_sequence();
        if batch.producer_epoch() != entry.producer_epoch {
            // A bumped epoch restarts sequences at zero.
            if first_seq != 0 && entry.producer_epoch != NO_PRODUCER_EPOCH {
                return Err(SequenceViolation::OutOfOrder {
                    producer_id,
                    expected: 0,
                    received: first_seq,
                }
                .into());
            }
        } else {
            let last_seq = entry.last_seq();
            let ok = if last_seq == NO_SEQUENCE {
                first_seq == 0
            } else {
                in_sequence(last_seq, first_seq)
            };
            if !ok {
                return Err(SequenceViolation::OutOfOrder {
                    producer_id,
                    expected: increment_sequence(last_seq.max(-1), 1),
                    received: first_seq,
                }
                .into());
            }
        }
        if !batch.is_transactional() {
            if let Some(txn_first_offset) = entry.current_txn_first_offset {
                return Err(SequenceViolation::InvalidTxnState {
                    producer_id,
                    txn_first_offset,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Last stable offset to record for `completed`: the first offset of the earliest
    /// transaction still open by another producer, or the offset after the marker.
    pub fn last_stable_offset(&self, completed: &CompletedTxn) -> i64 {
        self.ongoing_txns
            .values()
            .find(|t| t.producer_id != completed.producer_id)
            .map_or(completed.last_offset + 1, |t| t.first_offset)
    }

    /// Forget the open transaction `completed` closed. Returns whether it was being tracked.
    pub fn complete_txn(&mut self, completed: &CompletedTxn) -> bool {
        let removed = self.ongoing_txns.remove(&completed.first_offset).is_some();
        if !removed {
            debug!(
                producer_id = completed.producer_id,
                first_offset = completed.first_offset,
                "completed transaction was not tracked as open"
            );
        }
        removed
    }

    /// First offset of the earliest open transaction.
    pub fn first_unstable_offset(&self) -> Option<i64> {
        self.ongoing_txns.keys().next().copied()
    }

    /// Offset up to which state has been applied (exclusive).
    pub fn map_end_offset(&self) -> i64 {
        self.last_map_offset
    }

    /// Record that state has been applied up to `offset` (exclusive).
    pub fn update_map_end_offset(&mut self, offset: i64) {
        self.last_map_offset = offset;
    }

    /// Seed state for a producer, e.g. one whose transaction opened in an earlier segment.
    pub fn load_producer_entry(&mut self, entry: ProducerStateEntry) {
        if let Some(first_offset) = entry.current_txn_first_offset {
            self.ongoing_txns.insert(
                first_offset,
                TxnMetadata {
                    producer_id: entry.producer_id,
                    first_offset,
                },
            );
        }
        self.producers.insert(entry.producer_id, entry);
    }

    /// State of `producer_id`.
    pub fn last_entry(&self, producer_id: i64) -> Option<&ProducerStateEntry> {
        self.producers.get(&producer_id)
    }

    /// Every tracked producer.
    pub fn active_producers(&self) -> &HashMap<i64, ProducerStateEntry> {
        &self.producers
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty() && self.ongoing_txns.is_empty()
    }

    fn snapshot_path(&self, offset: i64) -> String {
        segment_file_path(&self.parent, offset, PRODUCER_SNAPSHOT_FILE_SUFFIX, "")
    }

    /// Offsets of the snapshots on disk, ascending.
    pub fn snapshot_offsets(&self) -> LogResult<Vec<i64>> {
        let mut offsets: Vec<i64> = self
            .snapshots
            .directory()
            .list_dir(&self.parent)?
            .iter()
            .filter(|name| name.ends_with(PRODUCER_SNAPSHOT_FILE_SUFFIX))
            .filter_map(|name| offset_from_file_name(name))
            .collect();
        offsets.sort_unstable();
        Ok(offsets)
    }

    /// Write a snapshot at the map end offset unless one already covers it. Returns the path.
    pub fn take_snapshot(&mut self) -> LogResult<Option<String>> {
        if self.last_map_offset <= self.last_snap_offset {
            return Ok(None);
        }
        let mut entries: Vec<ProducerStateEntry> = self.producers.values().cloned().collect();
        entries.sort_by_key(|e| e.producer_id);
        let path = self.snapshot_path(self.last_map_offset);
        self.snapshots
            .write_postcard(&path, self.last_map_offset, &ProducerSnapshot { entries })?;
        self.last_snap_offset = self.last_map_offset;
        debug!(path = %path, producers = self.producers.len(), "wrote producer snapshot");
        Ok(Some(path))
    }

    /// Replace in-memory state with the newest readable snapshot at or before `offset`.
    ///
    /// Unreadable snapshots are deleted and older ones tried. With no usable snapshot the state
    /// is emptied and the map end offset set to 0. Returns the loaded snapshot offset.
    pub fn load_snapshot_at_or_before(&mut self, offset: i64) -> LogResult<Option<i64>> {
        self.producers.clear();
        self.ongoing_txns.clear();
        for snap_offset in self.snapshot_offsets()?.into_iter().rev() {
            if snap_offset > offset {
                continue;
            }
            let path = self.snapshot_path(snap_offset);
            match self.snapshots.read_postcard::<ProducerSnapshot>(&path) {
                Ok((end_offset, snapshot)) => {
                    for entry in snapshot.entries {
                        self.load_producer_entry(entry);
                    }
                    self.last_map_offset = end_offset;
                    self.last_snap_offset = end_offset;
                    return Ok(Some(end_offset));
                }
                Err(e) if e.is_corruption() || matches!(e, LogError::Decode(_)) || matches!(e, LogError::Io(_)) => {
                    warn!(path = %path, error = %e, "discarding unreadable producer snapshot");
                    self.snapshots.directory().delete(&path)?;
                }
                Err(e) => return Err(e),
            }
        }
        self.last_map_offset = 0;
        self.last_snap_offset = 0;
        Ok(None)
    }

    /// Delete snapshots with an offset below `offset`.
    pub fn delete_snapshots_before(&mut self, offset: i64) -> LogResult<()> {
        for snap_offset in self.snapshot_offsets()? {
            if snap_offset < offset {
                self.snapshots.directory().delete(&self.snapshot_path(snap_offset))?;
            }
        }
        Ok(())
    }

    /// Drop all state and snapshots and restart at `offset`.
    pub fn truncate_fully_and_start_at(&mut self, offset: i64) -> LogResult<()> {
        self.producers.clear();
        self.ongoing_txns.clear();
        self.delete_snapshots_before(i64::MAX)?;
        self.last_map_offset = offset;
        self.last_snap_offset = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RecordBatchBuilder;
    use crate::storage::MemoryDirectory;

    fn tracker() -> ProducerStateTracker {
        ProducerStateTracker::new(MemoryDirectory::new(), "p-0")
    }

    fn data(offset: i64, pid: i64, epoch: i16, seq: i32, n: usize, txn: bool) -> RecordBatch {
        let mut b = RecordBatchBuilder::new(offset);
        b.producer(pid, epoch, seq).transactional(txn);
        for i in 0..n {
            b.append(1_000 + i as i64, None, b"v");
        }
        b.build().unwrap()
    }

    fn marker(offset: i64, pid: i64, epoch: i16, kind: ControlRecordType) -> RecordBatch {
        let mut b = RecordBatchBuilder::new(offset);
        b.producer(pid, epoch, NO_SEQUENCE).control_marker(kind, 2_000, 0);
        b.build().unwrap()
    }

    #[test]
    fn client_sequences_must_be_contiguous() {
        let mut t = tracker();
        t.update(&data(0, 1, 0, 0, 3, false), AppendOrigin::Client).unwrap();
        t.update(&data(3, 1, 0, 3, 2, false), AppendOrigin::Client).unwrap();
        assert_eq!(t.last_entry(1).unwrap().last_seq(), 4);

        let err = t.update(&data(5, 1, 0, 7, 1, false), AppendOrigin::Client).unwrap_err();
        assert!(matches!(
            err,
            LogError::SequenceViolation(SequenceViolation::OutOfOrder { expected: 5, received: 7, .. })
        ));
        assert_eq!(t.last_entry(1).unwrap().last_seq(), 4);
    }

    #[test]
    fn retried_batch_is_a_duplicate() {
        let mut t = tracker();
        let b = data(0, 1, 0, 0, 2, false);
        t.update(&b, AppendOrigin::Client).unwrap();
        let err = t.update(&b, AppendOrigin::Client).unwrap_err();
        assert!(matches!(
            err,
            LogError::SequenceViolation(SequenceViolation::Duplicate { offset: 1, .. })
        ));
    }

    #[test]
    fn only_recent_batches_are_retained() {
        let mut t = tracker();
        for i in 0..8 {
            t.update(&data(i, 1, 0, i as i32, 1, false), AppendOrigin::Client).unwrap();
        }
        let entry = t.last_entry(1).unwrap();
        assert_eq!(entry.batch_metadata.len(), NUM_BATCHES_TO_RETAIN);
        assert_eq!(entry.first_seq(), 3);
    }

    #[test]
    fn stale_epoch_is_fenced_except_during_recovery() {
        let mut t = tracker();
        t.update(&data(0, 1, 2, 0, 1, false), AppendOrigin::Client).unwrap();
        let stale = data(1, 1, 1, 0, 1, false);
        for origin in [AppendOrigin::Client, AppendOrigin::Replication] {
            assert!(matches!(
                t.update(&stale, origin),
                Err(LogError::SequenceViolation(SequenceViolation::Fenced { current_epoch: 2, .. }))
            ));
        }
        t.update(&stale, AppendOrigin::Recovery).unwrap();
    }

    #[test]
    fn epoch_bump_restarts_sequence_at_zero() {
        let mut t = tracker();
        t.update(&data(0, 1, 0, 0, 3, false), AppendOrigin::Client).unwrap();
        assert!(t.update(&data(3, 1, 1, 3, 1, false), AppendOrigin::Client).is_err());
        t.update(&data(3, 1, 1, 0, 1, false), AppendOrigin::Client).unwrap();
        assert_eq!(t.last_entry(1).unwrap().batch_metadata.len(), 1);
    }

    #[test]
    fn replication_skips_sequence_checks() {
        let mut t = tracker();
        t.update(&data(0, 1, 0, 10, 1, false), AppendOrigin::Replication).unwrap();
        t.update(&data(1, 1, 0, 50, 1, false), AppendOrigin::Replication).unwrap();
        assert_eq!(t.last_entry(1).unwrap().last_seq(), 50);
    }

    #[test]
    fn non_transactional_write_inside_open_txn_is_rejected() {
        let mut t = tracker();
        t.update(&data(0, 1, 0, 0, 1, true), AppendOrigin::Client).unwrap();
        assert!(matches!(
            t.update(&data(1, 1, 0, 1, 1, false), AppendOrigin::Client),
            Err(LogError::SequenceViolation(SequenceViolation::InvalidTxnState { txn_first_offset: 0, .. }))
        ));
    }

    #[test]
    fn abort_reports_lso_held_by_other_producers() {
        let mut t = tracker();
        t.update(&data(10, 1, 0, 0, 2, true), AppendOrigin::Client).unwrap();
        t.update(&data(12, 2, 0, 0, 2, true), AppendOrigin::Client).unwrap();
        t.update(&data(14, 1, 0, 2, 1, true), AppendOrigin::Client).unwrap();
        assert_eq!(t.first_unstable_offset(), Some(10));

        let completed = t
            .update(&marker(15, 1, 0, ControlRecordType::Abort), AppendOrigin::Client)
            .unwrap()
            .unwrap();
        assert_eq!(completed.first_offset, 10);
        assert_eq!(completed.last_offset, 15);
        assert!(completed.is_aborted);
        assert_eq!(t.last_stable_offset(&completed), 12);
        assert!(t.complete_txn(&completed));
        assert_eq!(t.first_unstable_offset(), Some(12));
        assert_eq!(t.last_entry(1).unwrap().current_txn_first_offset, None);

        let commit = t
            .update(&marker(16, 2, 0, ControlRecordType::Commit), AppendOrigin::Client)
            .unwrap()
            .unwrap();
        assert!(!commit.is_aborted);
        assert_eq!(t.last_stable_offset(&commit), 17);
        assert!(t.complete_txn(&commit));
        assert_eq!(t.first_unstable_offset(), None);
    }

    #[test]
    fn loaded_entry_carries_open_txn_across_segments() {
        let mut t = tracker();
        let mut entry = ProducerStateEntry::empty(7);
        entry.producer_epoch = 0;
        entry.current_txn_first_offset = Some(3);
        t.load_producer_entry(entry);
        let completed = t
            .update(&marker(120, 7, 0, ControlRecordType::Abort), AppendOrigin::Recovery)
            .unwrap()
            .unwrap();
        assert_eq!(completed.first_offset, 3);
        assert!(t.complete_txn(&completed));
    }

    #[test]
    fn marker_without_open_txn_completes_at_itself() {
        let mut t = tracker();
        let completed = t
            .update(&marker(9, 4, 0, ControlRecordType::Abort), AppendOrigin::Recovery)
            .unwrap()
            .unwrap();
        assert_eq!((completed.first_offset, completed.last_offset), (9, 9));
        assert!(!t.complete_txn(&completed));
    }

    #[test]
    fn snapshot_round_trip_and_fallback() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let mut t = ProducerStateTracker::new(dir.clone(), "p-0");
        t.update(&data(0, 1, 0, 0, 2, true), AppendOrigin::Client).unwrap();
        t.update_map_end_offset(2);
        let first = t.take_snapshot().unwrap().unwrap();
        assert_eq!(first, "p-0/00000000000000000002.snapshot");
        assert_eq!(t.take_snapshot().unwrap(), None);

        t.update(&data(2, 2, 0, 0, 1, false), AppendOrigin::Client).unwrap();
        t.update_map_end_offset(3);
        t.take_snapshot().unwrap().unwrap();
        assert_eq!(t.snapshot_offsets().unwrap(), vec![2, 3]);

        dir.atomic_write("p-0/00000000000000000003.snapshot", b"garbage").unwrap();
        let mut reloaded = ProducerStateTracker::new(dir.clone(), "p-0");
        assert_eq!(reloaded.load_snapshot_at_or_before(10).unwrap(), Some(2));
        assert_eq!(reloaded.map_end_offset(), 2);
        assert_eq!(reloaded.first_unstable_offset(), Some(0));
        assert!(reloaded.last_entry(2).is_none());
        assert_eq!(reloaded.snapshot_offsets().unwrap(), vec![2]);

        reloaded.truncate_fully_and_start_at(50).unwrap();
        assert!(reloaded.is_empty());
        assert_eq!(reloaded.map_end_offset(), 50);
        assert!(reloaded.snapshot_offsets().unwrap().is_empty());
    }
}
