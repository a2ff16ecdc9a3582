//! A log segment: one record store plus its offset, time and transaction indexes.
//!
//! All four files share the stem `{base_offset:020}` and differ by suffix. The offset and
//! time indexes are opened lazily, so a segment that is never searched never creates them.
//!
//! ## Public invariants
//!
//! - **Relative offsets**: every offset stored in the segment fits `i32` relative to the base
//!   offset. `append` checks this before writing anything.
//! - **Ordering**: state derived from an append (index samples, next offset, max timestamp)
//!   only moves after the record store accepted the bytes.
//! - **Recovery**: a scan stops at the first batch that fails structural or checksum
//!   validation and truncates the store there. Bytes past corruption are never kept.
//! - **Concurrency**: mutation takes `&mut self`; reads take `&self` and may run concurrently
//!   with each other. Lazily derived values sit behind a `parking_lot::Mutex`.

use crate::batch::{complete_batches_prefix, MemoryRecords, RecordBatch};
use crate::config::{RollParams, SegmentConfig};
use crate::epochcache::LeaderEpochCache;
use crate::error::{LogError, LogResult};
use crate::filerecords::{FileBatch, FileRecords, LogOffsetPosition, TimestampAndOffset};
use crate::formats::{
    segment_file_path, replace_suffix, INDEX_FILE_SUFFIX, LOG_FILE_SUFFIX, NO_TIMESTAMP,
    TIME_INDEX_FILE_SUFFIX, TXN_INDEX_FILE_SUFFIX,
};
use crate::offsetindex::{OffsetIndex, OffsetIndexEntry};
use crate::producerstate::{AppendOrigin, CompletedTxn, ProducerStateTracker};
use crate::sparseindex::{can_convert_to_relative_offset, relative_offset, LazyIndex};
use crate::storage::Directory;
use crate::time::Time;
use crate::timeindex::{TimeIndex, TimeIndexEntry, TimestampOffset};
use crate::txnindex::{AbortedTxn, TransactionIndex, TxnIndexSearchResult};
use parking_lot::{MappedMutexGuard, Mutex};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on the bytes moved per append by [`Segment::append_from_file`].
pub const APPEND_FROM_FILE_CHUNK_BYTES: usize = 1024 * 1024;

/// Where a fetch started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOffsetMetadata {
    /// Offset the caller asked for.
    pub message_offset: i64,
    /// Base offset of the segment serving the fetch.
    pub segment_base_offset: i64,
    /// Byte position of the batch holding `message_offset`.
    pub relative_position_in_segment: u64,
}

/// Result of [`Segment::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchDataInfo {
    /// Where the fetch started.
    pub fetch_offset_metadata: LogOffsetMetadata,
    /// Whole batches starting at the fetch position. May be empty.
    pub records: MemoryRecords,
    /// Whether the first batch did not fit in the requested size.
    pub first_entry_incomplete: bool,
}

#[derive(Debug, Default)]
struct DerivedState {
    // Max timestamp of the first batch, used for roll-by-age.
    rolling_based_timestamp: Option<i64>,
    max_timestamp_and_offset_so_far: Option<TimestampOffset>,
    next_offset: Option<i64>,
}

/// One segment of a partition log.
pub struct Segment {
    dir: Arc<dyn Directory>,
    base_offset: i64,
    log: FileRecords,
    offset_index: LazyIndex<OffsetIndexEntry>,
    time_index: LazyIndex<TimeIndexEntry>,
    txn_index: TransactionIndex,
    index_interval_bytes: u32,
    max_index_size: u32,
    rolling_jitter_ms: i64,
    time: Arc<dyn Time>,
    created: i64,
    bytes_since_last_index_entry: u32,
    derived: Mutex<DerivedState>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("base_offset", &self.base_offset)
            .field("path", &self.log.path())
            .field("size", &self.log.size_in_bytes())
            .field("created", &self.created)
            .finish()
    }
}

/// Base offset and length sit outside the batch checksum, so a damaged header can still
/// pass `ensure_valid`. A batch that starts before `expected_offset` or whose last offset
/// does not fit the segment is treated as corrupt.
fn ensure_follows(base_offset: i64, expected_offset: i64, batch: &RecordBatch, position: u64) -> LogResult<()> {
    if batch.base_offset() < expected_offset {
        return Err(LogError::CorruptRecord {
            position,
            reason: format!(
                "batch base offset {} precedes expected offset {expected_offset}",
                batch.base_offset()
            ),
        });
    }
    if !can_convert_to_relative_offset(base_offset, batch.last_offset()) {
        return Err(LogError::CorruptRecord {
            position,
            reason: format!(
                "last offset {} does not fit segment base {base_offset}",
                batch.last_offset()
            ),
        });
    }
    Ok(())
}

fn maybe_assign_epoch(
    cache: &mut dyn LeaderEpochCache,
    partition_leader_epoch: i32,
    base_offset: i64,
) -> LogResult<()> {
    if partition_leader_epoch >= 0
        && cache
            .latest_epoch()
            .map_or(true, |latest| partition_leader_epoch > latest)
    {
        cache.append(partition_leader_epoch, base_offset)?;
    }
    Ok(())
}

impl Segment {
    /// Open the segment starting at `base_offset` under `parent`.
    ///
    /// The record store is created (and preallocated when configured) if missing. Index files
    /// are only touched on first use. `file_suffix` is appended to every file name, e.g.
    /// [`SWAP_FILE_SUFFIX`](crate::formats::SWAP_FILE_SUFFIX) or `""`.
    pub fn open(
        dir: impl Into<Arc<dyn Directory>>,
        parent: &str,
        base_offset: i64,
        config: &SegmentConfig,
        time: Arc<dyn Time>,
        file_suffix: &str,
    ) -> LogResult<Self> {
        config.validate()?;
        if base_offset < 0 {
            return Err(LogError::InvalidOffset(format!(
                "segment base offset {base_offset} is negative"
            )));
        }
        let dir = dir.into();
        let path = |kind: &str| segment_file_path(parent, base_offset, kind, file_suffix);
        let log = FileRecords::open(
            dir.clone(),
            path(LOG_FILE_SUFFIX),
            config.preallocation_size(),
        )?;
        let offset_index = LazyIndex::new(
            dir.clone(),
            path(INDEX_FILE_SUFFIX),
            base_offset,
            config.max_index_size,
        );
        let time_index = LazyIndex::new(
            dir.clone(),
            path(TIME_INDEX_FILE_SUFFIX),
            base_offset,
            config.max_index_size,
        );
        let txn_index = TransactionIndex::new(dir.clone(), path(TXN_INDEX_FILE_SUFFIX), base_offset);
        let created = time.milliseconds();
        debug!(base_offset, path = %log.path(), size = log.size_in_bytes(), "opened segment");
        Ok(Self {
            dir,
            base_offset,
            log,
            offset_index,
            time_index,
            txn_index,
            index_interval_bytes: config.index_interval_bytes,
            max_index_size: config.max_index_size,
            rolling_jitter_ms: config.segment_jitter_ms,
            time,
            created,
            bytes_since_last_index_entry: 0,
            derived: Mutex::new(DerivedState::default()),
        })
    }

    /// First offset this segment may hold.
    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// Record store size in bytes.
    pub fn size(&self) -> u64 {
        self.log.size_in_bytes()
    }

    /// The record store.
    pub fn log(&self) -> &FileRecords {
        &self.log
    }

    /// The offset index, opening it if needed.
    pub fn offset_index(&self) -> LogResult<MappedMutexGuard<'_, OffsetIndex>> {
        self.offset_index.get()
    }

    /// The time index, opening it if needed.
    pub fn time_index(&self) -> LogResult<MappedMutexGuard<'_, TimeIndex>> {
        self.time_index.get()
    }

    /// The transaction index.
    pub fn txn_index(&self) -> &TransactionIndex {
        &self.txn_index
    }

    /// Creation time in milliseconds, reset when the segment is truncated to empty.
    pub fn created(&self) -> i64 {
        self.created
    }

    /// Whether `offset` can be stored relative to the base offset.
    pub fn can_convert_to_relative_offset(&self, offset: i64) -> bool {
        can_convert_to_relative_offset(self.base_offset, offset)
    }

    /// Append `records`, whose largest offset is `largest_offset` and whose max timestamp
    /// `largest_timestamp` sits at `shallow_offset_of_max_timestamp`.
    ///
    /// Fails with [`LogError::OffsetOverflow`] before writing when `largest_offset`, or any
    /// batch's base offset, does not fit relative to the base offset, or when a batch ends
    /// past `largest_offset`. When a cache is passed, every batch carrying a newer
    /// partition leader epoch extends it.
    pub fn append(
        &mut self,
        largest_offset: i64,
        largest_timestamp: i64,
        shallow_offset_of_max_timestamp: i64,
        records: &MemoryRecords,
        leader_epoch_cache: Option<&mut dyn LeaderEpochCache>,
    ) -> LogResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        relative_offset(self.base_offset, largest_offset)?;
        let headers = records.batch_headers()?;
        for header in &headers {
            relative_offset(self.base_offset, header.base_offset)?;
            if header.last_offset() > largest_offset {
                return Err(LogError::OffsetOverflow {
                    base_offset: self.base_offset,
                    offset: header.last_offset(),
                });
            }
        }
        let physical_position = self.log.size_in_bytes();
        let appended = self.log.append(records)?;

        if physical_position == 0 {
            self.derived.get_mut().rolling_based_timestamp = Some(largest_timestamp);
        }
        let so_far = self.load_max_timestamp_mut()?;
        if largest_timestamp > so_far.timestamp {
            self.derived.get_mut().max_timestamp_and_offset_so_far = Some(TimestampOffset {
                timestamp: largest_timestamp,
                offset: shallow_offset_of_max_timestamp,
            });
        }
        if self.bytes_since_last_index_entry > self.index_interval_bytes {
            self.offset_index
                .get_mut()?
                .maybe_append(largest_offset, physical_position)?;
            let max = self.load_max_timestamp_mut()?;
            self.time_index
                .get_mut()?
                .maybe_append(max.timestamp, max.offset, false)?;
            self.bytes_since_last_index_entry = 0;
        }
        self.bytes_since_last_index_entry = self
            .bytes_since_last_index_entry
            .saturating_add(u32::try_from(appended).unwrap_or(u32::MAX));
        self.derived.get_mut().next_offset = Some(largest_offset + 1);

        if let Some(cache) = leader_epoch_cache {
            for header in &headers {
                maybe_assign_epoch(cache, header.partition_leader_epoch, header.base_offset)?;
            }
        }
        Ok(())
    }

    /// Copy whole batches from `source`, starting at `start_position`, to the end of this
    /// segment. Stops at the end of `source` or at the first batch whose offsets cannot be
    /// stored relative to this segment. Returns the number of bytes copied.
    pub fn append_from_file(&mut self, source: &FileRecords, start_position: u64) -> LogResult<u64> {
        let mut position = start_position;
        let mut copied = 0u64;
        loop {
            let mut chunk = 0usize;
            let mut max_offset = None;
            let mut max_timestamp = NO_TIMESTAMP;
            let mut offset_of_max_timestamp = -1;
            let mut scan = position;
            while let Some(header) = source.read_header_at(scan)? {
                let size = header.size_in_bytes();
                if !self.can_convert_to_relative_offset(header.base_offset)
                    || !self.can_convert_to_relative_offset(header.last_offset())
                    || (chunk > 0 && chunk + size > APPEND_FROM_FILE_CHUNK_BYTES)
                {
                    break;
                }
                if header.max_timestamp > max_timestamp {
                    max_timestamp = header.max_timestamp;
                    offset_of_max_timestamp = header.last_offset();
                }
                max_offset = Some(header.last_offset());
                chunk += size;
                scan += size as u64;
            }
            let Some(max_offset) = max_offset else {
                break;
            };
            let records = source.read(position, chunk)?;
            self.append(max_offset, max_timestamp, offset_of_max_timestamp, &records, None)?;
            position += chunk as u64;
            copied += chunk as u64;
        }
        debug!(
            base_offset = self.base_offset,
            source = %source.path(),
            copied,
            "appended from file"
        );
        Ok(copied)
    }

    /// Locate the batch holding `offset`, scanning forward from the offset index hint and never
    /// before `starting_position`.
    pub fn translate_offset(
        &self,
        offset: i64,
        starting_position: u64,
    ) -> LogResult<Option<LogOffsetPosition>> {
        let hint = self.offset_index.get()?.lookup(offset);
        self.log
            .search_for_offset_with_size(offset, hint.position.max(starting_position))
    }

    /// Read whole batches starting with the one holding `start_offset`.
    ///
    /// Returns `None` when no batch holds `start_offset` or beyond, or when that batch starts at
    /// or past `max_position` (the end of the store by default). With `min_one_message` the
    /// first batch is returned whole even when it exceeds `max_size`.
    pub fn read(
        &self,
        start_offset: i64,
        max_size: usize,
        max_position: Option<u64>,
        min_one_message: bool,
    ) -> LogResult<Option<FetchDataInfo>> {
        let Some(start) = self.translate_offset(start_offset, 0)? else {
            return Ok(None);
        };
        let end = self.log.size_in_bytes();
        let max_position = max_position.map_or(end, |p| p.min(end));
        if start.position >= max_position {
            return Ok(None);
        }
        let fetch_offset_metadata = LogOffsetMetadata {
            message_offset: start_offset,
            segment_base_offset: self.base_offset,
            relative_position_in_segment: start.position,
        };
        let adjusted_max_size = if min_one_message {
            max_size.max(start.size)
        } else {
            max_size
        };
        let first_entry_incomplete = adjusted_max_size < start.size;
        if adjusted_max_size == 0 {
            return Ok(Some(FetchDataInfo {
                fetch_offset_metadata,
                records: MemoryRecords::empty(),
                first_entry_incomplete,
            }));
        }
        let window = usize::try_from(max_position - start.position)
            .unwrap_or(usize::MAX)
            .min(adjusted_max_size);
        let mut bytes = self.log.read(start.position, window)?.into_bytes();
        bytes.truncate(complete_batches_prefix(&bytes));
        Ok(Some(FetchDataInfo {
            fetch_offset_metadata,
            records: MemoryRecords::from_bytes(bytes),
            first_entry_incomplete,
        }))
    }

    /// First record at or after `starting_offset` with a timestamp `>= timestamp`.
    pub fn find_offset_by_timestamp(
        &self,
        timestamp: i64,
        starting_offset: i64,
    ) -> LogResult<Option<TimestampAndOffset>> {
        let hint = self.time_index.get()?.lookup(timestamp);
        let position = self
            .offset_index
            .get()?
            .lookup(hint.offset.max(starting_offset))
            .position;
        self.log
            .search_for_timestamp(timestamp, position, starting_offset)
    }

    /// Remove every batch whose last offset is `>= offset`, together with the index entries
    /// and aborted transactions at or past it. Returns the number of record bytes removed.
    pub fn truncate_to(&mut self, offset: i64) -> LogResult<u64> {
        let mapping = self.translate_offset(offset, 0)?;
        self.offset_index.get_mut()?.truncate_to(offset)?;
        self.time_index.get_mut()?.truncate_to(offset)?;
        self.txn_index.truncate_to(offset)?;
        self.offset_index.get_mut()?.resize(self.max_index_size)?;
        self.time_index.get_mut()?.resize(self.max_index_size)?;

        let bytes_truncated = match mapping {
            Some(m) => self.log.truncate_to(m.position)?,
            None => 0,
        };
        let derived = self.derived.get_mut();
        if self.log.size_in_bytes() == 0 {
            self.created = self.time.milliseconds();
            derived.rolling_based_timestamp = None;
        }
        derived.next_offset = None;
        self.bytes_since_last_index_entry = 0;
        self.load_largest_timestamp()?;
        debug!(base_offset = self.base_offset, offset, bytes_truncated, "truncated segment");
        Ok(bytes_truncated)
    }

    fn load_largest_timestamp(&mut self) -> LogResult<()> {
        let last = self.time_index.get_mut()?.last_timestamp_offset();
        let position = self.offset_index.get_mut()?.lookup(last.offset).position;
        let after = self.log.largest_timestamp_after(position)?;
        let max = if after.timestamp > last.timestamp {
            TimestampOffset {
                timestamp: after.timestamp,
                offset: after.offset,
            }
        } else {
            last
        };
        self.derived.get_mut().max_timestamp_and_offset_so_far = Some(max);
        Ok(())
    }

    /// Rebuild the indexes and producer state from the record store.
    ///
    /// Every valid batch is re-indexed the way [`append`](Self::append) would have indexed
    /// it, fed to `producer_state` and, when given, to `leader_epoch_cache`. The store is
    /// truncated at the first corrupt batch, including one whose offsets go backwards or fall
    /// outside the segment. Returns the number of bytes truncated.
    pub fn recover(
        &mut self,
        producer_state: &mut ProducerStateTracker,
        mut leader_epoch_cache: Option<&mut dyn LeaderEpochCache>,
    ) -> LogResult<u64> {
        self.offset_index.get_mut()?.reset()?;
        self.time_index.get_mut()?.reset()?;
        self.txn_index.reset()?;

        let mut valid_bytes = 0u64;
        let mut last_index_entry = 0u64;
        let mut max = TimestampOffset {
            timestamp: NO_TIMESTAMP,
            offset: self.base_offset,
        };
        let mut next_offset = self.base_offset;
        let base_offset = self.base_offset;

        for item in self.log.batches_from(0) {
            let checked = item.and_then(|FileBatch { batch, position }| {
                batch.ensure_valid()?;
                ensure_follows(base_offset, next_offset, &batch, position)?;
                Ok(batch)
            });
            let batch = match checked {
                Ok(batch) => batch,
                Err(e) if e.is_corruption() => {
                    warn!(
                        base_offset = self.base_offset,
                        position = valid_bytes,
                        error = %e,
                        "found invalid batch during segment recovery"
                    );
                    break;
                }
                Err(e) => return Err(e),
            };

            if batch.max_timestamp() > max.timestamp {
                max = TimestampOffset {
                    timestamp: batch.max_timestamp(),
                    offset: batch.last_offset(),
                };
            }
            if valid_bytes - last_index_entry > u64::from(self.index_interval_bytes) {
                self.offset_index
                    .get_mut()?
                    .maybe_append(batch.last_offset(), valid_bytes)?;
                self.time_index
                    .get_mut()?
                    .maybe_append(max.timestamp, max.offset, false)?;
                last_index_entry = valid_bytes;
            }
            valid_bytes += batch.size_in_bytes() as u64;
            next_offset = batch.next_offset();

            if let Some(cache) = leader_epoch_cache.as_deref_mut() {
                maybe_assign_epoch(cache, batch.partition_leader_epoch(), batch.base_offset())?;
            }
            if let Some(completed) = producer_state.update(&batch, AppendOrigin::Recovery)? {
                let last_stable_offset = producer_state.last_stable_offset(&completed);
                if completed.is_aborted {
                    self.txn_index
                        .append(aborted_txn(&completed, last_stable_offset))?;
                }
                producer_state.complete_txn(&completed);
            }
            producer_state.update_map_end_offset(batch.next_offset());
        }

        let truncated = self.log.size_in_bytes() - valid_bytes;
        if truncated > 0 {
            info!(
                base_offset = self.base_offset,
                valid_bytes,
                truncated,
                "truncating segment after recovery"
            );
        }
        self.log.truncate_to(valid_bytes)?;
        self.time_index
            .get_mut()?
            .maybe_append(max.timestamp, max.offset, true)?;

        let derived = self.derived.get_mut();
        derived.max_timestamp_and_offset_so_far = Some(max);
        derived.next_offset = Some(next_offset);
        derived.rolling_based_timestamp = None;
        self.bytes_since_last_index_entry =
            u32::try_from(valid_bytes - last_index_entry).unwrap_or(u32::MAX);
        Ok(truncated)
    }

    /// Record an aborted transaction closed in this segment.
    pub fn update_txn_index(&mut self, completed: &CompletedTxn, last_stable_offset: i64) -> LogResult<()> {
        if completed.is_aborted {
            debug!(
                producer_id = completed.producer_id,
                first_offset = completed.first_offset,
                last_offset = completed.last_offset,
                "indexing aborted transaction"
            );
            self.txn_index
                .append(aborted_txn(completed, last_stable_offset))?;
        }
        Ok(())
    }

    /// Aborted transactions in this segment overlapping `[fetch_offset, upper_bound_offset)`.
    pub fn collect_aborted_txns(
        &self,
        fetch_offset: i64,
        upper_bound_offset: i64,
    ) -> LogResult<TxnIndexSearchResult> {
        self.txn_index
            .collect_aborted_txns(fetch_offset, upper_bound_offset)
    }

    /// Whether the next append should go to a new segment.
    pub fn should_roll(&self, params: &RollParams) -> LogResult<bool> {
        let reached_roll_ms = self
            .time_waited_for_roll(params.now, params.max_timestamp_in_messages)?
            > params.max_segment_ms - self.rolling_jitter_ms;
        let size = self.log.size_in_bytes() as i64;
        Ok(
            size > i64::from(params.max_segment_bytes) - i64::from(params.messages_size)
                || (size > 0 && reached_roll_ms)
                || self.offset_index.get()?.is_full()
                || self.time_index.get()?.is_full()
                || !self.can_convert_to_relative_offset(params.max_offset_in_messages),
        )
    }

    /// Age of the segment for roll purposes.
    ///
    /// Measured from the first batch's timestamp to `message_timestamp` when the first batch
    /// carries a timestamp, else from the creation time to `now`.
    pub fn time_waited_for_roll(&self, now: i64, message_timestamp: i64) -> LogResult<i64> {
        Ok(match self.load_first_batch_timestamp()? {
            Some(first) if first >= 0 => message_timestamp - first,
            _ => now - self.created,
        })
    }

    /// Max timestamp of the first batch, or `i64::MAX` for an empty segment.
    pub fn get_first_batch_timestamp(&self) -> LogResult<i64> {
        Ok(self.load_first_batch_timestamp()?.unwrap_or(i64::MAX))
    }

    fn load_first_batch_timestamp(&self) -> LogResult<Option<i64>> {
        if let Some(ts) = self.derived.lock().rolling_based_timestamp {
            return Ok(Some(ts));
        }
        let first = self.log.read_header_at(0)?.map(|h| h.max_timestamp);
        if first.is_some() {
            self.derived.lock().rolling_based_timestamp = first;
        }
        Ok(first)
    }

    fn load_max_timestamp_mut(&mut self) -> LogResult<TimestampOffset> {
        let derived = self.derived.get_mut();
        if let Some(max) = derived.max_timestamp_and_offset_so_far {
            return Ok(max);
        }
        let loaded = self.time_index.get_mut()?.last_timestamp_offset();
        derived.max_timestamp_and_offset_so_far = Some(loaded);
        Ok(loaded)
    }

    fn max_timestamp_and_offset_so_far(&self) -> LogResult<TimestampOffset> {
        if let Some(max) = self.derived.lock().max_timestamp_and_offset_so_far {
            return Ok(max);
        }
        let loaded = self.time_index.get()?.last_timestamp_offset();
        Ok(*self
            .derived
            .lock()
            .max_timestamp_and_offset_so_far
            .get_or_insert(loaded))
    }

    /// Largest timestamp appended so far, or [`NO_TIMESTAMP`].
    pub fn max_timestamp_so_far(&self) -> LogResult<i64> {
        Ok(self.max_timestamp_and_offset_so_far()?.timestamp)
    }

    /// Offset of the batch carrying [`max_timestamp_so_far`](Self::max_timestamp_so_far).
    pub fn shallow_offset_of_max_timestamp_so_far(&self) -> LogResult<i64> {
        Ok(self.max_timestamp_and_offset_so_far()?.offset)
    }

    /// Largest timestamp in the segment, or [`NO_TIMESTAMP`] when no batch carries one.
    pub fn largest_timestamp(&self) -> LogResult<i64> {
        self.max_timestamp_so_far()
    }

    /// Offset the next append would start at.
    pub fn read_next_offset(&self) -> LogResult<i64> {
        if let Some(next) = self.derived.lock().next_offset {
            return Ok(next);
        }
        let mut position = {
            let index = self.offset_index.get()?;
            index.lookup(index.last_offset()).position
        };
        let mut next = self.base_offset;
        while let Some(header) = self.log.read_header_at(position)? {
            next = header.next_offset();
            position += header.size_in_bytes() as u64;
        }
        self.derived.lock().next_offset = Some(next);
        Ok(next)
    }

    /// Whether the segment holds an offset that does not fit relative to its base.
    pub fn has_overflow(&self) -> LogResult<bool> {
        let next = self.read_next_offset()?;
        Ok(next > self.base_offset && !self.can_convert_to_relative_offset(next - 1))
    }

    /// Validate the index files against their structural rules.
    pub fn sanity_check(&self) -> LogResult<()> {
        if !self.dir.exists(self.log.path()) {
            return Err(LogError::NotFound(self.log.path().to_string()));
        }
        self.offset_index.get()?.sanity_check()?;
        self.time_index.get()?.sanity_check()?;
        self.txn_index.sanity_check()
    }

    /// Rename every file from `old_suffix` to `new_suffix`. Index files that do not exist yet
    /// are not created.
    pub fn change_file_suffixes(&mut self, old_suffix: &str, new_suffix: &str) -> LogResult<()> {
        let renamed = |path: &str| {
            replace_suffix(path, old_suffix, new_suffix).ok_or_else(|| {
                LogError::InvalidState(format!("{path} does not end with {old_suffix:?}"))
            })
        };
        let log_path = renamed(self.log.path())?;
        let offset_index_path = renamed(&self.offset_index.path())?;
        let time_index_path = renamed(&self.time_index.path())?;
        let txn_index_path = renamed(self.txn_index.path())?;

        self.log.rename_to(log_path)?;
        self.offset_index.rename_to(offset_index_path)?;
        self.time_index.rename_to(time_index_path)?;
        self.txn_index.rename_to(txn_index_path)?;
        debug!(
            base_offset = self.base_offset,
            old_suffix,
            new_suffix,
            "changed segment file suffixes"
        );
        Ok(())
    }

    /// Resize both sparse indexes to `size` bytes.
    pub fn resize_indexes(&mut self, size: u32) -> LogResult<()> {
        self.offset_index.get_mut()?.resize(size)?;
        self.time_index.get_mut()?.resize(size)?;
        Ok(())
    }

    /// Seal the segment once a newer one takes appends: write the final time index entry and
    /// trim every file to its content.
    pub fn on_became_inactive_segment(&mut self) -> LogResult<()> {
        let max = self.load_max_timestamp_mut()?;
        self.time_index
            .get_mut()?
            .maybe_append(max.timestamp, max.offset, true)?;
        self.offset_index.get_mut()?.trim_to_valid_size()?;
        self.time_index.get_mut()?.trim_to_valid_size()?;
        self.log.trim()
    }

    /// Flush every file.
    pub fn flush(&mut self) -> LogResult<()> {
        self.log.flush()?;
        if self.offset_index.is_loaded() {
            self.offset_index.get_mut()?.flush()?;
        }
        if self.time_index.is_loaded() {
            self.time_index.get_mut()?.flush()?;
        }
        self.txn_index.flush()
    }

    /// Write the final time index entry, then trim and close every file.
    pub fn close(&mut self) -> LogResult<()> {
        if let Some(max) = self.derived.get_mut().max_timestamp_and_offset_so_far {
            if max.timestamp != NO_TIMESTAMP {
                self.time_index
                    .get_mut()?
                    .maybe_append(max.timestamp, max.offset, true)?;
            }
        }
        self.offset_index.close()?;
        self.time_index.close()?;
        self.log.close()?;
        self.txn_index.close();
        Ok(())
    }

    /// Drop open index handles without trimming.
    pub fn close_handlers(&mut self) {
        self.offset_index.close_handler();
        self.time_index.close_handler();
        self.txn_index.close();
    }

    /// Delete every file of the segment.
    pub fn delete_if_exists(&mut self) -> LogResult<()> {
        self.log.delete_if_exists()?;
        self.offset_index.delete_if_exists()?;
        self.time_index.delete_if_exists()?;
        self.txn_index.delete_if_exists()?;
        debug!(base_offset = self.base_offset, "deleted segment files");
        Ok(())
    }
}

fn aborted_txn(completed: &CompletedTxn, last_stable_offset: i64) -> AbortedTxn {
    AbortedTxn {
        producer_id: completed.producer_id,
        first_offset: completed.first_offset,
        last_offset: completed.last_offset,
        last_stable_offset,
        last_update_time: completed.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{ControlRecordType, RecordBatchBuilder};
    use crate::epochcache::{EpochEntry, MemoryLeaderEpochCache};
    use crate::formats::DELETED_FILE_SUFFIX;
    use crate::storage::MemoryDirectory;
    use crate::time::MockTime;

    fn config() -> SegmentConfig {
        SegmentConfig {
            index_interval_bytes: 10,
            max_index_size: 1000,
            ..SegmentConfig::default()
        }
    }

    fn segment(dir: &Arc<dyn Directory>, base: i64, time: &MockTime) -> Segment {
        Segment::open(dir.clone(), "p-0", base, &config(), Arc::new(time.clone()), "").unwrap()
    }

    fn records(base: i64, ts: i64, values: &[&str]) -> RecordBatch {
        let mut b = RecordBatchBuilder::new(base);
        for v in values {
            b.append(ts, None, v.as_bytes());
        }
        b.build().unwrap()
    }

    fn append(seg: &mut Segment, batch: &RecordBatch) {
        let mem = MemoryRecords::with_batches([batch]);
        seg.append(batch.last_offset(), batch.max_timestamp(), batch.last_offset(), &mem, None)
            .unwrap();
    }

    fn values(info: &FetchDataInfo) -> Vec<String> {
        info.records
            .batches()
            .unwrap()
            .iter()
            .flat_map(|b| b.records().unwrap())
            .map(|r| String::from_utf8(r.value.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn read_floors_then_scans_forward() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 40, &time);
        append(&mut seg, &records(50, 0, &["hello", "there"]));

        let read = seg.read(41, 300, None, false).unwrap().unwrap();
        assert_eq!(read.records.batches().unwrap()[0].base_offset(), 50);
        assert_eq!(values(&read), vec!["hello", "there"]);
        assert_eq!(read.fetch_offset_metadata.segment_base_offset, 40);
        assert_eq!(read.fetch_offset_metadata.relative_position_in_segment, 0);

        assert!(seg.read(52, 200, None, false).unwrap().is_none());
        assert_eq!(seg.read_next_offset().unwrap(), 52);
    }

    #[test]
    fn read_honours_max_size_and_min_one_message() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 0, &time);
        let first = records(0, 0, &["a", "b"]);
        append(&mut seg, &first);
        append(&mut seg, &records(2, 0, &["c"]));

        let tiny = seg.read(0, 5, None, false).unwrap().unwrap();
        assert!(tiny.records.is_empty());
        assert!(tiny.first_entry_incomplete);

        let one = seg.read(0, 5, None, true).unwrap().unwrap();
        assert_eq!(values(&one), vec!["a", "b"]);
        assert!(!one.first_entry_incomplete);

        let capped = seg
            .read(0, 10_000, Some(first.size_in_bytes() as u64), false)
            .unwrap()
            .unwrap();
        assert_eq!(values(&capped), vec!["a", "b"]);
        assert!(seg
            .read(2, 10_000, Some(first.size_in_bytes() as u64), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn append_rejects_overflow_before_writing() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 100, &time);
        let batch = records(99, 0, &["x"]);
        let mem = MemoryRecords::with_batches([&batch]);
        let err = seg.append(99, 0, 99, &mem, None).unwrap_err();
        assert!(matches!(err, LogError::OffsetOverflow { .. }));

        let far = 100 + i64::from(i32::MAX) + 1;
        let err = seg.append(far, 0, far, &mem, None).unwrap_err();
        assert!(matches!(err, LogError::OffsetOverflow { .. }));
        assert_eq!(seg.size(), 0);
        assert_eq!(seg.read_next_offset().unwrap(), 100);
    }

    #[test]
    fn append_checks_every_batch_against_the_segment() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 100, &time);

        // Starts below the base offset even though the largest offset fits.
        let straddling = records(99, 0, &["a", "b", "c"]);
        let mem = MemoryRecords::with_batches([&straddling]);
        let err = seg.append(101, 0, 101, &mem, None).unwrap_err();
        assert!(matches!(err, LogError::OffsetOverflow { offset: 99, .. }));

        // Ends past the largest offset the caller claims.
        let long = records(100, 0, &["a", "b", "c"]);
        let mem = MemoryRecords::with_batches([&long]);
        let err = seg.append(101, 0, 101, &mem, None).unwrap_err();
        assert!(matches!(err, LogError::OffsetOverflow { offset: 102, .. }));

        assert_eq!(seg.size(), 0);
        assert_eq!(seg.read_next_offset().unwrap(), 100);
        seg.append(102, 0, 102, &mem, None).unwrap();
        assert_eq!(seg.read_next_offset().unwrap(), 103);
    }

    #[test]
    fn find_offset_by_timestamp_uses_record_timestamps() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 40, &time);
        for i in 0..10 {
            append(&mut seg, &records(40 + i, 400 + 10 * i, &["v"]));
        }
        let found = seg.find_offset_by_timestamp(430, 0).unwrap().unwrap();
        assert_eq!(found.offset, 43);
        assert_eq!(found.timestamp, 430);
        assert!(seg.find_offset_by_timestamp(491, 0).unwrap().is_none());
        assert_eq!(seg.largest_timestamp().unwrap(), 490);
        assert_eq!(seg.shallow_offset_of_max_timestamp_so_far().unwrap(), 49);
    }

    #[test]
    fn truncate_drops_data_and_allows_reappend() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 40, &time);
        for i in 0..6 {
            append(&mut seg, &records(40 + i * 2, 100 + i, &["a", "b"]));
        }
        let removed = seg.truncate_to(46).unwrap();
        assert!(removed > 0);
        assert_eq!(seg.read_next_offset().unwrap(), 46);
        assert!(seg.read(46, 1000, None, false).unwrap().is_none());
        assert_eq!(seg.largest_timestamp().unwrap(), 102);

        append(&mut seg, &records(46, 200, &["c"]));
        let read = seg.read(46, 1000, None, false).unwrap().unwrap();
        assert_eq!(values(&read), vec!["c"]);
    }

    #[test]
    fn truncate_to_empty_restarts_age_and_index_capacity() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(1_000);
        let cfg = SegmentConfig {
            index_interval_bytes: 0,
            max_index_size: 24,
            segment_ms: 100,
            ..SegmentConfig::default()
        };
        let mut seg = Segment::open(dir, "", 0, &cfg, Arc::new(time.clone()), "").unwrap();
        // Appends after the first are each sampled; three fill the offset index.
        for i in 0..4 {
            append(&mut seg, &records(i, -1, &["v"]));
        }
        assert!(seg.offset_index().unwrap().is_full());
        time.sleep(500);
        let params = RollParams::new(&cfg, -1, 5, 10, time.milliseconds());
        assert!(seg.should_roll(&params).unwrap());

        seg.truncate_to(0).unwrap();
        assert_eq!(seg.size(), 0);
        assert_eq!(seg.created(), 1_500);
        assert!(!seg.offset_index().unwrap().is_full());
        assert!(!seg.time_index().unwrap().is_full());
        assert!(!seg.should_roll(&params).unwrap());
    }

    #[test]
    fn roll_by_age_uses_first_batch_timestamp() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(10_000);
        let cfg = SegmentConfig {
            segment_ms: 1_000,
            ..config()
        };
        let mut seg = Segment::open(dir, "", 0, &cfg, Arc::new(time.clone()), "").unwrap();
        // Empty segments never roll by age.
        let stale = RollParams::new(&cfg, 50_000, 0, 10, 50_000);
        assert!(!seg.should_roll(&stale).unwrap());

        append(&mut seg, &records(0, 2_000, &["v"]));
        assert_eq!(seg.get_first_batch_timestamp().unwrap(), 2_000);
        assert_eq!(seg.time_waited_for_roll(10_000, 2_500).unwrap(), 500);
        assert!(!seg
            .should_roll(&RollParams::new(&cfg, 2_500, 1, 10, 10_000))
            .unwrap());
        assert!(seg
            .should_roll(&RollParams::new(&cfg, 3_001, 1, 10, 10_000))
            .unwrap());
        assert!(seg
            .should_roll(&RollParams::new(&cfg, 2_500, i64::from(i32::MAX) + 1, 10, 10_000))
            .unwrap());
    }

    #[test]
    fn roll_by_size() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 0, &time);
        let batch = records(0, 0, &["payload"]);
        append(&mut seg, &batch);
        let size = batch.size_in_bytes() as u32;
        let params = |max: u32| RollParams {
            max_segment_bytes: max,
            ..RollParams::new(&config(), 0, 1, size, 0)
        };
        assert!(!seg.should_roll(&params(2 * size)).unwrap());
        assert!(seg.should_roll(&params(2 * size - 1)).unwrap());
    }

    #[test]
    fn recover_rebuilds_indexes_and_truncates_corrupt_tail() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 0, &time);
        for i in 0..10 {
            append(&mut seg, &records(i, 100 + i, &["v"]));
        }
        let entries_before = seg.offset_index().unwrap().entries().to_vec();
        let size = seg.size();
        seg.close().unwrap();

        // Flip a byte inside the last batch.
        let mut f = dir.open_random("p-0/00000000000000000000.log", false).unwrap();
        f.write_at(size - 1, &[0xFF]).unwrap();
        drop(f);

        let mut seg = segment(&dir, 0, &time);
        let mut tracker = ProducerStateTracker::new(dir.clone(), "p-0");
        let truncated = seg.recover(&mut tracker, None).unwrap();
        assert!(truncated > 0);
        assert_eq!(seg.read_next_offset().unwrap(), 9);
        assert_eq!(tracker.map_end_offset(), 9);
        assert_eq!(
            &seg.offset_index().unwrap().entries()[..],
            &entries_before[..entries_before.len() - 1]
        );
        for offset in 0..9 {
            assert!(seg.read(offset, 1000, None, false).unwrap().is_some());
        }
        assert!(seg.read(9, 1000, None, false).unwrap().is_none());
        assert_eq!(seg.largest_timestamp().unwrap(), 108);
    }

    #[test]
    fn recover_indexes_aborted_transactions_and_epochs() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 0, &time);

        let mut data = RecordBatchBuilder::new(0);
        data.partition_leader_epoch(3)
            .producer(7, 0, 0)
            .transactional(true)
            .append(10, None, b"t1")
            .append(11, None, b"t2");
        let data = data.build().unwrap();
        let mut marker = RecordBatchBuilder::new(2);
        marker
            .partition_leader_epoch(4)
            .producer(7, 0, 0)
            .control_marker(ControlRecordType::Abort, 12, 0);
        let marker = marker.build().unwrap();
        let mut cache = MemoryLeaderEpochCache::new();
        for b in [&data, &marker] {
            let mem = MemoryRecords::with_batches([b]);
            seg.append(b.last_offset(), b.max_timestamp(), b.last_offset(), &mem, Some(&mut cache))
                .unwrap();
        }
        assert_eq!(
            cache.entries(),
            vec![EpochEntry { epoch: 3, start_offset: 0 }, EpochEntry { epoch: 4, start_offset: 2 }]
        );

        let mut tracker = ProducerStateTracker::new(dir.clone(), "p-0");
        let mut rebuilt = MemoryLeaderEpochCache::new();
        assert_eq!(seg.recover(&mut tracker, Some(&mut rebuilt)).unwrap(), 0);
        assert_eq!(rebuilt.entries(), cache.entries());
        let aborted = seg.txn_index().all_aborted_txns().unwrap();
        assert_eq!(
            aborted,
            vec![AbortedTxn {
                producer_id: 7,
                first_offset: 0,
                last_offset: 2,
                last_stable_offset: 3,
                last_update_time: 12,
            }]
        );
        assert_eq!(tracker.first_unstable_offset(), None);
        let found = seg.collect_aborted_txns(0, 3).unwrap();
        assert_eq!(found.aborted_transactions, aborted);
    }

    #[test]
    fn change_file_suffixes_does_not_create_indexes() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 0, &time);
        seg.change_file_suffixes("", DELETED_FILE_SUFFIX).unwrap();
        assert!(dir.exists("p-0/00000000000000000000.log.deleted"));
        assert!(!dir.exists("p-0/00000000000000000000.log"));
        assert!(!dir.exists("p-0/00000000000000000000.index.deleted"));
        assert!(!dir.exists("p-0/00000000000000000000.timeindex.deleted"));
        assert!(seg.change_file_suffixes(".swap", "").is_err());

        seg.change_file_suffixes(DELETED_FILE_SUFFIX, "").unwrap();
        append(&mut seg, &records(0, 0, &["v"]));
        assert!(seg.offset_index().unwrap().is_empty());
        seg.change_file_suffixes("", DELETED_FILE_SUFFIX).unwrap();
        assert!(dir.exists("p-0/00000000000000000000.index.deleted"));
        seg.delete_if_exists().unwrap();
        assert!(!dir.exists("p-0/00000000000000000000.log.deleted"));
        assert!(!dir.exists("p-0/00000000000000000000.index.deleted"));
    }

    #[test]
    fn append_from_file_stops_at_relative_offset_limit() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let limit = i64::from(i32::MAX);
        let mut source = FileRecords::open(dir.clone(), "cleaned.log", 0).unwrap();
        for batch in [records(0, 0, &["a"]), records(limit, 0, &["b"]), records(limit + 1, 0, &["c"])] {
            source.append(&MemoryRecords::with_batches([&batch])).unwrap();
        }

        let mut dest = segment(&dir, 0, &time);
        let copied = dest.append_from_file(&source, 0).unwrap();
        assert_eq!(
            copied,
            (records(0, 0, &["a"]).size_in_bytes() + records(limit, 0, &["b"]).size_in_bytes()) as u64
        );
        assert_eq!(dest.read_next_offset().unwrap(), limit + 1);
        assert!(!dest.has_overflow().unwrap());
    }

    #[test]
    fn inactive_segment_is_trimmed_and_reopens_cleanly() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let time = MockTime::new(0);
        let mut seg = segment(&dir, 0, &time);
        for i in 0..4 {
            append(&mut seg, &records(i, 50 + i, &["v"]));
        }
        seg.on_became_inactive_segment().unwrap();
        assert!(seg.offset_index().unwrap().is_full());
        assert_eq!(seg.time_index().unwrap().last_timestamp_offset().timestamp, 53);
        seg.close().unwrap();

        let reopened = segment(&dir, 0, &time);
        reopened.sanity_check().unwrap();
        assert_eq!(reopened.read_next_offset().unwrap(), 4);
        assert_eq!(reopened.largest_timestamp().unwrap(), 53);
        assert_eq!(reopened.find_offset_by_timestamp(52, 0).unwrap().unwrap().offset, 2);
    }
}
