//! Record batch store: the `.log` file of a segment.
//!
//! The file is a plain concatenation of encoded batches (see [`crate::batch`]). It may be
//! preallocated, so its on-disk length can exceed the logical `size`; bytes past `size` are
//! never read.
//!
//! ## Recovery posture
//!
//! Batch iteration is best-effort at the tail: a batch whose declared size runs past the end of
//! data is a torn write and ends iteration cleanly. A header whose declared size is below the
//! minimum batch size (including the zeros of a preallocated region) is reported as
//! [`LogError::CorruptRecord`]; the caller decides whether to truncate.

use crate::batch::{
    BatchHeader, MemoryRecords, RecordBatch, LOG_OVERHEAD, RECORD_BATCH_OVERHEAD,
};
use crate::error::{LogError, LogResult};
use crate::formats::NO_TIMESTAMP;
use crate::storage::{Directory, RandomAccessFile};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

/// Offset and location of a batch found by [`FileRecords::search_for_offset_with_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOffsetPosition {
    /// Last offset of the batch.
    pub offset: i64,
    /// Byte position of the batch.
    pub position: u64,
    /// Size of the batch in bytes.
    pub size: usize,
}

/// A timestamp together with the offset that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampAndOffset {
    /// Record or batch timestamp.
    pub timestamp: i64,
    /// Offset holding `timestamp`.
    pub offset: i64,
    /// Partition leader epoch of the batch, if it carries one.
    pub leader_epoch: Option<i32>,
}

impl TimestampAndOffset {
    /// Sentinel for "nothing found".
    pub const UNKNOWN: Self = Self {
        timestamp: NO_TIMESTAMP,
        offset: -1,
        leader_epoch: None,
    };
}

/// A batch together with its byte position in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBatch {
    /// Byte position of the batch.
    pub position: u64,
    /// The batch.
    pub batch: RecordBatch,
}

/// File-backed record batch store.
pub struct FileRecords {
    dir: Arc<dyn Directory>,
    path: String,
    file: Box<dyn RandomAccessFile>,
    size: u64,
}

impl std::fmt::Debug for FileRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRecords")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

impl FileRecords {
    /// Open the store at `path`, creating it when missing.
    ///
    /// A newly created file is preallocated to `preallocate_size` bytes (0 disables it) and
    /// starts with a logical size of 0. An existing file's logical size is its on-disk length.
    pub fn open(
        dir: impl Into<Arc<dyn Directory>>,
        path: impl Into<String>,
        preallocate_size: u32,
    ) -> LogResult<Self> {
        let dir = dir.into();
        let path = path.into();
        let existed = dir.exists(&path);
        let mut file = dir.open_random(&path, true)?;
        let size = if existed {
            file.len()?
        } else {
            if preallocate_size > 0 {
                file.set_len(u64::from(preallocate_size))?;
            }
            0
        };
        Ok(Self {
            dir,
            path,
            file,
            size,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Logical size in bytes.
    pub fn size_in_bytes(&self) -> u64 {
        self.size
    }

    /// Append encoded batches at the logical end. Returns the number of bytes written.
    ///
    /// The logical size only advances once the write succeeded, so a failed write leaves the
    /// store unchanged as far as readers are concerned.
    pub fn append(&mut self, records: &MemoryRecords) -> LogResult<usize> {
        let n = records.size_in_bytes();
        if n as u64 > i32::MAX as u64 - self.size.min(i32::MAX as u64) {
            return Err(LogError::InvalidState(format!(
                "append of {n} bytes would grow {} past {} bytes",
                self.path,
                i32::MAX
            )));
        }
        self.file.write_at(self.size, records.as_bytes())?;
        self.size += n as u64;
        Ok(n)
    }

    /// Raw bytes in `[position, position + max_size)`, clipped to the logical size.
    pub fn read(&self, position: u64, max_size: usize) -> LogResult<MemoryRecords> {
        if position > self.size {
            return Err(LogError::InvalidOffset(format!(
                "position {position} is past the end of {} ({} bytes)",
                self.path, self.size
            )));
        }
        let end = self.size.min(position.saturating_add(max_size as u64));
        let mut buf = vec![0u8; (end - position) as usize];
        self.file.read_exact_at(position, &mut buf)?;
        Ok(MemoryRecords::from_bytes(buf))
    }

    /// Header of the batch at `position`, or `None` when the remaining bytes cannot hold a
    /// complete batch.
    pub fn read_header_at(&self, position: u64) -> LogResult<Option<BatchHeader>> {
        let Some(size) = self.batch_size_at(position)? else {
            return Ok(None);
        };
        let mut buf = [0u8; RECORD_BATCH_OVERHEAD];
        self.file.read_exact_at(position, &mut buf)?;
        let header = BatchHeader::parse(&buf, position)?;
        debug_assert_eq!(header.size_in_bytes(), size);
        Ok(Some(header))
    }

    /// The batch at `position`, or `None` when the remaining bytes cannot hold a complete
    /// batch. The checksum is not verified.
    pub fn read_batch_at(&self, position: u64) -> LogResult<Option<RecordBatch>> {
        let Some(size) = self.batch_size_at(position)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; size];
        self.file.read_exact_at(position, &mut buf)?;
        RecordBatch::from_bytes_at(buf, position).map(Some)
    }

    fn batch_size_at(&self, position: u64) -> LogResult<Option<usize>> {
        if self.size.saturating_sub(position) < LOG_OVERHEAD as u64 {
            return Ok(None);
        }
        let mut prefix = [0u8; LOG_OVERHEAD];
        self.file.read_exact_at(position, &mut prefix)?;
        let length = LittleEndian::read_i32(&prefix[8..12]);
        if length < (RECORD_BATCH_OVERHEAD - LOG_OVERHEAD) as i32 {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!(
                    "batch size {} is smaller than the minimum {RECORD_BATCH_OVERHEAD}",
                    i64::from(length) + LOG_OVERHEAD as i64
                ),
            });
        }
        let size = length as usize + LOG_OVERHEAD;
        if size as u64 > self.size - position {
            return Ok(None);
        }
        Ok(Some(size))
    }

    /// Iterate batches starting at `position`. Iteration ends at a torn tail or after the first
    /// error.
    pub fn batches_from(&self, position: u64) -> FileBatches<'_> {
        FileBatches {
            records: self,
            position,
            done: false,
        }
    }

    /// Locate the first batch at or after `starting_position` whose last offset is at least
    /// `target_offset`.
    pub fn search_for_offset_with_size(
        &self,
        target_offset: i64,
        starting_position: u64,
    ) -> LogResult<Option<LogOffsetPosition>> {
        let mut position = starting_position;
        while let Some(header) = self.read_header_at(position)? {
            if header.last_offset() >= target_offset {
                return Ok(Some(LogOffsetPosition {
                    offset: header.last_offset(),
                    position,
                    size: header.size_in_bytes(),
                }));
            }
            position += header.size_in_bytes() as u64;
        }
        Ok(None)
    }

    /// First record at or after `starting_position` with timestamp `>= target_timestamp` and
    /// offset `>= starting_offset`.
    ///
    /// Compressed batches cannot be searched record by record; for those the batch's max
    /// timestamp is returned with the first eligible offset of the batch.
    pub fn search_for_timestamp(
        &self,
        target_timestamp: i64,
        starting_position: u64,
        starting_offset: i64,
    ) -> LogResult<Option<TimestampAndOffset>> {
        for item in self.batches_from(starting_position) {
            let FileBatch { batch, .. } = item?;
            if batch.max_timestamp() < target_timestamp || batch.last_offset() < starting_offset {
                continue;
            }
            let leader_epoch = leader_epoch_of(&batch);
            match batch.records() {
                Ok(records) => {
                    if let Some(r) = records
                        .iter()
                        .find(|r| r.timestamp >= target_timestamp && r.offset >= starting_offset)
                    {
                        return Ok(Some(TimestampAndOffset {
                            timestamp: r.timestamp,
                            offset: r.offset,
                            leader_epoch,
                        }));
                    }
                }
                Err(LogError::NotSupported(_)) => {
                    return Ok(Some(TimestampAndOffset {
                        timestamp: batch.max_timestamp(),
                        offset: batch.base_offset().max(starting_offset),
                        leader_epoch,
                    }));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Largest batch timestamp at or after `starting_position` and the last offset of the
    /// batch carrying it.
    pub fn largest_timestamp_after(&self, starting_position: u64) -> LogResult<TimestampAndOffset> {
        let mut best = TimestampAndOffset::UNKNOWN;
        let mut position = starting_position;
        while let Some(header) = self.read_header_at(position)? {
            if header.max_timestamp > best.timestamp {
                best = TimestampAndOffset {
                    timestamp: header.max_timestamp,
                    offset: header.last_offset(),
                    leader_epoch: (header.partition_leader_epoch >= 0)
                        .then_some(header.partition_leader_epoch),
                };
            }
            position += header.size_in_bytes() as u64;
        }
        Ok(best)
    }

    /// Shrink the logical size to `target_size`. Returns the number of bytes removed.
    pub fn truncate_to(&mut self, target_size: u64) -> LogResult<u64> {
        let original = self.size;
        if target_size > original {
            return Err(LogError::InvalidState(format!(
                "cannot truncate {} to {target_size} bytes: size is {original}",
                self.path
            )));
        }
        if target_size < self.file.len()? {
            self.file.set_len(target_size)?;
        }
        self.size = target_size;
        Ok(original - target_size)
    }

    /// Make appended bytes durable.
    pub fn flush(&mut self) -> LogResult<()> {
        self.file.sync()
    }

    /// Drop preallocated space past the logical end.
    pub fn trim(&mut self) -> LogResult<()> {
        if self.file.len()? > self.size {
            self.file.set_len(self.size)?;
        }
        Ok(())
    }

    /// Flush and trim.
    pub fn close(&mut self) -> LogResult<()> {
        self.flush()?;
        self.trim()
    }

    /// Rename the backing file and keep using it under the new name.
    pub fn rename_to(&mut self, new_path: impl Into<String>) -> LogResult<()> {
        let new_path = new_path.into();
        self.dir.atomic_rename(&self.path, &new_path)?;
        self.file = self.dir.open_random(&new_path, false)?;
        self.path = new_path;
        Ok(())
    }

    /// Delete the backing file. Returns whether it existed.
    pub fn delete_if_exists(&mut self) -> LogResult<bool> {
        let existed = self.dir.exists(&self.path);
        self.dir.delete(&self.path)?;
        Ok(existed)
    }
}

fn leader_epoch_of(batch: &RecordBatch) -> Option<i32> {
    let epoch = batch.partition_leader_epoch();
    (epoch >= 0).then_some(epoch)
}

/// Iterator returned by [`FileRecords::batches_from`].
pub struct FileBatches<'a> {
    records: &'a FileRecords,
    position: u64,
    done: bool,
}

impl Iterator for FileBatches<'_> {
    type Item = LogResult<FileBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.records.read_batch_at(self.position) {
            Ok(Some(batch)) => {
                let position = self.position;
                self.position += batch.size_in_bytes() as u64;
                Some(Ok(FileBatch { position, batch }))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RecordBatchBuilder;
    use crate::storage::MemoryDirectory;

    fn batch(base: i64, ts: i64, values: &[&str]) -> RecordBatch {
        let mut b = RecordBatchBuilder::new(base);
        for (i, v) in values.iter().enumerate() {
            b.append(ts + i as i64, None, v.as_bytes());
        }
        b.build().unwrap()
    }

    fn store() -> FileRecords {
        FileRecords::open(MemoryDirectory::new(), "p/00000000000000000000.log", 0).unwrap()
    }

    #[test]
    fn append_read_and_iterate() {
        let mut fr = store();
        let a = batch(0, 100, &["a", "b"]);
        let b = batch(2, 200, &["c"]);
        fr.append(&MemoryRecords::with_batches([&a])).unwrap();
        fr.append(&MemoryRecords::with_batches([&b])).unwrap();
        assert_eq!(fr.size_in_bytes(), (a.size_in_bytes() + b.size_in_bytes()) as u64);

        let all: Vec<_> = fr.batches_from(0).map(|r| r.unwrap()).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].position, a.size_in_bytes() as u64);
        assert_eq!(all[1].batch, b);

        let raw = fr.read(0, 10_000).unwrap();
        assert_eq!(raw.size_in_bytes() as u64, fr.size_in_bytes());
        assert!(fr.read(fr.size_in_bytes() + 1, 1).is_err());
    }

    #[test]
    fn search_for_offset_returns_containing_batch() {
        let mut fr = store();
        let a = batch(0, 100, &["a", "b", "c"]);
        let b = batch(3, 200, &["d", "e"]);
        fr.append(&MemoryRecords::with_batches([&a, &b])).unwrap();

        let hit = fr.search_for_offset_with_size(1, 0).unwrap().unwrap();
        assert_eq!((hit.offset, hit.position, hit.size), (2, 0, a.size_in_bytes()));
        let hit = fr.search_for_offset_with_size(3, 0).unwrap().unwrap();
        assert_eq!(hit.position, a.size_in_bytes() as u64);
        assert_eq!(fr.search_for_offset_with_size(5, 0).unwrap(), None);
    }

    #[test]
    fn timestamp_search_and_largest_timestamp() {
        let mut fr = store();
        let a = batch(0, 100, &["a", "b"]);
        let b = batch(2, 150, &["c", "d"]);
        fr.append(&MemoryRecords::with_batches([&a, &b])).unwrap();

        let found = fr.search_for_timestamp(101, 0, 0).unwrap().unwrap();
        assert_eq!((found.timestamp, found.offset), (101, 1));
        let found = fr.search_for_timestamp(120, 0, 0).unwrap().unwrap();
        assert_eq!((found.timestamp, found.offset), (150, 2));
        let found = fr.search_for_timestamp(0, 0, 3).unwrap().unwrap();
        assert_eq!(found.offset, 3);
        assert_eq!(fr.search_for_timestamp(152, 0, 0).unwrap(), None);

        let largest = fr.largest_timestamp_after(0).unwrap();
        assert_eq!((largest.timestamp, largest.offset), (151, 3));
        let past_end = fr.largest_timestamp_after(fr.size_in_bytes()).unwrap();
        assert_eq!(past_end, TimestampAndOffset::UNKNOWN);
    }

    #[test]
    fn torn_tail_ends_iteration_and_zeros_are_corrupt() {
        let dir = MemoryDirectory::new();
        let a = batch(0, 1, &["a"]);
        let mut bytes = a.as_bytes().to_vec();
        bytes.extend_from_slice(&a.as_bytes()[..20]);
        dir.atomic_write("t.log", &bytes).unwrap();
        let fr = FileRecords::open(dir.clone(), "t.log", 0).unwrap();
        let items: Vec<_> = fr.batches_from(0).collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());

        let mut zeros = a.as_bytes().to_vec();
        zeros.extend_from_slice(&[0u8; 128]);
        dir.atomic_write("z.log", &zeros).unwrap();
        let fr = FileRecords::open(dir, "z.log", 0).unwrap();
        let items: Vec<_> = fr.batches_from(0).collect();
        assert_eq!(items.len(), 2);
        let err = items[1].as_ref().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn preallocation_is_invisible_and_trimmed_on_close() {
        let dir = MemoryDirectory::new();
        let mut fr = FileRecords::open(dir.clone(), "x.log", 4096).unwrap();
        assert_eq!(fr.size_in_bytes(), 0);
        assert_eq!(fr.batches_from(0).count(), 0);
        let a = batch(0, 1, &["a"]);
        fr.append(&MemoryRecords::with_batches([&a])).unwrap();
        fr.close().unwrap();
        let reopened = FileRecords::open(dir, "x.log", 4096).unwrap();
        assert_eq!(reopened.size_in_bytes(), a.size_in_bytes() as u64);
    }

    #[test]
    fn truncate_rename_delete() {
        let dir = MemoryDirectory::new();
        let mut fr = FileRecords::open(dir.clone(), "r.log", 0).unwrap();
        let a = batch(0, 1, &["a"]);
        let b = batch(1, 2, &["b"]);
        fr.append(&MemoryRecords::with_batches([&a, &b])).unwrap();
        let total = fr.size_in_bytes();
        assert!(fr.truncate_to(total + 1).is_err());
        assert_eq!(fr.truncate_to(a.size_in_bytes() as u64).unwrap(), total - a.size_in_bytes() as u64);
        assert_eq!(fr.batches_from(0).count(), 1);

        fr.rename_to("r.log.deleted").unwrap();
        assert!(!dir.exists("r.log"));
        assert_eq!(fr.path(), "r.log.deleted");
        assert_eq!(fr.batches_from(0).count(), 1);
        assert!(fr.delete_if_exists().unwrap());
        assert!(!fr.delete_if_exists().unwrap());
    }
}
