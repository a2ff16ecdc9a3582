//! Fixed-width sparse index file shared by the offset and time indexes.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - The file is a packed array of `E::SIZE`-byte little-endian entries; there is no header.
//! - Entries are appended in strictly increasing key order and never rewritten.
//! - A new file is preallocated to `max_index_size` rounded down to a whole number of entries;
//!   the preallocated tail is zero and not part of the index until written.
//! - An existing file is loaded as-is: every whole entry in it counts. Files are trimmed to
//!   their valid size on close so a clean reopen sees exactly the written entries.
//!
//! Lookups are hints: a floor entry names a position at or before the target, and the caller
//! scans forward from there.

use crate::error::{LogError, LogResult};
use crate::storage::{Directory, RandomAccessFile};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// A fixed-width index entry.
pub trait IndexEntry: Copy + Debug + PartialEq {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Slots held back from [`SparseIndex::is_full`].
    const RESERVED_SLOTS: usize = 0;

    /// Ordering key used by lookups (relative offset or timestamp).
    fn key(&self) -> i64;
    /// Offset of the entry relative to the index's base offset.
    fn relative_offset(&self) -> i32;
    /// Encode into exactly `SIZE` bytes.
    fn encode(&self, out: &mut [u8]);
    /// Decode from exactly `SIZE` bytes.
    fn decode(buf: &[u8]) -> Self;
}

/// A sparse index file with an in-memory mirror of its entries.
pub struct SparseIndex<E: IndexEntry> {
    dir: Arc<dyn Directory>,
    path: String,
    file: Box<dyn RandomAccessFile>,
    base_offset: i64,
    max_index_size: u32,
    max_entries: usize,
    file_len: u64,
    entries: Vec<E>,
}

impl<E: IndexEntry> Debug for SparseIndex<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseIndex")
            .field("path", &self.path)
            .field("base_offset", &self.base_offset)
            .field("entries", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

fn round_down_to_entries(size: u64, entry_size: usize) -> u64 {
    size - size % entry_size as u64
}

impl<E: IndexEntry> SparseIndex<E> {
    /// Open the index at `path`, creating and preallocating it when missing.
    pub fn open(
        dir: impl Into<Arc<dyn Directory>>,
        path: impl Into<String>,
        base_offset: i64,
        max_index_size: u32,
    ) -> LogResult<Self> {
        let dir = dir.into();
        let path = path.into();
        if (max_index_size as usize) < E::SIZE {
            return Err(LogError::InvalidConfig(format!(
                "max index size {max_index_size} is smaller than one {}-byte entry",
                E::SIZE
            )));
        }
        let existed = dir.exists(&path);
        let mut file = dir.open_random(&path, true)?;
        let (file_len, entries) = if existed {
            let len = file.len()?;
            let valid = round_down_to_entries(len, E::SIZE);
            let mut buf = vec![0u8; valid as usize];
            file.read_exact_at(0, &mut buf)?;
            let entries = buf.chunks_exact(E::SIZE).map(E::decode).collect();
            (len, entries)
        } else {
            let len = round_down_to_entries(u64::from(max_index_size), E::SIZE);
            file.set_len(len)?;
            (len, Vec::new())
        };
        Ok(Self {
            dir,
            path,
            file,
            base_offset,
            max_index_size,
            max_entries: (file_len / E::SIZE as u64) as usize,
            file_len,
            entries,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Offset that relative offsets are measured from.
    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// All entries in order.
    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity of the current allocation.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Whether the allocation has no room for another regular entry.
    pub fn is_full(&self) -> bool {
        self.entries.len() + E::RESERVED_SLOTS >= self.max_entries
    }

    /// Bytes occupied by entries.
    pub fn size_in_bytes(&self) -> u64 {
        (self.entries.len() * E::SIZE) as u64
    }

    /// The most recently appended entry.
    pub fn last_entry(&self) -> Option<E> {
        self.entries.last().copied()
    }

    /// Absolute offset of a relative one.
    pub fn absolute_offset(&self, relative: i32) -> i64 {
        self.base_offset + i64::from(relative)
    }

    /// `offset - base_offset` as an index delta, or `OffsetOverflow`.
    pub fn relative_offset(&self, offset: i64) -> LogResult<i32> {
        relative_offset(self.base_offset, offset)
    }

    pub(crate) fn append_entry(&mut self, entry: E) -> LogResult<()> {
        if self.entries.len() >= self.max_entries {
            return Err(LogError::IndexFull {
                path: self.path.clone(),
                entries: self.entries.len(),
            });
        }
        let mut buf = vec![0u8; E::SIZE];
        entry.encode(&mut buf);
        self.file
            .write_at((self.entries.len() * E::SIZE) as u64, &buf)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Slot of the entry with the largest key `<= key`.
    pub(crate) fn floor_slot(&self, key: i64) -> Option<usize> {
        match self.entries.partition_point(|e| e.key() <= key) {
            0 => None,
            n => Some(n - 1),
        }
    }

    /// Drop every entry whose absolute offset is `>= offset`. Emptying the index restores its
    /// original capacity.
    pub fn truncate_to(&mut self, offset: i64) -> LogResult<()> {
        let keep = self
            .entries
            .partition_point(|e| self.base_offset + i64::from(e.relative_offset()) < offset);
        self.truncate_to_entries(keep)
    }

    fn truncate_to_entries(&mut self, n: usize) -> LogResult<()> {
        self.entries.truncate(n);
        if self.entries.is_empty() {
            self.resize(self.max_index_size)?;
        }
        Ok(())
    }

    /// Remove all entries and restore the configured capacity.
    pub fn reset(&mut self) -> LogResult<()> {
        self.entries.clear();
        self.resize(self.max_index_size)?;
        Ok(())
    }

    /// Resize the allocation to `new_size` bytes rounded down to whole entries. Returns whether
    /// the file length changed.
    pub fn resize(&mut self, new_size: u32) -> LogResult<bool> {
        let rounded = round_down_to_entries(u64::from(new_size), E::SIZE)
            .max(self.size_in_bytes());
        if rounded == self.file_len {
            return Ok(false);
        }
        self.file.set_len(rounded)?;
        self.file_len = rounded;
        self.max_entries = (rounded / E::SIZE as u64) as usize;
        debug!(path = %self.path, bytes = rounded, "resized index");
        Ok(true)
    }

    /// Shrink the allocation to the written entries. The index is full afterwards.
    pub fn trim_to_valid_size(&mut self) -> LogResult<()> {
        let valid = self.size_in_bytes();
        if valid != self.file_len {
            self.file.set_len(valid)?;
            self.file_len = valid;
        }
        self.max_entries = self.entries.len();
        Ok(())
    }

    /// Check structural validity: whole entries, non-negative and ordered relative offsets, and
    /// strictly increasing keys.
    pub fn sanity_check(&self) -> LogResult<()> {
        let corrupt = |reason: String| LogError::CorruptIndex {
            path: self.path.clone(),
            reason,
        };
        if self.file_len % E::SIZE as u64 != 0 {
            return Err(corrupt(format!(
                "length {} is not a multiple of the {}-byte entry size",
                self.file_len,
                E::SIZE
            )));
        }
        for (i, pair) in self.entries.windows(2).enumerate() {
            if pair[1].key() <= pair[0].key() {
                return Err(corrupt(format!(
                    "entry {} key {} does not exceed previous key {}",
                    i + 1,
                    pair[1].key(),
                    pair[0].key()
                )));
            }
            if pair[1].relative_offset() < pair[0].relative_offset() {
                return Err(corrupt(format!(
                    "entry {} offset goes backwards",
                    i + 1
                )));
            }
        }
        if let Some(first) = self.entries.first() {
            if first.relative_offset() < 0 {
                return Err(corrupt(format!(
                    "first entry offset {} is below base offset {}",
                    self.absolute_offset(first.relative_offset()),
                    self.base_offset
                )));
            }
        }
        Ok(())
    }

    /// Make written entries durable.
    pub fn flush(&mut self) -> LogResult<()> {
        self.file.sync()
    }

    /// Trim to valid size; the file is left reopenable.
    pub fn close(&mut self) -> LogResult<()> {
        self.trim_to_valid_size()?;
        self.file.sync()
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

/// `offset - base_offset` if it fits a non-negative `i32`.
pub fn relative_offset(base_offset: i64, offset: i64) -> LogResult<i32> {
    offset
        .checked_sub(base_offset)
        .and_then(|d| i32::try_from(d).ok())
        .filter(|d| *d >= 0)
        .ok_or(LogError::OffsetOverflow {
            base_offset,
            offset,
        })
}

/// Whether `offset` can be stored relative to `base_offset`.
pub fn can_convert_to_relative_offset(base_offset: i64, offset: i64) -> bool {
    relative_offset(base_offset, offset).is_ok()
}

struct LazyState<E: IndexEntry> {
    path: String,
    index: Option<SparseIndex<E>>,
}

/// An index whose file is only opened (and created) on first access.
pub struct LazyIndex<E: IndexEntry> {
    dir: Arc<dyn Directory>,
    base_offset: i64,
    max_index_size: u32,
    state: Mutex<LazyState<E>>,
}

impl<E: IndexEntry> LazyIndex<E> {
    /// A handle for the index at `path`. Nothing touches storage until first access.
    pub fn new(
        dir: impl Into<Arc<dyn Directory>>,
        path: impl Into<String>,
        base_offset: i64,
        max_index_size: u32,
    ) -> Self {
        Self {
            dir: dir.into(),
            base_offset,
            max_index_size,
            state: Mutex::new(LazyState {
                path: path.into(),
                index: None,
            }),
        }
    }

    /// Current path.
    pub fn path(&self) -> String {
        self.state.lock().path.clone()
    }

    /// Whether the backing file has been opened.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().index.is_some()
    }

    fn open_index(&self, path: &str) -> LogResult<SparseIndex<E>> {
        SparseIndex::open(
            self.dir.clone(),
            path.to_string(),
            self.base_offset,
            self.max_index_size,
        )
    }

    /// Shared access, opening the file if needed.
    pub fn get(&self) -> LogResult<MappedMutexGuard<'_, SparseIndex<E>>> {
        let mut guard = self.state.lock();
        if guard.index.is_none() {
            let index = self.open_index(&guard.path)?;
            guard.index = Some(index);
        }
        MutexGuard::try_map(guard, |s| s.index.as_mut()).map_err(|_| {
            LogError::InvalidState("lazy index lost its handle".to_string())
        })
    }

    /// Exclusive access, opening the file if needed.
    pub fn get_mut(&mut self) -> LogResult<&mut SparseIndex<E>> {
        let index = match self.state.get_mut().index.take() {
            Some(index) => index,
            None => {
                let path = self.state.get_mut().path.clone();
                self.open_index(&path)?
            }
        };
        Ok(self.state.get_mut().index.insert(index))
    }

    /// Rename the backing file if it exists; never creates it.
    pub fn rename_to(&mut self, new_path: impl Into<String>) -> LogResult<()> {
        let new_path = new_path.into();
        let state = self.state.get_mut();
        match state.index.as_mut() {
            Some(index) => index.rename_to(new_path.clone())?,
            None => {
                if self.dir.exists(&state.path) {
                    self.dir.atomic_rename(&state.path, &new_path)?;
                }
            }
        }
        state.path = new_path;
        Ok(())
    }

    /// Delete the backing file. Returns whether it existed.
    pub fn delete_if_exists(&mut self) -> LogResult<bool> {
        let state = self.state.get_mut();
        match state.index.take() {
            Some(mut index) => index.delete_if_exists(),
            None => {
                let existed = self.dir.exists(&state.path);
                self.dir.delete(&state.path)?;
                Ok(existed)
            }
        }
    }

    /// Close the index if it was opened.
    pub fn close(&mut self) -> LogResult<()> {
        if let Some(index) = self.state.get_mut().index.as_mut() {
            index.close()?;
        }
        Ok(())
    }

    /// Drop the open handle without trimming.
    pub fn close_handler(&mut self) {
        self.state.get_mut().index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDirectory;
    use byteorder::{ByteOrder, LittleEndian};

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pair(i32, i32);

    impl IndexEntry for Pair {
        const SIZE: usize = 8;
        fn key(&self) -> i64 {
            i64::from(self.0)
        }
        fn relative_offset(&self) -> i32 {
            self.0
        }
        fn encode(&self, out: &mut [u8]) {
            LittleEndian::write_i32(&mut out[0..4], self.0);
            LittleEndian::write_i32(&mut out[4..8], self.1);
        }
        fn decode(buf: &[u8]) -> Self {
            Pair(
                LittleEndian::read_i32(&buf[0..4]),
                LittleEndian::read_i32(&buf[4..8]),
            )
        }
    }

    #[test]
    fn floor_slot_and_truncation() {
        let dir = MemoryDirectory::new();
        let mut idx = SparseIndex::<Pair>::open(dir, "a.index", 100, 80).unwrap();
        assert_eq!(idx.max_entries(), 10);
        for k in [0, 5, 9] {
            idx.append_entry(Pair(k, k * 10)).unwrap();
        }
        assert_eq!(idx.floor_slot(-1), None);
        assert_eq!(idx.floor_slot(0), Some(0));
        assert_eq!(idx.floor_slot(7), Some(1));
        assert_eq!(idx.floor_slot(100), Some(2));

        idx.truncate_to(105).unwrap();
        assert_eq!(idx.entries(), &[Pair(0, 0)]);
        idx.truncate_to(100).unwrap();
        assert!(idx.is_empty());
    }

    #[test]
    fn full_index_rejects_appends_until_emptied() {
        let dir = MemoryDirectory::new();
        let mut idx = SparseIndex::<Pair>::open(dir, "f.index", 0, 20).unwrap();
        assert_eq!(idx.max_entries(), 2);
        idx.append_entry(Pair(1, 0)).unwrap();
        idx.append_entry(Pair(2, 0)).unwrap();
        assert!(idx.is_full());
        assert!(matches!(
            idx.append_entry(Pair(3, 0)),
            Err(LogError::IndexFull { entries: 2, .. })
        ));

        idx.trim_to_valid_size().unwrap();
        idx.truncate_to(0).unwrap();
        assert!(!idx.is_full());
        assert_eq!(idx.max_entries(), 2);
    }

    #[test]
    fn reopen_after_close_sees_exactly_the_written_entries() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let mut idx = SparseIndex::<Pair>::open(dir.clone(), "r.index", 0, 64).unwrap();
        idx.append_entry(Pair(1, 11)).unwrap();
        idx.append_entry(Pair(4, 44)).unwrap();
        idx.close().unwrap();

        let mut reopened = SparseIndex::<Pair>::open(dir, "r.index", 0, 64).unwrap();
        assert_eq!(reopened.entries(), &[Pair(1, 11), Pair(4, 44)]);
        assert!(reopened.is_full());
        reopened.sanity_check().unwrap();
        assert!(reopened.resize(64).unwrap());
        assert_eq!(reopened.max_entries(), 8);
    }

    #[test]
    fn sanity_check_flags_unordered_keys_and_partial_entries() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let mut bytes = vec![0u8; 16];
        Pair(3, 0).encode(&mut bytes[0..8]);
        Pair(2, 0).encode(&mut bytes[8..16]);
        dir.atomic_write("bad.index", &bytes).unwrap();
        let idx = SparseIndex::<Pair>::open(dir.clone(), "bad.index", 0, 64).unwrap();
        assert!(matches!(idx.sanity_check(), Err(LogError::CorruptIndex { .. })));

        dir.atomic_write("odd.index", &[0u8; 12]).unwrap();
        let idx = SparseIndex::<Pair>::open(dir.clone(), "odd.index", 0, 64).unwrap();
        assert!(idx.sanity_check().is_err());

        // A preallocated file left untrimmed reads back as repeated zero entries.
        dir.atomic_write("zeros.index", &[0u8; 32]).unwrap();
        let idx = SparseIndex::<Pair>::open(dir, "zeros.index", 0, 64).unwrap();
        assert!(idx.sanity_check().is_err());
    }

    #[test]
    fn relative_offset_bounds() {
        assert_eq!(relative_offset(10, 10).unwrap(), 0);
        assert_eq!(relative_offset(0, i64::from(i32::MAX)).unwrap(), i32::MAX);
        assert!(relative_offset(0, i64::from(i32::MAX) + 1).is_err());
        assert!(relative_offset(10, 9).is_err());
        assert!(!can_convert_to_relative_offset(i64::MAX, i64::MIN));
    }

    #[test]
    fn lazy_index_creates_file_on_first_access_only() {
        let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
        let mut lazy = LazyIndex::<Pair>::new(dir.clone(), "l.index", 0, 64);
        lazy.rename_to("l.index.deleted").unwrap();
        assert!(!dir.exists("l.index") && !dir.exists("l.index.deleted"));
        assert!(!lazy.is_loaded());

        assert_eq!(lazy.get().unwrap().len(), 0);
        assert!(dir.exists("l.index.deleted"));
        lazy.get_mut().unwrap().append_entry(Pair(1, 1)).unwrap();
        lazy.rename_to("l.index").unwrap();
        assert!(dir.exists("l.index"));
        assert_eq!(lazy.get().unwrap().entries(), &[Pair(1, 1)]);
        assert!(lazy.delete_if_exists().unwrap());
        assert!(!dir.exists("l.index"));
    }
}
