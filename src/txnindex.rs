//! Transaction index: aborted transaction ranges that overlap a segment.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - Entry layout (42 bytes, little-endian): `version:i16 | producer_id:i64 | first_offset:i64 |
//!   last_offset:i64 | last_stable_offset:i64 | last_update_time:i64`.
//! - Entries are appended in increasing `last_offset` order.
//! - The file is created by the first append; a segment without aborted transactions has none.

use crate::error::{LogError, LogResult};
use crate::storage::{Directory, RandomAccessFile};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

const TXN_INDEX_VERSION: i16 = 0;
/// Encoded size of an [`AbortedTxn`].
pub const ABORTED_TXN_SIZE: usize = 42;

/// A producer transaction that ended in abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedTxn {
    /// Producer that ran the transaction.
    pub producer_id: i64,
    /// Offset of the transaction's first batch, possibly in an earlier segment.
    pub first_offset: i64,
    /// Offset of the abort marker.
    pub last_offset: i64,
    /// Last stable offset when the abort was written.
    pub last_stable_offset: i64,
    /// Timestamp of the abort marker.
    pub last_update_time: i64,
}

impl AbortedTxn {
    fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_i16(&mut out[0..2], TXN_INDEX_VERSION);
        LittleEndian::write_i64(&mut out[2..10], self.producer_id);
        LittleEndian::write_i64(&mut out[10..18], self.first_offset);
        LittleEndian::write_i64(&mut out[18..26], self.last_offset);
        LittleEndian::write_i64(&mut out[26..34], self.last_stable_offset);
        LittleEndian::write_i64(&mut out[34..42], self.last_update_time);
    }

    fn decode(buf: &[u8]) -> Result<Self, String> {
        let version = LittleEndian::read_i16(&buf[0..2]);
        if version != TXN_INDEX_VERSION {
            return Err(format!("unexpected entry version {version}"));
        }
        Ok(Self {
            producer_id: LittleEndian::read_i64(&buf[2..10]),
            first_offset: LittleEndian::read_i64(&buf[10..18]),
            last_offset: LittleEndian::read_i64(&buf[18..26]),
            last_stable_offset: LittleEndian::read_i64(&buf[26..34]),
            last_update_time: LittleEndian::read_i64(&buf[34..42]),
        })
    }
}

/// Aborted transactions overlapping a fetch range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnIndexSearchResult {
    /// Matching transactions in index order.
    pub aborted_transactions: Vec<AbortedTxn>,
    /// Whether later segments cannot hold more matches.
    pub is_complete: bool,
}

/// Append-only file of [`AbortedTxn`] entries for one segment.
pub struct TransactionIndex {
    dir: Arc<dyn Directory>,
    path: String,
    start_offset: i64,
    file: Option<Box<dyn RandomAccessFile>>,
    last_offset: Option<i64>,
}

impl std::fmt::Debug for TransactionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionIndex")
            .field("path", &self.path)
            .field("start_offset", &self.start_offset)
            .finish()
    }
}

impl TransactionIndex {
    /// A handle for the index at `path`. The file is not touched until needed.
    pub fn new(dir: impl Into<Arc<dyn Directory>>, path: impl Into<String>, start_offset: i64) -> Self {
        Self {
            dir: dir.into(),
            path: path.into(),
            start_offset,
            file: None,
            last_offset: None,
        }
    }

    /// Current path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Append `txn`. Its last offset must exceed every indexed last offset.
    pub fn append(&mut self, txn: AbortedTxn) -> LogResult<()> {
        if self.last_offset.is_none() && self.dir.exists(&self.path) {
            self.last_offset = self.read_all()?.last().map(|t| t.last_offset);
        }
        if let Some(last) = self.last_offset {
            if txn.last_offset <= last {
                return Err(LogError::InvalidOffset(format!(
                    "aborted txn last offset {} does not exceed {last} in {}",
                    txn.last_offset, self.path
                )));
            }
        }
        let mut buf = [0u8; ABORTED_TXN_SIZE];
        txn.encode(&mut buf);
        let file = self.file_mut()?;
        let end = file.len()?;
        file.write_at(end, &buf)?;
        self.last_offset = Some(txn.last_offset);
        Ok(())
    }

    fn file_mut(&mut self) -> LogResult<&mut Box<dyn RandomAccessFile>> {
        let file = match self.file.take() {
            Some(f) => f,
            None => self.dir.open_random(&self.path, true)?,
        };
        Ok(self.file.insert(file))
    }

    fn read_all(&self) -> LogResult<Vec<AbortedTxn>> {
        let opened;
        let file: &dyn RandomAccessFile = match &self.file {
            Some(f) => f.as_ref(),
            None => {
                if !self.dir.exists(&self.path) {
                    return Ok(Vec::new());
                }
                opened = self.dir.open_random(&self.path, false)?;
                opened.as_ref()
            }
        };
        let len = file.len()?;
        if len % ABORTED_TXN_SIZE as u64 != 0 {
            return Err(self.corrupt(format!(
                "length {len} is not a multiple of the {ABORTED_TXN_SIZE}-byte entry size"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        file.read_exact_at(0, &mut buf)?;
        buf.chunks_exact(ABORTED_TXN_SIZE)
            .map(|chunk| AbortedTxn::decode(chunk).map_err(|reason| self.corrupt(reason)))
            .collect()
    }

    fn corrupt(&self, reason: String) -> LogError {
        LogError::CorruptIndex {
            path: self.path.clone(),
            reason,
        }
    }

    /// Every indexed aborted transaction, in order.
    pub fn all_aborted_txns(&self) -> LogResult<Vec<AbortedTxn>> {
        self.read_all()
    }

    /// Aborted transactions overlapping `[fetch_offset, upper_bound_offset)`.
    ///
    /// The search is complete once an entry's last stable offset reaches the upper bound: no
    /// later segment can hold an abort that overlaps the range.
    pub fn collect_aborted_txns(
        &self,
        fetch_offset: i64,
        upper_bound_offset: i64,
    ) -> LogResult<TxnIndexSearchResult> {
        let mut result = TxnIndexSearchResult::default();
        for txn in self.read_all()? {
            if txn.last_offset >= fetch_offset && txn.first_offset < upper_bound_offset {
                result.aborted_transactions.push(txn);
            }
            if txn.last_stable_offset >= upper_bound_offset {
                result.is_complete = true;
                break;
            }
        }
        Ok(result)
    }

    /// Drop entries whose last offset is `>= offset`.
    pub fn truncate_to(&mut self, offset: i64) -> LogResult<()> {
        let all = self.read_all()?;
        let keep = all.iter().take_while(|t| t.last_offset < offset).count();
        if keep < all.len() {
            let file = self.file_mut()?;
            file.set_len((keep * ABORTED_TXN_SIZE) as u64)?;
        }
        self.last_offset = all[..keep].last().map(|t| t.last_offset);
        Ok(())
    }

    /// Remove every entry.
    pub fn reset(&mut self) -> LogResult<()> {
        if self.file.is_some() || self.dir.exists(&self.path) {
            self.file_mut()?.set_len(0)?;
        }
        self.last_offset = None;
        Ok(())
    }

    /// Check that entries decode and that none ends before the segment starts.
    pub fn sanity_check(&self) -> LogResult<()> {
        for txn in self.read_all()? {
            if txn.last_offset < self.start_offset {
                return Err(self.corrupt(format!(
                    "aborted txn last offset {} precedes segment start {}",
                    txn.last_offset, self.start_offset
                )));
            }
        }
        Ok(())
    }

    /// Make written entries durable.
    pub fn flush(&mut self) -> LogResult<()> {
        match self.file.as_mut() {
            Some(f) => f.sync(),
            None => Ok(()),
        }
    }

    /// Rename the backing file if it exists; never creates it.
    pub fn rename_to(&mut self, new_path: impl Into<String>) -> LogResult<()> {
        let new_path = new_path.into();
        if self.dir.exists(&self.path) {
            self.dir.atomic_rename(&self.path, &new_path)?;
            if self.file.is_some() {
                self.file = Some(self.dir.open_random(&new_path, false)?);
            }
        }
        self.path = new_path;
        Ok(())
    }

    /// Delete the backing file. Returns whether it existed.
    pub fn delete_if_exists(&mut self) -> LogResult<bool> {
        self.file = None;
        let existed = self.dir.exists(&self.path);
        self.dir.delete(&self.path)?;
        Ok(existed)
    }

    /// Drop the open handle.
    pub fn close(&mut self) {
        self.file = None;
    }
}
