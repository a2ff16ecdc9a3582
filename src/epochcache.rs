//! Leader epoch history: which offset each leader epoch started at.
//!
//! Segments only ever call [`LeaderEpochCache::append`], and only with an epoch newer than the
//! cache's latest. Persistence is the cache's own business.

use crate::checkpoint::CheckpointFile;
use crate::error::LogResult;
use crate::storage::Directory;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Start offset of a leader epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochEntry {
    /// Leader epoch.
    pub epoch: i32,
    /// First offset written in `epoch`.
    pub start_offset: i64,
}

/// Epoch history a segment extends while appending or recovering.
pub trait LeaderEpochCache {
    /// Record that `epoch` starts at `start_offset`.
    ///
    /// Re-appending the latest epoch at the same or a later offset is a no-op. Entries with an
    /// epoch `>= epoch` or a start offset `>= start_offset` are replaced.
    fn append(&mut self, epoch: i32, start_offset: i64) -> LogResult<()>;
    /// Most recent epoch.
    fn latest_epoch(&self) -> Option<i32>;
    /// Entries in ascending order.
    fn entries(&self) -> Vec<EpochEntry>;
}

/// Apply an assignment to `entries`. Returns whether anything changed.
fn assign_entry(entries: &mut Vec<EpochEntry>, entry: EpochEntry) -> bool {
    if entry.epoch < 0 || entry.start_offset < 0 {
        warn!(epoch = entry.epoch, start_offset = entry.start_offset, "ignoring invalid epoch assignment");
        return false;
    }
    if let Some(latest) = entries.last() {
        if latest.epoch == entry.epoch && latest.start_offset <= entry.start_offset {
            return false;
        }
    }
    entries.retain(|e| e.epoch < entry.epoch && e.start_offset < entry.start_offset);
    entries.push(entry);
    true
}

fn truncate_from_end(entries: &mut Vec<EpochEntry>, end_offset: i64) -> bool {
    let before = entries.len();
    entries.retain(|e| e.start_offset < end_offset);
    entries.len() != before
}

fn truncate_from_start(entries: &mut Vec<EpochEntry>, start_offset: i64) -> bool {
    let covering = entries.iter().rposition(|e| e.start_offset <= start_offset);
    match covering {
        Some(i) if entries[i].start_offset < start_offset || i > 0 => {
            entries.drain(..i);
            entries[0].start_offset = start_offset;
            true
        }
        _ => false,
    }
}

fn epoch_for_offset(entries: &[EpochEntry], offset: i64) -> Option<i32> {
    entries
        .iter()
        .rev()
        .find(|e| e.start_offset <= offset)
        .map(|e| e.epoch)
}

/// In-memory epoch history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLeaderEpochCache {
    entries: Vec<EpochEntry>,
}

impl MemoryLeaderEpochCache {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries starting at or after `end_offset`.
    pub fn truncate_from_end(&mut self, end_offset: i64) {
        truncate_from_end(&mut self.entries, end_offset);
    }

    /// Drop history before `start_offset`; the epoch covering it now starts there.
    pub fn truncate_from_start(&mut self, start_offset: i64) {
        truncate_from_start(&mut self.entries, start_offset);
    }

    /// Epoch that `offset` was written in.
    pub fn epoch_for_offset(&self, offset: i64) -> Option<i32> {
        epoch_for_offset(&self.entries, offset)
    }
}

impl LeaderEpochCache for MemoryLeaderEpochCache {
    fn append(&mut self, epoch: i32, start_offset: i64) -> LogResult<()> {
        assign_entry(&mut self.entries, EpochEntry { epoch, start_offset });
        Ok(())
    }

    fn latest_epoch(&self) -> Option<i32> {
        self.entries.last().map(|e| e.epoch)
    }

    fn entries(&self) -> Vec<EpochEntry> {
        self.entries.clone()
    }
}

/// Epoch history persisted to a checkpoint file on every change.
pub struct CheckpointedLeaderEpochCache {
    checkpoint: CheckpointFile,
    path: String,
    entries: Vec<EpochEntry>,
}

impl CheckpointedLeaderEpochCache {
    /// Load the history at `path`, or start empty when there is none.
    pub fn open(dir: impl Into<Arc<dyn Directory>>, path: impl Into<String>) -> LogResult<Self> {
        let checkpoint = CheckpointFile::new(dir);
        let path = path.into();
        let entries = if checkpoint.directory().exists(&path) {
            let (_, entries): (i64, Vec<EpochEntry>) = checkpoint.read_postcard(&path)?;
            entries
        } else {
            Vec::new()
        };
        Ok(Self {
            checkpoint,
            path,
            entries,
        })
    }

    fn persist(&self) -> LogResult<()> {
        self.checkpoint.write_postcard(&self.path, 0, &self.entries)?;
        debug!(path = %self.path, entries = self.entries.len(), "wrote leader epoch checkpoint");
        Ok(())
    }

    /// Drop entries starting at or after `end_offset`.
    pub fn truncate_from_end(&mut self, end_offset: i64) -> LogResult<()> {
        if truncate_from_end(&mut self.entries, end_offset) {
            self.persist()?;
        }
        Ok(())
    }

    /// Drop history before `start_offset`; the epoch covering it now starts there.
    pub fn truncate_from_start(&mut self, start_offset: i64) -> LogResult<()> {
        if truncate_from_start(&mut self.entries, start_offset) {
            self.persist()?;
        }
        Ok(())
    }

    /// Epoch that `offset` was written in.
    pub fn epoch_for_offset(&self, offset: i64) -> Option<i32> {
        epoch_for_offset(&self.entries, offset)
    }
}

impl LeaderEpochCache for CheckpointedLeaderEpochCache {
    fn append(&mut self, epoch: i32, start_offset: i64) -> LogResult<()> {
        if assign_entry(&mut self.entries, EpochEntry { epoch, start_offset }) {
            self.persist()?;
        }
        Ok(())
    }

    fn latest_epoch(&self) -> Option<i32> {
        self.entries.last().map(|e| e.epoch)
    }

    fn entries(&self) -> Vec<EpochEntry> {
        self.entries.clone()
    }
}
