//! On-disk format constants and file naming.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - Every file of a segment shares the stem `{base_offset:020}`; the suffix names the file type.
//! - All integers are little-endian.
//! - Index entries store offsets as signed 32-bit deltas from the segment base offset.

/// Suffix of the record batch store.
pub const LOG_FILE_SUFFIX: &str = ".log";
/// Suffix of the offset index.
pub const INDEX_FILE_SUFFIX: &str = ".index";
/// Suffix of the time index.
pub const TIME_INDEX_FILE_SUFFIX: &str = ".timeindex";
/// Suffix of the transaction (aborted txn) index.
pub const TXN_INDEX_FILE_SUFFIX: &str = ".txnindex";
/// Suffix of producer state snapshots.
pub const PRODUCER_SNAPSHOT_FILE_SUFFIX: &str = ".snapshot";
/// Marker suffix appended to files scheduled for deletion.
pub const DELETED_FILE_SUFFIX: &str = ".deleted";
/// Marker suffix used while a cleaned segment is being swapped in.
pub const SWAP_FILE_SUFFIX: &str = ".swap";

/// Magic bytes for checkpoint files (leader epoch cache, producer snapshots).
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"LSCK";
/// Current on-disk format version for checkpoint files.
pub const FORMAT_VERSION: u32 = 1;

/// Record batch format version written by this crate.
pub const BATCH_MAGIC: u8 = 2;

/// Sentinel for "no timestamp".
pub const NO_TIMESTAMP: i64 = -1;
/// Sentinel for "no producer id".
pub const NO_PRODUCER_ID: i64 = -1;
/// Sentinel for "no producer epoch".
pub const NO_PRODUCER_EPOCH: i16 = -1;
/// Sentinel for "no sequence".
pub const NO_SEQUENCE: i32 = -1;
/// Sentinel for "no partition leader epoch".
pub const NO_PARTITION_LEADER_EPOCH: i32 = -1;

/// Zero-padded stem shared by every file of the segment starting at `offset`.
pub fn filename_prefix_from_offset(offset: i64) -> String {
    format!("{offset:020}")
}

/// Join a directory-relative parent with a file name (`""` means the root).
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// Path of the file with `kind_suffix` for the segment at `base_offset`, plus an optional
/// marker suffix such as [`DELETED_FILE_SUFFIX`].
pub fn segment_file_path(parent: &str, base_offset: i64, kind_suffix: &str, marker: &str) -> String {
    join_path(
        parent,
        &format!(
            "{}{kind_suffix}{marker}",
            filename_prefix_from_offset(base_offset)
        ),
    )
}

/// Replace `old_suffix` at the end of `path` with `new_suffix`.
///
/// Returns `None` when `path` does not end with `old_suffix`.
pub fn replace_suffix(path: &str, old_suffix: &str, new_suffix: &str) -> Option<String> {
    let stem = path.strip_suffix(old_suffix)?;
    Some(format!("{stem}{new_suffix}"))
}

/// Parse the base offset out of a segment file name such as `00000000000000000042.log`.
pub fn offset_from_file_name(name: &str) -> Option<i64> {
    let stem = name.split('.').next()?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse::<i64>().ok()
}
