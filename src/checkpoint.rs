//! Checkpoint file: one postcard-encoded value with a header and CRC32.
//!
//! Used for producer state snapshots and the leader epoch checkpoint. Callers own the schema
//! and decide when to write.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - **Header**: `[CHECKPOINT_MAGIC][FORMAT_VERSION][end_offset:i64][payload_len:u64][crc32:u32]`
//!   (little-endian for integers).
//! - **Checksum**: `crc32fast` over the payload bytes.
//! - **`end_offset`**: the log offset the value is current up to (exclusive); `0` when the
//!   value is not tied to an offset.
//! - **Atomicity**: written via `Directory::atomic_write`, so readers see the old or the new
//!   file, never a mix.

use crate::error::{LogError, LogResult};
use crate::formats::{CHECKPOINT_MAGIC, FORMAT_VERSION};
use crate::storage::Directory;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;

/// Cap on payload size so a corrupt header cannot trigger a huge allocation.
pub const MAX_CHECKPOINT_PAYLOAD_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// Fixed-size header stored at the start of a checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Offset the payload is current up to.
    pub end_offset: i64,
    /// Payload length in bytes.
    pub payload_len: u64,
    /// CRC32 computed over payload bytes.
    pub checksum: u32,
}

impl CheckpointHeader {
    /// Number of bytes in the serialized header.
    pub const SIZE: usize = 4 + 4 + 8 + 8 + 4;

    fn write<W: Write>(&self, w: &mut W) -> LogResult<()> {
        w.write_all(&CHECKPOINT_MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        w.write_i64::<LittleEndian>(self.end_offset)?;
        w.write_u64::<LittleEndian>(self.payload_len)?;
        w.write_u32::<LittleEndian>(self.checksum)?;
        Ok(())
    }

    fn read<R: Read + ?Sized>(r: &mut R) -> LogResult<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != CHECKPOINT_MAGIC {
            return Err(LogError::Decode("invalid checkpoint magic".into()));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(LogError::Decode(format!(
                "checkpoint version {version} (expected {FORMAT_VERSION})"
            )));
        }
        Ok(Self {
            end_offset: r.read_i64::<LittleEndian>()?,
            payload_len: r.read_u64::<LittleEndian>()?,
            checksum: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Read/write checkpoint files in a `Directory`.
#[derive(Clone)]
pub struct CheckpointFile {
    dir: Arc<dyn Directory>,
}

impl CheckpointFile {
    /// Checkpoint helper for `dir`.
    pub fn new(dir: impl Into<Arc<dyn Directory>>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory checkpoints are written to.
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }

    /// Atomically replace `path` with `value`.
    pub fn write_postcard<T: serde::Serialize>(
        &self,
        path: &str,
        end_offset: i64,
        value: &T,
    ) -> LogResult<()> {
        let payload = postcard::to_allocvec(value).map_err(|e| LogError::Encode(e.to_string()))?;
        if payload.len() > MAX_CHECKPOINT_PAYLOAD_BYTES {
            return Err(LogError::Encode(format!(
                "checkpoint payload too large: {} bytes (max {MAX_CHECKPOINT_PAYLOAD_BYTES})",
                payload.len()
            )));
        }
        let header = CheckpointHeader {
            end_offset,
            payload_len: payload.len() as u64,
            checksum: crc32fast::hash(&payload),
        };
        let mut buf = Vec::with_capacity(CheckpointHeader::SIZE + payload.len());
        header.write(&mut buf)?;
        buf.extend_from_slice(&payload);
        self.dir.atomic_write(path, &buf)
    }

    /// Read `path`, validate its CRC and decode the value. Returns `(end_offset, value)`.
    pub fn read_postcard<T: serde::de::DeserializeOwned>(&self, path: &str) -> LogResult<(i64, T)> {
        let mut f = self.dir.open_file(path)?;
        let header = CheckpointHeader::read(&mut *f)?;
        let len = usize::try_from(header.payload_len)
            .ok()
            .filter(|n| *n <= MAX_CHECKPOINT_PAYLOAD_BYTES)
            .ok_or_else(|| {
                LogError::Decode(format!(
                    "checkpoint payload length {} exceeds {MAX_CHECKPOINT_PAYLOAD_BYTES}",
                    header.payload_len
                ))
            })?;
        let mut payload = vec![0u8; len];
        f.read_exact(&mut payload)?;
        let actual = crc32fast::hash(&payload);
        if actual != header.checksum {
            return Err(LogError::CrcMismatch {
                expected: header.checksum,
                actual,
            });
        }
        let value = postcard::from_bytes(&payload).map_err(|e| LogError::Decode(e.to_string()))?;
        Ok((header.end_offset, value))
    }
}
