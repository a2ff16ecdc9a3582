//! Record batch format.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! Batch layout (little-endian):
//!
//! ```text
//! base_offset:i64 | length:i32 | partition_leader_epoch:i32 | magic:u8 | crc:u32 |
//! attributes:i16 | last_offset_delta:i32 | base_timestamp:i64 | max_timestamp:i64 |
//! producer_id:i64 | producer_epoch:i16 | base_sequence:i32 | records_count:i32 | records...
//! ```
//!
//! - `length` counts the bytes after the length field, so a batch occupies `length + 12` bytes.
//! - `crc` is `crc32fast` over everything from `attributes` to the end of the batch. The
//!   partition leader epoch sits outside the checksum.
//! - Offsets inside a batch are `base_offset + offset_delta` and are contiguous up to
//!   `base_offset + last_offset_delta`.
//! - Record framing: `length:u32 | timestamp_delta:i64 | offset_delta:i32 |
//!   key_len:i32 (-1 = null) | key | value_len:i32 (-1 = null) | value`.
//!
//! Attribute bits: `0..=2` compression codec, `4` transactional, `5` control batch.
//! Compressed payloads are opaque: the batch header stays readable, the records do not.

use crate::error::{LogError, LogResult};
use crate::formats::{BATCH_MAGIC, NO_PARTITION_LEADER_EPOCH, NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE, NO_TIMESTAMP};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Bytes of `base_offset` + `length`; every batch starts with this prefix.
pub const LOG_OVERHEAD: usize = 12;
/// Bytes up to and including the magic byte.
pub const HEADER_SIZE_UP_TO_MAGIC: usize = 17;
/// Fixed batch header size; the smallest structurally valid batch.
pub const RECORD_BATCH_OVERHEAD: usize = 61;

const PARTITION_LEADER_EPOCH_OFFSET: usize = 12;
const MAGIC_OFFSET: usize = 16;
const CRC_OFFSET: usize = 17;
const ATTRIBUTES_OFFSET: usize = 21;
const LAST_OFFSET_DELTA_OFFSET: usize = 23;
const BASE_TIMESTAMP_OFFSET: usize = 27;
const MAX_TIMESTAMP_OFFSET: usize = 35;
const PRODUCER_ID_OFFSET: usize = 43;
const PRODUCER_EPOCH_OFFSET: usize = 51;
const BASE_SEQUENCE_OFFSET: usize = 53;
const RECORDS_COUNT_OFFSET: usize = 57;

const COMPRESSION_CODEC_MASK: i16 = 0x07;
const TRANSACTIONAL_FLAG_MASK: i16 = 0x10;
const CONTROL_FLAG_MASK: i16 = 0x20;

const CONTROL_RECORD_KEY_SIZE: usize = 4;
const CONTROL_RECORD_VERSION: i16 = 0;

/// Compression codec named by a batch's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// Uncompressed records.
    None,
    /// gzip.
    Gzip,
    /// Snappy.
    Snappy,
    /// LZ4.
    Lz4,
    /// Zstandard.
    Zstd,
}

impl CompressionType {
    fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Snappy),
            3 => Some(Self::Lz4),
            4 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Kind of transaction marker carried by a control batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecordType {
    /// The producer's open transaction was aborted.
    Abort,
    /// The producer's open transaction was committed.
    Commit,
}

impl ControlRecordType {
    fn id(self) -> i16 {
        match self {
            Self::Abort => 0,
            Self::Commit => 1,
        }
    }

    fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(Self::Abort),
            1 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Absolute offset.
    pub offset: i64,
    /// Record timestamp, or [`NO_TIMESTAMP`].
    pub timestamp: i64,
    /// Optional key.
    pub key: Option<Vec<u8>>,
    /// Optional value.
    pub value: Option<Vec<u8>>,
}

/// Fixed-size header of a record batch, readable without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    /// First offset in the batch.
    pub base_offset: i64,
    /// Bytes after the length field.
    pub length: i32,
    /// Leader epoch of the partition when the batch was written.
    pub partition_leader_epoch: i32,
    /// Format version.
    pub magic: u8,
    /// Stored checksum.
    pub crc: u32,
    /// Attribute bits.
    pub attributes: i16,
    /// `last_offset - base_offset`.
    pub last_offset_delta: i32,
    /// Timestamp of the first record.
    pub base_timestamp: i64,
    /// Largest record timestamp.
    pub max_timestamp: i64,
    /// Producer id, or [`NO_PRODUCER_ID`].
    pub producer_id: i64,
    /// Producer epoch.
    pub producer_epoch: i16,
    /// Sequence of the first record.
    pub base_sequence: i32,
    /// Number of records.
    pub records_count: i32,
}

impl BatchHeader {
    /// Parse the header from the first [`RECORD_BATCH_OVERHEAD`] bytes of a batch.
    ///
    /// Only checks what the header itself can tell: size and magic. The checksum is verified
    /// by [`RecordBatch::ensure_valid`].
    pub fn parse(buf: &[u8], position: u64) -> LogResult<Self> {
        if buf.len() < RECORD_BATCH_OVERHEAD {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!("header needs {RECORD_BATCH_OVERHEAD} bytes, got {}", buf.len()),
            });
        }
        let length = LittleEndian::read_i32(&buf[8..12]);
        if length < (RECORD_BATCH_OVERHEAD - LOG_OVERHEAD) as i32 {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!(
                    "batch size {} is smaller than the minimum {RECORD_BATCH_OVERHEAD}",
                    i64::from(length) + LOG_OVERHEAD as i64
                ),
            });
        }
        let magic = buf[MAGIC_OFFSET];
        if magic != BATCH_MAGIC {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!("unsupported batch magic {magic}"),
            });
        }
        let header = Self {
            base_offset: LittleEndian::read_i64(&buf[0..8]),
            length,
            partition_leader_epoch: LittleEndian::read_i32(
                &buf[PARTITION_LEADER_EPOCH_OFFSET..MAGIC_OFFSET],
            ),
            magic,
            crc: LittleEndian::read_u32(&buf[CRC_OFFSET..ATTRIBUTES_OFFSET]),
            attributes: LittleEndian::read_i16(&buf[ATTRIBUTES_OFFSET..LAST_OFFSET_DELTA_OFFSET]),
            last_offset_delta: LittleEndian::read_i32(
                &buf[LAST_OFFSET_DELTA_OFFSET..BASE_TIMESTAMP_OFFSET],
            ),
            base_timestamp: LittleEndian::read_i64(&buf[BASE_TIMESTAMP_OFFSET..MAX_TIMESTAMP_OFFSET]),
            max_timestamp: LittleEndian::read_i64(&buf[MAX_TIMESTAMP_OFFSET..PRODUCER_ID_OFFSET]),
            producer_id: LittleEndian::read_i64(&buf[PRODUCER_ID_OFFSET..PRODUCER_EPOCH_OFFSET]),
            producer_epoch: LittleEndian::read_i16(&buf[PRODUCER_EPOCH_OFFSET..BASE_SEQUENCE_OFFSET]),
            base_sequence: LittleEndian::read_i32(&buf[BASE_SEQUENCE_OFFSET..RECORDS_COUNT_OFFSET]),
            records_count: LittleEndian::read_i32(&buf[RECORDS_COUNT_OFFSET..RECORD_BATCH_OVERHEAD]),
        };
        if header.last_offset_delta < 0 || header.records_count < 0 {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!(
                    "negative last offset delta {} or record count {}",
                    header.last_offset_delta, header.records_count
                ),
            });
        }
        let in_range = header.base_offset >= 0
            && header
                .base_offset
                .checked_add(i64::from(header.last_offset_delta))
                .is_some_and(|last| last < i64::MAX);
        if !in_range {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!(
                    "base offset {} with last offset delta {} is out of range",
                    header.base_offset, header.last_offset_delta
                ),
            });
        }
        Ok(header)
    }

    /// Total bytes occupied by the batch.
    pub fn size_in_bytes(&self) -> usize {
        self.length as usize + LOG_OVERHEAD
    }

    /// Last offset in the batch.
    pub fn last_offset(&self) -> i64 {
        self.base_offset + i64::from(self.last_offset_delta)
    }

    /// Offset following the batch.
    pub fn next_offset(&self) -> i64 {
        self.last_offset() + 1
    }

    /// Whether the batch belongs to a transaction.
    pub fn is_transactional(&self) -> bool {
        self.attributes & TRANSACTIONAL_FLAG_MASK != 0
    }

    /// Whether the batch is a transaction marker.
    pub fn is_control_batch(&self) -> bool {
        self.attributes & CONTROL_FLAG_MASK != 0
    }

    /// Whether a producer id is set.
    pub fn has_producer_id(&self) -> bool {
        self.producer_id > NO_PRODUCER_ID
    }

    /// Sequence of the last record, wrapping at `i32::MAX`.
    pub fn last_sequence(&self) -> i32 {
        if self.base_sequence == NO_SEQUENCE {
            return NO_SEQUENCE;
        }
        increment_sequence(self.base_sequence, self.last_offset_delta)
    }
}

/// `sequence + increment`, wrapping to 0 after `i32::MAX`.
pub fn increment_sequence(sequence: i32, increment: i32) -> i32 {
    if sequence > i32::MAX - increment {
        increment - (i32::MAX - sequence) - 1
    } else {
        sequence + increment
    }
}

/// An immutable, encoded record batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    header: BatchHeader,
    bytes: Vec<u8>,
}

impl RecordBatch {
    /// Wrap the encoded bytes of exactly one batch.
    pub fn from_bytes(bytes: Vec<u8>) -> LogResult<Self> {
        Self::from_bytes_at(bytes, 0)
    }

    pub(crate) fn from_bytes_at(bytes: Vec<u8>, position: u64) -> LogResult<Self> {
        let header = BatchHeader::parse(&bytes, position)?;
        if header.size_in_bytes() != bytes.len() {
            return Err(LogError::CorruptRecord {
                position,
                reason: format!(
                    "batch declares {} bytes but {} were supplied",
                    header.size_in_bytes(),
                    bytes.len()
                ),
            });
        }
        Ok(Self { header, bytes })
    }

    /// The parsed header.
    pub fn header(&self) -> &BatchHeader {
        &self.header
    }

    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total encoded size.
    pub fn size_in_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// First offset in the batch.
    pub fn base_offset(&self) -> i64 {
        self.header.base_offset
    }

    /// Last offset in the batch.
    pub fn last_offset(&self) -> i64 {
        self.header.last_offset()
    }

    /// Offset following the batch.
    pub fn next_offset(&self) -> i64 {
        self.header.next_offset()
    }

    /// Largest record timestamp.
    pub fn max_timestamp(&self) -> i64 {
        self.header.max_timestamp
    }

    /// Leader epoch recorded in the batch.
    pub fn partition_leader_epoch(&self) -> i32 {
        self.header.partition_leader_epoch
    }

    /// Producer id.
    pub fn producer_id(&self) -> i64 {
        self.header.producer_id
    }

    /// Producer epoch.
    pub fn producer_epoch(&self) -> i16 {
        self.header.producer_epoch
    }

    /// Sequence of the first record.
    pub fn base_sequence(&self) -> i32 {
        self.header.base_sequence
    }

    /// Sequence of the last record.
    pub fn last_sequence(&self) -> i32 {
        self.header.last_sequence()
    }

    /// Whether a producer id is set.
    pub fn has_producer_id(&self) -> bool {
        self.header.has_producer_id()
    }

    /// Whether the batch belongs to a transaction.
    pub fn is_transactional(&self) -> bool {
        self.header.is_transactional()
    }

    /// Whether the batch is a transaction marker.
    pub fn is_control_batch(&self) -> bool {
        self.header.is_control_batch()
    }

    /// Compression codec from the attributes, `None` for unknown codec ids.
    pub fn compression_type(&self) -> Option<CompressionType> {
        CompressionType::from_id(self.header.attributes & COMPRESSION_CODEC_MASK)
    }

    /// Checksum over the covered bytes as they are now.
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.bytes[ATTRIBUTES_OFFSET..])
    }

    /// Whether the stored checksum matches the bytes.
    pub fn is_valid(&self) -> bool {
        self.compute_checksum() == self.header.crc
    }

    /// Fail with `CrcMismatch` if the stored checksum does not match the bytes.
    pub fn ensure_valid(&self) -> LogResult<()> {
        let actual = self.compute_checksum();
        if actual != self.header.crc {
            return Err(LogError::CrcMismatch {
                expected: self.header.crc,
                actual,
            });
        }
        Ok(())
    }

    /// Decode the records of an uncompressed batch.
    pub fn records(&self) -> LogResult<Vec<Record>> {
        match self.compression_type() {
            Some(CompressionType::None) => {}
            other => {
                return Err(LogError::NotSupported(format!(
                    "cannot iterate records of a batch compressed with {other:?}"
                )))
            }
        }
        let count = usize::try_from(self.header.records_count).unwrap_or(0);
        let mut out = Vec::with_capacity(count);
        let mut pos = RECORD_BATCH_OVERHEAD;
        for _ in 0..count {
            let (record, next) = self.decode_record(pos)?;
            out.push(record);
            pos = next;
        }
        if pos != self.bytes.len() {
            return Err(LogError::Decode(format!(
                "{} trailing bytes after {count} records",
                self.bytes.len() - pos
            )));
        }
        Ok(out)
    }

    fn decode_record(&self, pos: usize) -> LogResult<(Record, usize)> {
        let buf = &self.bytes[..];
        let len = LittleEndian::read_u32(slice_at(buf, pos, 4)?) as usize;
        let end = pos + 4 + len;
        if end > buf.len() {
            return Err(LogError::Decode(format!(
                "record at byte {pos} declares {len} bytes past the batch end"
            )));
        }
        let mut at = pos + 4;
        let timestamp_delta = LittleEndian::read_i64(slice_at(buf, at, 8)?);
        at += 8;
        let offset_delta = LittleEndian::read_i32(slice_at(buf, at, 4)?);
        at += 4;
        let key = read_nullable(buf, &mut at)?;
        let value = read_nullable(buf, &mut at)?;
        if at != end {
            return Err(LogError::Decode(format!(
                "record at byte {pos} length mismatch"
            )));
        }
        let timestamp = if self.header.base_timestamp == NO_TIMESTAMP {
            NO_TIMESTAMP
        } else {
            self.header.base_timestamp + timestamp_delta
        };
        Ok((
            Record {
                offset: self.header.base_offset + i64::from(offset_delta),
                timestamp,
                key,
                value,
            },
            end,
        ))
    }

    /// The marker type of a control batch; `None` for data batches.
    pub fn control_record_type(&self) -> LogResult<Option<ControlRecordType>> {
        if !self.is_control_batch() {
            return Ok(None);
        }
        let records = self.records()?;
        let key = records
            .first()
            .and_then(|r| r.key.as_deref())
            .filter(|k| k.len() >= CONTROL_RECORD_KEY_SIZE)
            .ok_or_else(|| LogError::Decode("control batch without a control key".into()))?;
        let version = LittleEndian::read_i16(&key[0..2]);
        if version != CONTROL_RECORD_VERSION {
            return Err(LogError::Decode(format!(
                "unsupported control record version {version}"
            )));
        }
        let id = LittleEndian::read_i16(&key[2..4]);
        ControlRecordType::from_id(id)
            .map(Some)
            .ok_or_else(|| LogError::Decode(format!("unknown control record type {id}")))
    }
}

fn slice_at(buf: &[u8], at: usize, n: usize) -> LogResult<&[u8]> {
    buf.get(at..at.saturating_add(n))
        .ok_or_else(|| LogError::Decode(format!("record truncated at byte {at}")))
}

fn read_nullable(buf: &[u8], at: &mut usize) -> LogResult<Option<Vec<u8>>> {
    let n = LittleEndian::read_i32(slice_at(buf, *at, 4)?);
    *at += 4;
    if n < 0 {
        return Ok(None);
    }
    let data = slice_at(buf, *at, n as usize)?.to_vec();
    *at += n as usize;
    Ok(Some(data))
}

struct PendingRecord {
    offset: i64,
    timestamp: i64,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

/// Builder for uncompressed record batches.
pub struct RecordBatchBuilder {
    base_offset: i64,
    partition_leader_epoch: i32,
    producer_id: i64,
    producer_epoch: i16,
    base_sequence: i32,
    transactional: bool,
    control: bool,
    records: Vec<PendingRecord>,
}

impl RecordBatchBuilder {
    /// Start a batch whose first record gets `base_offset`.
    pub fn new(base_offset: i64) -> Self {
        Self {
            base_offset,
            partition_leader_epoch: NO_PARTITION_LEADER_EPOCH,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            base_sequence: NO_SEQUENCE,
            transactional: false,
            control: false,
            records: Vec::new(),
        }
    }

    /// Set the partition leader epoch.
    pub fn partition_leader_epoch(&mut self, epoch: i32) -> &mut Self {
        self.partition_leader_epoch = epoch;
        self
    }

    /// Set producer id, epoch and the sequence of the first record.
    pub fn producer(&mut self, producer_id: i64, producer_epoch: i16, base_sequence: i32) -> &mut Self {
        self.producer_id = producer_id;
        self.producer_epoch = producer_epoch;
        self.base_sequence = base_sequence;
        self
    }

    /// Mark the batch as part of a transaction.
    pub fn transactional(&mut self, transactional: bool) -> &mut Self {
        self.transactional = transactional;
        self
    }

    /// Append a record at the next offset.
    pub fn append(&mut self, timestamp: i64, key: Option<&[u8]>, value: &[u8]) -> &mut Self {
        let offset = self
            .records
            .last()
            .map(|r| r.offset + 1)
            .unwrap_or(self.base_offset);
        self.push(offset, timestamp, key, Some(value))
    }

    /// Turn the batch into a transaction marker of `kind`.
    pub fn control_marker(
        &mut self,
        kind: ControlRecordType,
        timestamp: i64,
        coordinator_epoch: i32,
    ) -> &mut Self {
        self.control = true;
        self.transactional = true;
        self.records.clear();
        let mut key = Vec::with_capacity(CONTROL_RECORD_KEY_SIZE);
        key.extend_from_slice(&CONTROL_RECORD_VERSION.to_le_bytes());
        key.extend_from_slice(&kind.id().to_le_bytes());
        let mut value = Vec::with_capacity(6);
        value.extend_from_slice(&CONTROL_RECORD_VERSION.to_le_bytes());
        value.extend_from_slice(&coordinator_epoch.to_le_bytes());
        let offset = self.base_offset;
        self.push(offset, timestamp, Some(&key), Some(&value))
    }

    fn push(&mut self, offset: i64, timestamp: i64, key: Option<&[u8]>, value: Option<&[u8]>) -> &mut Self {
        self.records.push(PendingRecord {
            offset,
            timestamp,
            key: key.map(<[u8]>::to_vec),
            value: value.map(<[u8]>::to_vec),
        });
        self
    }

    /// Encode the batch.
    pub fn build(&self) -> LogResult<RecordBatch> {
        let Some(last) = self.records.last() else {
            return Err(LogError::InvalidState("record batch must hold at least one record".into()));
        };
        let last_offset_delta = i32::try_from(last.offset - self.base_offset)
            .map_err(|_| LogError::Encode("batch spans more than i32::MAX offsets".into()))?;
        let records_count = i32::try_from(self.records.len())
            .map_err(|_| LogError::Encode("too many records in batch".into()))?;
        let timed = self.records.iter().map(|r| r.timestamp).filter(|t| *t != NO_TIMESTAMP);
        let base_timestamp = timed.clone().min().unwrap_or(NO_TIMESTAMP);
        let max_timestamp = timed.max().unwrap_or(NO_TIMESTAMP);

        let mut attributes: i16 = 0;
        if self.transactional {
            attributes |= TRANSACTIONAL_FLAG_MASK;
        }
        if self.control {
            attributes |= CONTROL_FLAG_MASK;
        }

        let mut buf: Vec<u8> = Vec::with_capacity(RECORD_BATCH_OVERHEAD + 32 * self.records.len());
        buf.write_i64::<LittleEndian>(self.base_offset)?;
        buf.write_i32::<LittleEndian>(0)?; // length, patched below
        buf.write_i32::<LittleEndian>(self.partition_leader_epoch)?;
        buf.write_u8(BATCH_MAGIC)?;
        buf.write_u32::<LittleEndian>(0)?; // crc, patched below
        buf.write_i16::<LittleEndian>(attributes)?;
        buf.write_i32::<LittleEndian>(last_offset_delta)?;
        buf.write_i64::<LittleEndian>(base_timestamp)?;
        buf.write_i64::<LittleEndian>(max_timestamp)?;
        buf.write_i64::<LittleEndian>(self.producer_id)?;
        buf.write_i16::<LittleEndian>(self.producer_epoch)?;
        buf.write_i32::<LittleEndian>(self.base_sequence)?;
        buf.write_i32::<LittleEndian>(records_count)?;

        for r in &self.records {
            let timestamp_delta = if base_timestamp == NO_TIMESTAMP || r.timestamp == NO_TIMESTAMP {
                0
            } else {
                r.timestamp - base_timestamp
            };
            let offset_delta = (r.offset - self.base_offset) as i32;
            let key_len = r.key.as_ref().map_or(0, Vec::len);
            let value_len = r.value.as_ref().map_or(0, Vec::len);
            let body_len = 8 + 4 + 4 + key_len + 4 + value_len;
            buf.write_u32::<LittleEndian>(
                u32::try_from(body_len).map_err(|_| LogError::Encode("record too large".into()))?,
            )?;
            buf.write_i64::<LittleEndian>(timestamp_delta)?;
            buf.write_i32::<LittleEndian>(offset_delta)?;
            for field in [&r.key, &r.value] {
                match field {
                    Some(bytes) => {
                        let n = i32::try_from(bytes.len())
                            .map_err(|_| LogError::Encode("record field too large".into()))?;
                        buf.write_i32::<LittleEndian>(n)?;
                        buf.extend_from_slice(bytes);
                    }
                    None => buf.write_i32::<LittleEndian>(-1)?,
                }
            }
        }

        let length = i32::try_from(buf.len() - LOG_OVERHEAD)
            .map_err(|_| LogError::Encode("batch larger than i32::MAX bytes".into()))?;
        LittleEndian::write_i32(&mut buf[8..12], length);
        let crc = crc32fast::hash(&buf[ATTRIBUTES_OFFSET..]);
        LittleEndian::write_u32(&mut buf[CRC_OFFSET..ATTRIBUTES_OFFSET], crc);
        RecordBatch::from_bytes(buf)
    }
}

/// Offsets and timestamps an append needs, derived from the batches being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendInfo {
    /// First offset of the first batch.
    pub first_offset: i64,
    /// Last offset of the last batch.
    pub last_offset: i64,
    /// Largest batch max timestamp.
    pub max_timestamp: i64,
    /// Last offset of the batch holding `max_timestamp`.
    pub shallow_offset_of_max_timestamp: i64,
}

/// An in-memory sequence of encoded batches, the unit passed to appends and returned by reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryRecords {
    buf: Vec<u8>,
}

impl MemoryRecords {
    /// No batches.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap raw bytes. They are validated lazily by [`MemoryRecords::batches`].
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// Concatenate `batches`.
    pub fn with_batches<'a>(batches: impl IntoIterator<Item = &'a RecordBatch>) -> Self {
        let mut buf = Vec::new();
        for b in batches {
            buf.extend_from_slice(b.as_bytes());
        }
        Self { buf }
    }

    /// Total bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Whether there are no bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Headers of every batch, without copying payloads. Trailing bytes that do not form a
    /// whole batch are an error.
    pub fn batch_headers(&self) -> LogResult<Vec<BatchHeader>> {
        self.split().map(|parts| parts.into_iter().map(|(h, _)| h).collect())
    }

    /// Decode every batch. Trailing bytes that do not form a whole batch are an error.
    pub fn batches(&self) -> LogResult<Vec<RecordBatch>> {
        Ok(self
            .split()?
            .into_iter()
            .map(|(header, range)| RecordBatch {
                header,
                bytes: self.buf[range].to_vec(),
            })
            .collect())
    }

    fn split(&self) -> LogResult<Vec<(BatchHeader, std::ops::Range<usize>)>> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < self.buf.len() {
            let rest = &self.buf[pos..];
            let header = BatchHeader::parse(rest, pos as u64)?;
            let size = header.size_in_bytes();
            if size > rest.len() {
                return Err(LogError::CorruptRecord {
                    position: pos as u64,
                    reason: format!("batch of {size} bytes truncated to {}", rest.len()),
                });
            }
            out.push((header, pos..pos + size));
            pos += size;
        }
        Ok(out)
    }

    /// Offsets and max timestamp of the contained batches; `None` when empty.
    pub fn append_info(&self) -> LogResult<Option<AppendInfo>> {
        let headers = self.batch_headers()?;
        let Some(first) = headers.first() else {
            return Ok(None);
        };
        let mut info = AppendInfo {
            first_offset: first.base_offset,
            last_offset: first.last_offset(),
            max_timestamp: NO_TIMESTAMP,
            shallow_offset_of_max_timestamp: first.last_offset(),
        };
        for h in &headers {
            info.last_offset = h.last_offset();
            if h.max_timestamp > info.max_timestamp {
                info.max_timestamp = h.max_timestamp;
                info.shallow_offset_of_max_timestamp = h.last_offset();
            }
        }
        Ok(Some(info))
    }
}

/// Length of the longest prefix of `bytes` made of whole batches. Stops at the first header
/// that is short or unparseable.
pub(crate) fn complete_batches_prefix(bytes: &[u8]) -> usize {
    let mut pos = 0usize;
    while bytes.len() - pos >= LOG_OVERHEAD {
        let length = LittleEndian::read_i32(&bytes[pos + 8..pos + 12]);
        if length < (RECORD_BATCH_OVERHEAD - LOG_OVERHEAD) as i32 {
            break;
        }
        let size = length as usize + LOG_OVERHEAD;
        if size > bytes.len() - pos {
            break;
        }
        pos += size;
    }
    pos
}
