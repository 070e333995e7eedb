//! Log record envelope.
//!
//! ```text
//! | magic "HSLG" (4) | version u16 (2) | kind u8 (1) | len u32 (4) | payload | crc32 (4) |
//! ```
//!
//! Integers are little-endian. The CRC covers header and payload. The
//! payload is a CBOR-encoded `Vec<Mutation>`.

use crate::error::{StoreError, StoreResult};
use crate::tables::Mutation;

/// Magic bytes identifying a log record.
pub const LOG_MAGIC: [u8; 4] = *b"HSLG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Kind of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Mutations of one committed transaction.
    Batch = 1,
    /// Full table state; replay resets the tables first.
    Snapshot = 2,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Batch),
            2 => Some(Self::Snapshot),
            _ => None,
        }
    }

    /// Converts the record kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Snapshot => "snapshot",
        }
    }
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Record kind.
    pub kind: RecordKind,
    /// Mutations in commit order.
    pub mutations: Vec<Mutation>,
}

impl LogRecord {
    /// Creates a batch record.
    pub fn batch(mutations: Vec<Mutation>) -> Self {
        Self {
            kind: RecordKind::Batch,
            mutations,
        }
    }

    /// Creates a snapshot record.
    pub fn snapshot(mutations: Vec<Mutation>) -> Self {
        Self {
            kind: RecordKind::Snapshot,
            mutations,
        }
    }

    /// Encodes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if CBOR encoding fails or the payload exceeds the
    /// 4-byte length field.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(&self.mutations, &mut payload).map_err(StoreError::codec)?;

        let len = u32::try_from(payload.len()).map_err(|_| {
            StoreError::InvalidArgument(format!("log record too large: {} bytes", payload.len()))
        })?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&LOG_MAGIC);
        buf.extend_from_slice(&LOG_VERSION.to_le_bytes());
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

/// Iterates over the records of an in-memory log image.
///
/// Yields `(offset, record)` pairs. An incomplete record at the tail ends
/// iteration and is reported by [`LogReader::torn_at`]; any other damage is
/// an error.
pub struct LogReader<'a> {
    data: &'a [u8],
    offset: usize,
    torn_at: Option<u64>,
    finished: bool,
}

impl<'a> LogReader<'a> {
    /// Creates a reader over a full log image.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            torn_at: None,
            finished: false,
        }
    }

    /// Offset of an incomplete tail record, if iteration stopped at one.
    #[must_use]
    pub fn torn_at(&self) -> Option<u64> {
        self.torn_at
    }

    /// Offset just past the last complete record read so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.offset as u64
    }

    fn read_next(&mut self) -> StoreResult<Option<(u64, LogRecord)>> {
        let start = self.offset;
        let remaining = &self.data[start..];
        if remaining.is_empty() {
            return Ok(None);
        }
        if remaining.len() < HEADER_SIZE {
            self.torn_at = Some(start as u64);
            return Ok(None);
        }

        let header = &remaining[..HEADER_SIZE];
        if header[0..4] != LOG_MAGIC {
            return Err(StoreError::corrupted(start as u64, "invalid magic"));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > LOG_VERSION {
            return Err(StoreError::corrupted(
                start as u64,
                format!("unsupported version {version}"),
            ));
        }

        let kind = RecordKind::from_byte(header[6]).ok_or_else(|| {
            StoreError::corrupted(start as u64, format!("unknown record kind {}", header[6]))
        })?;

        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if remaining.len() < total {
            self.torn_at = Some(start as u64);
            return Ok(None);
        }

        let body = &remaining[..HEADER_SIZE + len];
        let stored = &remaining[HEADER_SIZE + len..total];
        let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StoreError::ChecksumMismatch {
                offset: start as u64,
                expected,
                actual,
            });
        }

        let mutations: Vec<Mutation> = ciborium::de::from_reader(&body[HEADER_SIZE..])
            .map_err(|e| StoreError::corrupted(start as u64, format!("bad payload: {e}")))?;

        self.offset = start + total;
        Ok(Some((start as u64, LogRecord { kind, mutations })))
    }
}

impl Iterator for LogReader<'_> {
    type Item = StoreResult<(u64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
