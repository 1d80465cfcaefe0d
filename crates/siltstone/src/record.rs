//! Log record and position codecs.
//!
//! Every on-disk record is encoded as:
//!
//! ```text
//! +-----+------+----------+------------+-----+-------+
//! | crc | type | key size | value size | key | value |
//! +-----+------+----------+------------+-----+-------+
//!   4B    1B     1..5B       1..5B
//! ```
//!
//! The CRC is CRC32/IEEE over everything after the checksum itself, stored
//! little-endian. Sizes are zigzag varints. A header is at least 5 bytes
//! (checksum plus type byte plus one byte per size varint at minimum); a
//! decoder handed fewer than 5 bytes, or an all-zero header, reports
//! end-of-stream rather than an error so that zero-filled or truncated
//! segment tails terminate replay cleanly.
//!
//! Positions are encoded without a length prefix as
//! `uvarint(segment_id) ∥ zigzag-varint(offset) ∥ uvarint(record_size)`;
//! records carrying positions (hint-file entries) are length-framed by the
//! outer record codec.

use bytes::{BufMut, BytesMut};
use prost::encoding::{decode_varint, encode_varint};

use crate::error::{Error, Result};

/// Largest possible header: crc(4) + type(1) + two varint32 sizes (5 each).
pub const MAX_HEADER_SIZE: usize = 4 + 1 + 5 + 5;

/// Number of bytes occupied by the checksum field.
pub(crate) const CRC_SIZE: usize = 4;

/// Discriminates what a log record means on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordType {
    /// A live key-value pair.
    Normal,
    /// A deletion marker.
    Tombstone,
    /// Commit marker making a batch's records visible on replay.
    BatchFinish,
}

impl LogRecordType {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            LogRecordType::Normal => 0,
            LogRecordType::Tombstone => 1,
            LogRecordType::BatchFinish => 2,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(LogRecordType::Normal),
            1 => Some(LogRecordType::Tombstone),
            2 => Some(LogRecordType::BatchFinish),
            _ => None,
        }
    }
}

/// The unit of encoding on disk: key, value, and record type.
///
/// Keys carry the batch-id varint prefix by the time they reach the codec;
/// the codec itself is oblivious to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub rec_type: LogRecordType,
}

impl LogRecord {
    /// Serializes the record, returning the full buffer. The buffer length
    /// is the record's on-disk size.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MAX_HEADER_SIZE + self.key.len() + self.value.len());
        buf.put_u32_le(0); // checksum, patched below
        buf.put_u8(self.rec_type.as_byte());
        encode_varint(encode_zigzag(self.key.len() as i64), &mut buf);
        encode_varint(encode_zigzag(self.value.len() as i64), &mut buf);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);

        let crc = crc32fast::hash(&buf[CRC_SIZE..]);
        buf[..CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
        buf.to_vec()
    }
}

/// Decoded header fields of a log record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordHeader {
    pub crc: u32,
    pub rec_type: LogRecordType,
    pub key_size: u32,
    pub value_size: u32,
}

/// Decodes a record header from the start of `buf`.
///
/// Returns `Ok(None)` at end-of-stream: fewer than 5 bytes available, an
/// all-zero header, a size varint cut short, or a size outside the `u32`
/// range (all shapes a torn or zero-filled tail can take).
///
/// # Errors
///
/// [`Error::InvalidRecordType`] if the type byte is none of the known
/// record types.
pub(crate) fn decode_header(buf: &[u8]) -> Result<Option<(RecordHeader, usize)>> {
    if buf.len() < CRC_SIZE + 1 {
        return Ok(None);
    }
    let crc = u32::from_le_bytes(buf[..CRC_SIZE].try_into().expect("slice is 4 bytes"));
    let type_byte = buf[CRC_SIZE];

    let mut rest = &buf[CRC_SIZE + 1..];
    let available = rest.len();
    let Ok(raw_key_size) = decode_varint(&mut rest) else {
        return Ok(None);
    };
    let Ok(raw_value_size) = decode_varint(&mut rest) else {
        return Ok(None);
    };
    let header_len = CRC_SIZE + 1 + (available - rest.len());

    let Ok(key_size) = u32::try_from(decode_zigzag(raw_key_size)) else {
        return Ok(None);
    };
    let Ok(value_size) = u32::try_from(decode_zigzag(raw_value_size)) else {
        return Ok(None);
    };

    if crc == 0 && key_size == 0 && value_size == 0 {
        return Ok(None);
    }

    let rec_type =
        LogRecordType::from_byte(type_byte).ok_or(Error::InvalidRecordType(type_byte))?;

    Ok(Some((
        RecordHeader {
            crc,
            rec_type,
            key_size,
            value_size,
        },
        header_len,
    )))
}

/// Address of one record on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecordPos {
    /// Segment the record lives in.
    pub segment_id: u32,
    /// Byte offset of the record within the segment.
    pub offset: u64,
    /// Full encoded size of the record.
    pub size: u32,
}

impl LogRecordPos {
    /// Serializes the position without a length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5 + 10 + 5);
        encode_varint(u64::from(self.segment_id), &mut buf);
        encode_varint(encode_zigzag(self.offset as i64), &mut buf);
        encode_varint(u64::from(self.size), &mut buf);
        buf.to_vec()
    }

    /// Deserializes a position produced by [`LogRecordPos::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut rest = buf;
        let segment_id = decode_varint(&mut rest).map_err(|_| Error::MalformedPosition)?;
        let offset = decode_varint(&mut rest).map_err(|_| Error::MalformedPosition)?;
        let size = decode_varint(&mut rest).map_err(|_| Error::MalformedPosition)?;
        Ok(Self {
            segment_id: u32::try_from(segment_id).map_err(|_| Error::MalformedPosition)?,
            offset: u64::try_from(decode_zigzag(offset)).map_err(|_| Error::MalformedPosition)?,
            size: u32::try_from(size).map_err(|_| Error::MalformedPosition)?,
        })
    }
}

/// Maps a signed value onto the unsigned varint space, small magnitudes first.
pub(crate) fn encode_zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`encode_zigzag`].
pub(crate) fn decode_zigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
