//! Segment files: append and positioned reads of encoded log records.
//!
//! A [`DataFile`] pairs a segment id with an IO handle and a write offset.
//! Segments are named `<nine-digit id>.data`; the same record framing is
//! reused for the auxiliary single-record files the engine maintains (the
//! hint file, the merge-finish marker, and the batch-id file).

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fio::{self, IoManager, IoType};
use crate::record::{self, LogRecord, MAX_HEADER_SIZE};

/// Suffix of every segment file.
pub const DATA_FILE_SUFFIX: &str = ".data";

/// Index hints emitted by the last merge.
pub const HINT_FILE_NAME: &str = "hint-index";

/// Marker recording the merge horizon of a completed merge.
pub const MERGE_FINISH_FILE_NAME: &str = "merge-finish";

/// Last-used batch id, persisted across restarts of persistent-index engines.
pub const BATCH_ID_FILE_NAME: &str = "wbid";

/// Returns the file name of the segment with the given id.
pub fn segment_file_name(segment_id: u32) -> String {
    format!("{segment_id:09}{DATA_FILE_SUFFIX}")
}

/// Returns the full path of the segment with the given id.
pub fn segment_file_path(dir: &Path, segment_id: u32) -> PathBuf {
    dir.join(segment_file_name(segment_id))
}

/// One append-only file holding a sequence of encoded log records.
pub struct DataFile {
    segment_id: u32,
    write_off: u64,
    io: Box<dyn IoManager>,
}

impl DataFile {
    /// Opens (creating if necessary) the segment with the given id.
    pub fn open(dir: &Path, segment_id: u32, io_type: IoType) -> Result<Self> {
        Self::open_path(segment_file_path(dir, segment_id), segment_id, io_type)
    }

    /// Opens the hint file in `dir`.
    pub fn hint_file(dir: &Path) -> Result<Self> {
        Self::open_path(dir.join(HINT_FILE_NAME), 0, IoType::Standard)
    }

    /// Opens the merge-finish marker file in `dir`.
    pub fn merge_finish_file(dir: &Path) -> Result<Self> {
        Self::open_path(dir.join(MERGE_FINISH_FILE_NAME), 0, IoType::Standard)
    }

    /// Opens the batch-id file in `dir`.
    pub fn batch_id_file(dir: &Path) -> Result<Self> {
        Self::open_path(dir.join(BATCH_ID_FILE_NAME), 0, IoType::Standard)
    }

    fn open_path(path: PathBuf, segment_id: u32, io_type: IoType) -> Result<Self> {
        let io = fio::new_io_manager(&path, io_type)?;
        Ok(Self {
            segment_id,
            write_off: 0,
            io,
        })
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    /// Offset the next append will land at.
    pub fn write_off(&self) -> u64 {
        self.write_off
    }

    pub fn set_write_off(&mut self, offset: u64) {
        self.write_off = offset;
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.io.size()
    }

    /// Appends raw bytes, advancing the write offset by what the IO layer
    /// reports written.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let written = self.io.write(buf)?;
        self.write_off += written as u64;
        Ok(written)
    }

    /// Flushes the file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    /// Replaces the IO backend. The previous handle is dropped, and with it
    /// closed, as part of the swap.
    pub fn set_io_type(&mut self, dir: &Path, io_type: IoType) -> Result<()> {
        let path = segment_file_path(dir, self.segment_id);
        self.io = fio::new_io_manager(&path, io_type)?;
        Ok(())
    }

    /// Reads the record starting at `offset`, returning it together with
    /// its full on-disk size.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidOffset`] if `offset` lies past the end of the file.
    /// - [`Error::EndOfFile`] when the header is exhausted, all zeros, or
    ///   the record extends past the end of the file (a torn tail).
    /// - [`Error::InvalidCrc`] if the checksum does not verify.
    /// - [`Error::DecodedEmptyKey`] if the header carries a zero key size.
    pub fn read_record(&self, offset: u64) -> Result<(LogRecord, u64)> {
        let file_size = self.io.size()?;
        if offset > file_size {
            return Err(Error::InvalidOffset {
                offset,
                size: file_size,
            });
        }

        // Never read the header past end-of-file; a shortened buffer decodes
        // as end-of-stream if it cannot hold a complete header.
        let header_avail = (file_size - offset).min(MAX_HEADER_SIZE as u64) as usize;
        let mut header_buf = vec![0u8; header_avail];
        if header_avail > 0 {
            self.io.read(&mut header_buf, offset)?;
        }

        let Some((header, header_len)) = record::decode_header(&header_buf)? else {
            return Err(Error::EndOfFile);
        };
        if header.key_size == 0 {
            return Err(Error::DecodedEmptyKey);
        }

        let key_size = u64::from(header.key_size);
        let value_size = u64::from(header.value_size);
        let record_size = header_len as u64 + key_size + value_size;
        if offset + record_size > file_size {
            return Err(Error::EndOfFile);
        }

        let mut kv = vec![0u8; (key_size + value_size) as usize];
        self.io.read(&mut kv, offset + header_len as u64)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_buf[record::CRC_SIZE..header_len]);
        hasher.update(&kv);
        let computed = hasher.finalize();
        if computed != header.crc {
            return Err(Error::InvalidCrc {
                stored: header.crc,
                computed,
            });
        }

        let value = kv.split_off(key_size as usize);
        Ok((
            LogRecord {
                key: kv,
                value,
                rec_type: header.rec_type,
            },
            record_size,
        ))
    }
}
