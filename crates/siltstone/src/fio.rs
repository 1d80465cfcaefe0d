//! IO backends for segment files.
//!
//! Every segment is accessed through the [`IoManager`] capability: positioned
//! reads, appending writes, fsync, and size queries. Two backends exist:
//!
//! - [`FileIo`]: standard file IO, opened with create+append+read semantics.
//! - [`MmapIo`]: read-only memory map, used to speed up startup replay.
//!   `write` and `sync` fail with [`Error::Unsupported`].
//!
//! Closing is handled by drop. The engine swaps a segment's backend by
//! replacing its boxed handle, which drops (and therefore closes) the old
//! one before the new handle is opened by the caller.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use memmap2::Mmap;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Selects the backend a segment file is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// Buffered standard file IO.
    Standard,
    /// Read-only memory map.
    Mmap,
}

/// Uniform read/write/sync/size capability over one file.
pub trait IoManager: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Appends `buf` to the end of the file, returning the bytes written.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Flushes file contents to stable storage.
    fn sync(&self) -> Result<()>;

    /// Current file size in bytes.
    fn size(&self) -> Result<u64>;
}

/// Opens the backend of the requested type for `path`, creating the file if
/// it does not exist.
pub fn new_io_manager(path: &Path, io_type: IoType) -> Result<Box<dyn IoManager>> {
    match io_type {
        IoType::Standard => Ok(Box::new(FileIo::new(path)?)),
        IoType::Mmap => Ok(Box::new(MmapIo::new(path)?)),
    }
}

/// Standard file IO backend.
pub struct FileIo {
    file: RwLock<File>,
}

impl FileIo {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: RwLock::new(file),
        })
    }
}

impl IoManager for FileIo {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file.read();
        file.read_exact_at(buf, offset)?;
        Ok(buf.len())
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut file = self.file.write();
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn sync(&self) -> Result<()> {
        self.file.read().sync_all()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.read().metadata()?.len())
    }
}

/// Read-only mmap backend.
///
/// Zero-length files are representable (`map` is `None`); mapping only
/// happens for non-empty files since an empty mapping is rejected by the OS.
pub struct MmapIo {
    map: Option<Mmap>,
    len: u64,
}

impl MmapIo {
    #[allow(unsafe_code)]
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let map = if len == 0 {
            None
        } else {
            // SAFETY: segment files are append-only and this backend is only
            // handed out for reads of the already-written prefix, which is
            // never mutated or truncated while the engine holds the file lock.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { map, len })
    }
}

impl IoManager for MmapIo {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset + buf.len() as u64;
        if end > self.len {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past the end of the mapped file",
            )));
        }
        let map = self
            .map
            .as_ref()
            .expect("non-empty mapped file has a mapping");
        buf.copy_from_slice(&map[offset as usize..end as usize]);
        Ok(buf.len())
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::Unsupported("write"))
    }

    fn sync(&self) -> Result<()> {
        Err(Error::Unsupported("sync"))
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len)
    }
}
