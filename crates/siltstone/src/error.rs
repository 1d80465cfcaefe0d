//! Error types for the storage engine.
//!
//! A single crate-wide [`Error`] enum covers input validation, lookup
//! failures, engine state conflicts, on-disk corruption, and OS-level I/O.
//! The [`Error::EndOfFile`] variant doubles as the end-of-stream sentinel
//! for segment scans: replay loops stop at the first occurrence rather than
//! surfacing it to callers.

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Input validation
    #[error("key is empty")]
    EmptyKey,

    #[error("database directory path is empty")]
    InvalidDirPath,

    #[error("segment size must be greater than zero")]
    InvalidSegmentSize,

    #[error("merge ratio must be within [0, 1], got {0}")]
    InvalidMergeRatio(f32),

    // Lookup failures
    #[error("key not found")]
    KeyNotFound,

    #[error("data file for segment {segment_id} not found")]
    DataFileNotFound { segment_id: u32 },

    // Engine state
    #[error("database directory is locked by another process")]
    DatabaseInUse,

    #[error("a merge is already in progress")]
    MergeInProgress,

    #[error("merge ratio {ratio:.3} is below the configured threshold {threshold:.3}")]
    MergeRatioUnreached { ratio: f32, threshold: f32 },

    #[error("not enough disk space for merge: need {needed} bytes, {available} available")]
    DiskSpaceNotEnough { needed: u64, available: u64 },

    #[error("positioned read returned a tombstone")]
    DeletedKey,

    #[error("failed to update index")]
    IndexUpdateFailed,

    #[error("write batches are unavailable: persistent index has no batch-id state")]
    BatchNotAllowed,

    #[error("batch holds {len} writes, exceeding the configured maximum {max}")]
    BatchTooLarge { len: usize, max: usize },

    // Corruption
    #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    InvalidCrc { stored: u32, computed: u32 },

    #[error("malformed data file name: {0}")]
    MalformedFileName(String),

    #[error("invalid record type byte {0:#04x}")]
    InvalidRecordType(u8),

    #[error("read offset {offset} beyond file size {size}")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("record with empty key decoded from disk")]
    DecodedEmptyKey,

    #[error("malformed position record")]
    MalformedPosition,

    #[error("malformed batch-id key prefix")]
    MalformedKeyPrefix,

    #[error("malformed {file} marker file")]
    MalformedMarkerFile { file: &'static str },

    /// End-of-stream sentinel for segment scans. Never escapes the engine.
    #[error("end of data file")]
    EndOfFile,

    #[error("operation not supported by the mmap io backend: {0}")]
    Unsupported(&'static str),

    #[error("persistent index failure: {0}")]
    PersistentIndex(#[from] jammdb::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
