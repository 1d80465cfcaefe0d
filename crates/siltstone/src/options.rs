//! Engine, batch, and iterator configuration.
//!
//! All configuration is plain structs with `Default` impls; callers own any
//! file- or environment-based configuration layer.

use std::path::PathBuf;

/// Which in-memory or on-disk structure backs the key directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// Ordered map with byte-wise key comparison, held in memory.
    BTree,
    /// Radix tree, held in memory.
    Radix,
    /// Persistent single-file B+-tree. Survives restarts, so reopening the
    /// engine does not replay data files.
    BPlusTree,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding all engine files. Created on open if missing.
    pub dir_path: PathBuf,

    /// Rollover threshold in bytes. The active segment is sealed when the
    /// next record would push it past this size. Must be greater than zero.
    pub segment_size: u64,

    /// Fsync the active segment after every append.
    pub always_sync: bool,

    /// When nonzero and `always_sync` is off, fsync once the number of
    /// unsynced bytes crosses this threshold.
    pub bytes_per_sync: u64,

    /// Index backend for the key directory.
    pub index_type: IndexType,

    /// Read segments through mmap during startup replay, switching back to
    /// standard file IO before any write is accepted.
    pub mmap_on_open: bool,

    /// Minimum `invalid_bytes / disk_bytes` ratio required before a merge
    /// is permitted. Zero disables the check. Must be within `[0, 1]`.
    pub merge_ratio: f32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir_path: std::env::temp_dir().join("siltstone"),
            segment_size: 256 * 1024 * 1024,
            always_sync: false,
            bytes_per_sync: 0,
            index_type: IndexType::BTree,
            mmap_on_open: false,
            merge_ratio: 0.5,
        }
    }
}

/// Write batch configuration.
#[derive(Debug, Clone)]
pub struct WriteBatchOptions {
    /// Fsync the active segment after the finish marker is appended.
    pub sync_on_commit: bool,

    /// Maximum number of staged writes a single commit may carry.
    pub max_batch_size: usize,
}

impl Default for WriteBatchOptions {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            max_batch_size: 10_000,
        }
    }
}

/// Iterator configuration.
#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    /// When non-empty, only keys beginning with this prefix are yielded.
    pub prefix: Vec<u8>,

    /// Iterate keys in descending order.
    pub reverse: bool,
}
