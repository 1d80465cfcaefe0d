//! Key directory: key → record position, with ordered iteration.
//!
//! Three interchangeable backends satisfy the [`Indexer`] capability. The
//! in-memory backends ([`btree::BTreeIndex`], [`radix::RadixIndex`]) keep
//! the whole directory in process memory and are rebuilt by log replay on
//! open; the persistent backend ([`bptree::BPlusTreeIndex`]) stores the
//! directory in a single-file B+-tree so reopening skips replay entirely.
//!
//! Iterators over all backends share one contract: lexicographic key order
//! (descending when reversed), `seek` to the least key `>=` the target (or
//! the greatest `<=` when reversed), and a point-in-time view that stays
//! consistent while the engine keeps mutating. Each backend materialises
//! that view as a snapshot array up front.

mod bptree;
mod btree;
mod radix;

use std::path::Path;

use crate::error::Result;
use crate::options::IndexType;
use crate::record::LogRecordPos;

pub(crate) use bptree::BPlusTreeIndex;
pub(crate) use btree::BTreeIndex;
pub(crate) use radix::RadixIndex;

/// The key-directory capability.
pub trait Indexer: Send + Sync {
    /// Inserts or replaces the position stored under `key`, returning the
    /// replaced position if the key already existed.
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>>;

    /// Looks up the position stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<LogRecordPos>>;

    /// Removes `key`, returning the position it mapped to, if any.
    fn delete(&self, key: &[u8]) -> Result<Option<LogRecordPos>>;

    /// Number of keys currently indexed.
    fn len(&self) -> Result<usize>;

    /// Creates an ordered iterator over a point-in-time view of the index.
    fn iterator(&self, reverse: bool) -> Result<Box<dyn IndexIterator>>;

    /// Flushes and releases backend resources.
    fn close(&self) -> Result<()>;
}

/// Ordered cursor over an index snapshot.
///
/// `key` and `value` panic if called on an exhausted iterator; callers
/// check [`IndexIterator::is_end`] first, in the
/// `rewind(); while !is_end() { ...; next() }` shape.
pub trait IndexIterator: Send {
    /// Repositions the cursor at the first entry.
    fn rewind(&mut self);

    /// Positions the cursor on the least key `>=` `key` (greatest `<=` when
    /// reversed); at end if no such key exists.
    fn seek(&mut self, key: &[u8]);

    /// Advances the cursor by one entry.
    fn next(&mut self);

    /// Whether the cursor has run off the end of the snapshot.
    fn is_end(&self) -> bool;

    /// Key under the cursor.
    fn key(&self) -> &[u8];

    /// Position under the cursor.
    fn value(&self) -> LogRecordPos;

    /// Releases the snapshot.
    fn close(&mut self);
}

/// Instantiates the backend selected in the engine options.
pub(crate) fn new_indexer(index_type: IndexType, dir_path: &Path) -> Result<Box<dyn Indexer>> {
    match index_type {
        IndexType::BTree => Ok(Box::new(BTreeIndex::new())),
        IndexType::Radix => Ok(Box::new(RadixIndex::new())),
        IndexType::BPlusTree => Ok(Box::new(BPlusTreeIndex::open(dir_path)?)),
    }
}

/// Snapshot-array iterator shared by every backend.
///
/// Entries arrive in ascending key order and are stored in iteration order,
/// so `seek` is a binary search and advancing is a cursor bump.
pub(crate) struct SnapshotIter {
    entries: Vec<(Vec<u8>, LogRecordPos)>,
    cursor: usize,
    reverse: bool,
}

impl SnapshotIter {
    /// Builds an iterator from entries sorted in ascending key order.
    pub(crate) fn new(mut entries: Vec<(Vec<u8>, LogRecordPos)>, reverse: bool) -> Self {
        debug_assert!(
            entries.windows(2).all(|w| w[0].0 < w[1].0),
            "snapshot entries must be strictly ascending"
        );
        if reverse {
            entries.reverse();
        }
        Self {
            entries,
            cursor: 0,
            reverse,
        }
    }
}

impl IndexIterator for SnapshotIter {
    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn seek(&mut self, key: &[u8]) {
        self.cursor = if self.reverse {
            self.entries.partition_point(|(k, _)| k.as_slice() > key)
        } else {
            self.entries.partition_point(|(k, _)| k.as_slice() < key)
        };
    }

    fn next(&mut self) {
        self.cursor += 1;
    }

    fn is_end(&self) -> bool {
        self.cursor >= self.entries.len()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.cursor].0
    }

    fn value(&self) -> LogRecordPos {
        self.entries[self.cursor].1
    }

    fn close(&mut self) {
        self.entries = Vec::new();
        self.cursor = 0;
    }
}
