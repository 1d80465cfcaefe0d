//! In-memory ordered-map backend.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::record::LogRecordPos;

use super::{IndexIterator, Indexer, SnapshotIter};

/// Key directory over a `BTreeMap`, byte-wise key comparison, guarded by a
/// reader-writer lock.
pub(crate) struct BTreeIndex {
    tree: RwLock<BTreeMap<Vec<u8>, LogRecordPos>>,
}

impl BTreeIndex {
    pub(crate) fn new() -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Indexer for BTreeIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.write().insert(key, pos))
    }

    fn get(&self, key: &[u8]) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.read().get(key).copied())
    }

    fn delete(&self, key: &[u8]) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.write().remove(key))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.tree.read().len())
    }

    fn iterator(&self, reverse: bool) -> Result<Box<dyn IndexIterator>> {
        let entries = self
            .tree
            .read()
            .iter()
            .map(|(key, pos)| (key.clone(), *pos))
            .collect();
        Ok(Box::new(SnapshotIter::new(entries, reverse)))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
