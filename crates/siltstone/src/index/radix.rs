//! In-memory radix-tree backend.

use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};

use crate::error::Result;
use crate::record::LogRecordPos;

use super::{IndexIterator, Indexer, SnapshotIter};

/// Key directory over a radix trie. Same contract as the B-tree backend;
/// iteration materialises the trie's ordered traversal into a snapshot.
pub(crate) struct RadixIndex {
    tree: RwLock<Trie<Vec<u8>, LogRecordPos>>,
}

impl RadixIndex {
    pub(crate) fn new() -> Self {
        Self {
            tree: RwLock::new(Trie::new()),
        }
    }
}

impl Indexer for RadixIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.write().insert(key, pos))
    }

    fn get(&self, key: &[u8]) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.read().get(&key.to_vec()).copied())
    }

    fn delete(&self, key: &[u8]) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.write().remove(&key.to_vec()))
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

#[cfg(test)]
mod tests {
    use super::super::tests::{check_iterator_contract, pos};
    use super::*;

    #[test]
    fn put_get_delete() {
        let index = RadixIndex::new();

        assert!(index.put(b"radix".to_vec(), pos(1, 0)).unwrap().is_none());
        assert_eq!(index.get(b"radix").unwrap(), Some(pos(1, 0)));

        assert_eq!(index.put(b"radix".to_vec(), pos(3, 128)).unwrap(), Some(pos(1, 0)));
        assert_eq!(index.delete(b"radix").unwrap(), Some(pos(3, 128)));
        assert!(index.get(b"radix").unwrap().is_none());
        assert_eq!(index.len().unwrap(), 0);
    }

    #[test]
    fn shared_prefixes_stay_distinct() {
        let index = RadixIndex::new();
        index.put(b"app".to_vec(), pos(1, 0)).unwrap();
        index.put(b"apple".to_vec(), pos(1, 40)).unwrap();
        index.put(b"applesauce".to_vec(), pos(1, 80)).unwrap();

        assert_eq!(index.get(b"apple").unwrap(), Some(pos(1, 40)));
        index.delete(b"apple").unwrap();
        assert_eq!(index.get(b"app").unwrap(), Some(pos(1, 0)));
        assert_eq!(index.get(b"applesauce").unwrap(), Some(pos(1, 80)));
        assert!(index.get(b"apple").unwrap().is_none());
    }

    #[test]
    fn iterator_contract() {
        let index = RadixIndex::new();
        check_iterator_contract(&index);
    }
}
