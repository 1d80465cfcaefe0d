//! Persistent single-file B+-tree backend.
//!
//! Positions are stored under the user key in one bucket of a
//! [`jammdb`] file named `index-bptree` inside the engine directory. The
//! index itself is durable, so the engine skips log replay when reopening
//! with this backend; the price is a write transaction per index update.

use std::path::Path;

use jammdb::DB;

use crate::error::Result;
use crate::record::LogRecordPos;

use super::{IndexIterator, Indexer, SnapshotIter};

/// File name of the B+-tree index inside the engine directory.
pub const BPTREE_INDEX_FILE_NAME: &str = "index-bptree";

const BUCKET_NAME: &str = "siltstone-index";

pub(crate) struct BPlusTreeIndex {
    db: DB,
}

impl BPlusTreeIndex {
    /// Opens (creating if necessary) the index file and its bucket.
    pub(crate) fn open(dir_path: &Path) -> Result<Self> {
        let db = DB::open(dir_path.join(BPTREE_INDEX_FILE_NAME))?;
        let tx = db.tx(true)?;
        tx.get_or_create_bucket(BUCKET_NAME)?;
        tx.commit()?;
        Ok(Self { db })
    }
}

impl Indexer for BPlusTreeIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
        let tx = self.db.tx(true)?;
        let bucket = tx.get_bucket(BUCKET_NAME)?;
        let prev = match bucket.get_kv(&key) {
            Some(kv) => Some(LogRecordPos::decode(kv.value())?),
            None => None,
        };
        bucket.put(key, pos.encode())?;
        tx.commit()?;
        Ok(prev)
    }

    fn get(&self, key: &[u8]) -> Result<Option<LogRecordPos>> {
        let tx = self.db.tx(false)?;
        let bucket = tx.get_bucket(BUCKET_NAME)?;
        match bucket.get_kv(key) {
            Some(kv) => Ok(Some(LogRecordPos::decode(kv.value())?)),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &[u8]) -> Result<Option<LogRecordPos>> {
        let tx = self.db.tx(true)?;
        let bucket = tx.get_bucket(BUCKET_NAME)?;
        // A failed delete means the key was missing; that is reported, not
        // treated as an error.
        let Ok(kv) = bucket.delete(key) else {
            return Ok(None);
        };
        let prev = LogRecordPos::decode(kv.value())?;
        tx.commit()?;
        Ok(Some(prev))
    }

    fn len(&self) -> Result<usize> {
        let tx = self.db.tx(false)?;
        let bucket = tx.get_bucket(BUCKET_NAME)?;
        Ok(bucket.cursor().count())
    }

    fn iterator(&self, reverse: bool) -> Result<Box<dyn IndexIterator>> {
        let tx = self.db.tx(false)?;
        let bucket = tx.get_bucket(BUCKET_NAME)?;
        let mut entries = Vec::new();
        for data in bucket.cursor() {
            entries.push((
                data.key().to_vec(),
                LogRecordPos::decode(data.kv().value())?,
            ));
        }
        // The read transaction ends here; the snapshot array carries the
        // point-in-time view from now on.
        Ok(Box::new(SnapshotIter::new(entries, reverse)))
    }

    fn close(&self) -> Result<()> {
        // Every mutation committed its own transaction; nothing is buffered.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{check_iterator_contract, pos};
    use super::*;

    #[test]
    fn put_get_delete_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");

        {
            let index = BPlusTreeIndex::open(dir.path()).expect("open");
            assert!(index.put(b"alpha".to_vec(), pos(1, 0)).unwrap().is_none());
            assert_eq!(index.put(b"alpha".to_vec(), pos(2, 99)).unwrap(), Some(pos(1, 0)));
            index.put(b"beta".to_vec(), pos(1, 64)).unwrap();
            index.close().unwrap();
        }

        let index = BPlusTreeIndex::open(dir.path()).expect("reopen");
        assert_eq!(index.get(b"alpha").unwrap(), Some(pos(2, 99)));
        assert_eq!(index.len().unwrap(), 2);
        assert_eq!(index.delete(b"beta").unwrap(), Some(pos(1, 64)));
        assert!(index.delete(b"beta").unwrap().is_none());
        assert!(index.get(b"beta").unwrap().is_none());
    }

    #[test]
    fn missing_key_lookups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = BPlusTreeIndex::open(dir.path()).expect("open");
        assert!(index.get(b"nothing").unwrap().is_none());
        assert!(index.delete(b"nothing").unwrap().is_none());
    }

    #[test]
    fn iterator_contract() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = BPlusTreeIndex::open(dir.path()).expect("open");
        check_iterator_contract(&index);
    }
}
