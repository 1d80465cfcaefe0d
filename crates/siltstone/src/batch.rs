//! Atomic write batches.
//!
//! A batch stages writes in memory and commits them as one unit. On commit,
//! every staged record is appended with a fresh batch id prefixed to its
//! key, followed by a single [`LogRecordType::BatchFinish`] marker carrying
//! the same id. Replay only applies a batch once its marker is seen, so a
//! crash mid-commit leaves the whole batch invisible — that is the
//! atomicity guarantee.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use prost::encoding::{decode_varint, encode_varint};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::options::{IndexType, WriteBatchOptions};
use crate::record::{LogRecord, LogRecordPos, LogRecordType};

/// Batch id carried by non-batched records.
pub(crate) const NON_BATCH_ID: u64 = 0;

/// Well-known key of the finish marker (after its batch-id prefix).
pub(crate) const BATCH_FINISH_KEY: &[u8] = b"wb-finish";

/// A set of writes that commits atomically.
///
/// Staging is last-write-wins per key. The batch is independent of other
/// batches; only `commit` touches the engine.
pub struct WriteBatch<'a> {
    engine: &'a Engine,
    pending: Mutex<HashMap<Vec<u8>, LogRecord>>,
    options: WriteBatchOptions,
}

impl Engine {
    /// Creates a new write batch.
    ///
    /// # Errors
    ///
    /// [`Error::BatchNotAllowed`] when the persistent index backend is
    /// selected but neither a `wbid` file nor a freshly initialised
    /// directory vouches for the batch-id counter; handing out ids in that
    /// state could reuse ones already burned into the log.
    pub fn new_batch(&self, options: WriteBatchOptions) -> Result<WriteBatch<'_>> {
        if self.options.index_type == IndexType::BPlusTree
            && !self.batch_id_file_seen
            && !self.is_initial
        {
            return Err(Error::BatchNotAllowed);
        }
        Ok(WriteBatch {
            engine: self,
            pending: Mutex::new(HashMap::new()),
            options,
        })
    }
}

impl WriteBatch<'_> {
    /// Stages `value` to be written under `key` on commit.
    pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.pending.lock().insert(
            key.to_vec(),
            LogRecord {
                key: key.to_vec(),
                value: value.to_vec(),
                rec_type: LogRecordType::Normal,
            },
        );
        Ok(())
    }

    /// Stages a deletion of `key` on commit.
    ///
    /// Deleting a key the engine does not hold simply drops any staged
    /// write for it; no tombstone is recorded.
    pub fn delete(&self, key: Bytes) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let mut pending = self.pending.lock();
        if self.engine.index.get(&key)?.is_none() {
            pending.remove(key.as_ref());
            return Ok(());
        }
        pending.insert(
            key.to_vec(),
            LogRecord {
                key: key.to_vec(),
                value: Vec::new(),
                rec_type: LogRecordType::Tombstone,
            },
        );
        Ok(())
    }

    /// Number of currently staged writes.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether the batch has no staged writes.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Commits every staged write atomically.
    ///
    /// An empty batch is a no-op and does not consume a batch id.
    pub fn commit(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Ok(());
        }
        if pending.len() > self.options.max_batch_size {
            return Err(Error::BatchTooLarge {
                len: pending.len(),
                max: self.options.max_batch_size,
            });
        }

        // Hold the commit lock for the whole append span so batches cannot
        // interleave with each other.
        let _commit_guard = self.engine.batch_commit_lock.lock();
        let batch_id = self.engine.batch_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;

        let mut updates: HashMap<Vec<u8>, LogRecordPos> = HashMap::new();
        let mut deletes: Vec<(Vec<u8>, u32)> = Vec::new();
        for staged in pending.values() {
            let stamped = LogRecord {
                key: encode_key_with_batch_id(&staged.key, batch_id),
                value: staged.value.clone(),
                rec_type: staged.rec_type,
            };
            let pos = self.engine.append_record(&stamped)?;
            match staged.rec_type {
                LogRecordType::Normal => {
                    updates.insert(staged.key.clone(), pos);
                }
                LogRecordType::Tombstone => {
                    updates.remove(&staged.key);
                    deletes.push((staged.key.clone(), pos.size));
                }
                LogRecordType::BatchFinish => {
                    unreachable!("only normal and tombstone records are staged")
                }
            }
        }

        // The marker is what makes the batch visible on replay; failing to
        // append it fails the commit.
        let finish = LogRecord {
            key: encode_key_with_batch_id(BATCH_FINISH_KEY, batch_id),
            value: Vec::new(),
            rec_type: LogRecordType::BatchFinish,
        };
        self.engine.append_record(&finish)?;

        if self.options.sync_on_commit {
            self.engine.sync()?;
        }

        // Only after the marker is down does the batch reach the index.
        for (key, pos) in updates {
            if let Some(prev) = self.engine.index.put(key, pos)? {
                self.engine
                    .invalid_bytes
                    .fetch_add(u64::from(prev.size), std::sync::atomic::Ordering::SeqCst);
            }
        }
        for (key, tombstone_size) in deletes {
            let mut reclaimable = u64::from(tombstone_size);
            if let Some(prev) = self.engine.index.delete(&key)? {
                reclaimable += u64::from(prev.size);
            }
            self.engine
                .invalid_bytes
                .fetch_add(reclaimable, std::sync::atomic::Ordering::SeqCst);
        }

        pending.clear();
        Ok(())
    }
}

/// Prepends `uvarint(batch_id)` to a user key, producing the stored key.
pub(crate) fn encode_key_with_batch_id(key: &[u8], batch_id: u64) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(10 + key.len());
    encode_varint(batch_id, &mut out);
    out.put_slice(key);
    out.to_vec()
}

/// Splits a stored key into the user key and its batch id.
pub(crate) fn parse_key_with_batch_id(stored: &[u8]) -> Result<(Vec<u8>, u64)> {
    let mut rest = stored;
    let batch_id = decode_varint(&mut rest).map_err(|_| Error::MalformedKeyPrefix)?;
    Ok((rest.to_vec(), batch_id))
}

#[cfg(test)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::sync::atomic::Ordering;

    use crate::data_file::{DATA_FILE_SUFFIX, segment_file_path};
    use crate::engine::tests::test_options;
    use crate::util::tests::{test_key, test_value};

    use super::*;

    #[test]
    fn stored_key_round_trip() {
        let stored = encode_key_with_batch_id(b"user-key", 77);
        let (key, batch_id) = parse_key_with_batch_id(&stored).unwrap();
        assert_eq!(key, b"user-key");
        assert_eq!(batch_id, 77);

        let plain = encode_key_with_batch_id(b"user-key", NON_BATCH_ID);
        assert_eq!(plain.len(), b"user-key".len() + 1);
        assert_eq!(parse_key_with_batch_id(&plain).unwrap().1, NON_BATCH_ID);
    }

    #[test]
    fn staged_writes_invisible_until_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::open(test_options(dir.path())).expect("open");

        let batch = engine.new_batch(WriteBatchOptions::default()).unwrap();
        batch.put(test_key(1), test_value(1, 32)).unwrap();
        batch.put(test_key(2), test_value(2, 32)).unwrap();
        assert!(matches!(engine.get(test_key(1)), Err(Error::KeyNotFound)));

        batch.commit().unwrap();
        assert_eq!(engine.get(test_key(1)).unwrap(), test_value(1, 32));
        assert_eq!(engine.get(test_key(2)).unwrap(), test_value(2, 32));
        assert_eq!(engine.batch_id.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_commit_consumes_no_batch_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::open(test_options(dir.path())).expect("open");

        let batch = engine.new_batch(WriteBatchOptions::default()).unwrap();
        batch.commit().unwrap();
        assert_eq!(engine.batch_id.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::open(test_options(dir.path())).expect("open");

        let options = WriteBatchOptions {
            max_batch_size: 2,
            ..WriteBatchOptions::default()
        };
        let batch = engine.new_batch(options).unwrap();
        for n in 0..3 {
            batch.put(test_key(n), test_value(n, 8)).unwrap();
        }
        assert!(matches!(
            batch.commit(),
            Err(Error::BatchTooLarge { len: 3, max: 2 })
        ));
    }

    #[test]
    fn delete_of_absent_key_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::open(test_options(dir.path())).expect("open");

        let batch = engine.new_batch(WriteBatchOptions::default()).unwrap();
        batch.put(test_key(1), test_value(1, 8)).unwrap();
        // The engine has never seen this key; the staged put is dropped.
        batch.delete(test_key(1)).unwrap();
        batch.commit().unwrap();

        assert!(matches!(engine.get(test_key(1)), Err(Error::KeyNotFound)));
        assert_eq!(engine.batch_id.load(Ordering::SeqCst), 0, "nothing was staged");
    }

    #[test]
    fn staged_delete_shadows_prior_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::open(test_options(dir.path())).expect("open");
        engine.put(test_key(1), test_value(1, 8)).unwrap();

        let batch = engine.new_batch(WriteBatchOptions::default()).unwrap();
        batch.put(test_key(1), test_value(100, 8)).unwrap();
        batch.delete(test_key(1)).unwrap();
        batch.commit().unwrap();

        assert!(matches!(engine.get(test_key(1)), Err(Error::KeyNotFound)));
    }

    #[test]
    fn batch_survives_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = test_options(dir.path());

        {
            let engine = Engine::open(options.clone()).expect("open");
            let batch = engine.new_batch(WriteBatchOptions::default()).unwrap();
            for n in 0..100 {
                batch.put(test_key(n), test_value(n, 32)).unwrap();
            }
            batch.commit().unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(options).expect("reopen");
        for n in 0..100 {
            assert_eq!(engine.get(test_key(n)).unwrap(), test_value(n, 32));
        }
        // The replayed maximum seeds the next id.
        assert_eq!(engine.batch_id.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn truncated_finish_marker_hides_the_whole_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = test_options(dir.path());

        {
            let engine = Engine::open(options.clone()).expect("open");
            let batch = engine.new_batch(WriteBatchOptions::default()).unwrap();
            for n in 0..100 {
                batch.put(test_key(n), test_value(n, 32)).unwrap();
            }
            batch.commit().unwrap();
            engine.close().unwrap();
        }

        // Chop the tail off the last segment, taking the finish marker with
        // it — the crash-before-durable-marker shape.
        let last_segment = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| {
                let name = entry.unwrap().file_name();
                let name = name.to_string_lossy().into_owned();
                name.strip_suffix(DATA_FILE_SUFFIX)
                    .and_then(|stem| stem.parse::<u32>().ok())
            })
            .max()
            .expect("at least one segment");
        let path = segment_file_path(dir.path(), last_segment);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 8)
            .unwrap();

        let engine = Engine::open(options).expect("reopen");
        for n in 0..100 {
            assert!(
                matches!(engine.get(test_key(n)), Err(Error::KeyNotFound)),
                "key {n} must be invisible without the finish marker"
            );
        }
    }

    #[test]
    fn batch_order_applies_last_write_per_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = test_options(dir.path());

        {
            let engine = Engine::open(options.clone()).expect("open");
            let batch = engine.new_batch(WriteBatchOptions::default()).unwrap();
            batch.put(test_key(1), test_value(1, 16)).unwrap();
            batch.put(test_key(1), test_value(2, 16)).unwrap();
            batch.put(test_key(1), test_value(3, 16)).unwrap();
            batch.commit().unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(options).expect("reopen");
        assert_eq!(engine.get(test_key(1)).unwrap(), test_value(3, 16));
    }

    #[test]
    fn batches_refused_without_batch_id_evidence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = test_options(dir.path());
        options.index_type = crate::options::IndexType::BPlusTree;

        {
            // Fresh directory: batches allowed.
            let engine = Engine::open(options.clone()).expect("open");
            let batch = engine.new_batch(WriteBatchOptions::default()).unwrap();
            batch.put(test_key(1), test_value(1, 8)).unwrap();
            batch.commit().unwrap();
            engine.close().unwrap();
        }

        {
            // The wbid file written at close vouches for the counter.
            let engine = Engine::open(options.clone()).expect("reopen");
            assert!(engine.new_batch(WriteBatchOptions::default()).is_ok());
            assert_eq!(engine.batch_id.load(Ordering::SeqCst), 1);
            engine.close().unwrap();
            // Undo the wbid file this close just wrote.
            fs::remove_file(dir.path().join(crate::data_file::BATCH_ID_FILE_NAME)).unwrap();
        }

        // No wbid and not a fresh directory: refused.
        let engine = Engine::open(options).expect("reopen");
        assert!(matches!(
            engine.new_batch(WriteBatchOptions::default()),
            Err(Error::BatchNotAllowed)
        ));
    }
}
