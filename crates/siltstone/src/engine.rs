//! Engine core: open/close, reads and writes, replay, stats, backup.
//!
//! The engine owns the segment set. Exactly one segment is *active* and
//! receives appends; all others are immutable and live in an ordered map
//! keyed by segment id. The in-memory key directory maps each user key to
//! the position of its most recent live record.
//!
//! # Directory layout
//!
//! ```text
//! {dir_path}/
//! ├── 000000001.data   <- immutable segment
//! ├── 000000002.data   <- active segment
//! ├── hint-index       <- optional, index hints from the last merge
//! ├── merge-finish     <- optional, marker carrying the merge horizon
//! ├── wbid             <- optional, persistent-index batch-id carryover
//! ├── index-bptree     <- persistent index backend only
//! └── filelock         <- advisory lock sentinel
//! ```
//!
//! # Concurrency
//!
//! Appends serialise on the active segment's write lock; readers take the
//! segment locks shared. Batch commits additionally hold a dedicated commit
//! mutex for the span of the whole batch. Lock order is always active
//! before older.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};

use crate::batch::{self, NON_BATCH_ID};
use crate::data_file::{BATCH_ID_FILE_NAME, DATA_FILE_SUFFIX, DataFile};
use crate::error::{Error, Result};
use crate::fio::IoType;
use crate::index::{self, Indexer};
use crate::merge;
use crate::options::{IndexType, Options};
use crate::record::{LogRecord, LogRecordPos, LogRecordType};
use crate::util;

/// Advisory-lock sentinel file name.
pub(crate) const FILE_LOCK_NAME: &str = "filelock";

/// Segment ids start at one and strictly increase.
pub(crate) const FIRST_SEGMENT_ID: u32 = 1;

/// A Bitcask-style embedded key-value store.
///
/// All operations are internally synchronised; the engine is shared across
/// threads by reference.
pub struct Engine {
    pub(crate) options: Options,
    pub(crate) active: RwLock<Option<DataFile>>,
    pub(crate) older: RwLock<BTreeMap<u32, DataFile>>,
    pub(crate) index: Box<dyn Indexer>,
    /// Serialises whole-batch commits against each other.
    pub(crate) batch_commit_lock: Mutex<()>,
    /// Last batch id handed out; 0 means none yet.
    pub(crate) batch_id: AtomicU64,
    /// Held for the duration of a merge; `try_lock` failure means one is
    /// already running.
    pub(crate) merge_lock: Mutex<()>,
    lock_file: File,
    /// Bytes appended since the last fsync. Only touched while holding the
    /// active segment's write lock.
    bytes_since_sync: AtomicU64,
    /// Bytes of records no longer referenced by the index.
    pub(crate) invalid_bytes: AtomicU64,
    /// Whether a `wbid` file was found (and consumed) at open.
    pub(crate) batch_id_file_seen: bool,
    /// Whether the directory was created by, or empty at, this open.
    pub(crate) is_initial: bool,
    closed: AtomicBool,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct Stat {
    /// Number of keys in the index.
    pub key_count: usize,
    /// Number of segment files, active included.
    pub segment_count: usize,
    /// Bytes reclaimable by a merge.
    pub invalid_bytes: u64,
    /// Total size of the engine directory on disk.
    pub disk_bytes: u64,
}

impl Engine {
    /// Opens (creating if necessary) an engine rooted at
    /// `options.dir_path`.
    ///
    /// Installs any completed merge output, enumerates segments, and
    /// rebuilds the index: volatile backends replay the hint file and data
    /// files; the persistent backend recovers its batch id from the `wbid`
    /// file and skips replay.
    ///
    /// # Errors
    ///
    /// [`Error::DatabaseInUse`] if another process holds the directory.
    pub fn open(options: Options) -> Result<Self> {
        check_options(&options)?;

        let dir_path = options.dir_path.clone();
        let mut is_initial = false;
        if !dir_path.is_dir() {
            fs::create_dir_all(&dir_path)?;
            is_initial = true;
        }
        if fs::read_dir(&dir_path)?.next().is_none() {
            is_initial = true;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir_path.join(FILE_LOCK_NAME))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::DatabaseInUse);
        }

        // A completed merge is swapped in before segments are enumerated.
        let merge_installed = merge::install_merge_output(&dir_path)?;

        let io_type = if options.mmap_on_open {
            IoType::Mmap
        } else {
            IoType::Standard
        };
        let (active, older) = load_data_files(&dir_path, io_type)?;
        let index = index::new_indexer(options.index_type, &dir_path)?;

        let mut engine = Engine {
            active: RwLock::new(active),
            older: RwLock::new(older),
            index,
            batch_commit_lock: Mutex::new(()),
            batch_id: AtomicU64::new(0),
            merge_lock: Mutex::new(()),
            lock_file,
            bytes_since_sync: AtomicU64::new(0),
            invalid_bytes: AtomicU64::new(0),
            batch_id_file_seen: false,
            is_initial,
            closed: AtomicBool::new(false),
            options,
        };

        if engine.options.index_type == IndexType::BPlusTree {
            // The index survived the restart; only the batch id and the
            // active segment's write offset need recovering.
            engine.load_batch_id_file()?;
            if merge_installed {
                // The compacted segments invalidated every persisted
                // position at or below the horizon. Repair from the hint
                // file, then bring post-horizon writes back on top of it.
                engine.load_index_from_hint_file()?;
                engine.load_index_from_data_files()?;
            } else {
                let mut active = engine.active.write();
                if let Some(active_file) = active.as_mut() {
                    let size = active_file.file_size()?;
                    active_file.set_write_off(size);
                }
            }
        } else {
            engine.load_index_from_hint_file()?;
            let max_batch_id = engine.load_index_from_data_files()?;
            engine.batch_id.store(max_batch_id, Ordering::SeqCst);
        }

        // Startup replay is over; every segment must accept appends again.
        if engine.options.mmap_on_open {
            engine.reset_io_type()?;
        }

        let keys = engine.index.len()?;
        tracing::info!(
            path = %engine.options.dir_path.display(),
            keys,
            "opened engine"
        );
        Ok(engine)
    }

    /// Flushes state and releases the directory lock. Returns immediately
    /// if nothing was ever written.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let active = self.active.read();
            let Some(active_file) = active.as_ref() else {
                return Ok(());
            };
            self.index.close()?;
            if self.options.index_type == IndexType::BPlusTree {
                // No replay will rediscover the batch id on reopen, so it
                // is carried across in its own single-record file.
                let mut batch_id_file = DataFile::batch_id_file(&self.options.dir_path)?;
                let record = LogRecord {
                    key: BATCH_ID_FILE_NAME.as_bytes().to_vec(),
                    value: self.batch_id.load(Ordering::SeqCst).to_string().into_bytes(),
                    rec_type: LogRecordType::Normal,
                };
                batch_id_file.write(&record.encode())?;
                batch_id_file.sync()?;
            }
            active_file.sync()?;
        }
        FileExt::unlock(&self.lock_file)?;
        Ok(())
    }

    /// Fsyncs the active segment.
    pub fn sync(&self) -> Result<()> {
        if let Some(active_file) = self.active.read().as_ref() {
            active_file.sync()?;
        }
        Ok(())
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let record = LogRecord {
            key: batch::encode_key_with_batch_id(&key, NON_BATCH_ID),
            value: value.to_vec(),
            rec_type: LogRecordType::Normal,
        };
        let pos = self.append_record(&record)?;

        if let Some(prev) = self.index.put(key.to_vec(), pos)? {
            self.invalid_bytes
                .fetch_add(u64::from(prev.size), Ordering::SeqCst);
        }
        Ok(())
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] if the key is absent or deleted.
    pub fn get(&self, key: Bytes) -> Result<Bytes> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let Some(pos) = self.index.get(&key)? else {
            return Err(Error::KeyNotFound);
        };
        self.get_value_by_position(&pos)
    }

    /// Removes `key`, appending a tombstone record.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] if the key is not currently stored.
    pub fn delete(&self, key: Bytes) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if self.index.get(&key)?.is_none() {
            return Err(Error::KeyNotFound);
        }

        let record = LogRecord {
            key: batch::encode_key_with_batch_id(&key, NON_BATCH_ID),
            value: Vec::new(),
            rec_type: LogRecordType::Tombstone,
        };
        let pos = self.append_record(&record)?;

        // The tombstone is unreferenced the moment it lands, and so is the
        // record it shadows.
        let mut reclaimable = u64::from(pos.size);
        if let Some(prev) = self.index.delete(&key)? {
            reclaimable += u64::from(prev.size);
        }
        self.invalid_bytes.fetch_add(reclaimable, Ordering::SeqCst);
        Ok(())
    }

    /// All keys in the index, in lexicographic order (descending when
    /// `reverse` is set).
    pub fn list_keys(&self, reverse: bool) -> Result<Vec<Bytes>> {
        let mut iter = self.index.iterator(reverse)?;
        let mut keys = Vec::new();
        iter.rewind();
        while !iter.is_end() {
            keys.push(Bytes::copy_from_slice(iter.key()));
            iter.next();
        }
        iter.close();
        Ok(keys)
    }

    /// Calls `f` for every key-value pair in ascending key order, stopping
    /// early when `f` returns `false`.
    pub fn fold<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Bytes, Bytes) -> bool,
    {
        let mut iter = self.index.iterator(false)?;
        iter.rewind();
        while !iter.is_end() {
            let value = self.get_value_by_position(&iter.value())?;
            if !f(Bytes::copy_from_slice(iter.key()), value) {
                break;
            }
            iter.next();
        }
        iter.close();
        Ok(())
    }

    /// Point-in-time statistics.
    pub fn stat(&self) -> Result<Stat> {
        let key_count = self.index.len()?;
        let segment_count = {
            let active = self.active.read();
            let older = self.older.read();
            older.len() + usize::from(active.is_some())
        };
        Ok(Stat {
            key_count,
            segment_count,
            invalid_bytes: self.invalid_bytes.load(Ordering::SeqCst),
            disk_bytes: util::dir_size(&self.options.dir_path)?,
        })
    }

    /// Copies the engine directory to `target_dir`, skipping the file-lock
    /// sentinel. Writers are held off for the duration of the copy.
    pub fn backup(&self, target_dir: impl AsRef<Path>) -> Result<()> {
        let _write_pause = self.active.write();
        util::copy_dir(
            &self.options.dir_path,
            target_dir.as_ref(),
            &[FILE_LOCK_NAME],
        )
    }

    /// Reads and decodes the record at `pos` from whichever segment holds
    /// it.
    pub(crate) fn get_value_by_position(&self, pos: &LogRecordPos) -> Result<Bytes> {
        let active = self.active.read();
        let older = self.older.read();

        let data_file = match active.as_ref() {
            Some(active_file) if active_file.segment_id() == pos.segment_id => active_file,
            _ => older.get(&pos.segment_id).ok_or(Error::DataFileNotFound {
                segment_id: pos.segment_id,
            })?,
        };

        let (record, _) = data_file.read_record(pos.offset)?;
        if record.rec_type == LogRecordType::Tombstone {
            // The index never points at tombstones; reaching one here means
            // the directory and the log disagree.
            return Err(Error::DeletedKey);
        }
        Ok(record.value.into())
    }

    /// Appends an encoded record to the active segment, rolling over first
    /// when the record would not fit, and applies the durability policy.
    pub(crate) fn append_record(&self, record: &LogRecord) -> Result<LogRecordPos> {
        let encoded = record.encode();
        let size = encoded.len() as u64;

        let mut active = self.active.write();
        if active.is_none() {
            *active = Some(DataFile::open(
                &self.options.dir_path,
                FIRST_SEGMENT_ID,
                IoType::Standard,
            )?);
        }

        let needs_rollover = active
            .as_ref()
            .is_some_and(|file| file.write_off() + size > self.options.segment_size);
        if needs_rollover {
            let sealed_id = {
                let current = active.as_ref().expect("rollover implies an active segment");
                current.sync()?;
                current.segment_id()
            };
            // Open the replacement first so a failure leaves the current
            // active segment in place.
            let next = DataFile::open(&self.options.dir_path, sealed_id + 1, IoType::Standard)?;
            let sealed = active.replace(next).expect("rollover implies an active segment");
            self.older.write().insert(sealed_id, sealed);
            tracing::debug!(segment_id = sealed_id + 1, "rolled over to a new active segment");
        }

        let active_file = active.as_mut().expect("active segment was just ensured");
        let offset = active_file.write_off();
        active_file.write(&encoded)?;

        let mut need_sync = self.options.always_sync;
        if !need_sync && self.options.bytes_per_sync > 0 {
            // Only mutated here, under the active segment's write lock.
            let unsynced = self.bytes_since_sync.fetch_add(size, Ordering::SeqCst) + size;
            need_sync = unsynced >= self.options.bytes_per_sync;
        }
        if need_sync {
            active_file.sync()?;
            self.bytes_since_sync.store(0, Ordering::SeqCst);
        }

        Ok(LogRecordPos {
            segment_id: active_file.segment_id(),
            offset,
            size: encoded.len() as u32,
        })
    }

    /// Loads `(user_key, position)` pairs from the hint file, covering all
    /// segments at or below the merge horizon.
    fn load_index_from_hint_file(&self) -> Result<()> {
        let path = self.options.dir_path.join(crate::data_file::HINT_FILE_NAME);
        if !path.is_file() {
            return Ok(());
        }

        let hint_file = DataFile::hint_file(&self.options.dir_path)?;
        let mut offset = 0;
        loop {
            match hint_file.read_record(offset) {
                Ok((record, size)) => {
                    let pos = LogRecordPos::decode(&record.value)?;
                    self.index.put(record.key, pos)?;
                    offset += size;
                }
                Err(Error::EndOfFile) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Replays every segment above the merge horizon in ascending id order,
    /// rebuilding the index and buffering batched records until their
    /// finish marker is seen. Returns the largest batch id observed.
    fn load_index_from_data_files(&self) -> Result<u64> {
        let horizon = merge::merge_horizon_marker(&self.options.dir_path)?;
        let mut max_batch_id = 0;
        let mut pending: HashMap<u64, Vec<(Vec<u8>, LogRecordType, LogRecordPos)>> = HashMap::new();

        let mut active = self.active.write();
        let older = self.older.read();

        let active_id = active.as_ref().map(DataFile::segment_id);
        let mut segment_ids: Vec<u32> = older.keys().copied().collect();
        if let Some(id) = active_id {
            segment_ids.push(id);
        }

        let mut active_tail = 0;
        for id in segment_ids {
            if id <= horizon {
                // Subsumed by the merge output; the hint file already
                // covered it.
                continue;
            }
            let data_file = if Some(id) == active_id {
                active.as_ref().expect("active id implies an active segment")
            } else {
                older.get(&id).expect("enumerated segment is present")
            };

            let mut offset = 0;
            loop {
                let (record, size) = match data_file.read_record(offset) {
                    Ok(result) => result,
                    Err(Error::EndOfFile) => break,
                    Err(err) => return Err(err),
                };
                let pos = LogRecordPos {
                    segment_id: id,
                    offset,
                    size: size as u32,
                };

                let (user_key, batch_id) = batch::parse_key_with_batch_id(&record.key)?;
                if batch_id == NON_BATCH_ID {
                    self.apply_replayed_record(user_key, record.rec_type, pos)?;
                } else if record.rec_type == LogRecordType::BatchFinish {
                    // The whole batch becomes visible at once; without this
                    // marker its records are dropped with the buffer.
                    if let Some(records) = pending.remove(&batch_id) {
                        for (key, rec_type, record_pos) in records {
                            self.apply_replayed_record(key, rec_type, record_pos)?;
                        }
                    }
                } else {
                    pending
                        .entry(batch_id)
                        .or_default()
                        .push((user_key, record.rec_type, pos));
                }

                max_batch_id = max_batch_id.max(batch_id);
                offset += size;
            }

            if Some(id) == active_id {
                active_tail = offset;
                let file_size = data_file.file_size()?;
                if offset < file_size {
                    // Cut the file back to the last complete record so that
                    // future appends land where the index says they do.
                    tracing::warn!(
                        segment_id = id,
                        tail_bytes = file_size - offset,
                        "discarding truncated segment tail"
                    );
                    let path = crate::data_file::segment_file_path(&self.options.dir_path, id);
                    OpenOptions::new().write(true).open(&path)?.set_len(offset)?;
                }
            }
        }

        if let Some(active_file) = active.as_mut() {
            active_file.set_write_off(active_tail);
        }
        Ok(max_batch_id)
    }

    /// Applies one replayed record to the index, keeping the invalid-byte
    /// counter in step.
    fn apply_replayed_record(
        &self,
        key: Vec<u8>,
        rec_type: LogRecordType,
        pos: LogRecordPos,
    ) -> Result<()> {
        match rec_type {
            LogRecordType::Normal => {
                if let Some(prev) = self.index.put(key, pos)? {
                    self.invalid_bytes
                        .fetch_add(u64::from(prev.size), Ordering::SeqCst);
                }
            }
            LogRecordType::Tombstone => {
                let mut reclaimable = u64::from(pos.size);
                if let Some(prev) = self.index.delete(&key)? {
                    reclaimable += u64::from(prev.size);
                }
                self.invalid_bytes.fetch_add(reclaimable, Ordering::SeqCst);
            }
            LogRecordType::BatchFinish => {
                unreachable!("finish markers are consumed by the replay loop")
            }
        }
        Ok(())
    }

    /// Reads the last-used batch id from the `wbid` file, then deletes the
    /// file so a stale id can never be read twice.
    fn load_batch_id_file(&mut self) -> Result<()> {
        let path = self.options.dir_path.join(BATCH_ID_FILE_NAME);
        if !path.is_file() {
            return Ok(());
        }

        let file = DataFile::batch_id_file(&self.options.dir_path)?;
        let (record, _) = file.read_record(0)?;
        let id = std::str::from_utf8(&record.value)
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or(Error::MalformedMarkerFile {
                file: BATCH_ID_FILE_NAME,
            })?;

        self.batch_id.store(id, Ordering::SeqCst);
        self.batch_id_file_seen = true;
        drop(file);
        fs::remove_file(&path)?;
        Ok(())
    }

    /// Swaps every segment back to standard file IO after an mmap replay.
    fn reset_io_type(&self) -> Result<()> {
        let mut active = self.active.write();
        if let Some(active_file) = active.as_mut() {
            active_file.set_io_type(&self.options.dir_path, IoType::Standard)?;
        }
        let mut older = self.older.write();
        for data_file in older.values_mut() {
            data_file.set_io_type(&self.options.dir_path, IoType::Standard)?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            tracing::error!(%error, "failed to close engine");
        }
    }
}

/// Enumerates `*.data` files in `dir`, opening the highest id as the active
/// segment and the rest as immutables.
fn load_data_files(
    dir: &Path,
    io_type: IoType,
) -> Result<(Option<DataFile>, BTreeMap<u32, DataFile>)> {
    let mut segment_ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = name.strip_suffix(DATA_FILE_SUFFIX) else {
            continue;
        };
        let id: u32 = stem
            .parse()
            .map_err(|_| Error::MalformedFileName(name.clone()))?;
        segment_ids.push(id);
    }
    segment_ids.sort_unstable();

    let mut active = None;
    let mut older = BTreeMap::new();
    let last = segment_ids.last().copied();
    for id in segment_ids {
        let data_file = DataFile::open(dir, id, io_type)?;
        if Some(id) == last {
            active = Some(data_file);
        } else {
            older.insert(id, data_file);
        }
    }
    Ok((active, older))
}

fn check_options(options: &Options) -> Result<()> {
    if options.dir_path.as_os_str().is_empty() {
        return Err(Error::InvalidDirPath);
    }
    if options.segment_size == 0 {
        return Err(Error::InvalidSegmentSize);
    }
    if !(0.0..=1.0).contains(&options.merge_ratio) {
        return Err(Error::InvalidMergeRatio(options.merge_ratio));
    }
    Ok(())
}
