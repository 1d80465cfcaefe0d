//! Merge: compacting immutable segments into a fresh directory.
//!
//! A merge rewrites every *live* record (one the index still points at)
//! from the immutable segments into a scratch engine rooted in a sibling
//! `<dir>-merge` directory, pairing each with a hint-file entry. The
//! `merge-finish` marker, holding the merge horizon, is the commit point:
//! the next [`Engine::open`] installs any merge directory that carries the
//! marker and discards one that does not. Until the marker is durable a
//! crash costs nothing but the scratch directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::batch::{self, NON_BATCH_ID};
use crate::data_file::{self, DataFile, MERGE_FINISH_FILE_NAME};
use crate::engine::{Engine, FILE_LOCK_NAME};
use crate::error::{Error, Result};
use crate::options::IndexType;
use crate::record::{LogRecord, LogRecordType};
use crate::util;

const MERGE_DIR_SUFFIX: &str = "-merge";

impl Engine {
    /// Compacts all immutable segments, including the sealed current
    /// active segment, into the merge directory.
    ///
    /// Runs concurrently with writers: appends continue into segments above
    /// the merge horizon, which the merge never reads. The compacted output
    /// is installed on the next open.
    ///
    /// # Errors
    ///
    /// - [`Error::MergeInProgress`] if another merge is running.
    /// - [`Error::MergeRatioUnreached`] if too few bytes are reclaimable.
    /// - [`Error::DiskSpaceNotEnough`] if the live data cannot fit in the
    ///   free space.
    pub fn merge(&self) -> Result<()> {
        if self.active.read().is_none() {
            return Ok(());
        }
        let Some(_merge_guard) = self.merge_lock.try_lock() else {
            return Err(Error::MergeInProgress);
        };

        let disk_bytes = util::dir_size(&self.options.dir_path)?;
        let invalid_bytes = self.invalid_bytes.load(std::sync::atomic::Ordering::SeqCst);
        if self.options.merge_ratio > 0.0 {
            let ratio = invalid_bytes as f32 / disk_bytes as f32;
            if ratio < self.options.merge_ratio {
                return Err(Error::MergeRatioUnreached {
                    ratio,
                    threshold: self.options.merge_ratio,
                });
            }
        }
        // Conservative estimate: everything still referenced gets
        // rewritten.
        let live_bytes = disk_bytes.saturating_sub(invalid_bytes);
        let available = util::available_disk_size(&self.options.dir_path)?;
        if live_bytes >= available {
            return Err(Error::DiskSpaceNotEnough {
                needed: live_bytes,
                available,
            });
        }

        // Seal the active segment; it becomes the merge horizon. Writers
        // carry on in the replacement segment while the merge reads below
        // the horizon.
        let (merge_horizon, snapshot_ids) = {
            let mut active = self.active.write();
            let mut older = self.older.write();
            let merge_horizon = {
                let current = active.as_ref().expect("checked above");
                current.sync()?;
                current.segment_id()
            };
            // Open the replacement first so a failure leaves the current
            // active segment in place.
            let next = DataFile::open(
                &self.options.dir_path,
                merge_horizon + 1,
                crate::fio::IoType::Standard,
            )?;
            let sealed = active.replace(next).expect("checked above");
            older.insert(merge_horizon, sealed);
            (merge_horizon, older.keys().copied().collect::<Vec<_>>())
        };
        tracing::info!(merge_horizon, "merge started");

        // Fresh scratch directory next to the data directory.
        let merge_dir = merge_path(&self.options.dir_path);
        if merge_dir.exists() {
            fs::remove_dir_all(&merge_dir)?;
        }
        fs::create_dir_all(&merge_dir)?;

        let mut scratch_options = self.options.clone();
        scratch_options.dir_path = merge_dir.clone();
        scratch_options.always_sync = false;
        scratch_options.bytes_per_sync = 0;
        scratch_options.mmap_on_open = false;
        // The scratch index is never consulted; the cheapest backend will
        // do.
        scratch_options.index_type = IndexType::BTree;
        let scratch = Engine::open(scratch_options)?;

        let mut hint_file = DataFile::hint_file(&merge_dir)?;

        for segment_id in snapshot_ids {
            let mut offset = 0;
            loop {
                let older = self.older.read();
                let data_file = older
                    .get(&segment_id)
                    .expect("immutable segments persist for the duration of a merge");
                let (record, size) = match data_file.read_record(offset) {
                    Ok(result) => result,
                    Err(Error::EndOfFile) => break,
                    Err(err) => return Err(err),
                };
                drop(older);

                let (user_key, _) = batch::parse_key_with_batch_id(&record.key)?;
                // Live iff the index still points exactly here. Overwritten
                // and deleted records fail this test and are dropped.
                let live = self
                    .index
                    .get(&user_key)?
                    .is_some_and(|pos| pos.segment_id == segment_id && pos.offset == offset);
                if live {
                    // Merge output never belongs to an in-flight batch.
                    let rewritten = LogRecord {
                        key: batch::encode_key_with_batch_id(&user_key, NON_BATCH_ID),
                        value: record.value,
                        rec_type: LogRecordType::Normal,
                    };
                    let new_pos = scratch.append_record(&rewritten)?;

                    let hint_record = LogRecord {
                        key: user_key,
                        value: new_pos.encode(),
                        rec_type: LogRecordType::Normal,
                    };
                    hint_file.write(&hint_record.encode())?;
                }

                offset += size;
            }
        }

        scratch.sync()?;
        hint_file.sync()?;
        scratch.close()?;
        drop(scratch);

        // The marker is the commit point of the whole merge.
        let mut finish_file = DataFile::merge_finish_file(&merge_dir)?;
        let finish_record = LogRecord {
            key: MERGE_FINISH_FILE_NAME.as_bytes().to_vec(),
            value: merge_horizon.to_string().into_bytes(),
            rec_type: LogRecordType::Normal,
        };
        finish_file.write(&finish_record.encode())?;
        finish_file.sync()?;

        tracing::info!(merge_horizon, "merge finished");
        Ok(())
    }
}

/// Sibling scratch directory for a data directory: `<parent>/<name>-merge`.
pub(crate) fn merge_path(dir_path: &Path) -> PathBuf {
    let name = dir_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = dir_path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(name + MERGE_DIR_SUFFIX)
}

/// Reads the merge horizon out of a directory's `merge-finish` marker,
/// or zero when the marker is absent.
pub(crate) fn merge_horizon_marker(dir: &Path) -> Result<u32> {
    if !dir.join(MERGE_FINISH_FILE_NAME).is_file() {
        return Ok(0);
    }
    read_merge_horizon(dir)
}

fn read_merge_horizon(dir: &Path) -> Result<u32> {
    let finish_file = DataFile::merge_finish_file(dir)?;
    let (record, _) = finish_file.read_record(0)?;
    std::str::from_utf8(&record.value)
        .ok()
        .and_then(|text| text.parse::<u32>().ok())
        .ok_or(Error::MalformedMarkerFile {
            file: MERGE_FINISH_FILE_NAME,
        })
}

/// Installs a completed merge into the main directory, or discards an
/// incomplete one. Runs at open, under the directory file lock, before
/// segments are enumerated. Returns whether output was installed.
pub(crate) fn install_merge_output(dir: &Path) -> Result<bool> {
    let merge_dir = merge_path(dir);
    if !merge_dir.is_dir() {
        return Ok(false);
    }

    if !merge_dir.join(MERGE_FINISH_FILE_NAME).is_file() {
        // The merge never committed; its output is worthless.
        tracing::warn!(path = %merge_dir.display(), "discarding incomplete merge output");
        fs::remove_dir_all(&merge_dir)?;
        return Ok(false);
    }

    let merge_horizon = read_merge_horizon(&merge_dir)?;

    // Everything at or below the horizon is subsumed by the merge output.
    for segment_id in 1..=merge_horizon {
        let path = data_file::segment_file_path(dir, segment_id);
        if path.is_file() {
            fs::remove_file(&path)?;
        }
    }

    // The move is idempotent: rename replaces any half-moved leftovers
    // from a crash during a previous install. The finish marker moves
    // last — as long as it sits in the merge directory, a crashed install
    // is retried rather than discarded.
    for entry in fs::read_dir(&merge_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == FILE_LOCK_NAME || name == MERGE_FINISH_FILE_NAME {
            continue;
        }
        fs::rename(entry.path(), dir.join(&name))?;
    }
    fs::rename(
        merge_dir.join(MERGE_FINISH_FILE_NAME),
        dir.join(MERGE_FINISH_FILE_NAME),
    )?;
    fs::remove_dir_all(&merge_dir)?;

    tracing::info!(merge_horizon, "installed merge output");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::engine::tests::test_options;
    use crate::error::Error;
    use crate::util::tests::{test_key, test_value};

    use super::*;

    #[test]
    fn merge_preserves_visible_state_and_clears_invalid_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = test_options(dir.path());
        options.segment_size = 32 * 1024;

        {
            let engine = Engine::open(options.clone()).expect("open");
            for n in 0..2000 {
                engine.put(test_key(n), test_value(n, 64)).unwrap();
            }
            // Overwrite everything once so half the log is garbage.
            for n in 0..2000 {
                engine.put(test_key(n), test_value(n + 10_000, 64)).unwrap();
            }
            let before = engine.stat().unwrap();
            assert!(before.invalid_bytes > 0);

            engine.merge().unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(options).expect("reopen");
        let after = engine.stat().unwrap();
        assert_eq!(after.key_count, 2000);
        assert_eq!(after.invalid_bytes, 0);
        for n in 0..2000 {
            assert_eq!(engine.get(test_key(n)).unwrap(), test_value(n + 10_000, 64));
        }
    }

    #[test]
    fn merge_drops_deleted_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = test_options(dir.path());
        options.segment_size = 8 * 1024;

        {
            let engine = Engine::open(options.clone()).expect("open");
            for n in 0..500 {
                engine.put(test_key(n), test_value(n, 64)).unwrap();
            }
            for n in 0..250 {
                engine.delete(test_key(n)).unwrap();
            }
            engine.merge().unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(options).expect("reopen");
        assert_eq!(engine.stat().unwrap().key_count, 250);
        for n in 0..250 {
            assert!(matches!(engine.get(test_key(n)), Err(Error::KeyNotFound)));
        }
        for n in 250..500 {
            assert_eq!(engine.get(test_key(n)).unwrap(), test_value(n, 64));
        }
    }

    #[test]
    fn merge_shrinks_disk_usage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = test_options(dir.path());
        options.segment_size = 16 * 1024;

        let before;
        {
            let engine = Engine::open(options.clone()).expect("open");
            for round in 0..5 {
                for n in 0..300 {
                    engine.put(test_key(n), test_value(n + round, 128)).unwrap();
                }
            }
            before = engine.stat().unwrap().disk_bytes;
            engine.merge().unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(options).expect("reopen");
        let after = engine.stat().unwrap().disk_bytes;
        assert!(
            after <= before,
            "disk usage must not grow: before {before}, after {after}"
        );
    }

    #[test]
    fn writes_after_merge_land_above_the_horizon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = test_options(dir.path());

        {
            let engine = Engine::open(options.clone()).expect("open");
            for n in 0..100 {
                engine.put(test_key(n), test_value(n, 64)).unwrap();
            }
            engine.merge().unwrap();
            // The engine stays usable after the merge returns.
            engine.put(test_key(500), test_value(500, 64)).unwrap();
            engine.put(test_key(3), test_value(9999, 64)).unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(options).expect("reopen");
        assert_eq!(engine.get(test_key(500)).unwrap(), test_value(500, 64));
        assert_eq!(engine.get(test_key(3)).unwrap(), test_value(9999, 64));
        assert_eq!(engine.get(test_key(99)).unwrap(), test_value(99, 64));
    }

    #[test]
    fn incomplete_merge_output_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = test_options(dir.path());

        {
            let engine = Engine::open(options.clone()).expect("open");
            for n in 0..50 {
                engine.put(test_key(n), test_value(n, 64)).unwrap();
            }
            engine.close().unwrap();
        }

        // Fabricate a crashed merge: output exists, no finish marker.
        let merge_dir = merge_path(dir.path());
        std::fs::create_dir_all(&merge_dir).unwrap();
        std::fs::write(merge_dir.join("000000001.data"), b"half-written").unwrap();

        let engine = Engine::open(options).expect("reopen");
        assert!(!merge_dir.exists(), "merge directory must be removed");
        for n in 0..50 {
            assert_eq!(engine.get(test_key(n)).unwrap(), test_value(n, 64));
        }
    }

    #[test]
    fn merge_ratio_gate_rejects_clean_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = test_options(dir.path());
        options.merge_ratio = 0.5;

        let engine = Engine::open(options).expect("open");
        for n in 0..100 {
            engine.put(test_key(n), test_value(n, 64)).unwrap();
        }
        // Nothing was overwritten; the ratio is ~zero.
        assert!(matches!(
            engine.merge(),
            Err(Error::MergeRatioUnreached { .. })
        ));
    }

    #[test]
    fn merge_on_never_written_engine_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::open(test_options(dir.path())).expect("open");
        engine.merge().unwrap();
        assert!(!merge_path(dir.path()).exists());
    }

    #[test]
    fn batched_records_are_restamped_by_merge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = test_options(dir.path());

        {
            let engine = Engine::open(options.clone()).expect("open");
            let batch = engine
                .new_batch(crate::options::WriteBatchOptions::default())
                .unwrap();
            for n in 0..50 {
                batch.put(test_key(n), test_value(n, 64)).unwrap();
            }
            batch.commit().unwrap();
            engine.merge().unwrap();
            engine.close().unwrap();
        }

        // After install the records carry batch id zero, so replay applies
        // them directly even though no finish marker survives the merge.
        let engine = Engine::open(options).expect("reopen");
        for n in 0..50 {
            assert_eq!(engine.get(test_key(n)).unwrap(), test_value(n, 64));
        }
    }

    #[test]
    fn persistent_index_is_repaired_after_install() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = test_options(dir.path());
        options.index_type = crate::options::IndexType::BPlusTree;

        {
            let engine = Engine::open(options.clone()).expect("open");
            for n in 0..100 {
                engine.put(test_key(n), test_value(n, 64)).unwrap();
            }
            engine.merge().unwrap();
            // Post-merge writes sit above the horizon and must survive the
            // index repair on reopen.
            engine.put(test_key(7), Bytes::from("post-merge")).unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(options).expect("reopen");
        assert_eq!(engine.get(test_key(7)).unwrap(), "post-merge");
        for n in 0..100 {
            if n == 7 {
                continue;
            }
            assert_eq!(engine.get(test_key(n)).unwrap(), test_value(n, 64));
        }
    }

    #[test]
    fn merge_path_is_a_sibling_directory() {
        assert_eq!(
            merge_path(Path::new("/data/store")),
            Path::new("/data/store-merge")
        );
    }

    #[test]
    fn hint_file_short_cuts_rebuild() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = test_options(dir.path());

        {
            let engine = Engine::open(options.clone()).expect("open");
            for n in 0..200 {
                engine.put(test_key(n), test_value(n, 64)).unwrap();
            }
            engine.merge().unwrap();
            engine.close().unwrap();
        }

        {
            // First reopen installs the merge output, hint file included.
            let engine = Engine::open(options.clone()).expect("reopen");
            assert!(
                dir.path().join(crate::data_file::HINT_FILE_NAME).is_file(),
                "hint file must be installed"
            );
            assert_eq!(engine.stat().unwrap().key_count, 200);
            engine.close().unwrap();
        }

        let engine = Engine::open(options).expect("second reopen");
        assert_eq!(engine.get(test_key(42)).unwrap(), test_value(42, 64));
    }

    #[test]
    fn overwrites_during_merge_window_win() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = test_options(dir.path());

        {
            let engine = Engine::open(options.clone()).expect("open");
            for n in 0..20 {
                engine.put(test_key(n), test_value(n, 64)).unwrap();
            }
            engine.merge().unwrap();
            // Overwrite a merged key after the merge completes; the newer
            // record sits above the horizon and must win on reopen.
            engine.put(test_key(5), Bytes::from("fresher")).unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(options).expect("reopen");
        assert_eq!(engine.get(test_key(5)).unwrap(), "fresher");
    }
}
