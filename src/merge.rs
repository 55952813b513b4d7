use crate::batch::{key_with_seq_num, parse_key_seq_num, NON_TXN_SEQ_NUM};
use crate::data::data_file::{
    data_file_name, DataFile, MERGE_FINISHED_FILE_NAME, SEQ_NUM_FILE_NAME,
};
use crate::data::log_record::{LogRecord, LogRecordType, ReadLogRecord};
use crate::db::{Engine, FILE_LOCK_NAME};
use crate::errors::{Errors, Result};
use crate::fio::IoType;
use crate::index::{Indexer, BPTREE_INDEX_FILE_NAME};
use crate::options::IndexType;
use crate::util;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

/// Suffix of the staging directory, a sibling of the data directory.
const MERGE_DIR_SUFFIX: &str = "-merge";

/// Key of the single record inside the merge-finished marker file.
const MERGE_FINISHED_KEY: &[u8] = b"merge.finished";

impl Engine {
    /// Compacts the retired data files: live records are rewritten into a
    /// staging directory next to the data directory, together with a hint
    /// file seeding the keydir and a marker naming the first file that did
    /// not participate. The staged files replace the originals on the next
    /// open; until the marker is fsynced a crash leaves the original log
    /// untouched.
    ///
    /// Refuses to run while another merge is active, below the configured
    /// reclaim ratio, or without enough free disk for the surviving data.
    pub fn merge(&self) -> Result<()> {
        // An engine that never wrote anything has nothing to compact.
        {
            let active = self.active_file.read();
            if active.write_off() == 0 && self.old_files.read().is_empty() {
                return Ok(());
            }
        }

        let Some(_merging_guard) = self.merging_lock.try_lock() else {
            return Err(Errors::MergeInProgress);
        };

        let total_size = util::file::dir_size(&self.options.dir_path)?;
        let reclaim_size = self.reclaim_size.load(Ordering::SeqCst);
        if (reclaim_size as f32) / (total_size as f32) < self.options.data_file_merge_ratio {
            return Err(Errors::MergeRatioUnreached);
        }
        let survivor_size = total_size.saturating_sub(reclaim_size);
        if survivor_size >= util::file::available_disk_size(&self.options.dir_path)? {
            return Err(Errors::NotEnoughSpaceForMerge);
        }

        // Rotate the active file so every file in the merge set is immutable.
        // The id of the fresh active file is the first one not merged; replay
        // and intake use it as the cutoff.
        let non_merge_file_id;
        let merge_file_ids: Vec<u32>;
        {
            let mut active = self.active_file.write();
            active.sync()?;
            let current_id = active.file_id();
            let next = DataFile::new(&self.options.dir_path, current_id + 1, IoType::StandardIo)?;
            let retired = std::mem::replace(&mut *active, next);
            non_merge_file_id = active.file_id();

            let mut old_files = self.old_files.write();
            old_files.insert(current_id, retired);
            let mut ids: Vec<u32> = old_files.keys().copied().collect();
            ids.sort_unstable();
            merge_file_ids = ids;
        }

        log::info!(
            "Merging {} to reclaim {} of {} bytes",
            self.options.dir_path.display(),
            reclaim_size,
            total_size
        );

        // Stage into a fresh sibling directory through a scratch engine. Its
        // keydir is never read back, so the cheap in-memory tree does; this
        // also keeps a `bptree-index` out of the staging directory.
        let merge_path = merge_path(&self.options.dir_path);
        if merge_path.exists() {
            fs::remove_dir_all(&merge_path)?;
        }
        fs::create_dir_all(&merge_path)?;

        let mut merge_options = (*self.options).clone();
        merge_options.dir_path = merge_path.clone();
        merge_options.sync_writes = false;
        merge_options.index_type = IndexType::BTree;
        let merge_engine = Engine::open(merge_options)?;
        let hint_file = DataFile::new_hint_file(&merge_path)?;

        // Bulk rewrite under a shared borrow of the retired files; writers
        // keep appending to the new active file meanwhile.
        let old_files = self.old_files.read();
        for &file_id in &merge_file_ids {
            let Some(data_file) = old_files.get(&file_id) else { continue };
            let mut offset = 0;
            loop {
                let ReadLogRecord { mut record, size } = match data_file.read_log_record(offset) {
                    Ok(read) => read,
                    Err(Errors::ReadDataFileEof) => break,
                    Err(err) => return Err(err),
                };

                // A record is live iff the keydir still points exactly here.
                let (real_key, _) = parse_key_seq_num(&record.key);
                if let Some(pos) = self.index.get(&real_key) {
                    if pos.file_id == file_id && pos.offset == offset {
                        // Committed data needs no transaction marker anymore.
                        record.key = key_with_seq_num(real_key.clone(), NON_TXN_SEQ_NUM);
                        let new_pos = merge_engine.append_log_record(&record)?;
                        hint_file.write_hint_record(real_key, &new_pos)?;
                    }
                }
                offset += size as u64;
            }
        }
        drop(old_files);

        hint_file.sync()?;
        merge_engine.sync()?;

        // The marker is the commit point: only after it is on disk may an
        // open destroy the superseded originals.
        let merge_finished_file = DataFile::new_merge_finished_file(&merge_path)?;
        let record = LogRecord {
            key: MERGE_FINISHED_KEY.to_vec(),
            value: non_merge_file_id.to_string().into_bytes(),
            rec_type: LogRecordType::Normal,
        };
        merge_finished_file.write(&record.encode())?;
        merge_finished_file.sync()?;

        log::info!("Merged {} files below id {}", merge_file_ids.len(), non_merge_file_id);
        Ok(())
    }
}

/// Applies a completed merge left in the staging directory, if any: deletes
/// the superseded data files and moves the staged ones in. Returns whether a
/// merge was applied. The staging directory is removed in all cases, so a
/// crash mid-merge costs nothing but the discarded staging data.
///
/// Intake is idempotent: resuming after a crash re-deletes what is already
/// gone and treats already-moved files as originals.
pub(crate) fn load_merge_files(dir_path: &Path) -> Result<bool> {
    let merge_path = merge_path(dir_path);
    if !merge_path.is_dir() {
        return Ok(false);
    }
    let result = intake_merge_files(dir_path, &merge_path);
    fs::remove_dir_all(&merge_path)?;
    result
}

fn intake_merge_files(dir_path: &Path, merge_path: &Path) -> Result<bool> {
    let mut merge_finished = false;
    let mut staged_names = Vec::new();
    for entry in fs::read_dir(merge_path)?.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else { continue };
        if name == MERGE_FINISHED_FILE_NAME {
            merge_finished = true;
        }
        // The staging engine's own bookkeeping stays behind; moving a
        // bptree-index would clobber the live keydir.
        if name == SEQ_NUM_FILE_NAME || name == FILE_LOCK_NAME || name == BPTREE_INDEX_FILE_NAME {
            continue;
        }
        staged_names.push(name.to_string());
    }
    if !merge_finished {
        return Ok(false);
    }

    let non_merge_file_id = non_merge_file_id(merge_path)?;
    for file_id in 0..non_merge_file_id {
        let path = data_file_name(dir_path, file_id);
        if path.is_file() {
            fs::remove_file(path)?;
        }
    }
    for name in staged_names {
        fs::rename(merge_path.join(&name), dir_path.join(&name))?;
    }
    Ok(true)
}

/// Reads the first unmerged file id from the merge-finished marker in
/// `dir_path`.
pub(crate) fn non_merge_file_id(dir_path: &Path) -> Result<u32> {
    let merge_finished_file = DataFile::new_merge_finished_file(dir_path)?;
    let ReadLogRecord { record, .. } = merge_finished_file.read_log_record(0)?;
    let value = String::from_utf8(record.value).map_err(|_| Errors::DataDirectoryCorrupted)?;
    value.parse::<u32>().map_err(|_| Errors::DataDirectoryCorrupted)
}

/// The staging directory: `<dir>-merge`, a sibling of the data directory.
fn merge_path(dir_path: &Path) -> PathBuf {
    let mut name = dir_path.file_name().unwrap_or_default().to_os_string();
    name.push(MERGE_DIR_SUFFIX);
    dir_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_options;
    use crate::options::Options;

    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    /// Small files and no ratio gate, so merges always run.
    fn merge_options(dir: &Path) -> Options {
        Options {
            data_file_size: 4 * 1024,
            data_file_merge_ratio: 0.0,
            ..test_options(dir)
        }
    }

    fn dump(engine: &Engine) -> Result<BTreeMap<Bytes, Bytes>> {
        let mut contents = BTreeMap::new();
        for key in engine.list_keys()? {
            let value = engine.get(key.clone())?;
            contents.insert(key, value);
        }
        Ok(contents)
    }

    #[test]
    fn merge_on_empty_engine_is_a_no_op() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-merge")?;
        let engine = Engine::open(merge_options(dir.path()))?;
        engine.merge()?;
        assert!(!merge_path(dir.path()).exists());
        Ok(())
    }

    #[test]
    fn merge_below_ratio_is_refused() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-merge")?;
        let mut options = merge_options(dir.path());
        options.data_file_merge_ratio = 0.5;
        let engine = Engine::open(options)?;

        for i in 0..50 {
            engine.put(b(&format!("key-{i:03}")), Bytes::from(vec![b'v'; 100]))?;
        }
        // nothing overwritten or deleted, so nothing to reclaim
        assert!(matches!(engine.merge(), Err(Errors::MergeRatioUnreached)));
        Ok(())
    }

    #[test]
    fn concurrent_merge_is_refused() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-merge")?;
        let engine = Engine::open(merge_options(dir.path()))?;
        engine.put(b("k"), b("v"))?;

        let guard = engine.merging_lock.lock();
        assert!(matches!(engine.merge(), Err(Errors::MergeInProgress)));
        drop(guard);
        Ok(())
    }

    #[test]
    fn merge_preserves_contents_and_drops_dead_files() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-merge")?;
        let options = merge_options(dir.path());
        let engine = Engine::open(options.clone())?;

        // Fill several files, then delete half and overwrite a quarter.
        for i in 0..100 {
            engine.put(b(&format!("key-{i:03}")), Bytes::from(vec![b'v'; 128]))?;
        }
        for i in 0..50 {
            engine.delete(b(&format!("key-{i:03}")))?;
        }
        for i in 50..75 {
            engine.put(b(&format!("key-{i:03}")), b("rewritten"))?;
        }
        let before = dump(&engine)?;
        let disk_before = engine.stat()?.disk_size;

        engine.merge()?;
        // The original directory is untouched until the next open.
        assert_eq!(dump(&engine)?, before);

        drop(engine);
        let engine = Engine::open(options)?;
        assert_eq!(dump(&engine)?, before);
        assert_eq!(engine.stat()?.key_num, 50);
        assert!(engine.stat()?.disk_size <= disk_before);
        assert!(!merge_path(dir.path()).exists());

        // No surviving data file predates the merge cutoff.
        let cutoff = non_merge_file_id(dir.path())?;
        assert!(cutoff > 0);
        for file_id in 0..cutoff {
            assert!(!data_file_name(dir.path(), file_id).exists());
        }
        Ok(())
    }

    #[test]
    fn writes_after_merge_win_over_hinted_positions() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-merge")?;
        let options = merge_options(dir.path());
        let engine = Engine::open(options.clone())?;

        for i in 0..50 {
            engine.put(b(&format!("key-{i:02}")), b("merged"))?;
        }
        for i in 0..25 {
            engine.delete(b(&format!("key-{i:02}")))?;
        }
        engine.merge()?;

        // Keep writing after the merge completed; these records land in
        // files past the cutoff and must shadow the hint file on replay.
        engine.put(b("key-30"), b("fresher"))?;
        engine.put(b("key-00"), b("resurrected"))?;

        drop(engine);
        let engine = Engine::open(options)?;
        assert_eq!(engine.get(b("key-30"))?, b("fresher"));
        assert_eq!(engine.get(b("key-00"))?, b("resurrected"));
        assert_eq!(engine.get(b("key-49"))?, b("merged"));
        assert!(matches!(engine.get(b("key-01")), Err(Errors::KeyNotFound)));
        Ok(())
    }

    #[test]
    fn unfinished_staging_directory_is_discarded() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-merge")?;
        let options = merge_options(dir.path());
        {
            let engine = Engine::open(options.clone())?;
            engine.put(b("k"), b("v"))?;
        }

        // A crash mid-merge leaves staged files but no finished marker.
        let staging = merge_path(dir.path());
        fs::create_dir_all(&staging)?;
        fs::write(data_file_name(&staging, 0), b"half-written garbage")?;

        let engine = Engine::open(options)?;
        assert_eq!(engine.get(b("k"))?, b("v"));
        assert!(!staging.exists());
        Ok(())
    }

    #[test]
    fn merge_with_bptree_keydir() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-merge")?;
        let mut options = merge_options(dir.path());
        options.index_type = crate::options::IndexType::BPlusTree;
        {
            let engine = Engine::open(options.clone())?;
            for i in 0..40 {
                engine.put(b(&format!("key-{i:02}")), Bytes::from(vec![b'v'; 128]))?;
            }
            for i in 0..20 {
                engine.delete(b(&format!("key-{i:02}")))?;
            }
            engine.merge()?;
            engine.close()?;
        }

        // The hint file repoints the persisted keydir at the rewritten
        // records once the staged files are swapped in.
        let engine = Engine::open(options)?;
        assert_eq!(engine.stat()?.key_num, 20);
        for i in 20..40 {
            assert_eq!(engine.get(b(&format!("key-{i:02}")))?, Bytes::from(vec![b'v'; 128]));
        }
        Ok(())
    }

    #[test]
    fn hint_file_seeds_the_keydir() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-merge")?;
        let options = merge_options(dir.path());
        let engine = Engine::open(options.clone())?;
        for i in 0..30 {
            engine.put(b(&format!("key-{i:02}")), b("value"))?;
        }
        for i in 0..10 {
            engine.delete(b(&format!("key-{i:02}")))?;
        }
        engine.merge()?;
        drop(engine);

        let engine = Engine::open(options)?;
        assert!(engine.options.dir_path.join(crate::data::data_file::HINT_FILE_NAME).is_file());
        // every live key is resolvable through the hinted positions
        for i in 10..30 {
            assert_eq!(engine.get(b(&format!("key-{i:02}")))?, b("value"));
        }
        assert_eq!(engine.stat()?.key_num, 20);
        Ok(())
    }
}
