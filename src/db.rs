use crate::batch::{key_with_seq_num, parse_key_seq_num, NON_TXN_SEQ_NUM};
use crate::data::data_file::{
    DataFile, DATA_FILE_NAME_SUFFIX, HINT_FILE_NAME, MERGE_FINISHED_FILE_NAME, SEQ_NUM_FILE_NAME,
};
use crate::data::log_record::{
    LogRecord, LogRecordPos, LogRecordType, ReadLogRecord, TransactionRecord,
};
use crate::errors::{Errors, Result};
use crate::fio::IoType;
use crate::index::{new_indexer, IndexIterator, Indexer};
use crate::merge;
use crate::options::{IndexType, Options};
use crate::util;

use bytes::Bytes;
use fs4::fs_std::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const INITIAL_FILE_ID: u32 = 0;
const SEQ_NUM_KEY: &[u8] = b"seq.num";
pub(crate) const FILE_LOCK_NAME: &str = "flock";

/// A Bitcask storage engine: an append-only log of records on disk paired
/// with an in-memory keydir mapping every live key to the position of its
/// latest value. See <https://riak.com/assets/bitcask-intro.pdf>.
///
/// Writes append a record to the single active data file and update the
/// keydir; reads look the key up in the keydir and fetch the value with one
/// positional read. Old data files are immutable; superseded records are
/// reclaimed by [`Engine::merge`]. Opening a directory takes an exclusive
/// file lock, so one process owns a database at a time.
pub struct Engine {
    pub(crate) options: Arc<Options>,
    /// The sole data file open for appends.
    pub(crate) active_file: Arc<RwLock<DataFile>>,
    /// Former active files, read-only, by id.
    pub(crate) old_files: Arc<RwLock<HashMap<u32, DataFile>>>,
    /// The keydir.
    pub(crate) index: Box<dyn Indexer>,
    /// Ascending data file ids found at open; used only by replay.
    file_ids: Vec<u32>,
    /// Serializes batch commits.
    pub(crate) batch_commit_lock: Mutex<()>,
    /// Last assigned batch sequence number; 0 is reserved for
    /// non-transactional records.
    pub(crate) seq_num: Arc<AtomicU64>,
    /// At most one merge at a time.
    pub(crate) merging_lock: Mutex<()>,
    /// Whether a `seq-num` sidecar was found at open.
    pub(crate) seq_num_file_exists: bool,
    /// Whether this open initialized a fresh directory.
    pub(crate) is_initial: bool,
    /// Holds the directory's exclusive advisory lock for the engine lifetime.
    lock_file: File,
    /// Bytes appended since the last fsync, for the `bytes_per_sync` knob.
    bytes_since_sync: AtomicUsize,
    /// Bytes of superseded or deleted records currently on disk.
    pub(crate) reclaim_size: AtomicU64,
}

/// A point-in-time summary of the engine, from [`Engine::stat`].
#[derive(Clone, Debug)]
pub struct Stat {
    /// Live keys in the keydir.
    pub key_num: usize,
    /// Data files on disk, including the active one.
    pub data_file_num: usize,
    /// Bytes a merge could reclaim.
    pub reclaim_size: u64,
    /// Total size of the data directory.
    pub disk_size: u64,
}

impl Engine {
    /// Opens or creates a database in `options.dir_path`.
    ///
    /// Acquires the directory lock, applies any completed merge left by a
    /// previous run, loads the data files, and rebuilds the keydir from the
    /// hint file and the logs (the disk-resident B+ keydir skips replay).
    pub fn open(options: Options) -> Result<Self> {
        check_options(&options)?;
        log::info!("Opening database {}", options.dir_path.display());

        let mut is_initial = false;
        if !options.dir_path.is_dir() {
            is_initial = true;
            fs::create_dir_all(&options.dir_path)?;
        }

        let lock_file = fs::OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(options.dir_path.join(FILE_LOCK_NAME))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Errors::DatabaseIsInUse);
        }

        // A directory holding nothing but our own lock file is fresh too.
        if fs::read_dir(&options.dir_path)?
            .filter_map(|entry| entry.ok())
            .all(|entry| entry.file_name() == FILE_LOCK_NAME)
        {
            is_initial = true;
        }

        // Swap in the results of a completed merge before looking at files.
        let merge_applied = merge::load_merge_files(&options.dir_path)?;

        let mut data_files = load_data_files(&options.dir_path, options.mmap_at_startup)?;
        let file_ids: Vec<u32> = data_files.iter().map(|f| f.file_id()).collect();

        // The largest id becomes the active file, the rest go into the
        // old-file map. A fresh directory starts at file 0.
        let active_file = match data_files.pop() {
            Some(file) => file,
            None => DataFile::new(&options.dir_path, INITIAL_FILE_ID, IoType::StandardIo)?,
        };
        let mut old_files = HashMap::new();
        for file in data_files {
            old_files.insert(file.file_id(), file);
        }

        let options = Arc::new(options);
        let mut engine = Self {
            options: options.clone(),
            active_file: Arc::new(RwLock::new(active_file)),
            old_files: Arc::new(RwLock::new(old_files)),
            index: new_indexer(options.index_type, &options.dir_path),
            file_ids,
            batch_commit_lock: Mutex::new(()),
            seq_num: Arc::new(AtomicU64::new(0)),
            merging_lock: Mutex::new(()),
            seq_num_file_exists: false,
            is_initial,
            lock_file,
            bytes_since_sync: AtomicUsize::new(0),
            reclaim_size: AtomicU64::new(0),
        };

        match engine.options.index_type {
            IndexType::BPlusTree => {
                // The keydir survived on disk; just restore the sequence
                // counter and the append cursor. If a merge was applied, the
                // hint file repoints merged keys at their rewritten records.
                engine.load_seq_num()?;
                if merge_applied {
                    engine.load_index_from_hint_file()?;
                }
                let active = engine.active_file.read();
                let size = active.file_size()?;
                active.set_write_off(size);
            }
            _ => {
                // The seq-num sidecar only exists between a clean close and
                // the next open; replay rebuilds the counter from the log.
                let seq_num_path = engine.options.dir_path.join(SEQ_NUM_FILE_NAME);
                if seq_num_path.is_file() {
                    fs::remove_file(seq_num_path)?;
                }
                engine.load_index_from_hint_file()?;
                engine.load_index_from_data_files()?;
            }
        }

        // The mmap backend only accelerates the scans above; every file must
        // be writable-capable from here on.
        if engine.options.mmap_at_startup {
            engine.reset_io_type()?;
        }

        log::info!(
            "Indexed {} live keys in {}",
            engine.index.size(),
            engine.options.dir_path.display()
        );
        Ok(engine)
    }

    /// Closes the database: persists the sequence counter, syncs and closes
    /// every file, and releases the directory lock. The lock is released
    /// even when an earlier step fails.
    pub fn close(&self) -> Result<()> {
        let result = self.close_inner();
        let _ = FileExt::unlock(&self.lock_file);
        result
    }

    fn close_inner(&self) -> Result<()> {
        if !self.options.dir_path.is_dir() {
            return Ok(());
        }
        self.index.close()?;

        // The B+ keydir cannot recover the counter from replay, so it is
        // persisted on every close and consumed by the next open.
        let seq_num_file = DataFile::new_seq_num_file(&self.options.dir_path)?;
        let record = LogRecord {
            key: SEQ_NUM_KEY.to_vec(),
            value: self.seq_num.load(Ordering::SeqCst).to_string().into_bytes(),
            rec_type: LogRecordType::Normal,
        };
        seq_num_file.write(&record.encode())?;
        seq_num_file.sync()?;

        let active = self.active_file.read();
        active.sync()?;
        active.close()?;
        for file in self.old_files.read().values() {
            file.close()?;
        }
        Ok(())
    }

    /// Fsyncs the active data file.
    pub fn sync(&self) -> Result<()> {
        self.active_file.read().sync()
    }

    /// Stores `value` under `key`, overwriting any previous value.
    pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        if key.is_empty() {
            return Err(Errors::KeyIsEmpty);
        }

        let record = LogRecord {
            key: key_with_seq_num(key.to_vec(), NON_TXN_SEQ_NUM),
            value: value.to_vec(),
            rec_type: LogRecordType::Normal,
        };
        let pos = self.append_log_record(&record)?;

        if let Some(old) = self.index.put(key.to_vec(), pos) {
            self.reclaim_size.fetch_add(old.size as u64, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Removes `key`. Deleting a key that does not exist succeeds without
    /// writing a tombstone, so repeated deletes of absent keys cannot grow
    /// the log.
    pub fn delete(&self, key: Bytes) -> Result<()> {
        if key.is_empty() {
            return Err(Errors::KeyIsEmpty);
        }
        if self.index.get(&key).is_none() {
            return Ok(());
        }

        let record = LogRecord {
            key: key_with_seq_num(key.to_vec(), NON_TXN_SEQ_NUM),
            value: Vec::new(),
            rec_type: LogRecordType::Deleted,
        };
        let pos = self.append_log_record(&record)?;
        // The tombstone itself is immediately reclaimable.
        self.reclaim_size.fetch_add(pos.size as u64, Ordering::SeqCst);

        let (old, existed) = self.index.delete(&key);
        if !existed {
            return Err(Errors::IndexUpdateFailed);
        }
        if let Some(old) = old {
            self.reclaim_size.fetch_add(old.size as u64, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Fetches the value stored under `key`.
    pub fn get(&self, key: Bytes) -> Result<Bytes> {
        if key.is_empty() {
            return Err(Errors::KeyIsEmpty);
        }
        let pos = self.index.get(&key).ok_or(Errors::KeyNotFound)?;
        self.get_value_by_position(&pos)
    }

    /// Reads the record at `pos` from whichever file owns it.
    pub(crate) fn get_value_by_position(&self, pos: &LogRecordPos) -> Result<Bytes> {
        let active = self.active_file.read();
        let old_files = self.old_files.read();
        let ReadLogRecord { record, .. } = if active.file_id() == pos.file_id {
            active.read_log_record(pos.offset)?
        } else {
            old_files
                .get(&pos.file_id)
                .ok_or(Errors::DataFileNotFound)?
                .read_log_record(pos.offset)?
        };
        if record.rec_type == LogRecordType::Deleted {
            return Err(Errors::KeyNotFound);
        }
        Ok(record.value.into())
    }

    /// Returns every live key in ascending order.
    pub fn list_keys(&self) -> Result<Vec<Bytes>> {
        let mut iter = self.index.iterator(false);
        let mut keys = Vec::with_capacity(self.index.size());
        iter.rewind();
        while iter.valid() {
            keys.push(Bytes::copy_from_slice(iter.key()));
            iter.next();
        }
        iter.close();
        Ok(keys)
    }

    /// Calls `f` for every live key/value pair in ascending key order,
    /// stopping early when `f` returns false.
    pub fn fold<F>(&self, f: F) -> Result<()>
    where
        F: Fn(Bytes, Bytes) -> bool,
    {
        let mut iter = self.index.iterator(false);
        iter.rewind();
        while iter.valid() {
            let value = self.get_value_by_position(&iter.value())?;
            if !f(Bytes::copy_from_slice(iter.key()), value) {
                break;
            }
            iter.next();
        }
        iter.close();
        Ok(())
    }

    /// Reports key count, file count, reclaimable bytes, and directory size.
    pub fn stat(&self) -> Result<Stat> {
        let old_files = self.old_files.read();
        Ok(Stat {
            key_num: self.index.size(),
            data_file_num: old_files.len() + 1,
            reclaim_size: self.reclaim_size.load(Ordering::SeqCst),
            disk_size: util::file::dir_size(&self.options.dir_path)?,
        })
    }

    /// Copies the data directory to `target`, excluding the lock file.
    pub fn backup(&self, target: impl AsRef<Path>) -> Result<()> {
        // Hold a read guard so no rollover happens mid-copy.
        let _active = self.active_file.read();
        util::file::copy_dir(&self.options.dir_path, target.as_ref(), &[FILE_LOCK_NAME])
    }

    /// Appends `record` to the active file, rotating to a fresh file when the
    /// configured size would be exceeded, and applies the durability knobs.
    /// Returns where the record landed.
    pub(crate) fn append_log_record(&self, record: &LogRecord) -> Result<LogRecordPos> {
        let encoded = record.encode();
        let record_len = encoded.len() as u64;

        let mut active = self.active_file.write();
        if active.write_off() + record_len > self.options.data_file_size {
            // Retire the full file and open the next id. Lock order is the
            // active file before the old-file map, everywhere.
            active.sync()?;
            let current_id = active.file_id();
            let next = DataFile::new(&self.options.dir_path, current_id + 1, IoType::StandardIo)?;
            let retired = std::mem::replace(&mut *active, next);
            self.old_files.write().insert(current_id, retired);
        }

        let write_off = active.write_off();
        active.write(&encoded)?;

        let accumulated =
            self.bytes_since_sync.fetch_add(encoded.len(), Ordering::SeqCst) + encoded.len();
        let need_sync = self.options.sync_writes
            || (self.options.bytes_per_sync > 0 && accumulated >= self.options.bytes_per_sync);
        if need_sync {
            active.sync()?;
            self.bytes_since_sync.store(0, Ordering::SeqCst);
        }

        Ok(LogRecordPos { file_id: active.file_id(), offset: write_off, size: encoded.len() as u32 })
    }

    /// Restores the sequence counter from the `seq-num` sidecar, deleting the
    /// file so it is never read twice.
    fn load_seq_num(&mut self) -> Result<()> {
        let path = self.options.dir_path.join(SEQ_NUM_FILE_NAME);
        if !path.is_file() {
            return Ok(());
        }
        let seq_num_file = DataFile::new_seq_num_file(&self.options.dir_path)?;
        let ReadLogRecord { record, .. } = seq_num_file.read_log_record(0)?;
        let value =
            String::from_utf8(record.value).map_err(|_| Errors::DataDirectoryCorrupted)?;
        let seq_num = value.parse::<u64>().map_err(|_| Errors::DataDirectoryCorrupted)?;

        self.seq_num.store(seq_num, Ordering::SeqCst);
        self.seq_num_file_exists = true;
        fs::remove_file(path)?;
        Ok(())
    }

    /// Seeds the keydir from the hint file left by a merge. Replay of the
    /// remaining data files overwrites hinted positions for keys updated
    /// after the merge.
    pub(crate) fn load_index_from_hint_file(&self) -> Result<()> {
        let hint_path = self.options.dir_path.join(HINT_FILE_NAME);
        if !hint_path.is_file() {
            return Ok(());
        }

        let hint_file = DataFile::new_hint_file(&self.options.dir_path)?;
        let mut offset = 0;
        loop {
            let ReadLogRecord { record, size } = match hint_file.read_log_record(offset) {
                Ok(read) => read,
                Err(Errors::ReadDataFileEof) => break,
                Err(err) => return Err(err),
            };
            let pos = crate::data::log_record::decode_log_record_pos(&record.value);
            self.index.put(record.key, pos);
            offset += size as u64;
        }
        Ok(())
    }

    /// Replays the data files in id order to rebuild the keydir, buffering
    /// batched records until their finisher and discarding batches whose
    /// finisher never made it to disk. Files already covered by a completed
    /// merge are skipped.
    fn load_index_from_data_files(&self) -> Result<()> {
        if self.file_ids.is_empty() {
            return Ok(());
        }

        let mut has_merged = false;
        let mut non_merge_file_id = 0;
        if self.options.dir_path.join(MERGE_FINISHED_FILE_NAME).is_file() {
            non_merge_file_id = merge::non_merge_file_id(&self.options.dir_path)?;
            has_merged = true;
        }

        let mut pending: HashMap<u64, Vec<TransactionRecord>> = HashMap::new();
        let mut max_seq_num = NON_TXN_SEQ_NUM;

        let active = self.active_file.read();
        let old_files = self.old_files.read();
        for (i, &file_id) in self.file_ids.iter().enumerate() {
            if has_merged && file_id < non_merge_file_id {
                continue;
            }

            let mut offset = 0;
            loop {
                let read = if file_id == active.file_id() {
                    active.read_log_record(offset)
                } else {
                    old_files
                        .get(&file_id)
                        .ok_or(Errors::DataFileNotFound)?
                        .read_log_record(offset)
                };
                let ReadLogRecord { mut record, size } = match read {
                    Ok(read) => read,
                    Err(Errors::ReadDataFileEof) => break,
                    Err(err) => return Err(err),
                };

                let pos = LogRecordPos { file_id, offset, size: size as u32 };
                let (real_key, seq_num) = parse_key_seq_num(&record.key);

                if seq_num == NON_TXN_SEQ_NUM {
                    self.update_index(real_key, record.rec_type, pos);
                } else if record.rec_type == LogRecordType::TxnFinished {
                    // The batch is committed: apply it as a unit.
                    if let Some(records) = pending.remove(&seq_num) {
                        for txn in records {
                            self.update_index(txn.record.key, txn.record.rec_type, txn.pos);
                        }
                    }
                } else {
                    record.key = real_key;
                    pending.entry(seq_num).or_default().push(TransactionRecord { record, pos });
                }

                if seq_num > max_seq_num {
                    max_seq_num = seq_num;
                }
                offset += size as u64;
            }

            // The scan of the last (active) file tells us where to append.
            if i == self.file_ids.len() - 1 {
                active.set_write_off(offset);
            }
        }

        self.seq_num.store(max_seq_num, Ordering::SeqCst);
        Ok(())
    }

    /// Applies one replayed record to the keydir, tracking reclaimable bytes
    /// for displaced positions and tombstones.
    pub(crate) fn update_index(&self, key: Vec<u8>, rec_type: LogRecordType, pos: LogRecordPos) {
        match rec_type {
            LogRecordType::Normal => {
                if let Some(old) = self.index.put(key, pos) {
                    self.reclaim_size.fetch_add(old.size as u64, Ordering::SeqCst);
                }
            }
            LogRecordType::Deleted => {
                let mut size = pos.size as u64;
                if let Some(old) = self.index.delete(&key).0 {
                    size += old.size as u64;
                }
                self.reclaim_size.fetch_add(size, Ordering::SeqCst);
            }
            LogRecordType::TxnFinished => {}
        }
    }

    /// Rebinds every data file from the startup mmap backend to buffered IO.
    fn reset_io_type(&self) -> Result<()> {
        let mut active = self.active_file.write();
        active.set_io_manager(&self.options.dir_path, IoType::StandardIo)?;
        for file in self.old_files.write().values_mut() {
            file.set_io_manager(&self.options.dir_path, IoType::StandardIo)?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("failed to close engine: {err}");
        }
    }
}

fn check_options(options: &Options) -> Result<()> {
    if options.dir_path.as_os_str().is_empty() {
        return Err(Errors::DirPathIsEmpty);
    }
    if options.data_file_size == 0 {
        return Err(Errors::DataFileSizeTooSmall);
    }
    if !(0.0..=1.0).contains(&options.data_file_merge_ratio) {
        return Err(Errors::InvalidMergeRatio);
    }
    Ok(())
}

/// Opens every `*.data` file in `dir_path` in ascending id order. The last
/// one becomes the active file.
fn load_data_files(dir_path: &Path, use_mmap: bool) -> Result<Vec<DataFile>> {
    let mut file_ids = Vec::new();
    for entry in fs::read_dir(dir_path)?.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(DATA_FILE_NAME_SUFFIX) {
            let file_id =
                stem.parse::<u32>().map_err(|_| Errors::DataDirectoryCorrupted)?;
            file_ids.push(file_id);
        }
    }
    file_ids.sort_unstable();

    let io_type = if use_mmap { IoType::MemoryMap } else { IoType::StandardIo };
    let mut data_files = Vec::with_capacity(file_ids.len());
    for file_id in file_ids {
        data_files.push(DataFile::new(dir_path, file_id, io_type)?);
    }
    Ok(data_files)
}
