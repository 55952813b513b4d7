use crate::data::log_record::{LogRecord, LogRecordType};
use crate::db::Engine;
use crate::errors::{Errors, Result};
use crate::index::Indexer;
use crate::options::{IndexType, WriteBatchOptions};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use prost::encoding::{decode_varint, encode_varint, encoded_len_varint};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;

/// Sequence number of records written outside a batch. Never assigned by the
/// counter.
pub(crate) const NON_TXN_SEQ_NUM: u64 = 0;

/// Key of the record marking a committed batch.
const TXN_FIN_KEY: &[u8] = b"Transaction Finished !";

/// Buffers writes and commits them atomically: all records of a batch carry
/// the same sequence number and are followed by a finisher record, so replay
/// applies the batch entirely or not at all. Effects become visible to
/// readers only after commit.
pub struct WriteBatch<'a> {
    /// Pending records by raw key, so later writes to a key replace earlier
    /// ones within the batch.
    pending: Mutex<BTreeMap<Vec<u8>, LogRecord>>,
    engine: &'a Engine,
    options: WriteBatchOptions,
}

impl Engine {
    /// Creates a write batch.
    ///
    /// # Panics
    ///
    /// With the B+ tree keydir, a missing `seq-num` sidecar on a non-fresh
    /// directory means sequence monotonicity cannot be guaranteed; batch
    /// construction is a fatal misuse in that state.
    pub fn new_write_batch(&self, options: WriteBatchOptions) -> WriteBatch<'_> {
        if self.options.index_type == IndexType::BPlusTree
            && !self.seq_num_file_exists
            && !self.is_initial
        {
            panic!("write batch is unavailable: the sequence-number file is missing");
        }
        WriteBatch { pending: Mutex::new(BTreeMap::new()), engine: self, options }
    }
}

impl WriteBatch<'_> {
    /// Buffers a put; nothing reaches disk until [`WriteBatch::commit`].
    pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        if key.is_empty() {
            return Err(Errors::KeyIsEmpty);
        }
        let record = LogRecord {
            key: key.to_vec(),
            value: value.to_vec(),
            rec_type: LogRecordType::Normal,
        };
        self.pending.lock().insert(key.to_vec(), record);
        Ok(())
    }

    /// Buffers a delete. Deleting a key unknown to both the keydir and the
    /// buffer is a no-op; deleting a key only buffered so far just drops the
    /// buffered write.
    pub fn delete(&self, key: Bytes) -> Result<()> {
        if key.is_empty() {
            return Err(Errors::KeyIsEmpty);
        }
        let mut pending = self.pending.lock();
        if self.engine.index.get(&key).is_none() {
            pending.remove(key.as_ref());
            return Ok(());
        }
        let record =
            LogRecord { key: key.to_vec(), value: Vec::new(), rec_type: LogRecordType::Deleted };
        pending.insert(key.to_vec(), record);
        Ok(())
    }

    /// Writes every buffered record under a fresh sequence number, appends
    /// the finisher, optionally syncs, then applies the effects to the
    /// keydir and clears the buffer.
    pub fn commit(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Ok(());
        }
        if pending.len() > self.options.max_batch_num {
            return Err(Errors::ExceedMaxBatchNum);
        }

        // One batch commits at a time; the sequence counter still uses
        // fetch-add so numbers stay strictly increasing across recoveries.
        let _commit_guard = self.engine.batch_commit_lock.lock();
        let seq_num = self.engine.seq_num.fetch_add(1, Ordering::SeqCst) + 1;

        let mut positions = HashMap::with_capacity(pending.len());
        for (key, record) in pending.iter() {
            let sealed = LogRecord {
                key: key_with_seq_num(key.clone(), seq_num),
                value: record.value.clone(),
                rec_type: record.rec_type,
            };
            let pos = self.engine.append_log_record(&sealed)?;
            positions.insert(key.clone(), pos);
        }

        // Replay treats a batch without this record as never committed.
        let finisher = LogRecord {
            key: key_with_seq_num(TXN_FIN_KEY.to_vec(), seq_num),
            value: Vec::new(),
            rec_type: LogRecordType::TxnFinished,
        };
        self.engine.append_log_record(&finisher)?;

        if self.options.sync_writes {
            self.engine.sync()?;
        }

        // All records are on disk; only now do they become visible.
        for (key, record) in pending.iter() {
            self.engine.update_index(key.clone(), record.rec_type, positions[key]);
        }
        pending.clear();
        Ok(())
    }
}

/// Prefixes `key` with the unsigned varint encoding of `seq_num`, the form
/// every stored record uses.
pub(crate) fn key_with_seq_num(key: Vec<u8>, seq_num: u64) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(encoded_len_varint(seq_num) + key.len());
    encode_varint(seq_num, &mut buf);
    buf.extend_from_slice(&key);
    buf.to_vec()
}

/// Splits a stored key into the real key and its sequence number.
pub(crate) fn parse_key_seq_num(key: &[u8]) -> (Vec<u8>, u64) {
    let mut buf = key;
    let seq_num = decode_varint(&mut buf).expect("sequence-prefixed key");
    (buf.to_vec(), seq_num)
}
