use super::{IndexIterator, Indexer, SnapshotIterator};
use crate::data::log_record::{decode_log_record_pos, LogRecordPos};
use crate::errors::Result;

use jammdb::DB;
use std::path::Path;

pub(crate) const BPTREE_INDEX_FILE_NAME: &str = "bptree-index";
const BUCKET_NAME: &str = "embercask-index";

/// Disk-resident keydir over a jammdb B+ tree, persisted in a single
/// `bptree-index` file next to the data files. Because the index itself
/// survives restarts, the engine skips log replay entirely when this backend
/// is selected.
///
/// Point operations run in short auto-committed transactions; the iterator
/// snapshots the bucket inside one read transaction. A corrupted or
/// inaccessible index file is unrecoverable, so internal failures panic.
pub struct BPlusTreeIndex {
    tree: DB,
}

impl BPlusTreeIndex {
    pub fn new(dir_path: &Path) -> Self {
        let tree = DB::open(dir_path.join(BPTREE_INDEX_FILE_NAME))
            .expect("failed to open the bptree index");
        let tx = tree.tx(true).expect("failed to begin a bptree transaction");
        tx.get_or_create_bucket(BUCKET_NAME).expect("failed to create the bptree bucket");
        tx.commit().expect("failed to commit the bptree bucket");
        Self { tree }
    }
}

impl Indexer for BPlusTreeIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos> {
        let tx = self.tree.tx(true).expect("failed to begin a bptree transaction");
        let bucket = tx.get_bucket(BUCKET_NAME).expect("missing bptree bucket");
        let old = bucket.get_kv(&key).map(|kv| decode_log_record_pos(kv.value()));
        bucket.put(key, pos.encode()).expect("failed to put into the bptree");
        tx.commit().expect("failed to commit a bptree put");
        old
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        let tx = self.tree.tx(false).expect("failed to begin a bptree transaction");
        let bucket = tx.get_bucket(BUCKET_NAME).expect("missing bptree bucket");
        bucket.get_kv(key).map(|kv| decode_log_record_pos(kv.value()))
    }

    fn delete(&self, key: &[u8]) -> (Option<LogRecordPos>, bool) {
        let tx = self.tree.tx(true).expect("failed to begin a bptree transaction");
        let bucket = tx.get_bucket(BUCKET_NAME).expect("missing bptree bucket");
        let old = bucket.get_kv(key).map(|kv| decode_log_record_pos(kv.value()));
        if old.is_some() {
            bucket.delete(key).expect("failed to delete from the bptree");
        }
        tx.commit().expect("failed to commit a bptree delete");
        let existed = old.is_some();
        (old, existed)
    }

    fn size(&self) -> usize {
        let tx = self.tree.tx(false).expect("failed to begin a bptree transaction");
        let bucket = tx.get_bucket(BUCKET_NAME).expect("missing bptree bucket");
        bucket.kv_pairs().count()
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let tx = self.tree.tx(false).expect("failed to begin a bptree transaction");
        let bucket = tx.get_bucket(BUCKET_NAME).expect("missing bptree bucket");
        let items = bucket
            .kv_pairs()
            .map(|kv| (kv.key().to_vec(), decode_log_record_pos(kv.value())))
            .collect();
        Box::new(SnapshotIterator::new(items, reverse))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{exercise_indexer, pos};

    #[test]
    fn contract() {
        let dir = tempfile::TempDir::with_prefix("embercask-bptree").unwrap();
        exercise_indexer(&BPlusTreeIndex::new(dir.path()));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::TempDir::with_prefix("embercask-bptree").unwrap();
        {
            let index = BPlusTreeIndex::new(dir.path());
            index.put(b"persisted".to_vec(), pos(4, 99));
            index.put(b"dropped".to_vec(), pos(5, 1));
            index.delete(b"dropped");
        }

        let index = BPlusTreeIndex::new(dir.path());
        assert_eq!(index.get(b"persisted"), Some(pos(4, 99)));
        assert!(index.get(b"dropped").is_none());
        assert_eq!(index.size(), 1);
    }
}
