mod art;
mod bptree;
mod btree;

pub use art::ArtIndex;
pub use bptree::BPlusTreeIndex;
pub use btree::BTreeIndex;

pub(crate) use bptree::BPTREE_INDEX_FILE_NAME;

use crate::data::log_record::LogRecordPos;
use crate::errors::Result;
use crate::options::IndexType;

use std::path::Path;

/// The keydir: an ordered map from live keys to their on-disk positions.
/// Every backend is internally synchronized; the engine shares one instance
/// across readers and the single writer.
pub trait Indexer: Send + Sync {
    /// Stores `pos` for `key`, returning the displaced position if the key
    /// was already present.
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos>;

    /// Looks up the position for `key`.
    fn get(&self, key: &[u8]) -> Option<LogRecordPos>;

    /// Removes `key`, returning the displaced position and whether the key
    /// existed.
    fn delete(&self, key: &[u8]) -> (Option<LogRecordPos>, bool);

    /// Number of live keys.
    fn size(&self) -> usize;

    /// A cursor over the keydir in ascending key order, or descending when
    /// `reverse` is set.
    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator>;

    /// Releases backend resources.
    fn close(&self) -> Result<()>;
}

/// Cursor over keydir entries. `key` and `value` may only be called while
/// `valid` returns true.
pub trait IndexIterator: Send + Sync {
    /// Repositions at the first entry.
    fn rewind(&mut self);

    /// Positions at the first key >= `key`, or <= `key` when reversed.
    fn seek(&mut self, key: &[u8]);

    /// Advances to the next entry.
    fn next(&mut self);

    /// Whether the cursor currently points at an entry.
    fn valid(&self) -> bool;

    fn key(&self) -> &[u8];

    fn value(&self) -> LogRecordPos;

    /// Releases the cursor's snapshot.
    fn close(&mut self);
}

/// Instantiates the configured keydir backend. Only the B+ tree touches
/// `dir_path`, for its `bptree-index` file.
pub fn new_indexer(index_type: IndexType, dir_path: &Path) -> Box<dyn Indexer> {
    match index_type {
        IndexType::BTree => Box::new(BTreeIndex::new()),
        IndexType::Art => Box::new(ArtIndex::new()),
        IndexType::BPlusTree => Box::new(BPlusTreeIndex::new(dir_path)),
    }
}

/// Shared cursor for the in-memory backends and the B+ tree: a sorted
/// snapshot materialized at construction, walked by index. `seek` is a
/// binary search over the snapshot.
pub(crate) struct SnapshotIterator {
    /// Ascending, or descending when `reverse` is set.
    items: Vec<(Vec<u8>, LogRecordPos)>,
    reverse: bool,
    current: usize,
}

impl SnapshotIterator {
    /// Takes `items` in ascending key order.
    pub(crate) fn new(mut items: Vec<(Vec<u8>, LogRecordPos)>, reverse: bool) -> Self {
        if reverse {
            items.reverse();
        }
        Self { items, reverse, current: 0 }
    }
}

impl IndexIterator for SnapshotIterator {
    fn rewind(&mut self) {
        self.current = 0;
    }

    fn seek(&mut self, key: &[u8]) {
        self.current = self.items.partition_point(|(k, _)| {
            if self.reverse {
                k.as_slice() > key
            } else {
                k.as_slice() < key
            }
        });
    }

    fn next(&mut self) {
        self.current += 1;
    }

    fn valid(&self) -> bool {
        self.current < self.items.len()
    }

    fn key(&self) -> &[u8] {
        &self.items[self.current].0
    }

    fn value(&self) -> LogRecordPos {
        self.items[self.current].1
    }

    fn close(&mut self) {
        self.items.clear();
    }
}
