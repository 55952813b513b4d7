use super::{IndexIterator, Indexer, SnapshotIterator};
use crate::data::log_record::LogRecordPos;
use crate::errors::Result;

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Ordered in-memory keydir over a [`BTreeMap`], comparing keys
/// lexicographically.
pub struct BTreeIndex {
    tree: Arc<RwLock<BTreeMap<Vec<u8>, LogRecordPos>>>,
}

impl BTreeIndex {
    pub fn new() -> Self {
        Self { tree: Arc::new(RwLock::new(BTreeMap::new())) }
    }
}

impl Indexer for BTreeIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos> {
        self.tree.write().insert(key, pos)
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        self.tree.read().get(key).copied()
    }

    fn delete(&self, key: &[u8]) -> (Option<LogRecordPos>, bool) {
        let old = self.tree.write().remove(key);
        let existed = old.is_some();
        (old, existed)
    }

    fn size(&self) -> usize {
        self.tree.read().len()
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let items = self.tree.read().iter().map(|(k, v)| (k.clone(), *v)).collect();
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
        exercise_indexer(&BTreeIndex::new());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let index = BTreeIndex::new();
        index.put(b"a".to_vec(), pos(0, 0));
        let mut iter = index.iterator(false);
        index.put(b"b".to_vec(), pos(0, 1));

        let mut seen = 0;
        iter.rewind();
        while iter.valid() {
            seen += 1;
            iter.next();
        }
        assert_eq!(seen, 1);
    }
}
