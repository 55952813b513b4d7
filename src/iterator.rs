use crate::db::Engine;
use crate::errors::Result;
use crate::index::IndexIterator;
use crate::options::IteratorOptions;

use bytes::Bytes;
use parking_lot::RwLock;

/// Iterator over the engine's live keys, in key order. Keys come from a
/// keydir snapshot taken at construction; values are fetched from disk on
/// demand, so a value read can still fail on IO errors.
pub struct Iterator<'a> {
    index_iter: RwLock<Box<dyn IndexIterator>>,
    engine: &'a Engine,
    options: IteratorOptions,
}

impl Engine {
    /// Creates an iterator positioned at the first matching key.
    pub fn new_iterator(&self, options: IteratorOptions) -> Iterator<'_> {
        let index_iter = self.index.iterator(options.reverse);
        let iter = Iterator { index_iter: RwLock::new(index_iter), engine: self, options };
        iter.rewind();
        iter
    }
}

impl Iterator<'_> {
    /// Repositions at the first matching key.
    pub fn rewind(&self) {
        self.index_iter.write().rewind();
        self.skip_to_next();
    }

    /// Positions at the first matching key >= `key` (<= when reversed).
    pub fn seek(&self, key: &[u8]) {
        self.index_iter.write().seek(key);
        self.skip_to_next();
    }

    /// Advances to the next matching key.
    pub fn next(&self) {
        self.index_iter.write().next();
        self.skip_to_next();
    }

    /// Whether the iterator points at an entry.
    pub fn valid(&self) -> bool {
        self.index_iter.read().valid()
    }

    /// The current key. Only call while `valid` returns true.
    pub fn key(&self) -> Bytes {
        Bytes::copy_from_slice(self.index_iter.read().key())
    }

    /// The current value, read from its data file. Only call while `valid`
    /// returns true.
    pub fn value(&self) -> Result<Bytes> {
        let pos = self.index_iter.read().value();
        self.engine.get_value_by_position(&pos)
    }

    /// Releases the snapshot.
    pub fn close(&self) {
        self.index_iter.write().close();
    }

    /// Skips entries that do not carry the configured prefix.
    fn skip_to_next(&self) {
        if self.options.prefix.is_empty() {
            return;
        }
        let mut index_iter = self.index_iter.write();
        while index_iter.valid() {
            if index_iter.key().starts_with(&self.options.prefix) {
                break;
            }
            index_iter.next();
        }
    }
}
