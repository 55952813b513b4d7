use super::{IndexIterator, Indexer, SnapshotIterator};
use crate::data::log_record::LogRecordPos;
use crate::errors::Result;

use parking_lot::RwLock;
use std::sync::Arc;

/// Child tables upgrade from the sorted sparse vector to a dense 256-slot
/// table past this fan-out.
const SPARSE_MAX: usize = 16;

/// Adaptive radix tree keydir: a byte-wise trie with path compression, so
/// runs of keys sharing prefixes collapse into single nodes. Child tables
/// adapt their layout to the fan-out.
pub struct ArtIndex {
    tree: Arc<RwLock<Art>>,
}

struct Art {
    root: Node,
    len: usize,
}

struct Node {
    /// Compressed path below the parent's edge byte.
    prefix: Vec<u8>,
    value: Option<LogRecordPos>,
    children: Children,
}

enum Children {
    /// Sorted by edge byte.
    Sparse(Vec<(u8, Node)>),
    Dense { slots: Vec<Option<Node>>, len: usize },
}

impl Node {
    fn leaf(prefix: Vec<u8>, pos: LogRecordPos) -> Self {
        Self { prefix, value: Some(pos), children: Children::Sparse(Vec::new()) }
    }

    /// Inserts `key` (relative to this node) and returns any displaced
    /// position.
    fn insert(&mut self, key: &[u8], pos: LogRecordPos) -> Option<LogRecordPos> {
        let common = common_prefix_len(&self.prefix, key);

        // The key diverges inside this node's compressed path: split it,
        // pushing the remainder of the path down into a child.
        if common < self.prefix.len() {
            let edge = self.prefix[common];
            let rest = self.prefix[common + 1..].to_vec();
            let lower = Node {
                prefix: rest,
                value: self.value.take(),
                children: std::mem::replace(&mut self.children, Children::Sparse(Vec::new())),
            };
            self.prefix.truncate(common);
            self.children.insert(edge, lower);

            if key.len() == common {
                self.value = Some(pos);
            } else {
                self.children.insert(key[common], Node::leaf(key[common + 1..].to_vec(), pos));
            }
            return None;
        }

        // The whole path matches and the key ends here.
        if key.len() == common {
            return self.value.replace(pos);
        }

        let edge = key[common];
        let rest = &key[common + 1..];
        match self.children.get_mut(edge) {
            Some(child) => child.insert(rest, pos),
            None => {
                self.children.insert(edge, Node::leaf(rest.to_vec(), pos));
                None
            }
        }
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        let p = self.prefix.len();
        if key.len() < p || key[..p] != self.prefix[..] {
            return None;
        }
        if key.len() == p {
            return self.value;
        }
        self.children.get(key[p])?.get(&key[p + 1..])
    }

    fn remove(&mut self, key: &[u8]) -> Option<LogRecordPos> {
        let p = self.prefix.len();
        if key.len() < p || key[..p] != self.prefix[..] {
            return None;
        }
        if key.len() == p {
            return self.value.take();
        }

        let edge = key[p];
        let child = self.children.get_mut(edge)?;
        let old = child.remove(&key[p + 1..])?;

        if child.value.is_none() && child.children.len() == 0 {
            self.children.remove(edge);
        } else if child.value.is_none() && child.children.len() == 1 {
            // Re-compress: fold the child's only grandchild into it.
            let (byte, grandchild) = child.children.take_only();
            child.prefix.push(byte);
            child.prefix.extend_from_slice(&grandchild.prefix);
            child.value = grandchild.value;
            child.children = grandchild.children;
        }
        Some(old)
    }

    /// In-order walk: a node's own key sorts before every descendant's.
    fn collect(&self, path: &mut Vec<u8>, out: &mut Vec<(Vec<u8>, LogRecordPos)>) {
        path.extend_from_slice(&self.prefix);
        if let Some(pos) = self.value {
            out.push((path.clone(), pos));
        }
        match &self.children {
            Children::Sparse(entries) => {
                for (byte, child) in entries {
                    path.push(*byte);
                    child.collect(path, out);
                    path.pop();
                }
            }
            Children::Dense { slots, .. } => {
                for (byte, slot) in slots.iter().enumerate() {
                    if let Some(child) = slot {
                        path.push(byte as u8);
                        child.collect(path, out);
                        path.pop();
                    }
                }
            }
        }
        path.truncate(path.len() - self.prefix.len());
    }
}

impl Children {
    fn len(&self) -> usize {
        match self {
            Children::Sparse(entries) => entries.len(),
            Children::Dense { len, .. } => *len,
        }
    }

    fn get(&self, byte: u8) -> Option<&Node> {
        match self {
            Children::Sparse(entries) => entries
                .binary_search_by_key(&byte, |(b, _)| *b)
                .ok()
                .map(|i| &entries[i].1),
            Children::Dense { slots, .. } => slots[byte as usize].as_ref(),
        }
    }

    fn get_mut(&mut self, byte: u8) -> Option<&mut Node> {
        match self {
            Children::Sparse(entries) => entries
                .binary_search_by_key(&byte, |(b, _)| *b)
                .ok()
                .map(|i| &mut entries[i].1),
            Children::Dense { slots, .. } => slots[byte as usize].as_mut(),
        }
    }

    /// Inserts a child for a byte not currently present, growing to the
    /// dense layout past `SPARSE_MAX`.
    fn insert(&mut self, byte: u8, node: Node) {
        match self {
            Children::Sparse(entries) => {
                if entries.len() < SPARSE_MAX {
                    let i = entries
                        .binary_search_by_key(&byte, |(b, _)| *b)
                        .expect_err("edge byte already present");
                    entries.insert(i, (byte, node));
                    return;
                }
                let mut slots: Vec<Option<Node>> = (0..256).map(|_| None).collect();
                let mut len = 0;
                for (b, child) in entries.drain(..) {
                    slots[b as usize] = Some(child);
                    len += 1;
                }
                slots[byte as usize] = Some(node);
                len += 1;
                *self = Children::Dense { slots, len };
            }
            Children::Dense { slots, len } => {
                debug_assert!(slots[byte as usize].is_none());
                slots[byte as usize] = Some(node);
                *len += 1;
            }
        }
    }

    fn remove(&mut self, byte: u8) -> Option<Node> {
        match self {
            Children::Sparse(entries) => {
                let i = entries.binary_search_by_key(&byte, |(b, _)| *b).ok()?;
                Some(entries.remove(i).1)
            }
            Children::Dense { slots, len } => {
                let node = slots[byte as usize].take()?;
                *len -= 1;
                Some(node)
            }
        }
    }

    /// Removes and returns the single remaining child. Panics unless
    /// `len() == 1`.
    fn take_only(&mut self) -> (u8, Node) {
        match self {
            Children::Sparse(entries) => {
                assert_eq!(entries.len(), 1);
                entries.pop().expect("single child")
            }
            Children::Dense { slots, len } => {
                assert_eq!(*len, 1);
                let byte = slots.iter().position(Option::is_some).expect("single child");
                *len -= 1;
                (byte as u8, slots[byte].take().expect("single child"))
            }
        }
    }
}

impl ArtIndex {
    pub fn new() -> Self {
        let root =
            Node { prefix: Vec::new(), value: None, children: Children::Sparse(Vec::new()) };
        Self { tree: Arc::new(RwLock::new(Art { root, len: 0 })) }
    }
}

impl Indexer for ArtIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos> {
        let mut art = self.tree.write();
        let old = art.root.insert(&key, pos);
        if old.is_none() {
            art.len += 1;
        }
        old
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        self.tree.read().root.get(key)
    }

    fn delete(&self, key: &[u8]) -> (Option<LogRecordPos>, bool) {
        let mut art = self.tree.write();
        let old = art.root.remove(key);
        if old.is_some() {
            art.len -= 1;
        }
        let existed = old.is_some();
        (old, existed)
    }

    fn size(&self) -> usize {
        self.tree.read().len
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let art = self.tree.read();
        let mut items = Vec::with_capacity(art.len);
        art.root.collect(&mut Vec::new(), &mut items);
        Box::new(SnapshotIterator::new(items, reverse))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
