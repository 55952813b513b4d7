//! An embeddable, single-writer key-value storage engine built on the
//! Bitcask model: an append-only log of records on disk, paired with an
//! in-memory keydir mapping every live key to the position of its latest
//! value. See <https://riak.com/assets/bitcask-intro.pdf>.
//!
//! [`Engine`] provides point reads and writes, ordered iteration, atomic
//! multi-key batches, crash recovery by log replay, and background
//! compaction with a hint file for fast restarts.

#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_long_first_doc_paragraph)]

mod batch;
mod data;
mod db;
mod errors;
mod fio;
mod index;
mod iterator;
mod merge;
mod options;
mod util;

pub use batch::WriteBatch;
pub use db::{Engine, Stat};
pub use errors::{Errors, Result};
pub use iterator::Iterator;
pub use options::{IndexType, IteratorOptions, Options, WriteBatchOptions};
