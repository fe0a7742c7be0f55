//! # taproot
//!
//! Disk-resident B+ tree containers over a single paged file: ordered
//! unique-key and multi-key maps (and sets, via `()` values) for trivially
//! copyable fixed-size records, plus a secondary-index layer for records
//! kept in an append-only flat file and a bulk loader built on external
//! merge-sort.
//!
//! ## Quick start
//!
//! ```no_run
//! use taproot_core::{BTree, TreeOptions};
//!
//! let mut tree: BTree<i32, i32> =
//!     BTree::open_map("points.btr".as_ref(), TreeOptions::new()).unwrap();
//! tree.insert(7, 70).unwrap();
//! assert_eq!(tree.get(&7).unwrap(), Some(70));
//! for item in tree.iter().unwrap() {
//!     let (key, value) = item.unwrap();
//!     println!("{key} -> {value}");
//! }
//! tree.close().unwrap();
//! ```
//!
//! The engine is single-writer and single-threaded: one writer per file,
//! no internal threads, and no durability guarantees beyond a flushed
//! close.

pub mod btree;
pub mod bulk;
pub mod error;
pub mod index;
pub mod storage;
pub mod types;

pub use btree::{BTree, Cursor, EntryRef, Iter, Range};
pub use bulk::{bulk_load, write_records, BulkLoadReport};
pub use error::{Error, Result};
pub use index::{FlatFile, NaturalRecordOrder, PositionOrder, RecordIndex, RecordOrder};
pub use types::{
    FilePos, KeyOrder, KeyPolicy, NaturalOrder, OpenFlags, PageId, Record, TreeOptions,
    DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE, SIGNATURE_ANY,
};
