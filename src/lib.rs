//! EmberDB: an embedded, single-writer, ordered key-value storage engine
//! built on the log-structured merge-tree model.
//!
//! Keys and values are arbitrary byte strings. The store supports point
//! lookups, ordered range scans, atomic multi-operation writes, and
//! consistent point-in-time snapshots, with durability across crashes.
//!
//! ```no_run
//! use emberdb::{Options, ReadOptions, WriteOptions, DB};
//!
//! let db = DB::open(Options::new().create_if_missing(true), "/tmp/demo-db")?;
//! db.put(WriteOptions::new(), b"key", b"value")?;
//! assert_eq!(db.get(&ReadOptions::new(), b"key")?, Some(b"value".to_vec()));
//! # Ok::<(), emberdb::Error>(())
//! ```

pub mod arena;
pub mod batch;
pub mod cache;
pub mod comparator;
pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod skiplist;
pub mod snapshot;
pub mod table;
pub mod table_cache;
pub mod version;
pub mod wal;

mod flock;

pub use batch::WriteBatch;
pub use comparator::{BytewiseComparator, Comparator};
pub use config::{CompressionType, Options, ReadOptions, WriteOptions};
pub use db::db_iter::DbIterator;
pub use db::DB;
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use iterator::Iter;
pub use snapshot::Snapshot;
