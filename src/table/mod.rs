//! Immutable sorted-table files.
//!
//! A table file holds a sequence of prefix-compressed data blocks followed
//! by the structures needed to find entries in them:
//!
//! ```text
//! +--------------------+
//! | data block 1..N    |
//! +--------------------+
//! | filter block       |  (when a filter policy is configured)
//! +--------------------+
//! | metaindex block    |  "filter.<name>" -> filter block handle
//! +--------------------+
//! | index block        |  separator key -> data block handle
//! +--------------------+
//! | footer             |  metaindex handle ‖ index handle ‖ magic
//! +--------------------+
//! ```
//!
//! Every block carries a one-byte compression tag and a crc32c trailer.
//! Tables are written once by flush or compaction and never modified.

pub mod block;
pub mod builder;
pub mod filter_block;
pub mod format;
pub mod reader;
pub mod two_level;

pub use builder::TableBuilder;
pub use reader::Table;
pub use two_level::TwoLevelIterator;
