//! Engine configuration and tuning constants.

use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;
use crate::snapshot::Snapshot;

/// Number of on-disk levels.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which each write is delayed by 1ms.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which writes stop until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Maximum level a freshly flushed memtable may be pushed to when it does
/// not overlap anything shallower.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// File descriptors reserved for non-table files (log, manifest, etc.).
pub const NUM_NON_TABLE_CACHE_FILES: usize = 10;

/// Block compression applied by the table builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    /// No snappy codec is linked into this build; blocks requested as
    /// snappy are stored uncompressed, and reading a block that is
    /// actually snappy-tagged on disk reports NotSupported.
    Snappy,
}

impl CompressionType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Snappy => 1,
        }
    }
}

/// Configuration for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Create the database if it does not exist (default: false).
    pub create_if_missing: bool,

    /// Fail open if the database already exists (default: false).
    pub error_if_exists: bool,

    /// Escalate recoverable read errors instead of skipping (default: false).
    pub paranoid_checks: bool,

    /// Memtable size before rotation, in bytes (default: 4 MiB).
    pub write_buffer_size: usize,

    /// Maximum number of open files (default: 1000). The table cache gets
    /// this minus a small reserve.
    pub max_open_files: usize,

    /// Block cache capacity in bytes (default: 8 MiB).
    pub block_cache_capacity: usize,

    /// Uncompressed target size of a table data block (default: 4 KiB).
    pub block_size: usize,

    /// Keys between restart points in a data block (default: 16).
    pub block_restart_interval: usize,

    /// Target size of an output table file (default: 2 MiB).
    pub max_file_size: u64,

    /// Block compression (default: Snappy, which degrades to stored).
    pub compression: CompressionType,

    /// Attempt to append to the previous WAL/manifest on reopen
    /// (default: false).
    pub reuse_logs: bool,

    /// Bytes of iteration between read samples that may trigger seek
    /// compaction (default: 1 MiB).
    pub read_sample_period_bytes: usize,

    /// Optional filter policy consulted before reading data blocks.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// User key ordering.
    pub comparator: Arc<dyn Comparator>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_cache_capacity: 8 * 1024 * 1024,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: CompressionType::Snappy,
            reuse_logs: false,
            read_sample_period_bytes: 1024 * 1024,
            filter_policy: None,
            comparator: Arc::new(BytewiseComparator),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, v: bool) -> Self {
        self.create_if_missing = v;
        self
    }

    pub fn error_if_exists(mut self, v: bool) -> Self {
        self.error_if_exists = v;
        self
    }

    pub fn paranoid_checks(mut self, v: bool) -> Self {
        self.paranoid_checks = v;
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn max_open_files(mut self, n: usize) -> Self {
        self.max_open_files = n;
        self
    }

    pub fn block_cache_capacity(mut self, bytes: usize) -> Self {
        self.block_cache_capacity = bytes;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn compression(mut self, c: CompressionType) -> Self {
        self.compression = c;
        self
    }

    pub fn reuse_logs(mut self, v: bool) -> Self {
        self.reuse_logs = v;
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    pub fn comparator(mut self, cmp: Arc<dyn Comparator>) -> Self {
        self.comparator = cmp;
        self
    }

    /// Clamps tunables into their supported ranges. Called once by `DB::open`.
    pub(crate) fn sanitize(mut self) -> Self {
        clip(&mut self.max_open_files, 64 + NUM_NON_TABLE_CACHE_FILES, 50_000);
        clip(&mut self.write_buffer_size, 64 << 10, 1 << 30);
        clip(&mut self.max_file_size, 1 << 20, 1 << 30);
        clip(&mut self.block_size, 1 << 10, 4 << 20);
        self
    }
}

fn clip<T: PartialOrd>(v: &mut T, min: T, max: T) {
    if *v < min {
        *v = min;
    } else if *v > max {
        *v = max;
    }
}

/// Per-read options.
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Verify block checksums on every read (default: false).
    pub verify_checksums: bool,

    /// Whether blocks read for this call populate the block cache
    /// (default: true via `ReadOptions::new`).
    pub fill_cache: bool,

    /// Read as of this snapshot instead of the latest sequence.
    pub snapshot: Option<Arc<Snapshot>>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }

    pub fn verify_checksums(mut self, v: bool) -> Self {
        self.verify_checksums = v;
        self
    }

    pub fn fill_cache(mut self, v: bool) -> Self {
        self.fill_cache = v;
        self
    }

    pub fn snapshot(mut self, s: Arc<Snapshot>) -> Self {
        self.snapshot = Some(s);
        self
    }
}

/// Per-write options.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// fsync the WAL before acknowledging the write (default: false).
    pub sync: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self, v: bool) -> Self {
        self.sync = v;
        self
    }
}

/// Maximum total bytes for a level before compaction is required.
pub fn max_bytes_for_level(level: usize) -> f64 {
    // Level 0 is scored by file count, not bytes; start at 10 MiB for
    // level 1 and grow 10x per level.
    let mut result = 10.0 * 1048576.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

/// Maximum bytes in grandparent overlap before an output file is cut.
pub fn max_grand_parent_overlap_bytes(options: &Options) -> u64 {
    10 * options.max_file_size
}

/// Maximum byte size of an expanded compaction (inputs from both levels).
pub fn expanded_compaction_byte_size_limit(options: &Options) -> u64 {
    25 * options.max_file_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(!opts.create_if_missing);
        assert_eq!(opts.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(opts.max_open_files, 1000);
        assert_eq!(opts.block_size, 4 * 1024);
        assert_eq!(opts.block_restart_interval, 16);
        assert_eq!(opts.max_file_size, 2 * 1024 * 1024);
    }

    #[test]
    fn test_builder() {
        let opts = Options::new()
            .create_if_missing(true)
            .write_buffer_size(1 << 20)
            .compression(CompressionType::None);
        assert!(opts.create_if_missing);
        assert_eq!(opts.write_buffer_size, 1 << 20);
        assert_eq!(opts.compression, CompressionType::None);
    }

    #[test]
    fn test_sanitize_clamps() {
        let opts = Options::new()
            .write_buffer_size(1)
            .max_open_files(1)
            .max_file_size(1)
            .sanitize();
        assert_eq!(opts.write_buffer_size, 64 << 10);
        assert_eq!(opts.max_open_files, 64 + NUM_NON_TABLE_CACHE_FILES);
        assert_eq!(opts.max_file_size, 1 << 20);
    }

    #[test]
    fn test_level_byte_budget() {
        assert_eq!(max_bytes_for_level(1) as u64, 10 * 1048576);
        assert_eq!(max_bytes_for_level(2) as u64, 100 * 1048576);
        assert_eq!(max_bytes_for_level(3) as u64, 1000 * 1048576);
    }

    #[test]
    fn test_compression_tags() {
        assert_eq!(CompressionType::from_tag(0), Some(CompressionType::None));
        assert_eq!(CompressionType::from_tag(1), Some(CompressionType::Snappy));
        assert_eq!(CompressionType::from_tag(2), None);
    }
}
