//! Cache of open table files, keyed by file number.
//!
//! Capacity is `max_open_files` minus a reserve for the WAL, manifest, and
//! info log. Handles are refcounted: evicting a table (or the whole cache
//! entry) never tears down a file while an iterator or read still uses it.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::ShardedCache;
use crate::config::{Options, ReadOptions};
use crate::encoding::put_fixed64;
use crate::error::{Error, Result};
use crate::iterator::{EmptyIterator, Iter};
use crate::table::block::Block;
use crate::table::Table;
use crate::db::filename::{sst_table_file_name, table_file_name};

pub struct TableCache {
    db_path: PathBuf,
    options: Options,
    block_cache: Arc<ShardedCache<Block>>,
    cache: ShardedCache<Table>,
}

impl TableCache {
    pub fn new(
        db_path: PathBuf,
        options: Options,
        block_cache: Arc<ShardedCache<Block>>,
        entries: usize,
    ) -> Self {
        Self {
            db_path,
            options,
            block_cache,
            cache: ShardedCache::new(entries),
        }
    }

    fn key(file_number: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(8);
        put_fixed64(&mut key, file_number);
        key
    }

    /// Opens (or fetches the cached handle of) table `file_number`.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        let key = Self::key(file_number);
        if let Some(table) = self.cache.get(&key) {
            return Ok(table);
        }

        let path = table_file_name(&self.db_path, file_number);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Files written before the .ldb extension existed.
                File::open(sst_table_file_name(&self.db_path, file_number)).map_err(|_| {
                    Error::Io(format!("table file {file_number} missing: {e}"))
                })?
            }
            Err(e) => return Err(e.into()),
        };

        let table = Table::open(
            self.options.clone(),
            Some(Arc::clone(&self.block_cache)),
            file,
            file_size,
        )?;
        Ok(self.cache.insert(key, table, 1))
    }

    /// Iterator over the table's entries; the returned iterator holds the
    /// table handle for its whole lifetime.
    pub fn iter(
        &self,
        options: &ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Box<dyn Iter> {
        match self.find_table(file_number, file_size) {
            Ok(table) => table.iter(options.clone()),
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        }
    }

    /// Single point lookup through the table. The handle is released when
    /// this call returns.
    pub fn get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        ikey: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(options, ikey)
    }

    /// Approximate offset of `ikey` within the table, for size estimates.
    pub fn approximate_offset_of(&self, file_number: u64, file_size: u64, ikey: &[u8]) -> u64 {
        match self.find_table(file_number, file_size) {
            Ok(table) => table.approximate_offset_of(ikey),
            Err(_) => 0,
        }
    }

    /// Drops the cached handle for a deleted file.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&Self::key(file_number));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::{append_internal_key, extract_user_key, LookupKey, ValueType};
    use crate::table::TableBuilder;
    use tempfile::TempDir;

    fn options() -> Options {
        Options {
            comparator: Arc::new(BytewiseComparator),
            ..Options::default()
        }
    }

    fn write_table(dir: &std::path::Path, number: u64, keys: &[(&[u8], &[u8])]) -> u64 {
        let file = File::create(table_file_name(dir, number)).unwrap();
        let mut builder = TableBuilder::new(options(), file);
        for (i, (k, v)) in keys.iter().enumerate() {
            let mut ikey = Vec::new();
            append_internal_key(&mut ikey, k, (i + 1) as u64, ValueType::Put);
            builder.add(&ikey, v).unwrap();
        }
        builder.finish().unwrap();
        builder.sync().unwrap();
        builder.file_size()
    }

    fn new_cache(dir: &TempDir) -> TableCache {
        TableCache::new(
            dir.path().to_path_buf(),
            options(),
            Arc::new(ShardedCache::new(1 << 20)),
            100,
        )
    }

    #[test]
    fn test_get_through_cache() {
        let dir = TempDir::new().unwrap();
        let size = write_table(dir.path(), 3, &[(b"a", b"1"), (b"b", b"2")]);
        let cache = new_cache(&dir);

        let lk = LookupKey::new(b"b", 100);
        let (key, value) = cache
            .get(&ReadOptions::new(), 3, size, lk.internal_key())
            .unwrap()
            .expect("entry");
        assert_eq!(extract_user_key(&key), b"b");
        assert_eq!(value, b"2");
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir);
        let lk = LookupKey::new(b"a", 100);
        assert!(cache
            .get(&ReadOptions::new(), 99, 1024, lk.internal_key())
            .is_err());
    }

    #[test]
    fn test_legacy_sst_fallback() {
        let dir = TempDir::new().unwrap();
        // Write under the legacy extension only.
        let file = File::create(sst_table_file_name(dir.path(), 5)).unwrap();
        let mut builder = TableBuilder::new(options(), file);
        let mut ikey = Vec::new();
        append_internal_key(&mut ikey, b"k", 1, ValueType::Put);
        builder.add(&ikey, b"v").unwrap();
        builder.finish().unwrap();
        builder.sync().unwrap();
        let size = builder.file_size();

        let cache = new_cache(&dir);
        let lk = LookupKey::new(b"k", 10);
        assert!(cache
            .get(&ReadOptions::new(), 5, size, lk.internal_key())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_evict_then_reopen() {
        let dir = TempDir::new().unwrap();
        let size = write_table(dir.path(), 8, &[(b"x", b"y")]);
        let cache = new_cache(&dir);

        let lk = LookupKey::new(b"x", 10);
        assert!(cache
            .get(&ReadOptions::new(), 8, size, lk.internal_key())
            .unwrap()
            .is_some());
        cache.evict(8);
        // Still readable; the cache just reopens the file.
        assert!(cache
            .get(&ReadOptions::new(), 8, size, lk.internal_key())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_iterator_keeps_handle_after_evict() {
        let dir = TempDir::new().unwrap();
        let size = write_table(dir.path(), 9, &[(b"a", b"1"), (b"b", b"2")]);
        let cache = new_cache(&dir);

        let mut it = cache.iter(&ReadOptions::new(), 9, size);
        it.seek_to_first();
        cache.evict(9);
        // The iterator's table handle outlives the eviction.
        assert!(it.valid());
        assert_eq!(it.value(), b"1");
        it.next();
        assert_eq!(it.value(), b"2");
    }
}
