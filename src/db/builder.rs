//! Building a level-0 table from a memtable.

use std::path::Path;

use tracing::info;

use crate::config::{Options, ReadOptions};
use crate::error::Result;
use crate::iterator::Iter;
use crate::key::InternalKey;
use crate::table::TableBuilder;
use crate::table_cache::TableCache;
use crate::db::filename::table_file_name;
use crate::version::FileMetaData;

/// Writes the entries of `iter` (internal-key order) into a new table
/// file. Returns `None` when the iterator is empty — no file is left
/// behind. The finished file is verified readable through the table cache
/// before it is reported usable.
pub fn build_table(
    db_path: &Path,
    options: &Options,
    table_cache: &TableCache,
    mut iter: Box<dyn Iter>,
    file_number: u64,
) -> Result<Option<FileMetaData>> {
    iter.seek_to_first();
    if !iter.valid() {
        iter.status()?;
        return Ok(None);
    }

    let path = table_file_name(db_path, file_number);
    let result = (|| -> Result<FileMetaData> {
        let file = std::fs::File::create(&path)?;
        let mut builder = TableBuilder::new(options.clone(), file);

        let smallest = InternalKey::decode_from(iter.key())?;
        let mut largest = smallest.clone();
        while iter.valid() {
            largest = InternalKey::decode_from(iter.key())?;
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        iter.status()?;

        builder.finish()?;
        builder.sync()?;
        let size = builder.file_size();
        debug_assert!(size > 0);

        // Make sure the file is usable before publishing it.
        let verify = table_cache.iter(&ReadOptions::new(), file_number, size);
        verify.status()?;

        Ok(FileMetaData::new(file_number, size, smallest, largest))
    })();

    match result {
        Ok(meta) => {
            info!(
                file = file_number,
                bytes = meta.size,
                "built level-0 table"
            );
            Ok(Some(meta))
        }
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ShardedCache;
    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::key::{extract_user_key, ValueType};
    use crate::memtable::MemTable;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn options() -> Options {
        Options {
            comparator: Arc::new(BytewiseComparator),
            ..Options::default()
        }
    }

    fn table_cache(dir: &TempDir) -> TableCache {
        TableCache::new(
            dir.path().to_path_buf(),
            options(),
            Arc::new(ShardedCache::new(1 << 20)),
            100,
        )
    }

    #[test]
    fn test_empty_memtable_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let cache = table_cache(&dir);
        let mem = Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))));
        let meta = build_table(dir.path(), &options(), &cache, Box::new(mem.iter()), 5).unwrap();
        assert!(meta.is_none());
        assert!(!table_file_name(dir.path(), 5).exists());
    }

    #[test]
    fn test_builds_readable_table() {
        let dir = TempDir::new().unwrap();
        let cache = table_cache(&dir);
        let mem = Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))));
        for i in 0..100u32 {
            mem.add(
                (i + 1) as u64,
                ValueType::Put,
                format!("key{i:04}").as_bytes(),
                format!("value{i}").as_bytes(),
            );
        }

        let meta = build_table(dir.path(), &options(), &cache, Box::new(mem.iter()), 6)
            .unwrap()
            .expect("table expected");
        assert_eq!(meta.number, 6);
        assert!(meta.size > 0);
        assert_eq!(extract_user_key(meta.smallest.encoded()), b"key0000");
        assert_eq!(extract_user_key(meta.largest.encoded()), b"key0099");

        // Every entry survives the round trip.
        let mut it = cache.iter(&ReadOptions::new(), 6, meta.size);
        it.seek_to_first();
        let mut count = 0;
        while it.valid() {
            count += 1;
            it.next();
        }
        assert_eq!(count, 100);
    }
}
