//! Reading entries out of an open table file.

use std::fs::File;
use std::sync::Arc;

use crate::cache::ShardedCache;
use crate::comparator::InternalKeyComparator;
use crate::config::{Options, ReadOptions};
use crate::encoding::put_fixed64;
use crate::error::Result;
use crate::filter::InternalFilterPolicy;
use crate::iterator::{EmptyIterator, Iter};
use crate::table::block::{Block, BlockOrdering};
use crate::table::filter_block::FilterBlockReader;
use crate::table::format::{read_block, BlockHandle, Footer, FOOTER_SIZE};
use crate::table::two_level::TwoLevelIterator;

pub struct Table {
    file: File,
    options: Options,
    icmp: InternalKeyComparator,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
    block_cache: Option<Arc<ShardedCache<Block>>>,
    cache_id: u64,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").finish_non_exhaustive()
    }
}

impl Table {
    /// Parses the footer, index, and filter of an open file.
    pub fn open(
        options: Options,
        block_cache: Option<Arc<ShardedCache<Block>>>,
        file: File,
        size: u64,
    ) -> Result<Table> {
        if size < FOOTER_SIZE as u64 {
            return Err(crate::corruption!("file too short to be a table"));
        }
        let mut footer_buf = vec![0u8; FOOTER_SIZE];
        super::format::read_exact_at(&file, &mut footer_buf, size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        let index_data = read_block(&file, footer.index_handle, true)?;
        let index_block = Arc::new(Block::new(index_data)?);

        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let cache_id = block_cache.as_ref().map_or(0, |c| c.new_id());

        let mut table = Table {
            file,
            options,
            icmp,
            index_block,
            filter: None,
            block_cache,
            cache_id,
        };
        table.read_filter(footer);
        Ok(table)
    }

    /// Filter damage is not fatal; the table just reads without one.
    fn read_filter(&mut self, footer: Footer) {
        let Some(policy) = self.options.filter_policy.clone() else {
            return;
        };
        let Ok(meta_data) = read_block(&self.file, footer.metaindex_handle, true) else {
            return;
        };
        let Ok(meta_block) = Block::new(meta_data) else {
            return;
        };
        let meta_block = Arc::new(meta_block);
        let mut iter = meta_block.iter(BlockOrdering::Raw);
        let key = format!("filter.{}", policy.name());
        iter.seek(key.as_bytes());
        if !iter.valid() || iter.key() != key.as_bytes() {
            return;
        }
        let Ok((handle, _)) = BlockHandle::decode_from(iter.value()) else {
            return;
        };
        let Ok(filter_data) = read_block(&self.file, handle, true) else {
            return;
        };
        self.filter = Some(FilterBlockReader::new(
            Arc::new(InternalFilterPolicy::new(policy)),
            filter_data,
        ));
    }

    fn cache_key(&self, handle: BlockHandle) -> Vec<u8> {
        let mut key = Vec::with_capacity(16);
        put_fixed64(&mut key, self.cache_id);
        put_fixed64(&mut key, handle.offset);
        key
    }

    /// Loads a data block, going through the block cache when allowed.
    fn read_data_block(&self, options: &ReadOptions, handle: BlockHandle) -> Result<Arc<Block>> {
        let verify = options.verify_checksums || self.options.paranoid_checks;
        let Some(cache) = &self.block_cache else {
            return Ok(Arc::new(Block::new(read_block(&self.file, handle, verify)?)?));
        };

        let cache_key = self.cache_key(handle);
        if let Some(block) = cache.get(&cache_key) {
            return Ok(block);
        }
        let block = Block::new(read_block(&self.file, handle, verify)?)?;
        if options.fill_cache {
            let charge = block.size();
            Ok(cache.insert(cache_key, block, charge))
        } else {
            Ok(Arc::new(block))
        }
    }

    fn block_iter(&self, options: &ReadOptions, index_value: &[u8]) -> Box<dyn Iter> {
        let handle = match BlockHandle::decode_from(index_value) {
            Ok((h, _)) => h,
            Err(e) => return Box::new(EmptyIterator::with_error(e)),
        };
        match self.read_data_block(options, handle) {
            Ok(block) => Box::new(block.iter(BlockOrdering::Internal(self.icmp.clone()))),
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        }
    }

    /// Full iteration over the table's internal-key entries.
    pub fn iter(self: &Arc<Self>, options: ReadOptions) -> Box<dyn Iter> {
        let index_iter = Box::new(
            self.index_block
                .iter(BlockOrdering::Internal(self.icmp.clone())),
        );
        let table = Arc::clone(self);
        TwoLevelIterator::new(
            index_iter,
            Box::new(move |index_value| table.block_iter(&options, index_value)),
        )
    }

    /// Point lookup: returns the raw entry a seek to `ikey` lands on, if
    /// the target block may contain the user key at all.
    pub fn internal_get(
        &self,
        options: &ReadOptions,
        ikey: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self
            .index_block
            .iter(BlockOrdering::Internal(self.icmp.clone()));
        index_iter.seek(ikey);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode_from(index_iter.value())?;
        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, ikey) {
                return Ok(None);
            }
        }

        let block = self.read_data_block(options, handle)?;
        let mut block_iter = block.iter(BlockOrdering::Internal(self.icmp.clone()));
        block_iter.seek(ikey);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }
        Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
    }

    /// Approximate file offset at which `ikey` would live.
    pub fn approximate_offset_of(&self, ikey: &[u8]) -> u64 {
        let mut index_iter = self
            .index_block
            .iter(BlockOrdering::Internal(self.icmp.clone()));
        index_iter.seek(ikey);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
        }
        // Past the last key: roughly the start of the metaindex.
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }
}
