//! Streaming construction of a table file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use crate::comparator::InternalKeyComparator;
use crate::config::{CompressionType, Options};
use crate::encoding::put_fixed32;
use crate::error::Result;
use crate::filter::InternalFilterPolicy;
use crate::table::block::BlockBuilder;
use crate::table::filter_block::FilterBlockBuilder;
use crate::table::format::{BlockHandle, Footer, CRC32};

pub struct TableBuilder {
    options: Options,
    icmp: InternalKeyComparator,
    file: BufWriter<File>,
    offset: u64,
    num_entries: u64,
    closed: bool,
    status: Result<()>,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,

    last_key: Vec<u8>,
    /// An index entry for the block just flushed is deferred until the next
    /// key arrives, so the separator can be shortened against it.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

impl TableBuilder {
    pub fn new(options: Options, file: File) -> Self {
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let filter_block = options.filter_policy.clone().map(|p| {
            let mut b = FilterBlockBuilder::new(Arc::new(InternalFilterPolicy::new(p)));
            b.start_block(0);
            b
        });
        let restart_interval = options.block_restart_interval;
        Self {
            options,
            icmp,
            file: BufWriter::new(file),
            offset: 0,
            num_entries: 0,
            closed: false,
            status: Ok(()),
            data_block: BlockBuilder::new(restart_interval),
            // Index entries are all restarts; nothing shares prefixes.
            index_block: BlockBuilder::new(1),
            filter_block,
            last_key: Vec::new(),
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    /// Adds an entry; internal keys must arrive in increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.closed);
        self.status.clone()?;
        debug_assert!(
            self.num_entries == 0
                || self.icmp.compare(key, &self.last_key) == std::cmp::Ordering::Greater
        );

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.icmp.find_shortest_separator(&mut self.last_key, key);
            self.index_block
                .add(&self.last_key.clone(), &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }

        if let Some(fb) = &mut self.filter_block {
            fb.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let contents = self.data_block.finish().to_vec();
        self.pending_handle = self.write_block(&contents)?;
        self.data_block.reset();
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(fb) = &mut self.filter_block {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    /// Writes a block plus its compression-tag/crc trailer.
    fn write_block(&mut self, contents: &[u8]) -> Result<BlockHandle> {
        // Snappy degrades to stored: no codec is linked into this build.
        let tag = CompressionType::None.tag();

        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        self.file.write_all(contents)?;

        let mut trailer = Vec::with_capacity(5);
        trailer.push(tag);
        let mut digest = CRC32.digest();
        digest.update(contents);
        digest.update(&[tag]);
        put_fixed32(&mut trailer, digest.finalize());
        // put_fixed32 appended after the tag byte.
        self.file.write_all(&trailer)?;

        self.offset += contents.len() as u64 + trailer.len() as u64;
        Ok(handle)
    }

    /// Writes filter, metaindex, index, and footer; the file is complete
    /// (but not yet fsynced) afterwards.
    pub fn finish(&mut self) -> Result<()> {
        debug_assert!(!self.closed);
        self.flush_data_block()?;
        self.closed = true;

        // Filter block.
        let mut filter_handle = None;
        if let Some(fb) = &mut self.filter_block {
            let contents = fb.finish().to_vec();
            filter_handle = Some(self.write_block(&contents)?);
        }

        // Metaindex block.
        let mut metaindex = BlockBuilder::new(self.options.block_restart_interval);
        if let (Some(handle), Some(policy)) = (filter_handle, &self.options.filter_policy) {
            let key = format!("filter.{}", policy.name());
            metaindex.add(key.as_bytes(), &handle.encoded());
        }
        let contents = metaindex.finish().to_vec();
        let metaindex_handle = self.write_block(&contents)?;

        // Index block, with the trailing entry for the final data block.
        if self.pending_index_entry {
            self.icmp.find_short_successor(&mut self.last_key);
            self.index_block
                .add(&self.last_key.clone(), &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }
        let contents = self.index_block.finish().to_vec();
        let index_handle = self.write_block(&contents)?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        self.file.write_all(&footer.encode())?;
        self.offset += super::format::FOOTER_SIZE as u64;
        self.file.flush()?;
        Ok(())
    }

    /// Abandons the build; the caller deletes the partial file.
    pub fn abandon(&mut self) {
        debug_assert!(!self.closed);
        self.closed = true;
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far (the final file size once finished).
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// fsyncs the underlying file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}
