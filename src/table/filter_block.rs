//! Filter block: per-region filters for one table file.
//!
//! The table's data blocks are partitioned into 2 KiB regions of file
//! offset space; each region gets one filter built from every key added
//! while the builder was inside it. Layout:
//!
//! ```text
//! filter 0 ‖ filter 1 ‖ ... ‖ offsets (fixed32 each)
//! ‖ offset_array_start (fixed32) ‖ base_lg (1 byte)
//! ```

use std::sync::Arc;

use crate::encoding::{decode_fixed32, put_fixed32};
use crate::filter::FilterPolicy;

/// Regions are 1 << FILTER_BASE_LG bytes of data-block offset space.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Called when the table builder starts a data block at `block_offset`.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.keys.is_empty() {
            self.generate_filter();
        }
        let array_start = self.result.len() as u32;
        let offsets = std::mem::take(&mut self.filter_offsets);
        for offset in offsets {
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, array_start);
        self.result.push(FILTER_BASE_LG);
        &self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            // Region with no keys: repeat the previous offset (empty filter).
            return;
        }
        let keys = std::mem::take(&mut self.keys);
        self.policy.create_filter(&keys, &mut self.result);
    }
}

pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Start of the offset array.
    offsets_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// A malformed filter block yields a reader that lets everything
    /// through; filters are an optimization, never an authority.
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> Self {
        let mut reader = Self {
            policy,
            data: Vec::new(),
            offsets_start: 0,
            num_filters: 0,
            base_lg: 0,
        };
        let n = data.len();
        if n < 5 {
            return reader;
        }
        let base_lg = data[n - 1];
        let offsets_start = decode_fixed32(&data[n - 5..]) as usize;
        if offsets_start > n - 5 {
            return reader;
        }
        reader.num_filters = (n - 5 - offsets_start) / 4;
        reader.offsets_start = offsets_start;
        reader.base_lg = base_lg;
        reader.data = data;
        reader
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            return true;
        }
        let start =
            decode_fixed32(&self.data[self.offsets_start + index * 4..]) as usize;
        let limit = if index + 1 < self.num_filters {
            decode_fixed32(&self.data[self.offsets_start + (index + 1) * 4..]) as usize
        } else {
            self.offsets_start
        };
        if start > limit || limit > self.offsets_start {
            // Damaged offsets: treat as a match and let the read decide.
            return true;
        }
        if start == limit {
            // Empty region.
            return false;
        }
        self.policy.key_may_match(key, &self.data[start..limit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::BloomFilterPolicy;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    #[test]
    fn test_empty_builder() {
        let mut builder = FilterBlockBuilder::new(policy());
        let block = builder.finish().to_vec();
        let reader = FilterBlockReader::new(policy(), block);
        // No filters at all: everything may match.
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100_000, b"foo"));
    }

    #[test]
    fn test_single_region() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        let block = builder.finish().to_vec();

        let reader = FilterBlockReader::new(policy(), block);
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(!reader.key_may_match(100, b"missing-key-xyz"));
    }

    #[test]
    fn test_multiple_regions() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"region0");
        builder.start_block(3000);
        builder.add_key(b"region1");
        builder.start_block(9000);
        builder.add_key(b"region4");
        let block = builder.finish().to_vec();

        let reader = FilterBlockReader::new(policy(), block);
        assert!(reader.key_may_match(0, b"region0"));
        assert!(!reader.key_may_match(0, b"region1"));
        assert!(reader.key_may_match(3100, b"region1"));
        assert!(!reader.key_may_match(3100, b"region0"));
        assert!(reader.key_may_match(9000, b"region4"));
        // Regions 2..3 got no keys.
        assert!(!reader.key_may_match(4100, b"region0"));
        assert!(!reader.key_may_match(6200, b"region1"));
    }

    #[test]
    fn test_malformed_block_is_permissive() {
        let reader = FilterBlockReader::new(policy(), vec![1, 2, 3]);
        assert!(reader.key_may_match(0, b"anything"));
    }
}
