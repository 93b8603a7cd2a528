//! Prefix-compressed blocks and their builder.
//!
//! Entries share key prefixes with their predecessor:
//!
//! ```text
//! entry   := varint32 shared ‖ varint32 unshared ‖ varint32 value_len
//!            ‖ key_delta ‖ value
//! block   := entry* ‖ restart_offset* (fixed32) ‖ num_restarts (fixed32)
//! ```
//!
//! Every `restart_interval` entries an entry is written with `shared = 0`
//! and its offset recorded, giving seeks a binary-searchable skeleton.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::InternalKeyComparator;
use crate::corruption;
use crate::encoding::{decode_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::error::{Error, Result};
use crate::iterator::Iter;

/// Ordering used to navigate a block. Data and index blocks hold internal
/// keys; the metaindex block holds plain byte strings.
#[derive(Clone)]
pub enum BlockOrdering {
    Internal(InternalKeyComparator),
    Raw,
}

impl BlockOrdering {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            BlockOrdering::Internal(icmp) => icmp.compare(a, b),
            BlockOrdering::Raw => a.cmp(b),
        }
    }
}

pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            restart_interval: restart_interval.max(1),
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Adds an entry; keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);

        let mut shared = 0;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let unshared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, unshared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        self.counter += 1;
    }

    /// Appends the restart array and returns the finished block contents.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes the finished block will occupy (before trailer).
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }
}

/// An immutable, parsed block.
pub struct Block {
    data: Vec<u8>,
    restarts_offset: usize,
    num_restarts: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(corruption!("block too small: {} bytes", data.len()));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]) as usize;
        let max_restarts = (data.len() - 4) / 4;
        if num_restarts > max_restarts {
            return Err(corruption!("block restart count out of range"));
        }
        let restarts_offset = data.len() - 4 - num_restarts * 4;
        Ok(Self {
            data,
            restarts_offset,
            num_restarts,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn restart_point(&self, i: usize) -> usize {
        decode_fixed32(&self.data[self.restarts_offset + i * 4..]) as usize
    }

    pub fn iter(self: &Arc<Self>, ordering: BlockOrdering) -> BlockIterator {
        BlockIterator {
            block: Arc::clone(self),
            ordering,
            current: self.restarts_offset,
            restart_index: self.num_restarts,
            key: Vec::new(),
            value_range: (0, 0),
            status: Ok(()),
        }
    }
}

/// Cursor over a block. `current == restarts_offset` means invalid.
pub struct BlockIterator {
    block: Arc<Block>,
    ordering: BlockOrdering,
    /// Offset of the current entry in the block data.
    current: usize,
    restart_index: usize,
    key: Vec<u8>,
    value_range: (usize, usize),
    status: Result<()>,
}

impl BlockIterator {
    fn restarts_offset(&self) -> usize {
        self.block.restarts_offset
    }

    fn corrupt(&mut self) {
        self.status = Err(corruption!("bad entry in block"));
        self.current = self.restarts_offset();
        self.restart_index = self.block.num_restarts;
        self.key.clear();
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;
        let offset = self.block.restart_point(index);
        self.current = offset;
        self.value_range = (offset, offset);
    }

    /// Decodes the entry at `value_range.1` (the end of the previous
    /// entry's value) and advances onto it. Returns false at block end or
    /// on corruption.
    fn parse_next_entry(&mut self) -> bool {
        let mut pos = self.value_range.1;
        if pos >= self.restarts_offset() {
            self.current = self.restarts_offset();
            self.restart_index = self.block.num_restarts;
            return false;
        }
        self.current = pos;

        let data = &self.block.data[..self.restarts_offset()];
        let Ok((shared, n)) = get_varint32(&data[pos..]) else {
            self.corrupt();
            return false;
        };
        pos += n;
        let Ok((unshared, n)) = get_varint32(&data[pos..]) else {
            self.corrupt();
            return false;
        };
        pos += n;
        let Ok((value_len, n)) = get_varint32(&data[pos..]) else {
            self.corrupt();
            return false;
        };
        pos += n;

        let (shared, unshared, value_len) = (shared as usize, unshared as usize, value_len as usize);
        if shared > self.key.len() || pos + unshared + value_len > data.len() {
            self.corrupt();
            return false;
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&data[pos..pos + unshared]);
        self.value_range = (pos + unshared, pos + unshared + value_len);

        // Keep the restart index in step with the cursor.
        while self.restart_index + 1 < self.block.num_restarts
            && self.block.restart_point(self.restart_index + 1) <= self.current
        {
            self.restart_index += 1;
        }
        true
    }
}

impl Iter for BlockIterator {
    fn valid(&self) -> bool {
        self.current < self.restarts_offset()
    }

    fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        // Walk forward to the final entry.
        while self.parse_next_entry() && self.value_range.1 < self.restarts_offset() {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            return;
        }
        // Binary search for the last restart point with key < target.
        let mut left = 0;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            self.seek_to_restart_point(mid);
            if !self.parse_next_entry() {
                return; // corrupt
            }
            if self.ordering.compare(&self.key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        self.seek_to_restart_point(left);
        // Linear scan to the first entry >= target.
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.ordering.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Find the restart point strictly before the current entry.
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // No entry before the first one.
                self.current = self.restarts_offset();
                self.restart_index = self.block.num_restarts;
                self.key.clear();
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        // Scan forward until the entry right before `original`.
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.value_range.1 >= original {
                return;
            }
        }
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_range.0..self.value_range.1]
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}
