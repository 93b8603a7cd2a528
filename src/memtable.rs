//! In-memory sorted buffer for recent writes.
//!
//! Entries are encoded into the arena as
//!
//! ```text
//! varint32(internal_key_len) ‖ internal_key ‖ varint32(value_len) ‖ value
//! ```
//!
//! and indexed by the skip list, which orders them by internal key. The
//! memtable is written only by the engine's write worker; readers access
//! it concurrently through shared references. Once rotated it becomes the
//! immutable memtable and is only read until its last reference drops.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::arena::Arena;
use crate::comparator::InternalKeyComparator;
use crate::encoding::{get_varint32, put_varint32, varint_length};
use crate::error::Result;
use crate::iterator::Iter;
use crate::key::{
    pack_sequence_and_type, sequence_and_type, LookupKey, SequenceNumber, ValueType,
};
use crate::skiplist::{KeyComparator, SkipList, SkipListIterator};

/// Orders memtable entries by their embedded internal key.
#[derive(Clone)]
pub struct MemtableKeyComparator {
    cmp: InternalKeyComparator,
}

impl KeyComparator for MemtableKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.cmp.compare(entry_internal_key(a), entry_internal_key(b))
    }
}

/// Internal key portion of an encoded memtable entry.
fn entry_internal_key(entry: &[u8]) -> &[u8] {
    let (len, n) = get_varint32(entry).expect("well-formed memtable entry");
    &entry[n..n + len as usize]
}

/// Value portion of an encoded memtable entry.
fn entry_value(entry: &[u8]) -> &[u8] {
    let (klen, n) = get_varint32(entry).expect("well-formed memtable entry");
    let rest = &entry[n + klen as usize..];
    let (vlen, m) = get_varint32(rest).expect("well-formed memtable entry");
    &rest[m..m + vlen as usize]
}

/// Outcome of a memtable point lookup.
pub enum MemtableGet {
    Found(Vec<u8>),
    Deleted,
    NotFound,
}

pub struct MemTable {
    cmp: InternalKeyComparator,
    list: SkipList<MemtableKeyComparator>,
}

impl MemTable {
    pub fn new(cmp: InternalKeyComparator) -> Self {
        let arena = Arc::new(Arena::new());
        let list = SkipList::new(MemtableKeyComparator { cmp: cmp.clone() }, arena);
        Self { cmp, list }
    }

    /// Bytes charged to this memtable's arena.
    pub fn approximate_memory_usage(&self) -> usize {
        self.list.arena().memory_usage()
    }

    /// Appends an entry. Caller (the write worker) guarantees `seq` is
    /// fresh, which keeps every skip-list key unique.
    pub fn add(&self, seq: SequenceNumber, t: ValueType, user_key: &[u8], value: &[u8]) {
        let internal_key_len = user_key.len() + 8;
        let encoded_len = varint_length(internal_key_len as u64)
            + internal_key_len
            + varint_length(value.len() as u64)
            + value.len();

        let mut buf = Vec::with_capacity(encoded_len);
        put_varint32(&mut buf, internal_key_len as u32);
        buf.extend_from_slice(user_key);
        crate::encoding::put_fixed64(&mut buf, pack_sequence_and_type(seq, t));
        put_varint32(&mut buf, value.len() as u32);
        buf.extend_from_slice(value);

        self.list.insert(&buf);
    }

    /// Point lookup at the lookup key's snapshot. A single seek lands on
    /// the newest entry for the user key with sequence <= snapshot, if any.
    pub fn get(&self, key: &LookupKey) -> MemtableGet {
        let mut iter = self.list.iter();
        iter.seek(key.memtable_key());
        if !iter.valid() {
            return MemtableGet::NotFound;
        }

        let entry = iter.key();
        let internal_key = entry_internal_key(entry);
        let user_key = &internal_key[..internal_key.len() - 8];
        if self
            .cmp
            .user_comparator()
            .compare(user_key, key.user_key())
            != Ordering::Equal
        {
            return MemtableGet::NotFound;
        }

        let tag = sequence_and_type(internal_key);
        match ValueType::from_tag((tag & 0xff) as u8) {
            Some(ValueType::Put) => MemtableGet::Found(entry_value(entry).to_vec()),
            Some(ValueType::Deletion) => MemtableGet::Deleted,
            // add() only ever writes known tags.
            None => MemtableGet::NotFound,
        }
    }

    /// Iterator over internal-key/value pairs. Holds a strong reference to
    /// the memtable, so it stays usable across rotation and flush.
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        // The skip-list cursor borrows the list; the Arc held alongside it
        // keeps that borrow alive for the iterator's whole lifetime.
        let iter = unsafe {
            std::mem::transmute::<
                SkipListIterator<'_, MemtableKeyComparator>,
                SkipListIterator<'static, MemtableKeyComparator>,
            >(self.list.iter())
        };
        MemTableIterator {
            _mem: Arc::clone(self),
            iter,
            scratch: Vec::new(),
        }
    }
}

pub struct MemTableIterator {
    _mem: Arc<MemTable>,
    iter: SkipListIterator<'static, MemtableKeyComparator>,
    scratch: Vec<u8>,
}

// The cursor only dereferences arena nodes, which the Arc keeps alive, and
// the skip list supports readers on any thread.
unsafe impl Send for MemTableIterator {}

impl MemTableIterator {
    /// Converts an internal-key seek target into the memtable entry format.
    fn encode_target(&mut self, target: &[u8]) {
        self.scratch.clear();
        put_varint32(&mut self.scratch, target.len() as u32);
        self.scratch.extend_from_slice(target);
    }
}

impl Iter for MemTableIterator {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        self.encode_target(target);
        let scratch = std::mem::take(&mut self.scratch);
        self.iter.seek(&scratch);
        self.scratch = scratch;
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        entry_internal_key(self.iter.key())
    }

    fn value(&self) -> &[u8] {
        entry_value(self.iter.key())
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
