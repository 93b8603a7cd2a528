//! Atomic multi-operation writes.
//!
//! A `WriteBatch` holds its operations pre-encoded in the WAL payload
//! format:
//!
//! ```text
//! fixed64 sequence ‖ fixed32 count ‖ entries*
//! entry := 0x01 ‖ varstring key ‖ varstring value   (put)
//!        | 0x00 ‖ varstring key                     (deletion)
//! ```
//!
//! The same bytes are appended verbatim to the WAL and replayed through
//! `insert_into` on recovery, so encode/decode symmetry here is what makes
//! batches atomic across crashes.

use crate::corruption;
use crate::encoding::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_fixed32, put_fixed64,
    put_length_prefixed_slice,
};
use crate::error::Result;
use crate::key::{SequenceNumber, ValueType};
use crate::memtable::MemTable;

/// sequence (8) + count (4)
const HEADER_SIZE: usize = 12;

const TAG_DELETION: u8 = 0;
const TAG_PUT: u8 = 1;

/// One decoded batch operation.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchOp<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

#[derive(Clone, Debug)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0; HEADER_SIZE],
        }
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(TAG_PUT);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(TAG_DELETION);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of operations in the batch.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    fn set_count(&mut self, n: u32) {
        let mut buf = Vec::with_capacity(4);
        put_fixed32(&mut buf, n);
        self.rep[8..12].copy_from_slice(&buf);
    }

    /// Sequence number assigned to the first operation.
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[0..8])
    }

    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        let mut buf = Vec::with_capacity(8);
        put_fixed64(&mut buf, seq);
        self.rep[0..8].copy_from_slice(&buf);
    }

    /// Encoded size in bytes (what the WAL record will carry).
    pub fn byte_size(&self) -> usize {
        self.rep.len()
    }

    /// The full wire representation.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Replaces this batch with previously encoded contents (WAL replay).
    pub fn set_contents(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < HEADER_SIZE {
            return Err(corruption!("write batch too small: {} bytes", data.len()));
        }
        self.rep.clear();
        self.rep.extend_from_slice(data);
        Ok(())
    }

    /// Appends all of `other`'s operations to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
    }

    /// Decodes the operations. Rejects truncation, bad tags, and a count
    /// that disagrees with the entries present.
    pub fn iterate(&self) -> Result<Vec<BatchOp<'_>>> {
        let mut ops = Vec::with_capacity(self.count() as usize);
        let mut input = &self.rep[HEADER_SIZE..];
        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            match tag {
                TAG_PUT => {
                    let (key, n) = get_length_prefixed_slice(input)?;
                    input = &input[n..];
                    let (value, n) = get_length_prefixed_slice(input)?;
                    input = &input[n..];
                    ops.push(BatchOp::Put { key, value });
                }
                TAG_DELETION => {
                    let (key, n) = get_length_prefixed_slice(input)?;
                    input = &input[n..];
                    ops.push(BatchOp::Delete { key });
                }
                _ => return Err(corruption!("unknown write batch tag: {tag}")),
            }
        }
        if ops.len() != self.count() as usize {
            return Err(corruption!(
                "write batch count mismatch: header {} vs {} entries",
                self.count(),
                ops.len()
            ));
        }
        Ok(ops)
    }

    /// Applies the batch to a memtable, assigning `sequence() + i` to the
    /// i-th operation.
    pub fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut seq = self.sequence();
        for op in self.iterate()? {
            match op {
                BatchOp::Put { key, value } => mem.add(seq, ValueType::Put, key, value),
                BatchOp::Delete { key } => mem.add(seq, ValueType::Deletion, key, b""),
            }
            seq += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::key::LookupKey;
    use crate::memtable::MemtableGet;
    use std::sync::Arc;

    #[test]
    fn test_empty_batch() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.byte_size(), 12);
        assert!(batch.iterate().unwrap().is_empty());
    }

    #[test]
    fn test_put_delete_roundtrip() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"", b"");
        assert_eq!(batch.count(), 3);

        let ops = batch.iterate().unwrap();
        assert_eq!(
            ops,
            vec![
                BatchOp::Put { key: b"a", value: b"1" },
                BatchOp::Delete { key: b"b" },
                BatchOp::Put { key: b"", value: b"" },
            ]
        );
    }

    #[test]
    fn test_sequence_header() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(12345);
        assert_eq!(batch.sequence(), 12345);
        batch.put(b"k", b"v");
        assert_eq!(batch.sequence(), 12345);
    }

    #[test]
    fn test_append_groups() {
        let mut a = WriteBatch::new();
        a.put(b"x", b"1");
        let mut b = WriteBatch::new();
        b.delete(b"y");
        b.put(b"z", b"2");
        a.append(&b);
        assert_eq!(a.count(), 3);
        let ops = a.iterate().unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[2], BatchOp::Put { key: b"z", value: b"2" });
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let full = batch.contents().to_vec();

        let mut short = WriteBatch::new();
        assert!(short.set_contents(&full[..8]).is_err());

        // Cut inside the entry bytes: header parses, iterate must fail.
        let mut cut = WriteBatch::new();
        cut.set_contents(&full[..full.len() - 2]).unwrap();
        assert!(cut.iterate().is_err());
    }

    #[test]
    fn test_decode_rejects_bad_tag() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        let mut raw = batch.contents().to_vec();
        raw[12] = 0x7f;
        let mut bad = WriteBatch::new();
        bad.set_contents(&raw).unwrap();
        assert!(bad.iterate().unwrap_err().is_corruption());
    }

    #[test]
    fn test_insert_into_memtable() {
        let mem = MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)));
        let mut batch = WriteBatch::new();
        batch.set_sequence(100);
        batch.put(b"a", b"1");
        batch.put(b"a", b"2");
        batch.delete(b"b");
        batch.insert_into(&mem).unwrap();

        match mem.get(&LookupKey::new(b"a", 200)) {
            MemtableGet::Found(v) => assert_eq!(v, b"2"),
            _ => panic!("expected overwrite to win"),
        }
        match mem.get(&LookupKey::new(b"a", 100)) {
            MemtableGet::Found(v) => assert_eq!(v, b"1"),
            _ => panic!("expected first put at its own sequence"),
        }
        match mem.get(&LookupKey::new(b"b", 200)) {
            MemtableGet::Deleted => {}
            _ => panic!("expected tombstone"),
        }
    }
}
