//! Iteration over sorted entry streams.
//!
//! All internal iterators — memtable, table block, level file, merging —
//! share one cursor-style trait. A cursor is positioned on an entry or
//! invalid; `key`/`value` must only be called while valid. Errors met
//! during movement are latched and reported through `status`.

use std::cmp::Ordering;

use crate::comparator::InternalKeyComparator;
use crate::error::Result;

pub trait Iter: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<()>;
}

/// An iterator over nothing, optionally carrying an error.
pub struct EmptyIterator {
    status: Result<()>,
}

impl EmptyIterator {
    pub fn new() -> Self {
        Self { status: Ok(()) }
    }

    pub fn with_error(err: crate::error::Error) -> Self {
        Self { status: Err(err) }
    }
}

impl Iter for EmptyIterator {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {}
    fn prev(&mut self) {}
    fn key(&self) -> &[u8] {
        panic!("key() on invalid iterator")
    }
    fn value(&self) -> &[u8] {
        panic!("value() on invalid iterator")
    }
    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges N child iterators into one stream ordered by internal key.
///
/// Children may contain equal user keys at different sequences; the
/// internal-key order (sequence descending within a user key) dictates the
/// merged order. Backward movement re-seeks the non-current children, so
/// `prev` is considerably more expensive than `next`.
pub struct MergingIterator {
    cmp: InternalKeyComparator,
    children: Vec<Box<dyn Iter>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub fn new(cmp: InternalKeyComparator, children: Vec<Box<dyn Iter>>) -> Box<dyn Iter> {
        match children.len() {
            0 => Box::new(EmptyIterator::new()),
            1 => children.into_iter().next().unwrap(),
            _ => Box::new(Self {
                cmp,
                children,
                current: None,
                direction: Direction::Forward,
            }),
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.cmp.compare(child.key(), self.children[s].key()) == Ordering::Less {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.cmp.compare(child.key(), self.children[l].key()) == Ordering::Greater {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl Iter for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        let current = self.current.expect("next() on invalid iterator");

        if self.direction != Direction::Forward {
            // All non-current children must be positioned after the current
            // key before a forward step is meaningful.
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() && self.cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("prev() on invalid iterator");

        if self.direction != Direction::Reverse {
            // Position all non-current children before the current key.
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() {
                    // Child is at the first entry >= key; step back once.
                    child.prev();
                } else {
                    // Everything in the child is < key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("key() on invalid iterator")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("value() on invalid iterator")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::{append_internal_key, ValueType};
    use std::sync::Arc;

    /// In-memory sorted iterator for tests.
    pub struct VecIterator {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
    }

    impl VecIterator {
        pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            Self { entries, pos: None }
        }
    }

    impl Iter for VecIterator {
        fn valid(&self) -> bool {
            self.pos.is_some()
        }
        fn seek_to_first(&mut self) {
            self.pos = if self.entries.is_empty() { None } else { Some(0) };
        }
        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().checked_sub(1);
        }
        fn seek(&mut self, target: &[u8]) {
            self.pos = self.entries.iter().position(|(k, _)| k.as_slice() >= target);
        }
        fn next(&mut self) {
            let p = self.pos.unwrap() + 1;
            self.pos = if p < self.entries.len() { Some(p) } else { None };
        }
        fn prev(&mut self) {
            self.pos = self.pos.unwrap().checked_sub(1);
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].0
        }
        fn value(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].1
        }
        fn status(&self) -> Result<()> {
            Ok(())
        }
    }

    fn ikey(user: &[u8], seq: u64) -> Vec<u8> {
        let mut k = Vec::new();
        append_internal_key(&mut k, user, seq, ValueType::Put);
        k
    }

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_merge_two_sources() {
        let a = VecIterator::new(vec![
            (ikey(b"a", 4), b"va".to_vec()),
            (ikey(b"c", 2), b"vc".to_vec()),
        ]);
        let b = VecIterator::new(vec![
            (ikey(b"b", 3), b"vb".to_vec()),
            (ikey(b"d", 1), b"vd".to_vec()),
        ]);
        let mut merged = MergingIterator::new(icmp(), vec![Box::new(a), Box::new(b)]);

        merged.seek_to_first();
        let mut seen = Vec::new();
        while merged.valid() {
            seen.push(crate::key::extract_user_key(merged.key()).to_vec());
            merged.next();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_same_user_key_newest_first() {
        let a = VecIterator::new(vec![(ikey(b"k", 9), b"new".to_vec())]);
        let b = VecIterator::new(vec![(ikey(b"k", 3), b"old".to_vec())]);
        let mut merged = MergingIterator::new(icmp(), vec![Box::new(a), Box::new(b)]);

        merged.seek_to_first();
        assert_eq!(merged.value(), b"new");
        merged.next();
        assert_eq!(merged.value(), b"old");
        merged.next();
        assert!(!merged.valid());
    }

    #[test]
    fn test_backward_after_forward() {
        let a = VecIterator::new(vec![
            (ikey(b"a", 1), vec![]),
            (ikey(b"c", 1), vec![]),
        ]);
        let b = VecIterator::new(vec![(ikey(b"b", 1), vec![])]);
        let mut merged = MergingIterator::new(icmp(), vec![Box::new(a), Box::new(b)]);

        merged.seek(&ikey(b"c", u64::MAX >> 8));
        assert_eq!(crate::key::extract_user_key(merged.key()), b"c");
        merged.prev();
        assert_eq!(crate::key::extract_user_key(merged.key()), b"b");
        merged.prev();
        assert_eq!(crate::key::extract_user_key(merged.key()), b"a");
        merged.prev();
        assert!(!merged.valid());
    }

    #[test]
    fn test_empty_children() {
        let mut merged = MergingIterator::new(
            icmp(),
            vec![
                Box::new(VecIterator::new(vec![])) as Box<dyn Iter>,
                Box::new(VecIterator::new(vec![])) as Box<dyn Iter>,
            ],
        );
        merged.seek_to_first();
        assert!(!merged.valid());
        assert!(merged.status().is_ok());
    }
}
