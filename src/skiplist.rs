//! Concurrent-read, single-writer skip list.
//!
//! The memtable's ordered index. Nodes live in the arena and are never
//! freed or unlinked until the whole list is dropped, so readers need no
//! locks: a node's key and height are immutable after construction, and
//! forward pointers are published with release stores and read with
//! acquire loads. A reader that observes a raised max height before the
//! new node's pointers at that height simply falls through lower levels —
//! a null next behaves as "past end".
//!
//! Writer contract: `insert` must only be called by one thread at a time
//! (the engine's write worker), and only with keys that compare unequal to
//! every key already present. The memtable guarantees uniqueness by
//! embedding a fresh sequence number in every internal key.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as MemOrder};
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::arena::Arena;

const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

/// Total order over the raw byte keys stored in the list.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

#[repr(C)]
struct Node {
    key_ptr: *const u8,
    key_len: usize,
    height: usize,
    // `height` AtomicPtr slots follow inline; this field is only the first.
    next0: AtomicPtr<Node>,
}

impl Node {
    fn key(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.key_ptr, self.key_len) }
    }

    fn next_slot(&self, level: usize) -> &AtomicPtr<Node> {
        debug_assert!(level < self.height);
        unsafe { &*(&self.next0 as *const AtomicPtr<Node>).add(level) }
    }

    fn next(&self, level: usize) -> *mut Node {
        self.next_slot(level).load(MemOrder::Acquire)
    }

    fn set_next(&self, level: usize, node: *mut Node) {
        self.next_slot(level).store(node, MemOrder::Release);
    }

    /// Relaxed variants for locations not yet visible to readers.
    fn next_relaxed(&self, level: usize) -> *mut Node {
        self.next_slot(level).load(MemOrder::Relaxed)
    }

    fn set_next_relaxed(&self, level: usize, node: *mut Node) {
        self.next_slot(level).store(node, MemOrder::Relaxed);
    }
}

pub struct SkipList<C: KeyComparator> {
    cmp: C,
    arena: Arc<Arena>,
    head: *mut Node,
    max_height: AtomicUsize,
    rng: Mutex<SmallRng>,
}

// Nodes are arena-allocated and immutable apart from the atomic next
// pointers; see the module contract.
unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    pub fn new(cmp: C, arena: Arc<Arena>) -> Self {
        let head = Self::new_node(&arena, &[], MAX_HEIGHT);
        Self {
            cmp,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            rng: Mutex::new(SmallRng::seed_from_u64(0xdead_beef)),
        }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    fn new_node(arena: &Arena, key: &[u8], height: usize) -> *mut Node {
        let size = std::mem::size_of::<Node>()
            + (height - 1) * std::mem::size_of::<AtomicPtr<Node>>();
        let mem = arena.alloc_aligned(size) as *mut Node;
        let key_ptr = arena.alloc_bytes(key);
        unsafe {
            std::ptr::addr_of_mut!((*mem).key_ptr).write(key_ptr);
            std::ptr::addr_of_mut!((*mem).key_len).write(key.len());
            std::ptr::addr_of_mut!((*mem).height).write(height);
            let slots = std::ptr::addr_of_mut!((*mem).next0);
            for i in 0..height {
                slots.add(i).write(AtomicPtr::new(std::ptr::null_mut()));
            }
        }
        mem
    }

    fn random_height(&self) -> usize {
        let mut rng = self.rng.lock().unwrap();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_ratio(1, BRANCHING) {
            height += 1;
        }
        height
    }

    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        !node.is_null() && self.cmp.compare(unsafe { (*node).key() }, key) == Ordering::Less
    }

    /// First node whose key is >= `key`, recording the predecessor at each
    /// level in `prev` when given.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height.load(MemOrder::Relaxed) - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(p) = prev.as_deref_mut() {
                    p[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Last node whose key is < `key`, or head.
    fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height.load(MemOrder::Relaxed) - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if !next.is_null()
                && self.cmp.compare(unsafe { (*next).key() }, key) == Ordering::Less
            {
                x = next;
            } else if level == 0 {
                return x;
            } else {
                level -= 1;
            }
        }
    }

    /// Last node in the list, or head if empty.
    fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height.load(MemOrder::Relaxed) - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if !next.is_null() {
                x = next;
            } else if level == 0 {
                return x;
            } else {
                level -= 1;
            }
        }
    }

    /// Inserts `key`. See the module contract: single writer, unique keys.
    pub fn insert(&self, key: &[u8]) {
        let mut prev = [std::ptr::null_mut(); MAX_HEIGHT];
        let x = self.find_greater_or_equal(key, Some(&mut prev));

        debug_assert!(
            x.is_null() || self.cmp.compare(unsafe { (*x).key() }, key) != Ordering::Equal,
            "duplicate key inserted into skip list"
        );

        let height = self.random_height();
        let max_height = self.max_height.load(MemOrder::Relaxed);
        if height > max_height {
            for slot in prev.iter_mut().take(height).skip(max_height) {
                *slot = self.head;
            }
            // Readers that see the new height before the node splice fall
            // through head's null pointers at the new levels.
            self.max_height.store(height, MemOrder::Relaxed);
        }

        let node = Self::new_node(&self.arena, key, height);
        for (level, &p) in prev.iter().enumerate().take(height) {
            unsafe {
                // The node is invisible until prev's pointer is published,
                // so its own link can be set without a barrier.
                (*node).set_next_relaxed(level, (*p).next_relaxed(level));
                (*p).set_next(level, node);
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let x = self.find_greater_or_equal(key, None);
        !x.is_null() && self.cmp.compare(unsafe { (*x).key() }, key) == Ordering::Equal
    }

    pub fn iter(&self) -> SkipListIterator<'_, C> {
        SkipListIterator {
            list: self,
            node: std::ptr::null(),
        }
    }
}

/// Cursor over the list. Movement is O(1) forward and O(log n) backward
/// (backward steps re-search for the predecessor).
pub struct SkipListIterator<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *const Node,
}

impl<'a, C: KeyComparator> SkipListIterator<'a, C> {
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    pub fn key(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { std::slice::from_raw_parts((*self.node).key_ptr, (*self.node).key_len) }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let prev = self.list.find_less_than(unsafe { (*self.node).key() });
        self.node = if prev == self.list.head {
            std::ptr::null()
        } else {
            prev
        };
    }

    /// Positions at the first entry with key >= `key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.node = self.list.find_greater_or_equal(key, None);
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    pub fn seek_to_last(&mut self) {
        let last = self.list.find_last();
        self.node = if last == self.list.head {
            std::ptr::null()
        } else {
            last
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OrdComparator;

    impl KeyComparator for OrdComparator {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
    }

    fn new_list() -> SkipList<OrdComparator> {
        SkipList::new(OrdComparator, Arc::new(Arena::new()))
    }

    #[test]
    fn test_empty() {
        let list = new_list();
        assert!(!list.contains(b"a"));
        let mut it = list.iter();
        assert!(!it.valid());
        it.seek_to_first();
        assert!(!it.valid());
        it.seek_to_last();
        assert!(!it.valid());
        it.seek(b"anything");
        assert!(!it.valid());
    }

    #[test]
    fn test_insert_and_lookup() {
        let list = new_list();
        let keys: Vec<Vec<u8>> = (0..500u32).map(|i| format!("key{i:05}").into_bytes()).collect();
        // Insert in a scrambled order.
        let mut scrambled = keys.clone();
        scrambled.rotate_left(123);
        scrambled.reverse();
        for k in &scrambled {
            list.insert(k);
        }

        for k in &keys {
            assert!(list.contains(k));
        }
        assert!(!list.contains(b"key99999x"));

        // Forward iteration yields sorted order.
        let mut it = list.iter();
        it.seek_to_first();
        for k in &keys {
            assert!(it.valid());
            assert_eq!(it.key(), &k[..]);
            it.next();
        }
        assert!(!it.valid());
    }

    #[test]
    fn test_seek_and_prev() {
        let list = new_list();
        for i in (0..100u32).step_by(2) {
            list.insert(format!("k{i:04}").as_bytes());
        }

        let mut it = list.iter();
        // Seek to a missing key lands on the next greater one.
        it.seek(b"k0013");
        assert!(it.valid());
        assert_eq!(it.key(), b"k0014");

        it.prev();
        assert!(it.valid());
        assert_eq!(it.key(), b"k0012");

        it.seek_to_last();
        assert_eq!(it.key(), b"k0098");

        // Prev off the front invalidates.
        it.seek_to_first();
        it.prev();
        assert!(!it.valid());
    }

    #[test]
    fn test_concurrent_readers() {
        use std::sync::atomic::{AtomicU32, Ordering as AOrd};
        use std::thread;

        let list = Arc::new(new_list());
        let written = Arc::new(AtomicU32::new(0));

        let mut readers = Vec::new();
        for _ in 0..3 {
            let list = Arc::clone(&list);
            let written = Arc::clone(&written);
            readers.push(thread::spawn(move || {
                // Every key published before the read must be observed, in
                // order, with no gaps among the observed prefix.
                for _ in 0..200 {
                    let floor = written.load(AOrd::Acquire);
                    let mut it = list.iter();
                    it.seek_to_first();
                    let mut count = 0u32;
                    let mut last: Option<Vec<u8>> = None;
                    while it.valid() {
                        let k = it.key().to_vec();
                        if let Some(prev) = &last {
                            assert!(prev < &k);
                        }
                        last = Some(k);
                        count += 1;
                        it.next();
                    }
                    assert!(count >= floor, "reader saw {count}, expected >= {floor}");
                }
            }));
        }

        for i in 0..1000u32 {
            list.insert(format!("key{i:06}").as_bytes());
            written.store(i + 1, AOrd::Release);
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
