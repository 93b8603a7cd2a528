//! Bump allocator backing one memtable.
//!
//! Memory is carved out of 4 KiB chunks; oversized requests get a dedicated
//! chunk. Nothing is ever freed individually — the whole arena is released
//! when the owning memtable is dropped. Allocated bytes stay at a stable
//! address for the arena's lifetime (chunks are boxed slices whose heap
//! buffers never move), which is what lets skip-list readers hold raw
//! pointers into it without synchronization.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const BLOCK_SIZE: usize = 4096;

pub struct Arena {
    inner: Mutex<Inner>,
    /// Total bytes charged to this arena, including chunk overhead.
    usage: AtomicUsize,
}

struct Inner {
    blocks: Vec<Box<[u8]>>,
    // Bump state within the last normal-sized block.
    alloc_ptr: *mut u8,
    alloc_remaining: usize,
}

// The raw bump pointer is only advanced under the inner mutex; handed-out
// allocations are disjoint and immutable once published.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                blocks: Vec::new(),
                alloc_ptr: std::ptr::null_mut(),
                alloc_remaining: 0,
            }),
            usage: AtomicUsize::new(0),
        }
    }

    /// Allocates `bytes` (> 0) with no alignment guarantee beyond 1.
    pub fn alloc(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let mut inner = self.inner.lock().unwrap();
        if bytes <= inner.alloc_remaining {
            let result = inner.alloc_ptr;
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(bytes) };
            inner.alloc_remaining -= bytes;
            return result;
        }
        self.alloc_fallback(&mut inner, bytes)
    }

    /// Allocates `bytes` aligned to `max(8, pointer size)`.
    pub fn alloc_aligned(&self, bytes: usize) -> *mut u8 {
        let align = std::mem::size_of::<usize>().max(8);
        let mut inner = self.inner.lock().unwrap();
        let misalign = inner.alloc_ptr as usize & (align - 1);
        let slop = if misalign == 0 { 0 } else { align - misalign };
        let needed = bytes + slop;
        if needed <= inner.alloc_remaining {
            let result = unsafe { inner.alloc_ptr.add(slop) };
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(needed) };
            inner.alloc_remaining -= needed;
            result
        } else {
            // Fresh blocks come from the global allocator and are always
            // suitably aligned for this scheme.
            self.alloc_fallback(&mut inner, bytes)
        }
    }

    /// Copies `data` into the arena and returns its stable address.
    pub fn alloc_bytes(&self, data: &[u8]) -> *const u8 {
        if data.is_empty() {
            return std::ptr::NonNull::<u8>::dangling().as_ptr();
        }
        let dst = self.alloc(data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        dst
    }

    /// Total bytes charged, including unused chunk tails and bookkeeping.
    pub fn memory_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    fn alloc_fallback(&self, inner: &mut Inner, bytes: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // Large request: dedicated block so the bump block's remainder
            // is not wasted.
            return self.new_block(inner, bytes, false);
        }
        let ptr = self.new_block(inner, BLOCK_SIZE, true);
        inner.alloc_ptr = unsafe { ptr.add(bytes) };
        inner.alloc_remaining = BLOCK_SIZE - bytes;
        ptr
    }

    fn new_block(&self, inner: &mut Inner, size: usize, _bump: bool) -> *mut u8 {
        let mut block = vec![0u8; size].into_boxed_slice();
        let ptr = block.as_mut_ptr();
        inner.blocks.push(block);
        self.usage
            .fetch_add(size + std::mem::size_of::<Box<[u8]>>(), Ordering::Relaxed);
        ptr
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_basic() {
        let arena = Arena::new();
        let p = arena.alloc(16);
        assert!(!p.is_null());
        assert!(arena.memory_usage() >= BLOCK_SIZE);
    }

    #[test]
    fn test_alloc_bytes_roundtrip() {
        let arena = Arena::new();
        let data = b"the quick brown fox";
        let p = arena.alloc_bytes(data);
        let copied = unsafe { std::slice::from_raw_parts(p, data.len()) };
        assert_eq!(copied, data);
    }

    #[test]
    fn test_large_allocation_gets_own_block() {
        let arena = Arena::new();
        // Fill part of a bump block first.
        arena.alloc(100);
        let before = arena.memory_usage();
        let big = BLOCK_SIZE; // > BLOCK_SIZE / 4
        let p = arena.alloc(big);
        assert!(!p.is_null());
        assert!(arena.memory_usage() >= before + big);
        // The bump block should still have room for small requests.
        arena.alloc(100);
    }

    #[test]
    fn test_aligned_alloc() {
        let arena = Arena::new();
        arena.alloc(1); // knock the bump pointer off alignment
        let align = std::mem::size_of::<usize>().max(8);
        for _ in 0..32 {
            let p = arena.alloc_aligned(24);
            assert_eq!(p as usize % align, 0);
        }
    }

    #[test]
    fn test_addresses_stable_across_growth() {
        let arena = Arena::new();
        let mut ptrs = Vec::new();
        for i in 0..1000usize {
            let data = i.to_le_bytes();
            ptrs.push((arena.alloc_bytes(&data), data));
        }
        for (p, expect) in ptrs {
            let got = unsafe { std::slice::from_raw_parts(p, expect.len()) };
            assert_eq!(got, expect);
        }
    }
}
