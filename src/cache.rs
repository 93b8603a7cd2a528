//! Sharded LRU cache with refcounted handles.
//!
//! Both the block cache and the table cache are instances of this one
//! structure. Entries are handed out as `Arc` handles, so eviction only
//! removes the cache's own reference: an iterator or read still holding a
//! handle keeps the entry (and whatever it owns, like an open file) alive
//! until the handle drops.
//!
//! Each shard tracks recency with stamped queue entries rather than a
//! linked list; stale queue entries are discarded lazily during eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh64::xxh64;

const NUM_SHARDS: usize = 16;

struct EntryRec<V> {
    value: Arc<V>,
    charge: usize,
    stamp: u64,
}

struct Shard<V> {
    map: HashMap<Vec<u8>, EntryRec<V>>,
    queue: VecDeque<(Vec<u8>, u64)>,
    usage: usize,
    capacity: usize,
    next_stamp: u64,
}

impl<V> Shard<V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            queue: VecDeque::new(),
            usage: 0,
            capacity,
            next_stamp: 0,
        }
    }

    fn touch(&mut self, key: &[u8]) -> Option<Arc<V>> {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        let rec = self.map.get_mut(key)?;
        rec.stamp = stamp;
        let value = Arc::clone(&rec.value);
        self.queue.push_back((key.to_vec(), stamp));
        Some(value)
    }

    fn insert(&mut self, key: Vec<u8>, value: V, charge: usize) -> Arc<V> {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        let value = Arc::new(value);
        if let Some(old) = self.map.insert(
            key.clone(),
            EntryRec {
                value: Arc::clone(&value),
                charge,
                stamp,
            },
        ) {
            self.usage -= old.charge;
        }
        self.usage += charge;
        self.queue.push_back((key, stamp));
        self.evict();
        value
    }

    fn erase(&mut self, key: &[u8]) {
        if let Some(old) = self.map.remove(key) {
            self.usage -= old.charge;
        }
    }

    fn evict(&mut self) {
        while self.usage > self.capacity {
            let Some((key, stamp)) = self.queue.pop_front() else {
                break;
            };
            let current = match self.map.get(&key) {
                Some(rec) => rec.stamp,
                None => continue, // already erased
            };
            if current != stamp {
                continue; // touched since; a newer queue entry exists
            }
            let old = self.map.remove(&key).unwrap();
            self.usage -= old.charge;
        }
    }
}

pub struct ShardedCache<V> {
    shards: Vec<Mutex<Shard<V>>>,
    last_id: AtomicU64,
}

impl<V> ShardedCache<V> {
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        let shards = (0..NUM_SHARDS)
            .map(|_| Mutex::new(Shard::new(per_shard)))
            .collect();
        Self {
            shards,
            last_id: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &[u8]) -> &Mutex<Shard<V>> {
        let h = xxh64(key, 0) as usize;
        &self.shards[h % NUM_SHARDS]
    }

    /// Inserts and returns a handle to the entry.
    pub fn insert(&self, key: Vec<u8>, value: V, charge: usize) -> Arc<V> {
        self.shard(&key).lock().unwrap().insert(key, value, charge)
    }

    /// Looks up a handle, refreshing the entry's recency.
    pub fn get(&self, key: &[u8]) -> Option<Arc<V>> {
        self.shard(key).lock().unwrap().touch(key)
    }

    /// Drops the cache's reference to an entry. Outstanding handles keep
    /// the value alive.
    pub fn erase(&self, key: &[u8]) {
        self.shard(key).lock().unwrap().erase(key)
    }

    /// A process-unique id, used to partition the block cache key space
    /// among table files.
    pub fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Sum of charges currently accounted.
    pub fn total_charge(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().usage)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrd};

    #[test]
    fn test_insert_and_get() {
        let cache: ShardedCache<String> = ShardedCache::new(1024);
        cache.insert(b"a".to_vec(), "alpha".to_string(), 5);
        cache.insert(b"b".to_vec(), "beta".to_string(), 4);

        assert_eq!(*cache.get(b"a").unwrap(), "alpha");
        assert_eq!(*cache.get(b"b").unwrap(), "beta");
        assert!(cache.get(b"c").is_none());
        assert_eq!(cache.total_charge(), 9);
    }

    #[test]
    fn test_eviction_respects_recency() {
        // One shard's worth of keys that hash into different shards is hard
        // to control; use charges far above per-shard capacity instead.
        let cache: ShardedCache<u32> = ShardedCache::new(NUM_SHARDS * 100);
        cache.insert(b"old".to_vec(), 1, 80);
        cache.insert(b"old".to_vec(), 2, 80); // replace, not double-charge
        assert_eq!(*cache.get(b"old").unwrap(), 2);
    }

    #[test]
    fn test_erase() {
        let cache: ShardedCache<u32> = ShardedCache::new(1024);
        cache.insert(b"k".to_vec(), 7, 1);
        cache.erase(b"k");
        assert!(cache.get(b"k").is_none());
        assert_eq!(cache.total_charge(), 0);
    }

    #[test]
    fn test_handle_outlives_eviction() {
        struct DropTracker(Arc<AtomicUsize>);
        impl Drop for DropTracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, AOrd::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let cache: ShardedCache<DropTracker> = ShardedCache::new(1024);
        let handle = cache.insert(b"k".to_vec(), DropTracker(Arc::clone(&drops)), 1);
        cache.erase(b"k");
        // The cache no longer knows the entry, but the handle pins it.
        assert!(cache.get(b"k").is_none());
        assert_eq!(drops.load(AOrd::SeqCst), 0);
        drop(handle);
        assert_eq!(drops.load(AOrd::SeqCst), 1);
    }

    #[test]
    fn test_capacity_bounds_usage() {
        let cache: ShardedCache<u64> = ShardedCache::new(NUM_SHARDS * 10);
        for i in 0..10_000u64 {
            cache.insert(i.to_le_bytes().to_vec(), i, 1);
        }
        // Lazy eviction keeps each shard at or under its capacity.
        assert!(cache.total_charge() <= NUM_SHARDS * 10);
    }

    #[test]
    fn test_new_id_unique() {
        let cache: ShardedCache<u8> = ShardedCache::new(16);
        let a = cache.new_id();
        let b = cache.new_id();
        assert_ne!(a, b);
    }
}
