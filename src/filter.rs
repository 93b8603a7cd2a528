//! Filter policies.
//!
//! A filter policy summarizes a set of keys into a small byte string that
//! can cheaply rule out lookups before a data block is read. The table
//! builder feeds it user keys per 2 KiB region; the reader consults it on
//! every point lookup.

use xxhash_rust::xxh64::xxh64;

use crate::key::extract_user_key;

pub trait FilterPolicy: Send + Sync {
    /// Name persisted in the table's metaindex; changing the algorithm
    /// requires a new name.
    fn name(&self) -> &'static str;

    /// Appends a filter covering `keys` to `dst`.
    fn create_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>);

    /// Whether `key` may be in the set `filter` was built from. False
    /// positives are allowed; false negatives are not.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter with double hashing.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), clamped to a sane probe count.
        let k = ((bits_per_key as f64) * 0.69) as usize;
        Self {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }

    fn bloom_hash(key: &[u8]) -> u32 {
        xxh64(key, 0xbc9f_1d34) as u32
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "emberdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>) {
        // Round up to a byte multiple; tiny key sets still get 64 bits to
        // keep the false positive rate down.
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let init_len = dst.len();
        dst.resize(init_len + bytes, 0);
        dst.push(self.k as u8);
        let array = &mut dst[init_len..init_len + bytes];

        for key in keys {
            let mut h = Self::bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit = (h as usize) % bits;
                array[bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }
        let bits = (filter.len() - 1) * 8;
        let k = filter[filter.len() - 1] as usize;
        if k > 30 {
            // Reserved for future encodings; err on the side of a read.
            return true;
        }
        let array = &filter[..filter.len() - 1];

        let mut h = Self::bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit = (h as usize) % bits;
            if array[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

/// Adapts a user-key policy to the internal keys stored in tables.
pub struct InternalFilterPolicy {
    user: std::sync::Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user: std::sync::Arc<dyn FilterPolicy>) -> Self {
        Self { user }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user.name()
    }

    fn create_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>) {
        let user_keys: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| extract_user_key(k).to_vec())
            .collect();
        self.user.create_filter(&user_keys, dst);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user.key_may_match(extract_user_key(key), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: &[&[u8]]) -> Vec<u8> {
        let policy = BloomFilterPolicy::new(10);
        let owned: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        let mut filter = Vec::new();
        policy.create_filter(&owned, &mut filter);
        filter
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build(&[]);
        assert!(!policy.key_may_match(b"anything", &filter));
    }

    #[test]
    fn test_no_false_negatives() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<Vec<u8>> = (0..1000u32).map(|i| i.to_le_bytes().to_vec()).collect();
        let mut filter = Vec::new();
        policy.create_filter(&keys, &mut filter);
        for key in &keys {
            assert!(policy.key_may_match(key, &filter));
        }
    }

    #[test]
    fn test_false_positive_rate_reasonable() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<Vec<u8>> = (0..10_000u32).map(|i| i.to_le_bytes().to_vec()).collect();
        let mut filter = Vec::new();
        policy.create_filter(&keys, &mut filter);

        let mut hits = 0;
        for i in 10_000..20_000u32 {
            if policy.key_may_match(&i.to_le_bytes(), &filter) {
                hits += 1;
            }
        }
        // ~1% expected at 10 bits/key; allow generous slack.
        assert!(hits < 400, "false positive rate too high: {hits}/10000");
    }

    #[test]
    fn test_internal_policy_strips_trailer() {
        use crate::key::{append_internal_key, ValueType};
        use std::sync::Arc;

        let internal = InternalFilterPolicy::new(Arc::new(BloomFilterPolicy::new(10)));
        let mut ikey = Vec::new();
        append_internal_key(&mut ikey, b"user-key", 42, ValueType::Put);

        let mut filter = Vec::new();
        internal.create_filter(&[ikey.clone()], &mut filter);

        // A different sequence for the same user key must still match.
        let mut probe = Vec::new();
        append_internal_key(&mut probe, b"user-key", 99, ValueType::Deletion);
        assert!(internal.key_may_match(&probe, &filter));
    }
}
