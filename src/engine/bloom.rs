//! SOPHIA - Bloom Filter
//! Per-SSTable membership filter consulted before a point lookup
//! touches the table's index.
//!
//! False positives are possible, but false negatives are not.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A Bloom filter for probabilistic set membership testing.
///
/// Uses double hashing: bit `i` of a key is `h1 + i * h2 (mod m)`.
/// With `k` hash functions and `m` bits for `n` elements the false
/// positive rate is about `(1 - e^(-kn/m))^k`.
pub struct BloomFilter {
    /// Bit array stored as bytes.
    bits: Vec<u8>,
    /// Number of bits in the filter.
    num_bits: usize,
    /// Number of hash functions to use.
    num_hashes: u32,
    /// Number of elements inserted.
    count: usize,
}

impl BloomFilter {
    /// Create a new Bloom filter sized for `expected_items`
    /// at the given `false_positive_rate`.
    ///
    /// - Optimal bits: `m = -n * ln(p) / (ln(2)^2)`
    /// - Optimal hashes: `k = (m/n) * ln(2)`
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let fp_rate = false_positive_rate.clamp(0.0001, 0.5);

        let num_bits =
            (-(expected_items as f64) * fp_rate.ln() / (2.0_f64.ln().powi(2))).ceil() as usize;
        let num_bits = num_bits.max(64);

        let num_hashes = ((num_bits as f64 / expected_items as f64) * 2.0_f64.ln()).ceil() as u32;
        let num_hashes = num_hashes.clamp(2, 16);

        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_bits,
            num_hashes,
            count: 0,
        }
    }

    /// Build a filter holding every key yielded by `keys`.
    pub fn build<'a, I>(keys: I, expected_items: usize, false_positive_rate: f64) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut filter = Self::new(expected_items, false_positive_rate);
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    /// Insert a key into the Bloom filter.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
        self.count += 1;
    }

    /// `false` means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.bits[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    /// Returns the number of elements inserted.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (combined % self.num_bits as u64) as usize
    }
}

/// Two independent hashes of `key`. `DefaultHasher::new()` is keyed with
/// fixed constants, so positions are identical across runs.
fn hash_pair(key: &[u8]) -> (u64, u64) {
    let seeded = |seed: u64| {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish()
    };
    (seeded(0), seeded(0xDEADBEEF))
}
