use std::sync::atomic::{AtomicU64, Ordering};

use ring::digest;

mod manager;

pub use manager::FilterManager;

/// A fixed-size probabilistic membership filter.
///
/// Queries may report a false positive at roughly the configured rate but
/// never a false negative: once a key is inserted it always tests positive.
/// Keys cannot be removed; staleness is corrected by building a fresh filter
/// and swapping it in (see [`FilterManager`]).
///
/// Bits live in atomic words, so inserts from the revoke path and the event
/// listener proceed concurrently with lock-free queries.
pub struct MembershipFilter {
    bits: Box<[AtomicU64]>,
    num_bits: u64,
    num_hashes: u32,
}

impl MembershipFilter {
    /// Sizes a filter for the expected number of insertions at the target
    /// false-positive probability: ~1.44 * log2(1/p) bits per element and
    /// log2(1/p) hash functions.
    pub fn with_capacity(expected_insertions: usize, false_positive_probability: f64) -> Self {
        let n = expected_insertions.max(1) as f64;
        let p = false_positive_probability.clamp(1e-9, 0.5);
        let bits_per_element = 1.44 * (1.0 / p).log2();
        let num_words = ((n * bits_per_element) / 64.0).ceil().max(1.0) as usize;
        let num_hashes = ((1.0 / p).log2().ceil() as u32).max(1);
        let bits = (0..num_words)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            num_bits: num_words as u64 * 64,
            bits,
            num_hashes,
        }
    }

    pub fn insert(&self, key: &str) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    /// Returns `false` only when the key was definitely never inserted.
    pub fn contains(&self, key: &str) -> bool {
        let (h1, h2) = hash_pair(key);
        (0..self.num_hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
        })
    }

    /// Number of set bits, exposed for operational stats.
    pub fn set_bits(&self) -> u64 {
        self.bits
            .iter()
            .map(|word| u64::from(word.load(Ordering::Relaxed).count_ones()))
            .sum()
    }

    pub fn size_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

/// Derives two independent 64-bit hashes from a SHA-256 digest of the key.
/// The k probe positions are generated by double hashing: `h1 + i * h2`.
fn hash_pair(key: &str) -> (u64, u64) {
    let digest = digest::digest(&digest::SHA256, key.as_bytes());
    let bytes = digest.as_ref();
    let mut h1 = [0u8; 8];
    let mut h2 = [0u8; 8];
    h1.copy_from_slice(&bytes[..8]);
    h2.copy_from_slice(&bytes[8..16]);
    // A zero stride would collapse every probe onto the same bit.
    (u64::from_le_bytes(h1), u64::from_le_bytes(h2) | 1)
}
