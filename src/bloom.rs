//! Bloom filter with a custom two-seed Murmur3-style probe scheme.
//!
//! Each key is hashed with two independent 128-bit Murmur3 x64 hashes (fixed
//! seeds 7 and 53); the low 32 bits of each 64-bit half are taken as a probe,
//! yielding four 32-bit probes per key. `Add` sets all four bits; `Hit`
//! returns true only if all four are set.
//!
//! A bloom filter answering "no" is a definitive negative for its SSTable; a
//! "yes" is best-effort and must be confirmed by an actual read.

use crossbeam::channel::{Receiver, Sender, bounded};
use std::sync::atomic::{AtomicU64, Ordering};

const SEEDS: [u64; 2] = [7, 53];
const HASHER_POOL_SIZE: usize = 4;

/// A pre-seeded hashing context. Murmur3 as implemented here is a pure
/// function of `(data, seed)`, so this carries no mutable state — it exists
/// so the pooling/concurrency discipline below mirrors the reference design
/// (a bounded pool of reusable hashers gating concurrent access) even though
/// Rust's hash function has no `Reset`/`Write` lifecycle to amortize.
struct HashMaker;

impl HashMaker {
    /// Returns the four 32-bit probes for `data`.
    fn probes(&self, data: &[u8]) -> [u32; 4] {
        let mut out = [0u32; 4];
        for (i, seed) in SEEDS.iter().enumerate() {
            let (lo, hi) = murmur3_x64_128(data, *seed);
            out[i * 2] = lo as u32;
            out[i * 2 + 1] = hi as u32;
        }
        out
    }
}

/// Fixed-size dense bit array backing a [`Bloom`] filter, with lock-free
/// concurrent set/get via atomics.
struct BitSet {
    words: Vec<AtomicU64>,
    bit_len: u32,
}

impl BitSet {
    fn new(bit_len: u32) -> Self {
        let bit_len = bit_len.max(1);
        let word_count = (bit_len as usize).div_ceil(64);
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self { words, bit_len }
    }

    fn set(&self, bit: u32) {
        let bit = bit % self.bit_len;
        let word = bit as usize / 64;
        let offset = bit % 64;
        self.words[word].fetch_or(1u64 << offset, Ordering::Relaxed);
    }

    fn get(&self, bit: u32) -> bool {
        let bit = bit % self.bit_len;
        let word = bit as usize / 64;
        let offset = bit % 64;
        (self.words[word].load(Ordering::Relaxed) >> offset) & 1 == 1
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 8);
        for word in &self.words {
            bytes.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        bytes
    }

    fn from_bytes(bit_len: u32, bytes: &[u8]) -> Self {
        let bit_len = bit_len.max(1);
        let word_count = (bit_len as usize).div_ceil(64);
        let mut words = Vec::with_capacity(word_count);
        for i in 0..word_count {
            let start = i * 8;
            let mut buf = [0u8; 8];
            let end = (start + 8).min(bytes.len());
            if start < bytes.len() {
                buf[..end - start].copy_from_slice(&bytes[start..end]);
            }
            words.push(AtomicU64::new(u64::from_le_bytes(buf)));
        }
        Self { words, bit_len }
    }
}

/// A bloom filter over byte-string keys, sized at construction and immutable
/// in shape thereafter (bits may still be set via [`Bloom::add`]).
pub struct Bloom {
    bits: BitSet,
    pool_tx: Sender<HashMaker>,
    pool_rx: Receiver<HashMaker>,
}

impl Bloom {
    /// Create a new, empty filter with the given bit length.
    pub fn new(bit_len: u32) -> Self {
        let (pool_tx, pool_rx) = bounded(HASHER_POOL_SIZE);
        for _ in 0..HASHER_POOL_SIZE {
            // Channel has capacity HASHER_POOL_SIZE; this cannot fail.
            let _ = pool_tx.try_send(HashMaker);
        }
        Self {
            bits: BitSet::new(bit_len),
            pool_tx,
            pool_rx,
        }
    }

    /// Reconstruct a filter from its serialized bit array (as read from an
    /// on-disk [`crate::block::BloomBlock`]).
    pub fn from_bytes(bit_len: u32, bytes: &[u8]) -> Self {
        let (pool_tx, pool_rx) = bounded(HASHER_POOL_SIZE);
        for _ in 0..HASHER_POOL_SIZE {
            let _ = pool_tx.try_send(HashMaker);
        }
        Self {
            bits: BitSet::from_bytes(bit_len, bytes),
            pool_tx,
            pool_rx,
        }
    }

    pub fn bit_len(&self) -> u32 {
        self.bits.bit_len
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    fn probes(&self, data: &[u8]) -> [u32; 4] {
        match self.pool_rx.try_recv() {
            Ok(maker) => {
                let probes = maker.probes(data);
                // Pool is bounded at its initial fill; send can't fail unless
                // a maker was lost, in which case just drop it.
                let _ = self.pool_tx.try_send(maker);
                probes
            }
            Err(_) => HashMaker.probes(data),
        }
    }

    /// Record `key` as present.
    pub fn add(&self, key: &[u8]) {
        for probe in self.probes(key) {
            self.bits.set(probe);
        }
    }

    /// Test membership. `false` is definitive; `true` is best-effort.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.probes(key).into_iter().all(|probe| self.bits.get(probe))
    }
}

/// Bit length to use for a bloom filter built at the given SSTable level.
///
/// Level 0/1/2 get 1 MiB / 5 MiB / 10 MiB of bits respectively; higher
/// levels are capped at the level-2 size since levels beyond that are rare
/// in practice and an unbounded filter would waste memory.
pub fn bit_length_for_level(level: u32) -> u32 {
    const MIB_BITS: u32 = 1024 * 1024 * 8;
    match level {
        0 => MIB_BITS,
        1 => 5 * MIB_BITS,
        _ => 10 * MIB_BITS,
    }
}

// --------------------------------------------------------------------------
// Murmur3 x64 128-bit (public-domain algorithm by Austin Appleby)
// --------------------------------------------------------------------------

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Computes the Murmur3 x64 128-bit hash of `data` with the given seed,
/// returning the two 64-bit halves `(h1, h2)`.
fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    let mut h1 = seed;
    let mut h2 = seed;

    let nblocks = data.len() / 16;
    for i in 0..nblocks {
        let block = &data[i * 16..i * 16 + 16];
        let mut k1 = u64::from_le_bytes(block[0..8].try_into().expect("8-byte slice"));
        let mut k2 = u64::from_le_bytes(block[8..16].try_into().expect("8-byte slice"));

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;

        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;

        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;

    let tail_len = tail.len();
    if tail_len > 8 {
        for i in (8..tail_len).rev() {
            k2 ^= (tail[i] as u64) << (8 * (i - 8));
        }
        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
    }
    if tail_len >= 1 {
        for i in (0..tail_len.min(8)).rev() {
            k1 ^= (tail[i] as u64) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix64(h1);
    h2 = fmix64(h2);

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_deterministic() {
        let (h1, h2) = murmur3_x64_128(b"", 0);
        let (h1b, h2b) = murmur3_x64_128(b"", 0);
        assert_eq!((h1, h2), (h1b, h2b));
    }

    #[test]
    fn different_seeds_diverge() {
        let a = murmur3_x64_128(b"hello world", 7);
        let b = murmur3_x64_128(b"hello world", 53);
        assert_ne!(a, b);
    }

    #[test]
    fn bloom_has_no_false_negatives() {
        let bloom = Bloom::new(bit_length_for_level(0));
        let keys: Vec<Vec<u8>> = (0..500).map(|i| format!("key-{i}").into_bytes()).collect();
        for k in &keys {
            bloom.add(k);
        }
        for k in &keys {
            assert!(bloom.might_contain(k), "false negative for {k:?}");
        }
    }

    #[test]
    fn bloom_round_trips_through_bytes() {
        let bloom = Bloom::new(1024);
        bloom.add(b"alpha");
        bloom.add(b"beta");
        let bytes = bloom.to_bytes();
        let reloaded = Bloom::from_bytes(bloom.bit_len(), &bytes);
        assert!(reloaded.might_contain(b"alpha"));
        assert!(reloaded.might_contain(b"beta"));
    }

    #[test]
    fn absent_key_usually_reports_false() {
        let bloom = Bloom::new(bit_length_for_level(0));
        for i in 0..100 {
            bloom.add(format!("present-{i}").as_bytes());
        }
        assert!(!bloom.might_contain(b"definitely-absent-key-xyz"));
    }
}
