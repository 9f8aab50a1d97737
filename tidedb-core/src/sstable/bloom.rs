//! Bloom filter for fast existence checks

use xxhash_rust::xxh3::xxh3_64;

/// Bloom filter over user keys
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Create a new bloom filter
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        // Tiny filters have a very high false positive rate
        let num_bits = (num_keys * bits_per_key).max(64);
        let num_bytes = (num_bits + 7) / 8;

        // Optimal number of hash functions
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as usize;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u8; num_bytes],
            num_bits: num_bytes * 8,
            num_hashes,
        }
    }

    /// Build a filter holding every key whose hash is in `hashes`
    pub fn from_hashes(hashes: &[u64], bits_per_key: usize) -> Self {
        let mut filter = Self::new(hashes.len(), bits_per_key);
        for &h in hashes {
            filter.add_hash(h);
        }
        filter
    }

    /// Hash used for filter membership
    pub fn hash(key: &[u8]) -> u64 {
        xxh3_64(key)
    }

    /// Add a key to the filter
    pub fn add(&mut self, key: &[u8]) {
        self.add_hash(Self::hash(key));
    }

    fn add_hash(&mut self, hash: u64) {
        let (h1, h2) = split(hash);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// Check if a key may be in the set
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = split(Self::hash(key));
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_position(h1, h2, i);
            (self.bits[bit / 8] >> (bit % 8)) & 1 == 1
        })
    }

    /// Serialized form: bit array followed by the hash count
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() + 1);
        out.extend_from_slice(&self.bits);
        out.push(self.num_hashes as u8);
        out
    }

    /// Parse a serialized filter; `None` if malformed
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&num_hashes, bits) = data.split_last()?;
        if bits.is_empty() || num_hashes == 0 || num_hashes > 30 {
            return None;
        }
        Some(Self {
            bits: bits.to_vec(),
            num_bits: bits.len() * 8,
            num_hashes: num_hashes as usize,
        })
    }

    /// Get number of hash functions
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    /// Estimated false positive rate
    pub fn false_positive_rate(&self, num_keys: usize) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = num_keys as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: usize) -> usize {
        let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (hash % self.num_bits as u64) as usize
    }
}

// Double hashing: derive the second hash stride from the high half
fn split(hash: u64) -> (u64, u64) {
    (hash, hash.rotate_right(32) | 1)
}
