//! Content fingerprinting: BLAKE3 hashing of block contents.

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash identifying a block's content. Used as the CAS key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Selects one of `buckets` index buckets. `buckets` must be a power of two.
    pub fn bucket(&self, buckets: usize) -> usize {
        let prefix = u64::from_le_bytes([
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6],
            self.0[7],
        ]);
        (prefix as usize) & (buckets - 1)
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute BLAKE3 hash of data
pub fn blake3_hash(data: &[u8]) -> ContentHash {
    let hash = blake3::hash(data);
    ContentHash(*hash.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blake3_hash_is_deterministic() {
        let h1 = blake3_hash(b"hello world");
        let h2 = blake3_hash(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_data_produces_different_hashes() {
        let h1 = blake3_hash(b"hello");
        let h2 = blake3_hash(b"world");
        assert_ne!(h1, h2);
    }

    #[test]
    fn hex_is_64_chars() {
        let h = blake3_hash(b"abc");
        assert_eq!(h.to_hex().len(), 64);
        assert_eq!(h.short().len(), 8);
        assert!(h.to_hex().starts_with(&h.short()));
        assert_eq!(format!("{}", h), h.to_hex());
    }

    proptest! {
        #[test]
        fn prop_bucket_in_range(data in prop::collection::vec(0u8..=255, 0..512), shift in 0u32..10) {
            let buckets = 1usize << shift;
            prop_assert!(blake3_hash(&data).bucket(buckets) < buckets);
        }
    }
}
