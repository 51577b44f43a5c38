//! Bloom filter for fast existence checks
//!
//! Encoded as `filter bytes || k (u8) || crc32(filter || k) (u32 BE)`.

use crate::{Result, StrataError};
use bytes::{Buf, BufMut};

const CHECKSUM_SIZE: usize = 4;
const MIN_BITS: usize = 64;

/// Hash a key for filter insertion and lookup
pub fn hash_key(key: &[u8]) -> u32 {
    xxhash_rust::xxh32::xxh32(key, 0)
}

/// Bloom filter over 32-bit key hashes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    filter: Vec<u8>,
    k: u8,
}

impl BloomFilter {
    /// Bits per key needed for `false_positive_rate`
    pub fn bits_per_key(false_positive_rate: f64) -> f64 {
        let ln2 = std::f64::consts::LN_2;
        -false_positive_rate.ln() / (ln2 * ln2)
    }

    /// Build a filter sized for `hashes.len()` keys at the target rate
    pub fn build_from_key_hashes(hashes: &[u32], false_positive_rate: f64) -> Self {
        let bits_per_key = Self::bits_per_key(false_positive_rate);
        let k = (bits_per_key * std::f64::consts::LN_2).ceil().clamp(1.0, 30.0) as u8;

        let wanted = (hashes.len() as f64 * bits_per_key).ceil() as usize;
        let num_bytes = (wanted.max(MIN_BITS) + 7) / 8;
        let mut filter = vec![0u8; num_bytes];
        let num_bits = num_bytes * 8;

        for &hash in hashes {
            for bit in Self::probes(hash, k, num_bits) {
                filter[bit / 8] |= 1 << (bit % 8);
            }
        }

        Self { filter, k }
    }

    /// Check if a key hash may be in the set
    pub fn may_contain(&self, hash: u32) -> bool {
        let num_bits = self.num_bits();
        if num_bits == 0 {
            return true;
        }
        Self::probes(hash, self.k, num_bits).all(|bit| self.filter[bit / 8] & (1 << (bit % 8)) != 0)
    }

    /// Serialize with trailing checksum
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut checksum = crc32fast::Hasher::new();
        checksum.update(&self.filter);
        checksum.update(&[self.k]);

        buf.put_slice(&self.filter);
        buf.put_u8(self.k);
        buf.put_u32(checksum.finalize());
    }

    /// Deserialize, rejecting any corrupted byte
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CHECKSUM_SIZE + 1 {
            return Err(StrataError::Corruption(format!(
                "bloom filter too short: {} bytes",
                data.len()
            )));
        }

        let (body, mut tail) = data.split_at(data.len() - CHECKSUM_SIZE);
        let expected = tail.get_u32();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        let (filter, k) = body.split_at(body.len() - 1);
        Ok(Self {
            filter: filter.to_vec(),
            k: k[0],
        })
    }

    /// Number of probes per key
    pub fn num_hashes(&self) -> u8 {
        self.k
    }

    /// Size of the bit array
    pub fn num_bits(&self) -> usize {
        self.filter.len() * 8
    }

    /// Double hashing: `h, h + delta, h + 2*delta, ...` modulo the bit count
    fn probes(hash: u32, k: u8, num_bits: usize) -> impl Iterator<Item = usize> {
        let delta = hash.rotate_right(17);
        (0..k as u32).map(move |i| (hash.wrapping_add(i.wrapping_mul(delta)) as usize) % num_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn hashes(range: std::ops::Range<usize>) -> Vec<u32> {
        range.map(|i| hash_key(format!("key-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_parameters() {
        let filter = BloomFilter::build_from_key_hashes(&hashes(0..1000), 0.01);
        // -ln(0.01)/ln2^2 = 9.59 bits per key, k = ceil(9.59 * 0.693) = 7
        assert_eq!(filter.num_hashes(), 7);
        assert!(filter.num_bits() >= 9586);

        let tiny = BloomFilter::build_from_key_hashes(&hashes(0..1), 0.01);
        assert_eq!(tiny.num_bits(), 64);

        let loose = BloomFilter::build_from_key_hashes(&hashes(0..10), 0.9);
        assert_eq!(loose.num_hashes(), 1);
    }

    #[test]
    fn test_no_false_negatives_and_fp_rate() {
        let inserted = hashes(0..10_000);
        let filter = BloomFilter::build_from_key_hashes(&inserted, 0.01);

        for hash in &inserted {
            assert!(filter.may_contain(*hash));
        }

        let false_positives = hashes(10_000..30_000)
            .into_iter()
            .filter(|h| filter.may_contain(*h))
            .count();
        let fp_rate = false_positives as f64 / 20_000.0;
        assert!(fp_rate < 0.03, "False positive rate too high: {}", fp_rate);
    }

    #[test]
    fn test_encode_decode() {
        let filter = BloomFilter::build_from_key_hashes(&hashes(0..50), 0.01);
        let mut buf = BytesMut::new();
        filter.encode(&mut buf);
        assert_eq!(buf.len(), filter.num_bits() / 8 + 1 + 4);

        let restored = BloomFilter::decode(&buf).unwrap();
        assert_eq!(restored, filter);
        for hash in hashes(0..50) {
            assert!(restored.may_contain(hash));
        }
    }

    #[test]
    fn test_checksum_validation() {
        let filter = BloomFilter::build_from_key_hashes(&hashes(0..50), 0.01);
        let mut buf = BytesMut::new();
        filter.encode(&mut buf);

        let mut corrupted = buf.to_vec();
        corrupted[3] ^= 0xFF;
        assert!(matches!(
            BloomFilter::decode(&corrupted),
            Err(StrataError::ChecksumMismatch { .. })
        ));

        assert!(BloomFilter::decode(&buf[..4]).unwrap_err().is_corruption());
    }
}
