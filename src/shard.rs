//! Shard hashing and assignment — §4.6.

use std::ops::Range;

use sha2::{Digest, Sha256};

/// `SHA-256(value)[first 8 bytes, big-endian] & ((1<<n_bits)-1)`. Stable
/// across processes and languages — this is the one piece of the system
/// every re-implementation must agree on byte-for-byte.
pub fn consistent_hash(value: &[u8], n_bits: u32) -> u32 {
    debug_assert!(n_bits <= 32, "n_bits must fit a u32 shard id");
    let digest = Sha256::digest(value);
    let first8: [u8; 8] = digest[0..8].try_into().unwrap();
    let folded = u64::from_be_bytes(first8);
    let mask = if n_bits == 64 { u64::MAX } else { (1u64 << n_bits) - 1 };
    (folded & mask) as u32
}

/// Partition `[0, 2^n_bits)` into contiguous blocks across `pod_count`
/// pods, round-robining the remainder to the lowest-index pods, and return
/// the block owned by `pod_ordinal`. Disjoint union of every pod's range
/// equals `[0, 2^n_bits)`.
pub fn shard_assignment(pod_ordinal: u32, pod_count: u32, n_bits: u32) -> Range<u32> {
    assert!(pod_count > 0, "pod_count must be positive");
    assert!(pod_ordinal < pod_count, "pod_ordinal must be < pod_count");

    let total = 1u64 << n_bits;
    let base = total / pod_count as u64;
    let remainder = total % pod_count as u64;

    let mut start = 0u64;
    for pod in 0..pod_ordinal {
        start += base + u64::from((pod as u64) < remainder);
    }
    let len = base + u64::from((pod_ordinal as u64) < remainder);
    (start as u32)..((start + len) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Pinned test vector: `consistent_hash(b"hello", 16)` must match any
    /// correct re-implementation byte-for-byte.
    #[test]
    fn pinned_vector() {
        // SHA-256("hello") = 2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
        // first 8 bytes big-endian = 0x2cf24dba5fb0a30e
        let full = consistent_hash(b"hello", 32);
        assert_eq!(full, 0x5fb0a30e);
        let masked = consistent_hash(b"hello", 16);
        assert_eq!(masked, 0xa30e);
    }

    #[test]
    fn deterministic_across_calls() {
        assert_eq!(consistent_hash(b"abc", 10), consistent_hash(b"abc", 10));
    }

    #[test]
    fn distribution_has_no_wildly_overloaded_bucket() {
        let n_bits = 8;
        let buckets = 1usize << n_bits;
        let samples = 200_000;
        let mut counts = vec![0u32; buckets];
        for i in 0..samples {
            let key = i.to_le_bytes();
            let b = consistent_hash(&key, n_bits) as usize;
            counts[b] += 1;
        }
        let mean = samples as f64 / buckets as f64;
        let max = *counts.iter().max().unwrap() as f64;
        assert!(max < 1.5 * mean, "max={max} mean={mean}");
    }

    #[test]
    fn assignment_is_a_disjoint_total_partition() {
        let n_bits = 3;
        let pod_count = 5;
        let mut seen = HashSet::new();
        let mut total_len = 0u32;
        for pod in 0..pod_count {
            let range = shard_assignment(pod, pod_count, n_bits);
            total_len += range.len() as u32;
            for shard in range {
                assert!(seen.insert(shard), "shard {shard} assigned to more than one pod");
            }
        }
        assert_eq!(total_len, 1 << n_bits);
        assert_eq!(seen, (0u32..(1 << n_bits)).collect::<HashSet<_>>());
    }

    #[test]
    fn five_pods_eight_shards_matches_expected_sizes() {
        let sizes: Vec<usize> = (0..5).map(|pod| shard_assignment(pod, 5, 3).len()).collect();
        let mut sorted = sizes.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 1, 2, 2, 2]);
    }
}
