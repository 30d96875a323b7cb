//! Routing hash for the sink router
//!
//! Keys are hashed with Kafka's murmur2 so a given primary key maps to the
//! same worker for the lifetime of the process (and across processes with
//! the same worker count).

const SEED: u32 = 0x9747b28c;
const M: u32 = 0x5bd1e995;
const R: u32 = 24;

/// 32-bit murmur2 with Kafka's seed and finalizer
///
/// ```
/// use ferry_replicator::hash::murmur2;
/// assert_eq!(murmur2(b"hello"), 2132663229);
/// ```
pub fn murmur2(data: &[u8]) -> u32 {
    let mut h: u32 = SEED ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M) ^ k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if let Some(&first) = tail.first() {
        h ^= u32::from(first);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^ (h >> 15)
}

/// Index in `0..buckets` for `key` (sign bit masked, then modulo).
///
/// `buckets` must be non-zero.
#[inline]
pub fn bucket_for(key: &[u8], buckets: usize) -> usize {
    (murmur2(key) & 0x7fff_ffff) as usize % buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(murmur2(b""), 275646681);
        assert_eq!(murmur2(b"hello"), 2132663229);
        assert_eq!(murmur2(b"kafka"), 3496464228);
        // Kafka reports -973932308 for "21"
        assert_eq!(murmur2(b"21") as i32, -973932308);
    }

    #[test]
    fn test_bucket_is_stable_and_in_range() {
        for workers in 1..=16 {
            let a = bucket_for(b"orders:42", workers);
            assert_eq!(a, bucket_for(b"orders:42", workers));
            assert!(a < workers);
        }
    }

    #[test]
    fn test_buckets_all_used() {
        let mut counts = [0u32; 8];
        for i in 0..1000u32 {
            counts[bucket_for(&i.to_be_bytes(), 8)] += 1;
        }
        assert!(counts.iter().all(|c| *c > 0));
    }
}
