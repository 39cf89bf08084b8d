//! Penetration guard
//!
//! A bloom filter answers "was this key ever written?". `false` is definite, so reads of
//! keys that were never written skip both tiers and the loader. `true` only means "don't skip".
//!
//! Bit positions come from FNV-1a with double hashing rather than `DefaultHasher`, so a filter
//! stored in the shared tier agrees across processes and builds.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::{CacheError, MembershipConfig};

/// Probabilistic set of keys ever written
#[async_trait]
pub trait MembershipFilter: Send + Sync + 'static {
    async fn add(&self, key: &str) -> Result<(), CacheError>;

    async fn contains(&self, key: &str) -> Result<bool, CacheError>;
}

/// Filter geometry derived from capacity and false-positive rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterShape {
    /// Bits in the filter
    pub bits: u64,
    /// Probes per key
    pub hashes: u32,
}

impl FilterShape {
    /// m = -n * ln(p) / ln(2)^2, k = (m / n) * ln(2)
    pub fn optimal(expected_items: u64, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let m = (-n * false_positive_rate.ln() / 2.0_f64.ln().powi(2)).ceil();
        let bits = (m as u64).max(64);
        let hashes = ((bits as f64 / n) * 2.0_f64.ln()).round().max(1.0) as u32;
        Self { bits, hashes }
    }

    pub fn from_config(config: &MembershipConfig) -> Self {
        Self::optimal(config.expected_items, config.false_positive_rate)
    }

    /// Bit indexes probed for `key`
    pub fn positions(&self, key: &str) -> impl Iterator<Item = u64> + use<> {
        let h1 = fnv1a(key.as_bytes(), FNV_OFFSET);
        // Odd step so every probe differs
        let h2 = fnv1a(key.as_bytes(), FNV_OFFSET_ALT) | 1;
        let bits = self.bits;
        (0..u64::from(self.hashes)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bits)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_OFFSET_ALT: u64 = 0x8422_2325_cbf2_9ce4;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8], offset: u64) -> u64 {
    bytes.iter().fold(offset, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// In-process bloom filter on an atomic bitset
pub struct BloomFilter {
    shape: FilterShape,
    words: Vec<AtomicU64>,
}

impl BloomFilter {
    pub fn new(expected_items: u64, false_positive_rate: f64) -> Self {
        Self::with_shape(FilterShape::optimal(expected_items, false_positive_rate))
    }

    pub fn from_config(config: &MembershipConfig) -> Self {
        Self::with_shape(FilterShape::from_config(config))
    }

    pub fn with_shape(shape: FilterShape) -> Self {
        let words = shape.bits.div_ceil(64) as usize;
        Self {
            shape,
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn insert(&self, key: &str) {
        for pos in self.shape.positions(key) {
            let (word, mask) = split(pos);
            self.words[word].fetch_or(mask, Ordering::Release);
        }
    }

    pub fn check(&self, key: &str) -> bool {
        self.shape.positions(key).all(|pos| {
            let (word, mask) = split(pos);
            self.words[word].load(Ordering::Acquire) & mask != 0
        })
    }
}

fn split(pos: u64) -> (usize, u64) {
    ((pos / 64) as usize, 1u64 << (pos % 64))
}

#[async_trait]
impl MembershipFilter for BloomFilter {
    async fn add(&self, key: &str) -> Result<(), CacheError> {
        self.insert(key);
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.check(key))
    }
}

/// In-process filter in front of a shared one.
///
/// Positive answers from the shared filter are copied into the local bits, so a known key
/// costs no round trip after the first check.
pub struct TieredFilter {
    local: BloomFilter,
    shared: Arc<dyn MembershipFilter>,
}

impl TieredFilter {
    pub fn new(shape: FilterShape, shared: Arc<dyn MembershipFilter>) -> Self {
        Self {
            local: BloomFilter::with_shape(shape),
            shared,
        }
    }
}

#[async_trait]
impl MembershipFilter for TieredFilter {
    async fn add(&self, key: &str) -> Result<(), CacheError> {
        self.local.insert(key);
        self.shared.add(key).await
    }

    async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        if self.local.check(key) {
            return Ok(true);
        }
        let seen = self.shared.contains(key).await?;
        if seen {
            self.local.insert(key);
        }
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimal_shape() {
        // 1000 items at 1%: ~9585 bits, 7 probes
        let shape = FilterShape::optimal(1000, 0.01);
        assert!(shape.bits > 9000 && shape.bits < 10000);
        assert_eq!(shape.hashes, 7);
    }

    #[test]
    fn test_no_false_negatives() {
        let filter = BloomFilter::new(10_000, 0.03);
        for i in 0..10_000 {
            filter.insert(&format!("app:cache:users:{}", i));
        }
        for i in 0..10_000 {
            assert!(filter.check(&format!("app:cache:users:{}", i)));
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let filter = BloomFilter::new(10_000, 0.03);
        for i in 0..10_000 {
            filter.insert(&format!("present:{}", i));
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.check(&format!("absent:{}", i)))
            .count();
        // Expected ~300; allow generous slack
        assert!(false_positives < 900, "false positives: {}", false_positives);
    }

    #[test]
    fn test_positions_are_stable() {
        let shape = FilterShape { bits: 1 << 20, hashes: 3 };
        let a: Vec<u64> = shape.positions("app:cache:users:42").collect();
        let b: Vec<u64> = shape.positions("app:cache:users:42").collect();
        assert_eq!(a, b);
        assert_eq!(fnv1a(b"", FNV_OFFSET), FNV_OFFSET);
        // Reference FNV-1a 64 value for "a"
        assert_eq!(fnv1a(b"a", FNV_OFFSET), 0xaf63_dc4c_8601_ec8c);
    }

    #[tokio::test]
    async fn test_filter_trait() {
        let filter = BloomFilter::new(100, 0.01);
        assert!(!filter.contains("k").await.unwrap());
        filter.add("k").await.unwrap();
        assert!(filter.contains("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_tiered_filter_sees_keys_added_elsewhere() {
        let shape = FilterShape::optimal(1000, 0.01);
        let shared: Arc<dyn MembershipFilter> = Arc::new(BloomFilter::with_shape(shape));
        let here = TieredFilter::new(shape, Arc::clone(&shared));
        let there = TieredFilter::new(shape, Arc::clone(&shared));

        there.add("k").await.unwrap();
        assert!(!here.local.check("k"));
        assert!(here.contains("k").await.unwrap());
        // Cached locally after the first positive answer
        assert!(here.local.check("k"));
        assert!(!here.contains("other").await.unwrap());
    }
}
