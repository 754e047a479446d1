//! HyperLogLog Cardinality Estimator
//!
//! A 14-bit-precision HyperLogLog: 16384 one-byte registers, harmonic-mean
//! estimation with the standard small-range (linear counting) and
//! large-range corrections, and register-wise-max merge.
//!
//! Elements are hashed with SHA-1 and the first 8 digest bytes are used as
//! a 64-bit hash. The hash must be stable across processes and restarts
//! because register blocks are persisted and merged by independent
//! front-ends sharing one database.
//!
//! The serialized form is exactly the 16384 raw register bytes.

use sha1::{Digest, Sha1};
use thiserror::Error;

/// Register index bits.
const PRECISION: u32 = 14;

/// Number of registers (2^14).
pub const NUM_REGISTERS: usize = 1 << PRECISION;

/// Bits left for the rank pattern after the index is consumed.
const RANK_BITS: u32 = 64 - PRECISION;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HllError {
    #[error("invalid register block length: {0} (expected {NUM_REGISTERS})")]
    InvalidLength(usize),
}

/// A dense HyperLogLog register block.
#[derive(Clone)]
pub struct HyperLogLog {
    registers: Box<[u8; NUM_REGISTERS]>,
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HyperLogLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperLogLog")
            .field("registers", &NUM_REGISTERS)
            .field("estimate", &self.count())
            .finish()
    }
}

impl HyperLogLog {
    /// Creates an empty estimator (all registers zero).
    pub fn new() -> Self {
        Self {
            registers: Box::new([0u8; NUM_REGISTERS]),
        }
    }

    /// Adds an element. Returns `true` if any register changed, which is
    /// what PFADD reports as "cardinality estimate updated".
    pub fn add(&mut self, element: &[u8]) -> bool {
        let hash = element_hash(element);
        let index = (hash & ((NUM_REGISTERS as u64) - 1)) as usize;
        let w = hash >> PRECISION;

        // Rank = position of the leftmost 1-bit in the remaining pattern,
        // counting from 1; an all-zero pattern ranks RANK_BITS + 1.
        let rank = if w == 0 {
            (RANK_BITS + 1) as u8
        } else {
            (w.leading_zeros() - PRECISION + 1) as u8
        };

        if rank > self.registers[index] {
            self.registers[index] = rank;
            true
        } else {
            false
        }
    }

    /// Estimates the cardinality.
    pub fn count(&self) -> i64 {
        let m = NUM_REGISTERS as f64;

        let mut sum = 0.0f64;
        let mut zeros = 0u32;
        for &r in self.registers.iter() {
            sum += 1.0 / ((1u64 << r) as f64);
            if r == 0 {
                zeros += 1;
            }
        }

        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let mut estimate = alpha * m * m / sum;

        if estimate <= 2.5 * m && zeros > 0 {
            // Small-range correction: linear counting
            estimate = m * (m / zeros as f64).ln();
        } else {
            let two32 = 4294967296.0f64;
            if estimate > two32 / 30.0 {
                // Large-range correction
                estimate = -two32 * (1.0 - estimate / two32).ln();
            }
        }

        estimate.round() as i64
    }

    /// Merges another estimator into this one (register-wise max).
    pub fn merge(&mut self, other: &HyperLogLog) {
        for (dst, src) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *src > *dst {
                *dst = *src;
            }
        }
    }

    /// Serializes to the raw 16384 register bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.registers.to_vec()
    }

    /// Deserializes a raw register block.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HllError> {
        if bytes.len() != NUM_REGISTERS {
            return Err(HllError::InvalidLength(bytes.len()));
        }
        let mut registers = Box::new([0u8; NUM_REGISTERS]);
        registers.copy_from_slice(bytes);
        Ok(Self { registers })
    }
}

/// Stable 64-bit element hash: first 8 bytes of SHA-1, big-endian.
fn element_hash(element: &[u8]) -> u64 {
    let digest = Sha1::digest(element);
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_counts_zero() {
        assert_eq!(HyperLogLog::new().count(), 0);
    }

    #[test]
    fn test_add_reports_change() {
        let mut hll = HyperLogLog::new();
        assert!(hll.add(b"a"));
        assert!(!hll.add(b"a"));
    }

    #[test]
    fn test_small_cardinality() {
        let mut hll = HyperLogLog::new();
        for e in [b"a", b"b", b"c", b"d", b"e"] {
            hll.add(e);
        }
        let count = hll.count();
        assert!((4..=6).contains(&count), "count = {}", count);
    }

    #[test]
    fn test_thousand_uniques_within_five_percent() {
        let mut hll = HyperLogLog::new();
        for i in 0..1000 {
            hll.add(format!("unique_{}", i).as_bytes());
        }
        let count = hll.count();
        assert!((950..=1050).contains(&count), "count = {}", count);
    }

    #[test]
    fn test_merge_is_register_wise_max() {
        let mut a = HyperLogLog::new();
        let mut b = HyperLogLog::new();
        for i in 0..500 {
            a.add(format!("left_{}", i).as_bytes());
            b.add(format!("right_{}", i).as_bytes());
        }

        let mut expected = a.clone();
        for (dst, src) in expected
            .registers
            .iter_mut()
            .zip(b.registers.iter())
        {
            *dst = (*dst).max(*src);
        }

        let mut merged = a.clone();
        merged.merge(&b);
        assert_eq!(&merged.registers[..], &expected.registers[..]);

        // Disjoint halves estimate close to the union size
        let count = merged.count();
        assert!((900..=1100).contains(&count), "count = {}", count);
    }

    #[test]
    fn test_merge_idempotent() {
        let mut a = HyperLogLog::new();
        for i in 0..100 {
            a.add(format!("e{}", i).as_bytes());
        }
        let before = a.count();
        let snapshot = a.clone();
        a.merge(&snapshot);
        assert_eq!(a.count(), before);
    }

    #[test]
    fn test_round_trip_bytes() {
        let mut hll = HyperLogLog::new();
        for i in 0..250 {
            hll.add(format!("x{}", i).as_bytes());
        }
        let bytes = hll.to_bytes();
        assert_eq!(bytes.len(), NUM_REGISTERS);
        let restored = HyperLogLog::from_bytes(&bytes).unwrap();
        assert_eq!(restored.count(), hll.count());
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        assert!(matches!(
            HyperLogLog::from_bytes(&[0u8; 100]),
            Err(HllError::InvalidLength(100))
        ));
    }

    #[test]
    fn test_hash_is_stable() {
        // The registers are persisted; the element hash must never drift.
        assert_eq!(element_hash(b"postkeys"), element_hash(b"postkeys"));
        let mut one = HyperLogLog::new();
        let mut two = HyperLogLog::new();
        one.add(b"same");
        two.add(b"same");
        assert_eq!(one.to_bytes(), two.to_bytes());
    }
}
