//! Compiled predicates over INT32 join-key columns.
//!
//! Every variant exposes the same three primitives: `run_dense` over a
//! contiguous value run, `run_sparse` over selected lanes of a 64-row
//! window, and `run_and_skip` which hunts for the first matching window.
//! `run` picks the dense path whenever the incoming mask is one
//! contiguous run, which it almost always is.

use std::sync::Arc;

use crate::common::bits::{dense_range, is_dense};
use crate::config::Selectivities;
use crate::join::hash_table::Hashtable;
use crate::simd::{
    self, BetweenKernel, Eq2Kernel, EqKernel, GtKernel, Kernel, LtKernel,
};

const NULL32: u32 = u32::MAX;

const FIBONACCI: u64 = 0x9E3779B97F4A7C15;

struct FnKernel<F: Fn(u32) -> bool>(F);

impl<F: Fn(u32) -> bool> Kernel for FnKernel<F> {
    #[inline(always)]
    fn check(&self, value: u32) -> bool {
        (self.0)(value)
    }
}

/// Hash family for the tiny perfect-hash tables.
#[derive(Debug, Clone, Copy)]
pub enum TinyHash {
    /// `v % size`
    Identity,
    /// Fibonacci multiply, top `bits` bits.
    Fibo(u32),
    /// Fibonacci multiply with a 32-bit xor fold, top `bits` bits.
    FiboXor(u32),
}

impl TinyHash {
    #[inline(always)]
    fn slot(self, value: u32, size: u32) -> usize {
        match self {
            TinyHash::Identity => (value % size) as usize,
            TinyHash::Fibo(bits) => {
                ((value as u64).wrapping_mul(FIBONACCI) >> (64 - bits)) as usize
            }
            TinyHash::FiboXor(bits) => {
                let h = (value as u64).wrapping_mul(FIBONACCI);
                ((h ^ (h >> 32)) as u32 >> (32 - bits)) as usize
            }
        }
    }
}

/// Closed set of ≤16 keys as a collision-free lookup table.
pub struct TinyTable {
    values: Vec<u32>,
    hasher: TinyHash,
}

impl TinyTable {
    /// Sentinels that the wildcard key `!0` cannot accidentally match: all
    /// slots hold `!0`, except the slot `!0` itself hashes to, which gets
    /// a value that hashes elsewhere.
    fn invalid_values(size: u32, hasher: TinyHash) -> Vec<u32> {
        let mut values = vec![NULL32; size as usize];
        let wildcard_slot = hasher.slot(NULL32, size);
        for test in [0u32, 1, NULL32 - 1, 33, 128] {
            if hasher.slot(test, size) != wildcard_slot {
                values[wildcard_slot] = test;
                break;
            }
        }
        debug_assert_ne!(values[wildcard_slot], NULL32);
        values
    }

    /// Try to place all keys without collision.
    fn build(keys: &[u32], size: u32, hasher: TinyHash) -> Option<TinyTable> {
        let invalid = Self::invalid_values(size, hasher);
        let mut values = invalid.clone();
        for &key in keys {
            let slot = hasher.slot(key, size);
            if values[slot] != invalid[slot] {
                return None;
            }
            values[slot] = key;
        }
        Some(TinyTable { values, hasher })
    }

    #[inline(always)]
    pub fn check(&self, value: u32) -> bool {
        self.values[self.hasher.slot(value, self.values.len() as u32)] == value
    }
}

pub enum RestrictionLogic {
    /// Row is non-null; applied by default to any multi-relation class.
    NotNull,
    Eq(u32),
    Eq2(u32, u32),
    /// `target < v`
    Gt(u32),
    /// `v < target`
    Lt(u32),
    /// `lo < v < hi`, both exclusive
    Between(u32, u32),
    Tiny(TinyTable),
    /// Bloom-slot check against a built hash table.
    JoinFilter(Arc<Hashtable>),
    /// Bloom-slot check plus a chain walk.
    JoinFilterPrecise(Arc<Hashtable>),
}

impl RestrictionLogic {
    #[inline]
    pub fn check(&self, value: u32) -> bool {
        match self {
            RestrictionLogic::NotNull => value != NULL32,
            RestrictionLogic::Eq(target) => value == *target,
            RestrictionLogic::Eq2(a, b) => (value == *a) | (value == *b),
            RestrictionLogic::Gt(target) => *target < value,
            RestrictionLogic::Lt(target) => value < *target,
            RestrictionLogic::Between(lo, hi) => (*lo < value) & (value < *hi),
            RestrictionLogic::Tiny(table) => table.check(value),
            RestrictionLogic::JoinFilter(ht) => ht.join_filter(value as u64),
            RestrictionLogic::JoinFilterPrecise(ht) => ht.join_filter_precise(value as u64),
        }
    }

    /// # Safety
    /// `values` must point at `len` readable lanes, `len <= 64`.
    pub unsafe fn run_dense(&self, values: *const u32, len: usize) -> u64 {
        match self {
            RestrictionLogic::NotNull => {
                simd::run_dense(values, len, &FnKernel(|v| v != NULL32))
            }
            RestrictionLogic::Eq(t) => simd::run_dense(values, len, &EqKernel(*t)),
            RestrictionLogic::Eq2(a, b) => simd::run_dense(values, len, &Eq2Kernel(*a, *b)),
            RestrictionLogic::Gt(t) => simd::run_dense(values, len, &GtKernel(*t)),
            RestrictionLogic::Lt(t) => simd::run_dense(values, len, &LtKernel(*t)),
            RestrictionLogic::Between(lo, hi) => {
                simd::run_dense(values, len, &BetweenKernel(*lo, *hi))
            }
            RestrictionLogic::Tiny(table) => {
                simd::run_dense(values, len, &FnKernel(|v| table.check(v)))
            }
            RestrictionLogic::JoinFilter(ht) => {
                simd::run_dense(values, len, &FnKernel(|v| ht.join_filter(v as u64)))
            }
            RestrictionLogic::JoinFilterPrecise(ht) => {
                simd::run_dense(values, len, &FnKernel(|v| ht.join_filter_precise(v as u64)))
            }
        }
    }

    /// # Safety
    /// `values` must be readable at every index set in `mask`.
    pub unsafe fn run_sparse(&self, values: *const u32, mask: u64) -> u64 {
        match self {
            RestrictionLogic::NotNull => {
                simd::run_sparse(values, mask, &FnKernel(|v| v != NULL32))
            }
            RestrictionLogic::Eq(t) => simd::run_sparse(values, mask, &EqKernel(*t)),
            RestrictionLogic::Eq2(a, b) => simd::run_sparse(values, mask, &Eq2Kernel(*a, *b)),
            RestrictionLogic::Gt(t) => simd::run_sparse(values, mask, &GtKernel(*t)),
            RestrictionLogic::Lt(t) => simd::run_sparse(values, mask, &LtKernel(*t)),
            RestrictionLogic::Between(lo, hi) => {
                simd::run_sparse(values, mask, &BetweenKernel(*lo, *hi))
            }
            RestrictionLogic::Tiny(table) => {
                simd::run_sparse(values, mask, &FnKernel(|v| table.check(v)))
            }
            RestrictionLogic::JoinFilter(ht) => {
                simd::run_sparse(values, mask, &FnKernel(|v| ht.join_filter(v as u64)))
            }
            RestrictionLogic::JoinFilterPrecise(ht) => {
                simd::run_sparse(values, mask, &FnKernel(|v| ht.join_filter_precise(v as u64)))
            }
        }
    }

    /// # Safety
    /// `values` must point at `len` readable lanes.
    pub unsafe fn run_and_skip(&self, values: *const u32, len: usize) -> (u64, usize) {
        match self {
            RestrictionLogic::NotNull => {
                simd::run_and_skip(values, len, &FnKernel(|v| v != NULL32))
            }
            RestrictionLogic::Eq(t) => simd::run_and_skip(values, len, &EqKernel(*t)),
            RestrictionLogic::Eq2(a, b) => {
                simd::run_and_skip(values, len, &Eq2Kernel(*a, *b))
            }
            RestrictionLogic::Gt(t) => simd::run_and_skip(values, len, &GtKernel(*t)),
            RestrictionLogic::Lt(t) => simd::run_and_skip(values, len, &LtKernel(*t)),
            RestrictionLogic::Between(lo, hi) => {
                simd::run_and_skip(values, len, &BetweenKernel(*lo, *hi))
            }
            RestrictionLogic::Tiny(table) => {
                simd::run_and_skip(values, len, &FnKernel(|v| table.check(v)))
            }
            RestrictionLogic::JoinFilter(ht) => {
                simd::run_and_skip(values, len, &FnKernel(|v| ht.join_filter(v as u64)))
            }
            RestrictionLogic::JoinFilterPrecise(ht) => {
                simd::run_and_skip(values, len, &FnKernel(|v| ht.join_filter_precise(v as u64)))
            }
        }
    }

    /// Filter masked values; dense masks take the vectorized path.
    ///
    /// # Safety
    /// `values` must be readable at every index set in `mask`.
    pub unsafe fn run(&self, values: *const u32, mask: u64) -> u64 {
        if mask == 0 {
            return 0;
        }
        if is_dense(mask) {
            let (start, end) = dense_range(mask);
            self.run_dense(values.add(start), end - start) << start
        } else {
            self.run_sparse(values, mask)
        }
    }

    /// Safe wrapper for running against an in-memory sample column.
    pub fn run_sample(&self, values: &[u32], mask: u64) -> u64 {
        debug_assert!(mask == 0 || (64 - mask.leading_zeros() as usize) <= values.len());
        unsafe { self.run(values.as_ptr(), mask) }
    }

    pub fn estimate_selectivity(&self, defaults: &Selectivities) -> f64 {
        match self {
            RestrictionLogic::NotNull => defaults.not_null,
            RestrictionLogic::Eq(_) => defaults.eq,
            RestrictionLogic::Eq2(..) => defaults.eq2,
            RestrictionLogic::Gt(t) => f64::from(u32::MAX - t) / f64::from(u32::MAX),
            RestrictionLogic::Lt(t) => f64::from(*t) / f64::from(u32::MAX),
            RestrictionLogic::Between(lo, hi) => f64::from(hi - lo) / f64::from(u32::MAX),
            RestrictionLogic::Tiny(_) => defaults.tiny_table,
            RestrictionLogic::JoinFilter(_) | RestrictionLogic::JoinFilterPrecise(_) => {
                defaults.join_filter
            }
        }
    }

    pub fn estimate_cost(&self) -> f64 {
        match self {
            RestrictionLogic::JoinFilter(ht) | RestrictionLogic::JoinFilterPrecise(ht) => {
                if ht.ht_size() * 2 < 32 * 1024 {
                    1.5
                } else {
                    3.0
                }
            }
            _ => 1.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RestrictionLogic::NotNull => "not_null",
            RestrictionLogic::Eq(_) => "eq",
            RestrictionLogic::Eq2(..) => "eq2",
            RestrictionLogic::Gt(_) => "gt",
            RestrictionLogic::Lt(_) => "lt",
            RestrictionLogic::Between(..) => "between",
            RestrictionLogic::Tiny(_) => "tiny_table",
            RestrictionLogic::JoinFilter(_) => "join_filter",
            RestrictionLogic::JoinFilterPrecise(_) => "join_filter_precise",
        }
    }

    /// Lower a join filter on a freshly built table to the cheapest
    /// restriction that recognizes exactly its key set. Small tables
    /// collapse to point/range predicates or a tiny perfect-hash table;
    /// everything else keeps the bloom filter, with a chain walk when
    /// `precise` is requested.
    pub fn from_hash_table(ht: &Arc<Hashtable>, precise: bool) -> RestrictionLogic {
        if ht.num_tuples() <= 32 {
            let mut keys: Vec<u32> = Vec::with_capacity(32);
            ht.iterate_all(|key| keys.push(key as u32));
            keys.sort_unstable();
            keys.dedup();

            match keys.len() {
                1 => return RestrictionLogic::Eq(keys[0]),
                2 => return RestrictionLogic::Eq2(keys[0], keys[1]),
                _ => {}
            }

            let front = keys[0];
            let back = *keys.last().unwrap();
            if (back - front) as usize == keys.len() - 1 {
                if front == 0 {
                    return RestrictionLogic::Lt(back + 1);
                }
                if back == u32::MAX {
                    return RestrictionLogic::Gt(front - 1);
                }
                return RestrictionLogic::Between(front - 1, back + 1);
            }

            if keys.len() <= 16 {
                let attempts = [
                    (8, TinyHash::Identity),
                    (16, TinyHash::Identity),
                    (32, TinyHash::Identity),
                    (16, TinyHash::Fibo(4)),
                    (32, TinyHash::Fibo(5)),
                    (16, TinyHash::FiboXor(4)),
                    (32, TinyHash::FiboXor(5)),
                ];
                for (size, hasher) in attempts {
                    if let Some(table) = TinyTable::build(&keys, size, hasher) {
                        return RestrictionLogic::Tiny(table);
                    }
                }
            }
        }
        if precise {
            RestrictionLogic::JoinFilterPrecise(ht.clone())
        } else {
            RestrictionLogic::JoinFilter(ht.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(logic: &RestrictionLogic, values: &[u32]) -> u64 {
        unsafe { logic.run_dense(values.as_ptr(), values.len()) }
    }

    #[test]
    fn test_eq_and_between() {
        let values = [5u32, 6, 7, 8, 9];
        assert_eq!(dense(&RestrictionLogic::Eq(7), &values), 0b00100);
        assert_eq!(dense(&RestrictionLogic::Between(5, 9), &values), 0b01110);
        assert_eq!(dense(&RestrictionLogic::Gt(7), &values), 0b11000);
        assert_eq!(dense(&RestrictionLogic::Lt(7), &values), 0b00011);
        assert_eq!(dense(&RestrictionLogic::Eq2(5, 9), &values), 0b10001);
    }

    #[test]
    fn test_not_null() {
        let values = [1u32, NULL32, 3];
        assert_eq!(dense(&RestrictionLogic::NotNull, &values), 0b101);
    }

    #[test]
    fn test_run_dense_shortcut_matches_sparse() {
        let values: Vec<u32> = (0..64).map(|i| i * 3 % 17).collect();
        let logic = RestrictionLogic::Lt(9);
        let mask = 0b1111_1100_0000;
        let via_run = unsafe { logic.run(values.as_ptr(), mask) };
        let via_sparse = unsafe { logic.run_sparse(values.as_ptr(), mask) };
        assert_eq!(via_run, via_sparse);
    }

    #[test]
    fn test_tiny_table_membership() {
        let keys = [3u32, 19, 70, 911];
        let table = (8..=32)
            .step_by(8)
            .find_map(|size| TinyTable::build(&keys, size as u32, TinyHash::Identity))
            .or_else(|| TinyTable::build(&keys, 16, TinyHash::Fibo(4)))
            .expect("some hasher fits");
        for &k in &keys {
            assert!(table.check(k));
        }
        for miss in [0u32, 4, 20, 910, u32::MAX] {
            assert!(!table.check(miss), "false positive for {miss}");
        }
    }

    #[test]
    fn test_tiny_table_rejects_wildcard() {
        // The all-ones key must never match an empty table slot.
        let keys = [1u32, 2];
        for (size, hasher) in [
            (8u32, TinyHash::Identity),
            (16, TinyHash::Fibo(4)),
            (16, TinyHash::FiboXor(4)),
        ] {
            if let Some(table) = TinyTable::build(&keys, size, hasher) {
                assert!(!table.check(NULL32));
            }
        }
    }

    #[test]
    fn test_selectivity_ordering() {
        let defaults = Selectivities::default();
        let eq = RestrictionLogic::Eq(1).estimate_selectivity(&defaults);
        let not_null = RestrictionLogic::NotNull.estimate_selectivity(&defaults);
        assert!(eq < not_null);
        let gt = RestrictionLogic::Gt(u32::MAX - 1).estimate_selectivity(&defaults);
        assert!(gt < 1e-6);
    }
}
