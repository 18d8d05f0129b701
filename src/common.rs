//! Plumbing shared by every set variant: the tuning constants, capacity
//! normalization, and the hashing helper.

use std::cell::UnsafeCell;
use std::hash::{BuildHasher, Hash, Hasher};

/// Default hasher for the sets in this crate.
///
/// This is the hasher used by `std::collections::HashMap`, which is
/// currently SipHash 1-3. It provides resistance against HashDoS attacks
/// at some cost for very small keys; every set type accepts a replacement
/// through its `*_and_hasher` constructor.
pub type DefaultHashBuilder = std::collections::hash_map::RandomState;

/// A table never has fewer buckets than this, and requested capacities
/// below it are rounded up.
pub(crate) const MIN_BUCKETS: usize = 4;

/// A successful insert grows the table to twice its capacity once
/// `len / capacity` exceeds this.
pub(crate) const MAX_LOAD_FACTOR: f64 = 4.0;

/// A successful remove shrinks the table to half its capacity once
/// `len / capacity` drops below this (clamped at `MIN_BUCKETS`).
pub(crate) const MIN_LOAD_FACTOR: f64 = 1.0;

#[inline]
pub(crate) fn normalize_capacity(capacity: usize) -> usize {
    capacity.max(MIN_BUCKETS)
}

pub(crate) fn hash<T, S>(build_hasher: &S, value: &T) -> u64
where
    T: ?Sized + Hash,
    S: BuildHasher,
{
    let mut hasher = build_hasher.build_hasher();
    value.hash(&mut hasher);

    hasher.finish()
}

// Capacities are not required to be powers of two, so the index is taken
// by modulo rather than by masking.
#[inline]
pub(crate) fn bucket_index(hash: u64, capacity: usize) -> usize {
    (hash % capacity as u64) as usize
}

pub(crate) fn new_buckets<T>(capacity: usize) -> Box<[Vec<T>]> {
    let mut buckets = Vec::with_capacity(capacity);
    buckets.resize_with(capacity, Vec::new);
    buckets.into_boxed_slice()
}

pub(crate) fn new_bucket_cells<T>(capacity: usize) -> Box<[UnsafeCell<Vec<T>>]> {
    let mut buckets = Vec::with_capacity(capacity);
    buckets.resize_with(capacity, || UnsafeCell::new(Vec::new()));
    buckets.into_boxed_slice()
}
