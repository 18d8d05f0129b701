use crate::common::{
    self, DefaultHashBuilder, MAX_LOAD_FACTOR, MIN_BUCKETS, MIN_LOAD_FACTOR,
};
use crate::ConcurrentSet;

use parking_lot::Mutex;

use std::{
    fmt,
    hash::{BuildHasher, Hash},
    mem,
};

/// A thread-safe hash set guarded by a single global mutex.
///
/// Every operation, `len` included, holds the mutex for its full
/// duration, so the set behaves exactly like [`crate::unsync::HashSet`]
/// under any interleaving. A resize triggered by an insert or remove runs
/// while the same guard is still held; the mutex is never re-entered.
///
/// Contention on the one mutex makes this the slowest concurrent variant
/// under parallel load, and the baseline the finer-grained variants are
/// compared against.
///
/// # Examples
///
/// ```rust
/// use burr::sync::HashSet;
/// use std::sync::Arc;
/// use std::thread;
///
/// let set = Arc::new(HashSet::new(16));
/// let other = Arc::clone(&set);
///
/// let handle = thread::spawn(move || {
///     other.insert(1);
/// });
/// set.insert(2);
/// handle.join().unwrap();
///
/// assert_eq!(set.len(), 2);
/// ```
pub struct HashSet<T, S = DefaultHashBuilder> {
    inner: Mutex<Inner<T>>,
    build_hasher: S,
}

struct Inner<T> {
    buckets: Box<[Vec<T>]>,
    len: usize,
}

impl<T> HashSet<T, DefaultHashBuilder> {
    /// Creates an empty set with at least `initial_capacity` buckets.
    ///
    /// Capacities below the minimum of 4 (including 0) are rounded up.
    pub fn new(initial_capacity: usize) -> Self {
        Self::with_capacity_and_hasher(initial_capacity, DefaultHashBuilder::default())
    }
}

impl<T, S> HashSet<T, S> {
    /// Creates an empty set with at least `initial_capacity` buckets,
    /// using `build_hasher` to hash the elements.
    pub fn with_capacity_and_hasher(initial_capacity: usize, build_hasher: S) -> Self {
        let capacity = common::normalize_capacity(initial_capacity);
        Self {
            inner: Mutex::new(Inner {
                buckets: common::new_buckets(capacity),
                len: 0,
            }),
            build_hasher,
        }
    }

    /// Returns the number of elements in the set.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Returns `true` if the set held no elements at some moment during
    /// the call.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the table.
    pub fn capacity(&self) -> usize {
        self.inner.lock().buckets.len()
    }
}

impl<T, S> HashSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher,
{
    /// Inserts `value` into the set.
    ///
    /// Returns `true` if the value was newly inserted, or `false` if an
    /// equal value was already present (the set is unchanged).
    pub fn insert(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        let idx = self.bucket_of(&value, inner.buckets.len());
        let bucket = &mut inner.buckets[idx];
        if bucket.contains(&value) {
            return false;
        }
        bucket.push(value);
        inner.len += 1;

        if inner.load_factor() > MAX_LOAD_FACTOR {
            let new_capacity = inner.buckets.len() * 2;
            inner.resize(&self.build_hasher, new_capacity);
        }
        true
    }

    /// Removes `value` from the set.
    ///
    /// Returns `true` if the value was present and has been removed, or
    /// `false` if it was absent (the set is unchanged).
    pub fn remove(&self, value: &T) -> bool {
        let mut inner = self.inner.lock();
        let idx = self.bucket_of(value, inner.buckets.len());
        let bucket = &mut inner.buckets[idx];
        let pos = match bucket.iter().position(|v| v == value) {
            Some(pos) => pos,
            None => return false,
        };
        bucket.swap_remove(pos);
        inner.len -= 1;

        if inner.load_factor() < MIN_LOAD_FACTOR && inner.buckets.len() > MIN_BUCKETS {
            let new_capacity = (inner.buckets.len() / 2).max(MIN_BUCKETS);
            inner.resize(&self.build_hasher, new_capacity);
        }
        true
    }

    /// Returns `true` if the set contained `value` at some moment during
    /// the call.
    pub fn contains(&self, value: &T) -> bool {
        let inner = self.inner.lock();
        let idx = self.bucket_of(value, inner.buckets.len());
        inner.buckets[idx].contains(value)
    }

    fn bucket_of(&self, value: &T, capacity: usize) -> usize {
        common::bucket_index(common::hash(&self.build_hasher, value), capacity)
    }
}

impl<T> Inner<T>
where
    T: Hash + Eq,
{
    fn load_factor(&self) -> f64 {
        self.len as f64 / self.buckets.len() as f64
    }

    // Runs under the already-held global mutex.
    fn resize(&mut self, build_hasher: &impl BuildHasher, new_capacity: usize) {
        let old_capacity = self.buckets.len();
        let old = mem::replace(&mut self.buckets, common::new_buckets(new_capacity));
        for bucket in old.into_vec() {
            for value in bucket {
                let idx =
                    common::bucket_index(common::hash(build_hasher, &value), new_capacity);
                self.buckets[idx].push(value);
            }
        }

        log::debug!(
            "coarse set resized from {} to {} buckets (len = {})",
            old_capacity,
            new_capacity,
            self.len
        );
    }
}

impl<T, S> ConcurrentSet<T> for HashSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher,
{
    fn insert(&self, value: T) -> bool {
        self.insert(value)
    }

    fn remove(&self, value: &T) -> bool {
        self.remove(value)
    }

    fn contains(&self, value: &T) -> bool {
        self.contains(value)
    }

    fn len(&self) -> usize {
        self.len()
    }
}

impl<T, S> fmt::Debug for HashSet<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("HashSet")
            .field("len", &inner.len)
            .field("capacity", &inner.buckets.len())
            .finish_non_exhaustive()
    }
}

impl<T, S> Default for HashSet<T, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_capacity_and_hasher(MIN_BUCKETS, S::default())
    }
}
