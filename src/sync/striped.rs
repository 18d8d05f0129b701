use crate::common::{
    self, DefaultHashBuilder, MAX_LOAD_FACTOR, MIN_BUCKETS, MIN_LOAD_FACTOR,
};
use crate::ConcurrentSet;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use std::{
    cell::UnsafeCell,
    fmt,
    hash::{BuildHasher, Hash},
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

/// The stripe count used when none is given. A zero stripe count is
/// coerced to this as well.
const DEFAULT_NUM_STRIPES: usize = 64;

/// A thread-safe hash set with striped locking.
///
/// A fixed array of stripe mutexes is chosen at construction and never
/// replaced; bucket `b` is guarded by stripe `b % num_stripes`. Growing
/// the table redistributes elements over more buckets but leaves the
/// stripe array untouched, so the lock memory stays bounded no matter how
/// large the set becomes. That is the defining trade of this variant:
/// after enough growth, many buckets share each stripe.
///
/// An operation observes the capacity, locks the stripe for its bucket,
/// and then re-checks the capacity; if a resize won the race in between,
/// it starts over against the new geometry. A resize serializes behind a
/// dedicated mutex and then takes every stripe in index order, so it
/// cannot deadlock with operations that each hold at most one stripe.
///
/// # Examples
///
/// ```rust
/// use burr::sync::StripedHashSet;
///
/// let set = StripedHashSet::with_num_stripes(8, 16);
///
/// assert!(set.insert(1));
/// assert!(set.contains(&1));
/// assert_eq!(set.num_stripes(), 8);
/// ```
pub struct StripedHashSet<T, S = DefaultHashBuilder> {
    // Written only while every stripe is held; each element is mutated
    // only while the stripe owning its bucket is held.
    buckets: UnsafeCell<Box<[UnsafeCell<Vec<T>>]>>,
    // Mirrors the bucket array length so operations can observe the
    // capacity without dereferencing the array.
    capacity: AtomicUsize,
    len: CachePadded<AtomicUsize>,
    stripes: Box<[Mutex<()>]>,
    resize_lock: Mutex<()>,
    build_hasher: S,
}

// The buckets are mutex-protected, so sharing the set only requires the
// elements to be movable between threads, as for `Mutex<T>` itself.
unsafe impl<T: Send, S: Send> Send for StripedHashSet<T, S> {}
unsafe impl<T: Send, S: Sync> Sync for StripedHashSet<T, S> {}

impl<T> StripedHashSet<T, DefaultHashBuilder> {
    /// Creates an empty set with at least `initial_capacity` buckets and
    /// the default stripe count of 64.
    ///
    /// Capacities below the minimum of 4 (including 0) are rounded up.
    pub fn new(initial_capacity: usize) -> Self {
        Self::with_num_stripes(DEFAULT_NUM_STRIPES, initial_capacity)
    }

    /// Creates an empty set with the given stripe count and at least
    /// `initial_capacity` buckets.
    ///
    /// A `num_stripes` of 0 is treated as the default of 64.
    pub fn with_num_stripes(num_stripes: usize, initial_capacity: usize) -> Self {
        Self::with_num_stripes_capacity_and_hasher(
            num_stripes,
            initial_capacity,
            DefaultHashBuilder::default(),
        )
    }
}

impl<T, S> StripedHashSet<T, S> {
    /// Creates an empty set with at least `initial_capacity` buckets and
    /// the default stripe count, using `build_hasher` to hash the
    /// elements.
    pub fn with_capacity_and_hasher(initial_capacity: usize, build_hasher: S) -> Self {
        Self::with_num_stripes_capacity_and_hasher(
            DEFAULT_NUM_STRIPES,
            initial_capacity,
            build_hasher,
        )
    }

    /// Creates an empty set with the given stripe count and at least
    /// `initial_capacity` buckets, using `build_hasher` to hash the
    /// elements.
    ///
    /// A `num_stripes` of 0 is treated as the default of 64.
    pub fn with_num_stripes_capacity_and_hasher(
        num_stripes: usize,
        initial_capacity: usize,
        build_hasher: S,
    ) -> Self {
        let num_stripes = if num_stripes == 0 {
            DEFAULT_NUM_STRIPES
        } else {
            num_stripes
        };
        let capacity = common::normalize_capacity(initial_capacity);

        let mut stripes = Vec::with_capacity(num_stripes);
        stripes.resize_with(num_stripes, || Mutex::new(()));

        Self {
            buckets: UnsafeCell::new(common::new_bucket_cells(capacity)),
            capacity: AtomicUsize::new(capacity),
            len: CachePadded::new(AtomicUsize::new(0)),
            stripes: stripes.into_boxed_slice(),
            resize_lock: Mutex::new(()),
            build_hasher,
        }
    }

    /// Returns the number of elements in the set at some moment during
    /// the call.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if the set held no elements at some moment during
    /// the call.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the table at some moment during
    /// the call.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Returns the stripe count chosen at construction.
    pub fn num_stripes(&self) -> usize {
        self.stripes.len()
    }

    fn lock_stripe(&self, bucket_idx: usize) -> MutexGuard<'_, ()> {
        self.stripes[bucket_idx % self.stripes.len()].lock()
    }

    /// # Safety
    ///
    /// The stripe owning bucket `idx` must be held, and `idx` must be in
    /// bounds for the current array.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bucket_mut(&self, idx: usize) -> &mut Vec<T> {
        let buckets = &*self.buckets.get();
        &mut *buckets[idx].get()
    }

    fn load_factor(&self, capacity: usize) -> f64 {
        self.len.load(Ordering::Relaxed) as f64 / capacity as f64
    }
}

impl<T, S> StripedHashSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher,
{
    /// Inserts `value` into the set.
    ///
    /// Returns `true` if the value was newly inserted, or `false` if an
    /// equal value was already present (the set is unchanged).
    pub fn insert(&self, value: T) -> bool {
        let hash = common::hash(&self.build_hasher, &value);
        let cap_used;
        loop {
            let cap = self.capacity.load(Ordering::Acquire);
            let idx = common::bucket_index(hash, cap);
            let _stripe = self.lock_stripe(idx);
            if self.capacity.load(Ordering::Acquire) != cap {
                // A resize swapped the table between the capacity
                // observation and the stripe acquisition.
                continue;
            }
            // SAFETY: the stripe for bucket `idx` is held and the
            // capacity re-check passed, so the array cannot be swapped
            // while this reference is live and no other thread can touch
            // bucket `idx`.
            let bucket = unsafe { self.bucket_mut(idx) };
            if bucket.contains(&value) {
                return false;
            }
            bucket.push(value);
            self.len.fetch_add(1, Ordering::Relaxed);
            cap_used = cap;
            break;
        }

        // The load factor is taken against the capacity this insert
        // operated under, not the live one, so a stale observation cannot
        // start a spurious resize storm.
        if self.load_factor(cap_used) > MAX_LOAD_FACTOR {
            self.resize(cap_used * 2);
        }
        true
    }

    /// Removes `value` from the set.
    ///
    /// Returns `true` if the value was present and has been removed, or
    /// `false` if it was absent (the set is unchanged).
    pub fn remove(&self, value: &T) -> bool {
        let hash = common::hash(&self.build_hasher, value);
        let cap_used;
        loop {
            let cap = self.capacity.load(Ordering::Acquire);
            let idx = common::bucket_index(hash, cap);
            let _stripe = self.lock_stripe(idx);
            if self.capacity.load(Ordering::Acquire) != cap {
                continue;
            }
            // SAFETY: as in `insert`.
            let bucket = unsafe { self.bucket_mut(idx) };
            let pos = match bucket.iter().position(|v| v == value) {
                Some(pos) => pos,
                None => return false,
            };
            bucket.swap_remove(pos);
            self.len.fetch_sub(1, Ordering::Relaxed);
            cap_used = cap;
            break;
        }

        if self.load_factor(cap_used) < MIN_LOAD_FACTOR && cap_used > MIN_BUCKETS {
            self.resize(cap_used / 2);
        }
        true
    }

    /// Returns `true` if the set contained `value` at some moment during
    /// the call.
    pub fn contains(&self, value: &T) -> bool {
        let hash = common::hash(&self.build_hasher, value);
        loop {
            let cap = self.capacity.load(Ordering::Acquire);
            let idx = common::bucket_index(hash, cap);
            let _stripe = self.lock_stripe(idx);
            if self.capacity.load(Ordering::Acquire) != cap {
                continue;
            }
            // SAFETY: as in `insert`.
            let bucket = unsafe { self.bucket_mut(idx) };
            return bucket.contains(value);
        }
    }

    fn resize(&self, new_capacity: usize) {
        let _resize = self.resize_lock.lock();

        let new_capacity = common::normalize_capacity(new_capacity);
        let old_capacity = self.capacity.load(Ordering::Acquire);
        if new_capacity == old_capacity {
            // Another resizer got here first.
            return;
        }

        // Every stripe, in index order. Normal operations hold at most
        // one stripe, so this order is deadlock-free.
        let mut stripe_guards = Vec::with_capacity(self.stripes.len());
        for stripe in self.stripes.iter() {
            stripe_guards.push(stripe.lock());
        }

        // SAFETY: every stripe is held, so no operation is inside any
        // bucket and none can observe the array until the stripes are
        // released.
        let buckets = unsafe { &mut *self.buckets.get() };
        let old = mem::replace(buckets, common::new_bucket_cells(new_capacity));
        for cell in old.into_vec() {
            for value in cell.into_inner() {
                let idx = common::bucket_index(
                    common::hash(&self.build_hasher, &value),
                    new_capacity,
                );
                buckets[idx].get_mut().push(value);
            }
        }
        self.capacity.store(new_capacity, Ordering::Release);

        log::debug!(
            "striped set resized from {} to {} buckets (len = {})",
            old_capacity,
            new_capacity,
            self.len.load(Ordering::Relaxed)
        );
    }
}

impl<T, S> ConcurrentSet<T> for StripedHashSet<T, S>
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

impl<T, S> fmt::Debug for StripedHashSet<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedHashSet")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("num_stripes", &self.num_stripes())
            .finish_non_exhaustive()
    }
}

impl<T, S> Default for StripedHashSet<T, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_num_stripes_capacity_and_hasher(
            DEFAULT_NUM_STRIPES,
            MIN_BUCKETS,
            S::default(),
        )
    }
}
