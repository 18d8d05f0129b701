use crate::common::{
    self, DefaultHashBuilder, MAX_LOAD_FACTOR, MIN_BUCKETS, MIN_LOAD_FACTOR,
};
use crate::ConcurrentSet;

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

use std::{
    cell::UnsafeCell,
    fmt,
    hash::{BuildHasher, Hash},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

/// Bucket and lock arrays that grow and shrink together. `locks.len()`
/// equals `buckets.len()` for every table ever published.
struct Table<T> {
    buckets: Box<[UnsafeCell<Vec<T>>]>,
    locks: Box<[Mutex<()>]>,
}

impl<T> Table<T> {
    fn with_capacity(capacity: usize) -> Self {
        let mut locks = Vec::with_capacity(capacity);
        locks.resize_with(capacity, || Mutex::new(()));
        Self {
            buckets: common::new_bucket_cells(capacity),
            locks: locks.into_boxed_slice(),
        }
    }

    fn capacity(&self) -> usize {
        self.buckets.len()
    }
}

/// A thread-safe hash set with one mutex per bucket.
///
/// Unlike [`StripedHashSet`](crate::sync::StripedHashSet), the lock array
/// here is refined on every resize: it always has exactly as many mutexes
/// as the table has buckets, so two operations contend only when they
/// target the same bucket. The price is that a resize replaces the lock
/// array out from under concurrent operations, which therefore cannot
/// trust a lock merely because they acquired it.
///
/// The coordination works with a version stamp and a resize flag. An
/// operation waits out any resize owned by another thread, notes the
/// version, locks the bucket for its value, and then re-checks that the
/// version is unchanged and no resize has started; if either check fails
/// it releases and retries against the new geometry. A resize publishes
/// its owner, migrates one old bucket at a time under that bucket's old
/// lock, swaps in the new bucket and lock arrays, and bumps the version.
/// The bump is the linearization point of the resize.
///
/// A thread that lost the race may still be parked on a mutex of a
/// replaced lock array, so retired tables are kept alive in an arena
/// until the set is dropped; a mutex is never destroyed while any thread
/// could still hold or release it.
///
/// # Examples
///
/// ```rust
/// use burr::sync::RefinableHashSet;
///
/// let set = RefinableHashSet::new(16);
///
/// assert!(set.insert("a"));
/// assert!(!set.insert("a"));
/// assert!(set.remove(&"a"));
/// assert!(set.is_empty());
/// ```
pub struct RefinableHashSet<T, S = DefaultHashBuilder> {
    table: AtomicPtr<Table<T>>,
    len: CachePadded<AtomicUsize>,
    // Bumped by every completed resize; the per-operation re-check reads
    // it before and after acquiring the bucket lock.
    version: AtomicUsize,
    // True while a resize is migrating and publishing new arrays.
    resizing: AtomicBool,
    // Id of the resizing thread; 0 when no resize is in progress.
    resize_owner: AtomicU64,
    // Serializes resizes. The payload is the retired-table arena: every
    // displaced table lands here and is freed only on drop, so a pointer
    // loaded from `table` stays dereferenceable for the set's lifetime.
    // Kept as raw pointers because late operations may still hold
    // references into a retired table while it sits in the arena.
    resize_state: Mutex<Vec<*mut Table<T>>>,
    build_hasher: S,
}

// The buckets are mutex-protected, so sharing the set only requires the
// elements to be movable between threads, as for `Mutex<T>` itself.
unsafe impl<T: Send, S: Send> Send for RefinableHashSet<T, S> {}
unsafe impl<T: Send, S: Sync> Sync for RefinableHashSet<T, S> {}

impl<T> RefinableHashSet<T, DefaultHashBuilder> {
    /// Creates an empty set with at least `initial_capacity` buckets (and
    /// as many bucket locks).
    ///
    /// Capacities below the minimum of 4 (including 0) are rounded up.
    pub fn new(initial_capacity: usize) -> Self {
        Self::with_capacity_and_hasher(initial_capacity, DefaultHashBuilder::default())
    }
}

impl<T, S> RefinableHashSet<T, S> {
    /// Creates an empty set with at least `initial_capacity` buckets,
    /// using `build_hasher` to hash the elements.
    pub fn with_capacity_and_hasher(initial_capacity: usize, build_hasher: S) -> Self {
        let capacity = common::normalize_capacity(initial_capacity);
        let table = Box::new(Table::with_capacity(capacity));
        Self {
            table: AtomicPtr::new(Box::into_raw(table)),
            len: CachePadded::new(AtomicUsize::new(0)),
            version: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),
            resize_owner: AtomicU64::new(0),
            resize_state: Mutex::new(Vec::new()),
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
        self.current_table().capacity()
    }

    fn current_table(&self) -> &Table<T> {
        // SAFETY: every table ever published is either current or parked
        // in the retired arena, and the arena is only emptied on drop, so
        // the loaded pointer is always dereferenceable.
        unsafe { &*self.table.load(Ordering::Acquire) }
    }

    fn load_factor(&self, capacity: usize) -> f64 {
        self.len.load(Ordering::Relaxed) as f64 / capacity as f64
    }

    fn other_thread_resizing(&self) -> bool {
        self.resizing.load(Ordering::Acquire)
            && self.resize_owner.load(Ordering::Acquire) != current_thread_id()
    }

    // The pre-operation gate: do not start a critical section on a table
    // that another thread is about to replace.
    fn wait_for_other_resize(&self) {
        let backoff = Backoff::new();
        while self.other_thread_resizing() {
            backoff.snooze();
        }
    }
}

impl<T, S> RefinableHashSet<T, S>
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
            self.wait_for_other_resize();
            let version = self.version.load(Ordering::Acquire);
            let table = self.current_table();
            let idx = common::bucket_index(hash, table.capacity());
            let _bucket_lock = table.locks[idx].lock();
            if self.version.load(Ordering::Acquire) != version
                || self.other_thread_resizing()
            {
                // The table was, or is being, replaced; retry against the
                // new geometry.
                continue;
            }
            // SAFETY: the re-check proves `table` is still the current
            // table, and bucket `idx` is only ever mutated under
            // `locks[idx]`, which is held.
            let bucket = unsafe { &mut *table.buckets[idx].get() };
            if bucket.contains(&value) {
                return false;
            }
            bucket.push(value);
            self.len.fetch_add(1, Ordering::Relaxed);
            cap_used = table.capacity();
            break;
        }

        // The load factor is taken against the capacity this insert
        // operated under, not the live one, so a stale observation cannot
        // start a spurious resize storm.
        if !self.other_thread_resizing() && self.load_factor(cap_used) > MAX_LOAD_FACTOR {
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
            self.wait_for_other_resize();
            let version = self.version.load(Ordering::Acquire);
            let table = self.current_table();
            let idx = common::bucket_index(hash, table.capacity());
            let _bucket_lock = table.locks[idx].lock();
            if self.version.load(Ordering::Acquire) != version
                || self.other_thread_resizing()
            {
                continue;
            }
            // SAFETY: as in `insert`.
            let bucket = unsafe { &mut *table.buckets[idx].get() };
            let pos = match bucket.iter().position(|v| v == value) {
                Some(pos) => pos,
                None => return false,
            };
            bucket.swap_remove(pos);
            self.len.fetch_sub(1, Ordering::Relaxed);
            cap_used = table.capacity();
            break;
        }

        if !self.other_thread_resizing() && self.load_factor(cap_used) < MIN_LOAD_FACTOR {
            self.resize((cap_used / 2).max(MIN_BUCKETS));
        }
        true
    }

    /// Returns `true` if the set contained `value` at some moment during
    /// the call.
    pub fn contains(&self, value: &T) -> bool {
        let hash = common::hash(&self.build_hasher, value);
        loop {
            self.wait_for_other_resize();
            let version = self.version.load(Ordering::Acquire);
            let table = self.current_table();
            let idx = common::bucket_index(hash, table.capacity());
            let _bucket_lock = table.locks[idx].lock();
            if self.version.load(Ordering::Acquire) != version
                || self.other_thread_resizing()
            {
                continue;
            }
            // SAFETY: as in `insert`.
            let bucket = unsafe { &*table.buckets[idx].get() };
            return bucket.contains(value);
        }
    }

    fn resize(&self, new_capacity: usize) {
        let mut retired = self.resize_state.lock();

        let new_capacity = common::normalize_capacity(new_capacity);
        let old_capacity = self.current_table().capacity();
        if new_capacity == old_capacity {
            // Another resizer got here first.
            return;
        }

        // Publish the resize before touching any bucket, so that normal
        // operations stop entering critical sections on the old table.
        self.resize_owner
            .store(current_thread_id(), Ordering::Release);
        self.resizing.store(true, Ordering::Release);

        let mut new_table = Box::new(Table::with_capacity(new_capacity));
        {
            let table = self.current_table();
            // Migrate one bucket at a time. Holding the old bucket's lock
            // keeps the migration from observing a half-mutated chain; an
            // operation that slips in on an already-drained bucket fails
            // its version/resizing re-check and retries.
            for (cell, lock) in table.buckets.iter().zip(table.locks.iter()) {
                let _bucket_lock = lock.lock();
                // SAFETY: `locks[idx]` is held, and bucket `idx` is only
                // mutated under it.
                let bucket = unsafe { &mut *cell.get() };
                for value in bucket.drain(..) {
                    let idx = common::bucket_index(
                        common::hash(&self.build_hasher, &value),
                        new_capacity,
                    );
                    new_table.buckets[idx].get_mut().push(value);
                }
            }
        }

        let old_ptr = self.table.swap(Box::into_raw(new_table), Ordering::AcqRel);
        // The version bump is the linearization point of the resize.
        self.version.fetch_add(1, Ordering::AcqRel);
        // Late operations may still be parked on, or about to release,
        // the old table's locks, so the old table must outlive them.
        retired.push(old_ptr);

        self.resizing.store(false, Ordering::Release);
        self.resize_owner.store(0, Ordering::Release);

        log::debug!(
            "refinable set resized from {} to {} buckets (len = {})",
            old_capacity,
            new_capacity,
            self.len.load(Ordering::Relaxed)
        );
    }
}

impl<T, S> Drop for RefinableHashSet<T, S> {
    fn drop(&mut self) {
        // SAFETY: every pointer here came from `Box::into_raw`, no two
        // entries alias, and `&mut self` guarantees no operation is in
        // flight that could still reach them.
        for table in self.resize_state.get_mut().drain(..) {
            drop(unsafe { Box::from_raw(table) });
        }
        let table = *self.table.get_mut();
        drop(unsafe { Box::from_raw(table) });
    }
}

impl<T, S> ConcurrentSet<T> for RefinableHashSet<T, S>
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

impl<T, S> fmt::Debug for RefinableHashSet<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefinableHashSet")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl<T, S> Default for RefinableHashSet<T, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_capacity_and_hasher(MIN_BUCKETS, S::default())
    }
}

/// Stable id of the calling thread, assigned on first touch. 0 is
/// reserved for "no resize owner".
fn current_thread_id() -> u64 {
    static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_ID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::RefinableHashSet;
    use crate::common;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::{sync::Arc, thread};

    #[test]
    fn basic_single_thread() {
        let set = RefinableHashSet::new(4);
        assert!(set.insert(1));
        assert!(set.insert(2));
        assert!(set.insert(3));
        assert_eq!(set.len(), 3);
        assert!(set.contains(&2));
        assert!(!set.contains(&4));

        for _ in 0..9 {
            assert!(!set.insert(1));
        }
        assert_eq!(set.len(), 3);

        assert!(!set.remove(&4));
        assert!(set.remove(&3));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn lock_array_tracks_bucket_array() {
        let set = RefinableHashSet::new(4);
        for i in 1..=100 {
            assert!(set.insert(i));
        }
        assert!(set.capacity() > 4);
        {
            let table = set.current_table();
            assert_eq!(table.locks.len(), table.buckets.len());
        }
        assert_bucket_integrity(&set);
        assert_load_factor_in_bounds(&set);

        for i in 1..=50 {
            assert!(set.remove(&i));
        }
        assert_eq!(set.len(), 50);
        assert!(!set.contains(&25));
        assert!(set.contains(&75));

        let table = set.current_table();
        assert_eq!(table.locks.len(), table.buckets.len());
        assert_bucket_integrity(&set);
        assert_load_factor_in_bounds(&set);
    }

    #[test]
    fn version_bumps_on_each_resize() {
        let set = RefinableHashSet::new(4);
        assert_eq!(set.version.load(Ordering::Relaxed), 0);

        // The 17th insert pushes the load factor over 4.0 at capacity 4.
        for i in 0..17 {
            set.insert(i);
        }
        assert_eq!(set.version.load(Ordering::Relaxed), 1);

        for i in 17..33 {
            set.insert(i);
        }
        assert_eq!(set.version.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn drain_shrinks_to_floor() {
        let set = RefinableHashSet::new(4);
        for i in 0..100 {
            assert!(set.insert(i));
        }
        assert!(set.capacity() > 4);
        assert_bucket_integrity(&set);
        assert_load_factor_in_bounds(&set);
        for i in 0..100 {
            assert!(set.remove(&i));
        }
        assert_eq!(set.len(), 0);
        assert_eq!(set.capacity(), 4);
        assert_bucket_integrity(&set);
    }

    #[test]
    fn resize_contention_many_writers() {
        let set = Arc::new(RefinableHashSet::new(4));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for i in (t * 500)..(t * 500 + 500) {
                        assert!(set.insert(i));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(set.len(), 4000);
        for i in (0..4000).step_by(97) {
            assert!(set.contains(&i));
        }
        let table = set.current_table();
        assert_eq!(table.locks.len(), table.buckets.len());
        assert_bucket_integrity(&set);
    }

    #[test]
    fn concurrent_writers_and_reader() {
        let set = Arc::new(RefinableHashSet::new(4));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let set = Arc::clone(&set);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let _ = set.len();
                    let _ = set.contains(&0);
                }
            })
        };

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for _ in 0..3 {
                        for i in (t * 1000)..(t * 1000 + 1000) {
                            assert!(set.insert(i));
                        }
                        for i in (t * 1000)..(t * 1000 + 1000) {
                            assert!(set.remove(&i));
                        }
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Ordering::Release);
        reader.join().unwrap();

        assert_eq!(set.len(), 0);
        assert!(!set.contains(&0));
        assert!(!set.contains(&3999));
        assert_bucket_integrity(&set);
    }

    /// Walks the private buckets and checks that every element is chained
    /// under its own hash, that no element appears twice, and that the
    /// chain lengths add up to `len`. Only called at quiescence, when the
    /// test owns the sole reference to the set.
    fn assert_bucket_integrity(set: &RefinableHashSet<i32>) {
        let table = set.current_table();
        let capacity = table.buckets.len();
        assert_eq!(table.locks.len(), capacity);
        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for (i, cell) in table.buckets.iter().enumerate() {
            // SAFETY: no operation is in flight, so nothing mutates the
            // bucket while it is walked.
            let bucket = unsafe { &*cell.get() };
            for value in bucket {
                let idx =
                    common::bucket_index(common::hash(&set.build_hasher, value), capacity);
                assert_eq!(idx, i, "element {value} chained under the wrong bucket");
                assert!(seen.insert(*value), "element {value} appears twice");
                total += 1;
            }
        }
        assert_eq!(total, set.len());
    }

    /// Checks the steady-state load factor bounds; a table at the
    /// four-bucket floor may be arbitrarily underfull.
    fn assert_load_factor_in_bounds(set: &RefinableHashSet<i32>) {
        let load_factor = set.len() as f64 / set.capacity() as f64;
        assert!(load_factor <= 4.0, "load factor {load_factor} above 4.0");
        if set.capacity() > 4 {
            assert!(load_factor >= 0.25, "load factor {load_factor} below 1/4");
        }
    }
}
