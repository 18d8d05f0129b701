#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Burr provides a family of hash sets that share one separate-chaining
//! table layout but synchronize it at four different grain sizes, from a
//! single global mutex down to one mutex per bucket.
//!
//! All variants expose the same observable semantics to a single-threaded
//! (or externally serialized) caller; they differ only in how much
//! concurrency they admit and in how a resize coordinates with in-flight
//! operations.
//!
//! | Type | Locking |
//! |------|---------|
//! | [`unsync::HashSet`] | none (`&mut self`) |
//! | [`sync::HashSet`] | one global mutex |
//! | [`sync::StripedHashSet`] | fixed array of stripe mutexes |
//! | [`sync::RefinableHashSet`] | one mutex per bucket, resized with the table |
//!
//! # Example
//!
//! ```rust
//! use burr::sync::StripedHashSet;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let set = Arc::new(StripedHashSet::new(64));
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|t| {
//!         let set = Arc::clone(&set);
//!         thread::spawn(move || {
//!             for i in (t * 100)..(t * 100 + 100) {
//!                 set.insert(i);
//!             }
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(set.len(), 400);
//! ```

pub(crate) mod common;
pub mod sync;
pub mod unsync;

pub use crate::common::DefaultHashBuilder;

/// The uniform contract of the thread-safe sets.
///
/// Every method takes `&self`; the implementations rely on interior
/// mutability, so a set can be shared between threads behind an `Arc`
/// without an outer lock. [`unsync::HashSet`] offers the same methods
/// with `&mut self` receivers and does not implement this trait.
///
/// ```rust
/// use burr::{sync::HashSet, ConcurrentSet};
///
/// fn occupancy<S: ConcurrentSet<u32>>(set: &S) -> usize {
///     set.len()
/// }
///
/// let set = HashSet::new(16);
/// set.insert(7);
/// assert_eq!(occupancy(&set), 1);
/// ```
pub trait ConcurrentSet<T> {
    /// Inserts `value` into the set.
    ///
    /// Returns `true` if the value was newly inserted, or `false` if an
    /// equal value was already present (the set is unchanged).
    fn insert(&self, value: T) -> bool;

    /// Removes `value` from the set.
    ///
    /// Returns `true` if the value was present and has been removed, or
    /// `false` if it was absent (the set is unchanged).
    fn remove(&self, value: &T) -> bool;

    /// Returns `true` if the set contained `value` at some moment during
    /// the call.
    fn contains(&self, value: &T) -> bool;

    /// Returns the number of elements in the set at some moment during
    /// the call.
    fn len(&self) -> usize;

    /// Returns `true` if the set held no elements at some moment during
    /// the call.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
