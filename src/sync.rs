//! Provides thread-safe, concurrent hash set implementations.
//!
//! The three types here order themselves by locking granularity:
//! [`HashSet`] serializes everything behind one mutex,
//! [`StripedHashSet`] spreads contention over a fixed stripe array, and
//! [`RefinableHashSet`] keeps one mutex per bucket and regrows the lock
//! array together with the table.

mod coarse;
mod refinable;
mod striped;

pub use coarse::HashSet;
pub use refinable::RefinableHashSet;
pub use striped::StripedHashSet;
