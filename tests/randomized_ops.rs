//! Randomized workloads checked against the set semantics.
//!
//! Each concurrent variant is driven by 8 threads of seeded random
//! operations; afterwards the per-thread tallies of successful inserts
//! and removes must reconcile with the final contents. A second harness
//! drives a concurrent set and the unsynchronized oracle with an
//! identical serialized op sequence and compares every return value.

use burr::{sync, unsync, ConcurrentSet};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{Arc, Barrier};
use std::thread;

const NUM_THREADS: usize = 8;
const OPS_PER_THREAD: usize = 10_000;
const KEY_SPACE: u32 = 1_000;

fn randomized_workload<S>(set: Arc<S>, seed: u64)
where
    S: ConcurrentSet<u32> + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let set = Arc::clone(&set);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                let mut inserted = vec![0i64; KEY_SPACE as usize];
                let mut removed = vec![0i64; KEY_SPACE as usize];
                barrier.wait();
                for _ in 0..OPS_PER_THREAD {
                    let key = rng.gen_range(0..KEY_SPACE);
                    match rng.gen_range(0..3) {
                        0 => {
                            if set.insert(key) {
                                inserted[key as usize] += 1;
                            }
                        }
                        1 => {
                            if set.remove(&key) {
                                removed[key as usize] += 1;
                            }
                        }
                        _ => {
                            set.contains(&key);
                        }
                    }
                }
                (inserted, removed)
            })
        })
        .collect();

    let mut net = vec![0i64; KEY_SPACE as usize];
    for handle in handles {
        let (inserted, removed) = handle.join().unwrap();
        for key in 0..KEY_SPACE as usize {
            net[key] += inserted[key] - removed[key];
        }
    }

    // Successful inserts and removes on one key strictly alternate, so
    // the net count per key is 0 or 1 and must agree with membership.
    let mut expected_len = 0;
    for (key, &n) in net.iter().enumerate() {
        assert!(n == 0 || n == 1, "key {key} has net count {n}");
        let present = n == 1;
        assert_eq!(
            set.contains(&(key as u32)),
            present,
            "membership of key {key} does not match its net count"
        );
        expected_len += n as usize;
    }
    assert_eq!(set.len(), expected_len);
}

#[test]
fn randomized_ops_coarse() {
    randomized_workload(Arc::new(sync::HashSet::new(4)), 0xC0A125E);
}

#[test]
fn randomized_ops_striped() {
    randomized_workload(Arc::new(sync::StripedHashSet::new(4)), 0x5721FED);
}

#[test]
fn randomized_ops_refinable() {
    randomized_workload(Arc::new(sync::RefinableHashSet::new(4)), 0x2EF12E);
}

fn serialized_oracle<S>(set: &S, seed: u64)
where
    S: ConcurrentSet<u32>,
{
    let mut oracle = unsync::HashSet::new(4);
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..20_000 {
        let key = rng.gen_range(0..KEY_SPACE);
        match rng.gen_range(0..3) {
            0 => assert_eq!(set.insert(key), oracle.insert(key)),
            1 => assert_eq!(set.remove(&key), oracle.remove(&key)),
            _ => assert_eq!(set.contains(&key), oracle.contains(&key)),
        }
    }
    assert_eq!(set.len(), oracle.len());
}

#[test]
fn matches_sequential_oracle() {
    serialized_oracle(&sync::HashSet::new(4), 1);
    serialized_oracle(&sync::StripedHashSet::new(4), 2);
    serialized_oracle(&sync::RefinableHashSet::new(4), 3);
}
