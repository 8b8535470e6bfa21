use std::sync::Arc;
use std::thread;

use ca_tree_set::CaTreeSet;

#[test]
fn range_queries_over_small_set() {
    let set = CaTreeSet::new();
    for k in 1..=9 {
        assert!(set.insert(k));
    }

    assert_eq!(set.range(3, 100), vec![3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(set.range(-100, 4), vec![1, 2, 3, 4]);
    assert_eq!(set.range(4, 6), vec![4, 5, 6]);
    assert_eq!(set.range(10, 20), Vec::<i64>::new());
}

#[test]
fn full_lifecycle_over_contiguous_keys() {
    let set = CaTreeSet::new();

    for k in 0..1023 {
        assert!(set.insert(k), "key {} should be newly inserted", k);
    }
    for k in 0..1023 {
        assert!(!set.insert(k), "key {} was already present", k);
    }
    for k in 0..1023 {
        assert!(set.lookup(k));
    }
    assert_eq!(set.range(0, 1022), (0..1023).collect::<Vec<_>>());

    for k in 0..1023 {
        assert!(set.remove(k), "key {} should have been present", k);
    }
    for k in 0..1023 {
        assert!(!set.lookup(k));
        assert!(!set.remove(k));
    }
    assert!(set.range(0, 1022).is_empty());
}

/// Fills a single base to capacity, then drives 1000 uncontended remove/insert pairs on the
/// same key — each pair should eventually push that base's `stat` below the join threshold and
/// trigger (and complete, via helping) a low-contention join with a sibling.
#[test]
fn uncontended_churn_drives_a_join() {
    let set = CaTreeSet::new();
    for k in 0..64 {
        assert!(set.insert(k));
    }

    for _ in 0..1000 {
        assert!(set.remove(0));
        assert!(set.insert(0));
    }

    for k in 0..64 {
        assert!(set.lookup(k));
    }
    assert_eq!(set.range(0, 63), (0..64).collect::<Vec<_>>());
}

/// Eight threads each insert a disjoint arithmetic progression (stride 8) over `[0, 100_000)`,
/// racing splits and joins the whole way; afterwards every key must be present exactly once.
#[test]
fn concurrent_stride_inserts_then_join() {
    const UPPER: i64 = 100_000;
    const THREADS: i64 = 8;

    let set = Arc::new(CaTreeSet::with_capacity_hint(UPPER as usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|offset| {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                let mut k = offset;
                while k < UPPER {
                    set.insert(k);
                    k += THREADS;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for k in 0..UPPER {
        assert!(set.lookup(k), "missing key {}", k);
    }
    assert_eq!(set.range(0, UPPER - 1).len(), UPPER as usize);

    let handles: Vec<_> = (0..THREADS)
        .map(|offset| {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                let mut k = offset;
                while k < UPPER {
                    assert!(set.remove(k));
                    k += THREADS;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for k in 0..UPPER {
        assert!(!set.lookup(k));
    }
}
