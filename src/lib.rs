//! A contention-adapting, lock-free concurrent ordered set of `i64` keys.
//!
//! The tree is built from bounded immutable treaps (at most [`config::TREAP_CAPACITY`] keys
//! each) hanging off a binary tree of routes. Point operations (`insert`/`remove`/`lookup`)
//! replace a single base node with a single CAS; a background adaptation protocol splits bases
//! under contention and joins them back together once contention subsides, and every protocol is
//! helper-driven so no thread ever blocks waiting on another. See `tree`, `adapt`, and `range` for
//! the three protocols, and `DESIGN.md` for how each piece traces back to its source.

mod adapt;
mod config;
mod error;
mod node;
mod pool;
mod range;
mod stats;
mod treap;
mod tree;

use crossbeam_epoch::{pin, Atomic, Shared};
use std::sync::atomic::Ordering::Acquire;

pub use error::{Error, Result};
use node::Node;
use pool::Pools;
use treap::{PooledTreap, Treap};

/// A contention-adapting concurrent ordered set of `i64`s.
///
/// Cloning a `CaTreeSet` is not supported; share it across threads behind an `Arc` instead, the
/// same way callers share any of the lock-free structures in this crate's lineage.
pub struct CaTreeSet {
    root: Atomic<Node>,
    pools: Pools,
}

impl CaTreeSet {
    /// Builds an empty set sized for roughly 64k keys; use [`Self::with_capacity_hint`] to size
    /// the underlying pools for a known workload instead.
    pub fn new() -> CaTreeSet {
        CaTreeSet::with_capacity_hint(config::TREAP_CAPACITY * 1024)
    }

    /// Builds an empty set whose node/treap/result-store pools are sized from `expected_keys`.
    ///
    /// Pool capacity is fixed at construction; an operation that would exceed it returns
    /// [`Error::PoolExhausted`] from the few internal paths that surface it (see `error`), and
    /// otherwise panics on the mandatory allocation paths where there is no sensible way to
    /// retry (a split/join is always best-effort and simply gives up instead).
    pub fn with_capacity_hint(expected_keys: usize) -> CaTreeSet {
        let pools = Pools::with_capacity_hint(expected_keys);
        let ticket = pools
            .nodes
            .acquire()
            .expect("a freshly sized node pool always has room for the initial base");
        let data = PooledTreap::alloc(&pools.treaps, Treap::new())
            .expect("a freshly sized treap pool always has room for the initial base");
        let root = Atomic::new(Node::new_base(data, 0, Atomic::null(), ticket));
        CaTreeSet { root, pools }
    }

    /// Inserts `key`, returning `true` iff it was not already present.
    pub fn insert(&self, key: i64) -> bool {
        let guard = pin();
        tree::insert(&self.root, key, &self.pools, &guard)
    }

    /// Removes `key`, returning `true` iff it was present.
    pub fn remove(&self, key: i64) -> bool {
        let guard = pin();
        tree::remove(&self.root, key, &self.pools, &guard)
    }

    /// Returns `true` iff `key` is currently a member of the set.
    pub fn lookup(&self, key: i64) -> bool {
        let guard = pin();
        tree::lookup(&self.root, key, &guard)
    }

    /// Returns every key `k` with `lo <= k <= hi`, in ascending order, consistent with some
    /// linearization point during the call.
    pub fn range(&self, lo: i64, hi: i64) -> Vec<i64> {
        let guard = pin();
        range::range(&self.root, lo, hi, &self.pools, &guard)
    }

    /// Live allocation counts for the node/treap/result-store pools, mostly useful for tests and
    /// the contention benchmark.
    pub fn pool_usage(&self) -> (usize, usize, usize) {
        (self.pools.nodes.live(), self.pools.treaps.live(), self.pools.result_stores.live())
    }
}

impl Default for CaTreeSet {
    fn default() -> CaTreeSet {
        CaTreeSet::new()
    }
}

/// Recursively reclaims a subtree. Only sound when no other thread can possibly still be
/// observing `ptr`, which `Drop::drop`'s `&mut self` receiver guarantees here.
unsafe fn free_subtree(ptr: Shared<'_, Node>, guard: &crossbeam_epoch::Guard) {
    if ptr.is_null() {
        return;
    }
    if let Node::Route(r) = ptr.deref() {
        free_subtree(r.left.load(Acquire, guard), guard);
        free_subtree(r.right.load(Acquire, guard), guard);
    }
    drop(ptr.into_owned());
}

impl Drop for CaTreeSet {
    fn drop(&mut self) {
        let guard = pin();
        let root = self.root.load(Acquire, &guard);
        unsafe { free_subtree(root, &guard) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_lookup_roundtrip() {
        let set = CaTreeSet::new();
        assert!(set.insert(5));
        assert!(!set.insert(5));
        assert!(set.lookup(5));
        assert!(set.remove(5));
        assert!(!set.lookup(5));
        assert!(!set.remove(5));
    }

    #[test]
    fn range_over_small_set() {
        let set = CaTreeSet::new();
        for k in 1..=9 {
            set.insert(k);
        }
        assert_eq!(set.range(3, 100), vec![3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(set.range(-100, 4), vec![1, 2, 3, 4]);
        assert_eq!(set.range(4, 6), vec![4, 5, 6]);
    }

    #[test]
    fn full_lifecycle_over_many_keys() {
        let set = CaTreeSet::new();
        for k in 0..1023 {
            assert!(set.insert(k));
        }
        for k in 0..1023 {
            assert!(set.lookup(k));
        }
        for k in 0..1023 {
            assert!(set.remove(k));
        }
        for k in 0..1023 {
            assert!(!set.lookup(k));
        }
    }
}
