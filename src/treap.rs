//! A fixed-capacity, immutable treap over distinct `i64` keys.
//!
//! Every slot-mutating operation (`insert`, `remove`, `split`, `merge`) takes `&self` and returns
//! a fresh `Treap`, leaving the receiver untouched — the tree engine above relies on this to swap
//! in a freshly built base node with a single CAS rather than mutating shared state in place.
//!
//! The representation is a flat array of slots addressed by index rather than a linked tree of
//! boxed nodes (contrast with the splay tree and the original treap map in this crate's lineage):
//! a base node's treap is small (at most [`TREAP_CAPACITY`] keys) and is cloned wholesale on every
//! mutation, so an array avoids a forest of small heap allocations on every insert/remove.

use std::sync::Arc;

use rand::Rng;

use crate::config::TREAP_CAPACITY;
use crate::pool::{Pool, PoolTicket};

const NULL_IX: i8 = -1;
/// One slot beyond `TREAP_CAPACITY`, reserved for the transient control node used by split/merge.
const SLOT_COUNT: usize = TREAP_CAPACITY + 1;

#[derive(Clone, Copy)]
struct Slot {
    key: i64,
    priority: u32,
    parent: i8,
    left: i8,
    right: i8,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            key: 0,
            priority: 0,
            parent: NULL_IX,
            left: NULL_IX,
            right: NULL_IX,
        }
    }
}

/// Failure modes local to the treap layer; always trapped by the caller, never surfaced to the
/// public `CaTreeSet` API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreapError {
    /// `insert` was attempted on a treap already holding `TREAP_CAPACITY` keys.
    Full,
}

/// A bounded, min-heap-ordered BST over distinct `i64` keys.
#[derive(Clone)]
pub struct Treap {
    slots: [Slot; SLOT_COUNT],
    root: i8,
    size: u8,
}

impl Treap {
    /// An empty treap.
    pub fn new() -> Treap {
        Treap {
            slots: [Slot::default(); SLOT_COUNT],
            root: NULL_IX,
            size: 0,
        }
    }

    /// Number of keys currently held.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// `true` iff `key` is present.
    pub fn contains(&self, key: i64) -> bool {
        self.find_ix(key).is_some()
    }

    /// The greatest key held, or `None` if empty.
    pub fn max_key(&self) -> Option<i64> {
        if self.root == NULL_IX {
            return None;
        }
        let mut ix = self.root;
        while self.slots[ix as usize].right != NULL_IX {
            ix = self.slots[ix as usize].right;
        }
        Some(self.slots[ix as usize].key)
    }

    /// Keys `k` with `lo <= k <= hi`, in ascending order.
    pub fn range(&self, lo: i64, hi: i64) -> Vec<i64> {
        let mut out = Vec::new();
        self.range_rec(self.root, lo, hi, &mut out);
        out
    }

    fn range_rec(&self, ix: i8, lo: i64, hi: i64, out: &mut Vec<i64>) {
        if ix == NULL_IX {
            return;
        }
        let slot = self.slots[ix as usize];
        if slot.key > lo {
            self.range_rec(slot.left, lo, hi, out);
        }
        if slot.key >= lo && slot.key <= hi {
            out.push(slot.key);
        }
        if slot.key < hi {
            self.range_rec(slot.right, lo, hi, out);
        }
    }

    fn find_ix(&self, key: i64) -> Option<usize> {
        let mut ix = self.root;
        while ix != NULL_IX {
            let slot = self.slots[ix as usize];
            if key == slot.key {
                return Some(ix as usize);
            }
            ix = if key < slot.key { slot.left } else { slot.right };
        }
        None
    }

    /// Inserts `key`, returning the new treap and whether it was newly added.
    ///
    /// Fails with [`TreapError::Full`] if the treap already holds `TREAP_CAPACITY` keys and
    /// `key` was not already present; the tree engine routes that failure into a split.
    pub fn insert(&self, key: i64) -> Result<(Treap, bool), TreapError> {
        if self.contains(key) {
            return Ok((self.clone(), false));
        }
        if self.size as usize == TREAP_CAPACITY {
            return Err(TreapError::Full);
        }
        let mut t = self.clone();
        let ix = t.size as i8;
        t.slots[ix as usize] = Slot {
            key,
            priority: thread_priority(),
            ..Slot::default()
        };
        t.size += 1;
        t.bst_insert(ix, false);
        t.bubble_up(ix);
        Ok((t, true))
    }

    /// Removes `key`, returning the new treap and whether it was present.
    pub fn remove(&self, key: i64) -> (Treap, bool) {
        let ix = match self.find_ix(key) {
            Some(ix) => ix,
            None => return (self.clone(), false),
        };
        let mut t = self.clone();
        t.rotate_down_to_leaf(ix as i8);
        t.unlink_leaf(ix as i8);
        t.compact_remove(ix);
        (t, true)
    }

    /// Splits into `(median_key, left, right)` such that `left` holds every key `<= median_key`
    /// and `right` holds every key `> median_key`. Returns `None` if `size() <= 1`.
    pub fn split(&self) -> Option<(i64, Treap, Treap)> {
        if self.size <= 1 {
            return None;
        }
        let sorted = self.range(i64::MIN, i64::MAX);
        let median_key = sorted[sorted.len() / 2];

        let mut t = self.clone();
        let ctrl = t.size as i8;
        t.slots[ctrl as usize] = Slot {
            key: median_key,
            priority: 0,
            ..Slot::default()
        };
        t.size += 1;
        // The control node is inserted to the *right* of the real node already holding
        // `median_key` on a tie, which — once the control node (priority 0) bubbles to the
        // root — places that real node in its left subtree, i.e. inside `left`.
        t.bst_insert(ctrl, false);
        t.bubble_up(ctrl);
        debug_assert_eq!(t.root, ctrl);

        let left_root = t.slots[ctrl as usize].left;
        let right_root = t.slots[ctrl as usize].right;
        let left = t.extract_subtree(left_root);
        let right = t.extract_subtree(right_root);
        Some((median_key, left, right))
    }

    /// Merges two treaps known to satisfy `max(left) <= min(right)` and
    /// `left.size() + right.size() <= TREAP_CAPACITY`.
    pub fn merge(left: &Treap, right: &Treap) -> Treap {
        if left.size == 0 {
            return right.clone();
        }
        if right.size == 0 {
            return left.clone();
        }
        debug_assert!(left.size as usize + right.size as usize <= TREAP_CAPACITY);

        let mut t = Treap::new();
        let left_root = t.copy_subtree(left, left.root, NULL_IX);
        let right_root = t.copy_subtree(right, right.root, NULL_IX);

        let ctrl = t.size as i8;
        t.slots[ctrl as usize] = Slot {
            key: 0,
            priority: 0,
            parent: NULL_IX,
            left: left_root,
            right: right_root,
        };
        if left_root != NULL_IX {
            t.slots[left_root as usize].parent = ctrl;
        }
        if right_root != NULL_IX {
            t.slots[right_root as usize].parent = ctrl;
        }
        t.size += 1;
        t.root = ctrl;

        t.rotate_down_to_leaf(ctrl);
        t.unlink_leaf(ctrl);
        t.slots[ctrl as usize] = Slot::default();
        t
    }

    // -- index-level plumbing -------------------------------------------------------------

    /// BST-inserts the already-populated slot `ix` under the current root. `tie_left` controls
    /// which way a slot comparing equal to an existing key descends (used only by `split`'s
    /// control-node insertion, which relies on this to land on a specific side once the control
    /// node bubbles to the root); ordinary key insertion never encounters a tie.
    fn bst_insert(&mut self, ix: i8, tie_left: bool) {
        if self.root == NULL_IX {
            self.root = ix;
            return;
        }
        let key = self.slots[ix as usize].key;
        let mut cur = self.root;
        loop {
            let cur_key = self.slots[cur as usize].key;
            let go_left = if key == cur_key {
                tie_left
            } else {
                key < cur_key
            };
            let next = if go_left {
                self.slots[cur as usize].left
            } else {
                self.slots[cur as usize].right
            };
            if next == NULL_IX {
                if go_left {
                    self.slots[cur as usize].left = ix;
                } else {
                    self.slots[cur as usize].right = ix;
                }
                self.slots[ix as usize].parent = cur;
                return;
            }
            cur = next;
        }
    }

    /// Bubbles slot `ix` up while its priority is smaller than its parent's (min-heap order).
    /// Ties favor the node already closer to the root, breaking ties by insertion order.
    fn bubble_up(&mut self, mut ix: i8) {
        loop {
            let p = self.slots[ix as usize].parent;
            if p == NULL_IX {
                return;
            }
            if self.slots[p as usize].priority <= self.slots[ix as usize].priority {
                return;
            }
            if self.slots[p as usize].left == ix {
                self.rotate_right(p);
            } else {
                self.rotate_left(p);
            }
        }
    }

    /// Repeatedly rotates `ix` down towards the leaves, at each step pulling up whichever child
    /// has the smaller priority, until `ix` has no children.
    fn rotate_down_to_leaf(&mut self, ix: i8) {
        loop {
            let l = self.slots[ix as usize].left;
            let r = self.slots[ix as usize].right;
            if l == NULL_IX && r == NULL_IX {
                return;
            }
            if l == NULL_IX {
                self.rotate_left(ix);
            } else if r == NULL_IX {
                self.rotate_right(ix);
            } else if self.slots[l as usize].priority <= self.slots[r as usize].priority {
                self.rotate_right(ix);
            } else {
                self.rotate_left(ix);
            }
        }
    }

    /// Detaches the now-childless slot `ix` from its parent (or the root).
    fn unlink_leaf(&mut self, ix: i8) {
        let p = self.slots[ix as usize].parent;
        if p == NULL_IX {
            self.root = NULL_IX;
        } else if self.slots[p as usize].left == ix {
            self.slots[p as usize].left = NULL_IX;
        } else {
            self.slots[p as usize].right = NULL_IX;
        }
        self.size -= 1;
    }

    /// Moves the last occupied slot into the vacated index `ix` to keep slots `0..size` dense.
    fn compact_remove(&mut self, ix: usize) {
        let last = self.size as usize;
        if ix != last {
            self.slots[ix] = self.slots[last];
            self.fixup_links_after_move(last as i8, ix as i8);
        }
        self.slots[last] = Slot::default();
    }

    fn fixup_links_after_move(&mut self, old_ix: i8, new_ix: i8) {
        if self.root == old_ix {
            self.root = new_ix;
        }
        let p = self.slots[new_ix as usize].parent;
        if p != NULL_IX {
            if self.slots[p as usize].left == old_ix {
                self.slots[p as usize].left = new_ix;
            } else if self.slots[p as usize].right == old_ix {
                self.slots[p as usize].right = new_ix;
            }
        }
        let l = self.slots[new_ix as usize].left;
        if l != NULL_IX {
            self.slots[l as usize].parent = new_ix;
        }
        let r = self.slots[new_ix as usize].right;
        if r != NULL_IX {
            self.slots[r as usize].parent = new_ix;
        }
    }

    fn rotate_left(&mut self, x: i8) {
        let y = self.slots[x as usize].right;
        debug_assert_ne!(y, NULL_IX);
        let parent = self.slots[x as usize].parent;
        let b = self.slots[y as usize].left;

        self.slots[x as usize].right = b;
        if b != NULL_IX {
            self.slots[b as usize].parent = x;
        }
        self.slots[y as usize].left = x;
        self.slots[x as usize].parent = y;
        self.slots[y as usize].parent = parent;
        self.relink_parent(parent, x, y);
    }

    fn rotate_right(&mut self, x: i8) {
        let y = self.slots[x as usize].left;
        debug_assert_ne!(y, NULL_IX);
        let parent = self.slots[x as usize].parent;
        let b = self.slots[y as usize].right;

        self.slots[x as usize].left = b;
        if b != NULL_IX {
            self.slots[b as usize].parent = x;
        }
        self.slots[y as usize].right = x;
        self.slots[x as usize].parent = y;
        self.slots[y as usize].parent = parent;
        self.relink_parent(parent, x, y);
    }

    fn relink_parent(&mut self, parent: i8, old_child: i8, new_child: i8) {
        if parent == NULL_IX {
            self.root = new_child;
        } else if self.slots[parent as usize].left == old_child {
            self.slots[parent as usize].left = new_child;
        } else {
            self.slots[parent as usize].right = new_child;
        }
    }

    /// Copies the subtree rooted at `ix` in `src` into `self`, appending at `self.size` and
    /// returning the new root index (or `NULL_IX` if `ix` is `NULL_IX`).
    fn copy_subtree(&mut self, src: &Treap, ix: i8, parent: i8) -> i8 {
        if ix == NULL_IX {
            return NULL_IX;
        }
        let slot = src.slots[ix as usize];
        let new_ix = self.size as i8;
        self.slots[new_ix as usize] = Slot {
            key: slot.key,
            priority: slot.priority,
            parent,
            left: NULL_IX,
            right: NULL_IX,
        };
        self.size += 1;
        let left = self.copy_subtree(src, slot.left, new_ix);
        let right = self.copy_subtree(src, slot.right, new_ix);
        self.slots[new_ix as usize].left = left;
        self.slots[new_ix as usize].right = right;
        new_ix
    }

    fn extract_subtree(&self, ix: i8) -> Treap {
        let mut t = Treap::new();
        let new_root = t.copy_subtree(self, ix, NULL_IX);
        t.root = new_root;
        t
    }
}

impl Default for Treap {
    fn default() -> Self {
        Treap::new()
    }
}

fn thread_priority() -> u32 {
    rand::thread_rng().gen::<u32>()
}

/// A treap together with the pool ticket accounting for its allocation; shared by reference
/// across every node variant pinned to the same snapshot (base/join/range nodes never mutate it,
/// so ordinary `Arc` refcounting is sufficient without epoch protection).
pub struct PooledTreap {
    pub treap: Treap,
    _ticket: PoolTicket,
}

impl PooledTreap {
    pub fn alloc(pool: &Arc<Pool>, treap: Treap) -> Result<Arc<PooledTreap>, crate::error::Error> {
        let ticket = pool.acquire()?;
        Ok(Arc::new(PooledTreap {
            treap,
            _ticket: ticket,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_of(t: &Treap) -> Vec<i64> {
        t.range(i64::MIN, i64::MAX)
    }

    #[test]
    fn test_empty() {
        let t = Treap::new();
        assert_eq!(t.size(), 0);
        assert!(t.is_empty());
        assert_eq!(t.max_key(), None);
        assert!(t.range(i64::MIN, i64::MAX).is_empty());
        assert!(!t.contains(0));
    }

    #[test]
    fn test_insert_contains() {
        let t = Treap::new();
        let (t, added) = t.insert(5).unwrap();
        assert!(added);
        assert!(t.contains(5));
        assert_eq!(t.size(), 1);

        let (t2, added) = t.insert(5).unwrap();
        assert!(!added);
        assert_eq!(t2.size(), 1);
        // original untouched
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn test_insert_sorted_range() {
        let mut t = Treap::new();
        for k in [5, 1, 9, 3, 7, 2, 8, 4, 6, 0] {
            let (nt, added) = t.insert(k).unwrap();
            assert!(added);
            t = nt;
        }
        assert_eq!(t.size(), 10);
        assert_eq!(keys_of(&t), (0..10).collect::<Vec<_>>());
        assert_eq!(t.max_key(), Some(9));
    }

    #[test]
    fn test_remove() {
        let mut t = Treap::new();
        for k in 0..20 {
            t = t.insert(k).unwrap().0;
        }
        for k in (0..20).step_by(2) {
            let (nt, removed) = t.remove(k);
            assert!(removed);
            t = nt;
        }
        assert_eq!(t.size(), 10);
        assert_eq!(keys_of(&t), (1..20).step_by(2).collect::<Vec<_>>());

        let (t2, removed) = t.remove(1000);
        assert!(!removed);
        assert_eq!(t2.size(), 10);
    }

    #[test]
    fn test_full_treap_rejects_insert() {
        let mut t = Treap::new();
        for k in 0..TREAP_CAPACITY as i64 {
            t = t.insert(k).unwrap().0;
        }
        assert_eq!(t.size(), TREAP_CAPACITY);
        assert_eq!(t.insert(TREAP_CAPACITY as i64), Err(TreapError::Full));
        // re-inserting an existing key is still fine even when full
        assert_eq!(t.insert(0).unwrap().1, false);
    }

    #[test]
    fn test_range_bounds() {
        let mut t = Treap::new();
        for k in 1..=9 {
            t = t.insert(k).unwrap().0;
        }
        assert_eq!(t.range(3, 100), vec![3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(t.range(-100, 4), vec![1, 2, 3, 4]);
        assert_eq!(t.range(4, 6), vec![4, 5, 6]);
    }

    #[test]
    fn test_split_singleton_or_empty_is_none() {
        let t = Treap::new();
        assert!(t.split().is_none());
        let t = t.insert(1).unwrap().0;
        assert!(t.split().is_none());
    }

    #[test]
    fn test_split_partitions_all_keys() {
        let mut t = Treap::new();
        for k in 0..64 {
            t = t.insert(k).unwrap().0;
        }
        let (median, left, right) = t.split().unwrap();
        let mut recombined = keys_of(&left);
        recombined.extend(keys_of(&right));
        recombined.sort_unstable();
        assert_eq!(recombined, (0..64).collect::<Vec<_>>());
        assert!(left.max_key().unwrap() <= median);
        for k in keys_of(&right) {
            assert!(k > median);
        }
        assert!(left.size() + right.size() == 64);
    }

    #[test]
    fn test_merge_round_trips_split() {
        let mut t = Treap::new();
        for k in 0..64 {
            t = t.insert(k).unwrap().0;
        }
        let (_, left, right) = t.split().unwrap();
        let merged = Treap::merge(&left, &right);
        assert_eq!(merged.size(), 64);
        assert_eq!(keys_of(&merged), (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_with_empty_side() {
        let mut t = Treap::new();
        for k in 0..5 {
            t = t.insert(k).unwrap().0;
        }
        let empty = Treap::new();
        let merged = Treap::merge(&t, &empty);
        assert_eq!(keys_of(&merged), keys_of(&t));
        let merged = Treap::merge(&empty, &t);
        assert_eq!(keys_of(&merged), keys_of(&t));
    }
}
