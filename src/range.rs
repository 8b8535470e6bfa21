//! Snapshot-consistent range queries.
//!
//! A range query pins the leaves it touches by swapping in `range`-variant copies of their
//! base nodes (each carrying the same shared [`ResultStore`]), sweeps left to right collecting
//! each pinned leaf's treap contents, and publishes the concatenation with a single CAS into the
//! shared store — that CAS is the query's linearization point.
//!
//! Every race detected mid-sweep (a route invalidated by a concurrent join, a lost CAS pinning
//! the next leaf) restarts the whole query from `lo` rather than resuming from a saved backup
//! point; this trades a bounded amount of duplicated work under heavy adaptation churn for a
//! substantially simpler implementation, and preserves the same lock-free progress guarantee
//! since a restart always makes forward progress on *some* thread's behalf (see `DESIGN.md`).

use std::sync::atomic::Ordering::Acquire;
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::node::{Dir, Node, ResultStore, StackFrame};
use crate::pool::Pools;
use crate::tree::{find_base_with_stack, help_if_needed, parent_slot_of, replaceable, try_replace};

/// `range(lo, hi)`: every key `k` in the set with `lo <= k <= hi`, at some linearization point
/// during the call, in ascending order.
pub fn range<'g>(root: &'g Atomic<Node>, lo: i64, hi: i64, pools: &Pools, guard: &'g Guard) -> Vec<i64> {
    all_in_range(root, lo, hi, None, pools, guard)
}

/// The range-query protocol proper. `resume` is `Some(storage)` when called from
/// `help_if_needed` to drive someone else's in-flight query to completion rather than starting
/// a fresh one; the public [`range`] always passes `None`.
pub fn all_in_range<'g>(
    root: &'g Atomic<Node>,
    lo: i64,
    hi: i64,
    resume: Option<Arc<ResultStore>>,
    pools: &Pools,
    guard: &'g Guard,
) -> Vec<i64> {
    loop {
        let mut stack: Vec<StackFrame<'g>> = Vec::new();
        let b = find_base_with_stack(root, lo, guard, &mut stack);
        let node = unsafe { b.deref() };

        if let Some(s) = &resume {
            let is_ours = node.as_range().map_or(false, |r| Arc::ptr_eq(&r.storage, s));
            if !is_ours {
                // The query we were asked to help has already moved past this base (someone
                // else finished it, or it was never installed); read whatever is there.
                return if s.is_set(guard) { s.get(guard).to_vec() } else { Vec::new() };
            }
        }

        let (range_b, storage) = match node.as_range() {
            Some(r) if r.hi >= hi => (b, r.storage.clone()),
            Some(_) => {
                help_if_needed(root, b, pools, guard);
                continue;
            }
            None if replaceable(node, guard) => {
                let data = node.data().expect("replaceable base-like node carries data").clone();
                let parent = node.parent().map(|p| p.load(Acquire, guard)).unwrap_or(Shared::null());
                let storage = match ResultStore::alloc(&pools.result_stores) {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        log::warn!("{}", e);
                        return Vec::new();
                    }
                };
                let node_ticket = match pools.nodes.acquire() {
                    Ok(t) => t,
                    Err(e) => {
                        log::warn!("{}", e);
                        return Vec::new();
                    }
                };
                let stat = node.stat().unwrap_or(0);
                let range_owned = Owned::new(Node::new_range(lo, hi, data, stat, Atomic::from(parent), storage.clone(), node_ticket));
                match try_replace(parent_slot_of(b, root, guard), b, range_owned, guard) {
                    Ok(installed) => (installed, storage),
                    Err(_) => continue,
                }
            }
            None => {
                help_if_needed(root, b, pools, guard);
                continue;
            }
        };

        match sweep(root, range_b, storage, stack, hi, pools, guard) {
            Some(result) => return result,
            None => continue,
        }
    }
}

/// Walks right from `first` pinning every leaf in `[lo, hi]` under the same `storage`, then
/// publishes the concatenated result. Returns `None` to signal the caller should restart the
/// whole query from the root.
fn sweep<'g>(
    root: &'g Atomic<Node>,
    first: Shared<'g, Node>,
    storage: Arc<ResultStore>,
    mut stack: Vec<StackFrame<'g>>,
    hi: i64,
    pools: &Pools,
    guard: &'g Guard,
) -> Option<Vec<i64>> {
    let mut visited: Vec<Shared<'g, Node>> = vec![first];
    let mut cur = first;

    loop {
        let r = unsafe { cur.deref() }.as_range().expect("sweep only visits range bases");
        if r.data.treap.is_empty() || r.data.treap.max_key().map_or(true, |mk| mk >= hi) {
            break;
        }

        let next = match find_next_base_via_stack(&mut stack, guard) {
            Ok(Some(n)) => n,
            Ok(None) => break,
            Err(()) => return None,
        };
        let next_node = unsafe { next.deref() };

        if let Some(nr) = next_node.as_range() {
            if Arc::ptr_eq(&nr.storage, &storage) {
                visited.push(next);
                cur = next;
                continue;
            }
        }
        if storage.is_set(guard) {
            return Some(storage.get(guard).to_vec());
        }
        if !replaceable(next_node, guard) {
            help_if_needed(root, next, pools, guard);
            return None;
        }

        let data = next_node.data().expect("replaceable base-like node carries data").clone();
        let parent = next_node.parent().map(|p| p.load(Acquire, guard)).unwrap_or(Shared::null());
        let ticket = match pools.nodes.acquire() {
            Ok(t) => t,
            Err(e) => {
                log::warn!("{}", e);
                return None;
            }
        };
        let stat = next_node.stat().unwrap_or(0);
        let range_owned = Owned::new(Node::new_range(i64::MIN, hi, data, stat, Atomic::from(parent), storage.clone(), ticket));
        match try_replace(parent_slot_of(next, root, guard), next, range_owned, guard) {
            Ok(installed) => {
                visited.push(installed);
                cur = installed;
            }
            Err(_) => return None,
        }
    }

    if storage.is_set(guard) {
        return Some(storage.get(guard).to_vec());
    }

    let mut combined = Vec::new();
    for v in &visited {
        let rn = unsafe { v.deref() }.as_range().expect("visited entries are all range bases");
        combined.extend(rn.data.treap.range(rn.lo, rn.hi));
    }
    let published = storage.try_publish(combined, guard);
    if visited.len() > 1 {
        storage.set_more_than_one_base();
    }
    Some(published.to_vec())
}

/// Finds the next base to the right of wherever `stack` currently points, by walking up to the
/// first route entered via its left child and descending leftmost through that route's right
/// subtree — the mirror image of `find_base`'s left-inclusive descent. `Err(())` means a route
/// along the way was invalidated by a concurrent join; the caller must restart from the root.
fn find_next_base_via_stack<'g>(
    stack: &mut Vec<StackFrame<'g>>,
    guard: &'g Guard,
) -> Result<Option<Shared<'g, Node>>, ()> {
    while let Some(frame) = stack.pop() {
        let route = unsafe { frame.route.deref() }.as_route().expect("stack frames are always routes");
        if !route.valid.load(Acquire, guard) {
            return Err(());
        }
        if frame.dir != Dir::Left {
            continue;
        }
        let mut cur = route.right.load(Acquire, guard);
        loop {
            match unsafe { cur.deref() } {
                Node::Route(r) => {
                    if !r.valid.load(Acquire, guard) {
                        return Err(());
                    }
                    stack.push(StackFrame { route: cur, dir: Dir::Left });
                    cur = r.left.load(Acquire, guard);
                }
                _ => return Ok(Some(cur)),
            }
        }
    }
    Ok(None)
}
