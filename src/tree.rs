//! The lock-free tree engine: descent, the shared insert/remove update loop, and the
//! CAS-based parent-pointer swing that publishes a replacement base.
//!
//! Every public operation pins an epoch guard for its duration and retries from the root on a
//! lost race; see `crate::adapt` for what happens once a base's `stat` crosses a threshold and
//! `crate::range` for the snapshot-consistent range-query protocol that shares this module's
//! descent and swing primitives.

use std::sync::atomic::Ordering::{Acquire, AcqRel};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::adapt::{high_contention_split, low_contention_join};
use crate::config::TREAP_CAPACITY;
use crate::node::{Dir, Node, StackFrame};
use crate::pool::Pools;
use crate::stats::{decide, new_stat, AdaptDecision, Contention};
use crate::treap::{PooledTreap, Treap, TreapError};

/// Descends from `root`, choosing `left` at a route iff `key <= route.key` (left-inclusive, per
/// the chosen descent convention — see `find_next_base_via_stack` in `crate::range` for the one
/// other place this convention must agree).
pub fn find_base<'g>(root: &'g Atomic<Node>, key: i64, guard: &'g Guard) -> Shared<'g, Node> {
    let mut cur = root.load(Acquire, guard);
    loop {
        match unsafe { cur.deref() } {
            Node::Route(r) => {
                cur = if key <= r.key {
                    r.left.load(Acquire, guard)
                } else {
                    r.right.load(Acquire, guard)
                };
            }
            _ => return cur,
        }
    }
}

/// Same descent as [`find_base`], recording each visited route and which child was taken onto
/// `stack` — the breadcrumb trail `crate::range`'s sweep uses to find the next leaf.
pub fn find_base_with_stack<'g>(
    root: &'g Atomic<Node>,
    key: i64,
    guard: &'g Guard,
    stack: &mut Vec<StackFrame<'g>>,
) -> Shared<'g, Node> {
    stack.clear();
    let mut cur = root.load(Acquire, guard);
    loop {
        match unsafe { cur.deref() } {
            Node::Route(r) => {
                let (dir, next) = if key <= r.key {
                    (Dir::Left, r.left.load(Acquire, guard))
                } else {
                    (Dir::Right, r.right.load(Acquire, guard))
                };
                stack.push(StackFrame { route: cur, dir });
                cur = next;
            }
            _ => return cur,
        }
    }
}

/// Whether `n` may be swapped out by a plain single-CAS parent-slot swing right now.
pub fn replaceable<'g>(n: &Node, guard: &'g Guard) -> bool {
    match n {
        Node::Base(_) => true,
        Node::JoinMain(m) => crate::node::neigh2_tag(&m.neigh2, guard).0 == crate::node::neigh2::ABORTED,
        Node::JoinNeighbor(jn) => {
            let main = jn.main_node.load(Acquire, guard);
            if main.is_null() {
                return false;
            }
            match unsafe { main.deref() }.as_join_main() {
                Some(m) => {
                    let tag = crate::node::neigh2_tag(&m.neigh2, guard).0;
                    tag == crate::node::neigh2::ABORTED || tag == crate::node::neigh2::DONE
                }
                None => false,
            }
        }
        Node::Range(r) => r.storage.is_set(guard),
        Node::Route(_) => false,
    }
}

/// The atomic slot that currently holds `b`: either `root` itself, or whichever child field of
/// `b`'s parent route currently points at it. Resolved by pointer identity, never by key, so a
/// concurrent rotation above `b` can't steer us at the wrong slot.
pub fn parent_slot_of<'g>(b: Shared<'g, Node>, root: &'g Atomic<Node>, guard: &'g Guard) -> &'g Atomic<Node> {
    let node = unsafe { b.deref() };
    let parent_atomic = match node.parent() {
        Some(p) => p,
        None => return root,
    };
    let parent_shared = parent_atomic.load(Acquire, guard);
    if parent_shared.is_null() {
        return root;
    }
    let route = unsafe { parent_shared.deref() }
        .as_route()
        .expect("base-like node's parent must be a route");
    if route.left.load(Acquire, guard) == b {
        &route.left
    } else {
        &route.right
    }
}

/// Single-node CAS swing: attempts to install `new` in place of `old` in `slot`. On success,
/// epoch-retires `old`. On failure, hands `new` back so the caller can inspect or drop it.
pub fn try_replace<'g>(
    slot: &Atomic<Node>,
    old: Shared<'g, Node>,
    new: Owned<Node>,
    guard: &'g Guard,
) -> Result<Shared<'g, Node>, Owned<Node>> {
    match slot.compare_exchange(old, new, AcqRel, Acquire, guard) {
        Ok(installed) => {
            if !old.is_null() {
                unsafe { guard.defer_destroy(old) };
            }
            Ok(installed)
        }
        Err(e) => Err(e.new),
    }
}

/// Multi-node CAS swing (used by `high_contention_split` to install a whole route+children
/// subtree at once). `new` must not yet be reachable from any other thread; on failure the
/// caller is responsible for reclaiming the subtree it built (see `crate::adapt::reclaim_shared`).
pub fn try_replace_shared<'g>(
    slot: &Atomic<Node>,
    old: Shared<'g, Node>,
    new: Shared<'g, Node>,
    guard: &'g Guard,
) -> bool {
    match slot.compare_exchange(old, new, AcqRel, Acquire, guard) {
        Ok(_) => {
            if !old.is_null() {
                unsafe { guard.defer_destroy(old) };
            }
            true
        }
        Err(_) => false,
    }
}

/// Dispatches on `n`'s variant to make progress on whatever adaptation or range query currently
/// owns it, so that a point operation blocked behind it can retry with a chance of succeeding.
pub fn help_if_needed<'g>(root: &'g Atomic<Node>, n: Shared<'g, Node>, pools: &Pools, guard: &'g Guard) {
    match unsafe { n.deref() } {
        Node::JoinNeighbor(jn) => {
            let main = jn.main_node.load(Acquire, guard);
            if !main.is_null() {
                help_if_needed(root, main, pools, guard);
            }
        }
        Node::JoinMain(m) => {
            let (tag, _) = crate::node::neigh2_tag(&m.neigh2, guard);
            if tag == crate::node::neigh2::PREPARING {
                let _ = m.neigh2.compare_exchange(
                    crate::node::neigh2_preparing_shared(),
                    crate::node::neigh2_aborted_shared(),
                    AcqRel,
                    Acquire,
                    guard,
                );
            } else if tag >= crate::node::neigh2::INSTALLED {
                crate::adapt::complete_join(root, n, guard);
            }
        }
        Node::Range(r) => {
            if !r.storage.is_set(guard) {
                let _ = crate::range::all_in_range(root, r.lo, r.hi, Some(r.storage.clone()), pools, guard);
            }
        }
        _ => {}
    }
}

/// Runs `adapt_if_needed` after a successful point-operation CAS: no-ops unless the freshly
/// installed base has crossed a split or join threshold.
pub fn adapt_if_needed<'g>(root: &'g Atomic<Node>, b: Shared<'g, Node>, pools: &Pools, guard: &'g Guard) {
    let node = unsafe { b.deref() };
    if !replaceable(node, guard) {
        return;
    }
    let base = match node.as_base() {
        Some(base) => base,
        None => return,
    };
    match decide(base) {
        AdaptDecision::Split => {
            log::debug!("base stat={} over split threshold, splitting", base.stat);
            high_contention_split(root, b, pools, guard);
        }
        AdaptDecision::Join => {
            log::debug!("base stat={} under join threshold, attempting join", base.stat);
            low_contention_join(root, b, pools, guard);
        }
        AdaptDecision::None => {}
    }
}

/// Shared insert/remove loop. `op` is applied to the current base's treap; it returns the
/// replacement treap and the bool the public API reports back to the caller.
fn do_update<'g>(
    root: &'g Atomic<Node>,
    key: i64,
    pools: &Pools,
    guard: &'g Guard,
    is_insert: bool,
    op: impl Fn(&Treap, i64) -> (Treap, bool),
) -> bool {
    let mut contention = Contention::Uncontended;
    loop {
        let b = find_base(root, key, guard);
        let node = unsafe { b.deref() };

        if is_insert {
            if let Some(base) = node.as_base() {
                if base.data.treap.size() == TREAP_CAPACITY && !base.data.treap.contains(key) {
                    high_contention_split(root, b, pools, guard);
                    continue;
                }
            }
        }

        if replaceable(node, guard) {
            let data = node.data().expect("replaceable node always carries data");
            let (new_treap, out) = op(&data.treap, key);
            match PooledTreap::alloc(&pools.treaps, new_treap) {
                Ok(new_data) => match pools.nodes.acquire() {
                    Ok(ticket) => {
                        let stat = new_stat(node, contention);
                        let parent = node.parent().map(|p| p.load(Acquire, guard)).unwrap_or(Shared::null());
                        let newb = Owned::new(Node::new_base(new_data, stat, Atomic::from(parent), ticket));
                        match try_replace(parent_slot_of(b, root, guard), b, newb, guard) {
                            Ok(installed) => {
                                adapt_if_needed(root, installed, pools, guard);
                                return out;
                            }
                            Err(_) => {}
                        }
                    }
                    Err(e) => panic!("{}", e),
                },
                Err(e) => panic!("{}", e),
            }
        }

        contention = Contention::Contended;
        help_if_needed(root, b, pools, guard);
    }
}

/// `insert(key)`: returns `true` iff `key` was newly added.
pub fn insert<'g>(root: &'g Atomic<Node>, key: i64, pools: &Pools, guard: &'g Guard) -> bool {
    do_update(root, key, pools, guard, true, |t, k| {
        t.insert(k).unwrap_or_else(|e: TreapError| panic!("insert routed into a full treap: {:?}", e))
    })
}

/// `remove(key)`: returns `true` iff `key` was present and removed.
pub fn remove<'g>(root: &'g Atomic<Node>, key: i64, pools: &Pools, guard: &'g Guard) -> bool {
    do_update(root, key, pools, guard, false, |t, k| t.remove(k))
}

/// `lookup(key)`: never waits, never adapts, never publishes.
pub fn lookup<'g>(root: &'g Atomic<Node>, key: i64, guard: &'g Guard) -> bool {
    let b = find_base(root, key, guard);
    unsafe { b.deref() }
        .data()
        .map(|d| d.treap.contains(key))
        .unwrap_or(false)
}
