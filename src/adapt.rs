//! Split and join: the two background adaptations that reshape the tree under contention.
//!
//! Both protocols are triggered from `crate::tree::adapt_if_needed` after a successful point-op
//! CAS, but either can be driven to completion by any other thread via `help_if_needed` — the
//! lock-free progress guarantee rests on this helping, not on the triggering thread surviving.

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::Ordering::{Acquire, AcqRel, Release};

use crate::config::TREAP_CAPACITY;
use crate::node::{neigh2, neigh2_aborted_shared, neigh2_preparing_shared, Dir, JoinMain, Node};
use crate::pool::Pools;
use crate::treap::{PooledTreap, Treap};
use crate::tree::{parent_slot_of, try_replace, try_replace_shared};

/// Converts a `Shared` that was built (via `Owned::into_shared`) but never successfully linked
/// into the tree back into an `Owned` so it drops normally. Only valid when the caller knows no
/// other thread can possibly have observed `ptr`.
unsafe fn reclaim_shared(ptr: Shared<'_, Node>) {
    if !ptr.is_null() {
        drop(ptr.into_owned());
    }
}

fn leftmost_leaf<'g>(mut cur: Shared<'g, Node>, guard: &'g Guard) -> Shared<'g, Node> {
    loop {
        match unsafe { cur.deref() } {
            Node::Route(r) => cur = r.left.load(Acquire, guard),
            _ => return cur,
        }
    }
}

fn rightmost_leaf<'g>(mut cur: Shared<'g, Node>, guard: &'g Guard) -> Shared<'g, Node> {
    loop {
        match unsafe { cur.deref() } {
            Node::Route(r) => cur = r.right.load(Acquire, guard),
            _ => return cur,
        }
    }
}

/// Replaces a base `b` with size `>= 2` with a fresh route and two half-size base children, via
/// one CAS on `b`'s parent slot. No-ops (silently) on any lost race or pool exhaustion — some
/// other operation will see the same contention and retry the split.
pub fn high_contention_split<'g>(root: &'g Atomic<Node>, b: Shared<'g, Node>, pools: &Pools, guard: &'g Guard) {
    let base = match unsafe { b.deref() }.as_base() {
        Some(base) => base,
        None => return,
    };
    if base.data.treap.size() < 2 {
        return;
    }
    let (split_key, lt, rt) = match base.data.treap.split() {
        Some(x) => x,
        None => return,
    };

    let (lt_pooled, rt_pooled) = match (
        PooledTreap::alloc(&pools.treaps, lt),
        PooledTreap::alloc(&pools.treaps, rt),
    ) {
        (Ok(l), Ok(r)) => (l, r),
        _ => {
            log::warn!("treap pool exhausted, abandoning split");
            return;
        }
    };
    let (route_ticket, left_ticket, right_ticket) =
        match (pools.nodes.acquire(), pools.nodes.acquire(), pools.nodes.acquire()) {
            (Ok(a), Ok(b), Ok(c)) => (a, b, c),
            _ => {
                log::warn!("node pool exhausted, abandoning split");
                return;
            }
        };

    let route_shared = Owned::new(Node::new_route(split_key, Atomic::null(), Atomic::null(), route_ticket))
        .into_shared(guard);
    let left_shared =
        Owned::new(Node::new_base(lt_pooled, 0, Atomic::from(route_shared), left_ticket)).into_shared(guard);
    let right_shared =
        Owned::new(Node::new_base(rt_pooled, 0, Atomic::from(route_shared), right_ticket)).into_shared(guard);
    let route = unsafe { route_shared.deref() }.as_route().unwrap();
    route.left.store(left_shared, Release);
    route.right.store(right_shared, Release);

    if !try_replace_shared(parent_slot_of(b, root, guard), b, route_shared, guard) {
        log::debug!("lost race installing split, discarding speculative subtree");
        unsafe {
            reclaim_shared(left_shared);
            reclaim_shared(right_shared);
            reclaim_shared(route_shared);
        }
    }
}

/// Clears whatever of `p.join_id` / `g.join_id` / `m.neigh2` this join-main still holds. Safe to
/// call from any point after `m` is installed in the tree: every clear is itself a guarded CAS,
/// so a clear for a link that was never set (or already cleared by a helper) is a harmless no-op.
fn back_out<'g>(
    m: &JoinMain,
    m_shared: Shared<'g, Node>,
    p_route: &crate::node::Route,
    g: Option<Shared<'g, Node>>,
    guard: &'g Guard,
) {
    let _ = m
        .neigh2
        .compare_exchange(neigh2_preparing_shared(), neigh2_aborted_shared(), AcqRel, Acquire, guard);
    let _ = p_route.join_id.compare_exchange(m_shared, Shared::null(), AcqRel, Acquire, guard);
    if let Some(g_shared) = g {
        if let Some(g_route) = unsafe { g_shared.deref() }.as_route() {
            let _ = g_route
                .join_id
                .compare_exchange(m_shared, Shared::null(), AcqRel, Acquire, guard);
        }
    }
}

/// Attempts to merge a cold base `b` with its nearest sibling base. Direction (left/right case)
/// is determined by whether `b` is its parent's left or right child; every failure path aborts
/// silently — a join is a heuristic optimization, never required for correctness.
pub fn low_contention_join<'g>(root: &'g Atomic<Node>, b: Shared<'g, Node>, pools: &Pools, guard: &'g Guard) {
    let base = match unsafe { b.deref() }.as_base() {
        Some(base) => base,
        None => return,
    };
    let parent_shared = base.parent.load(Acquire, guard);
    if parent_shared.is_null() {
        return; // b is the tree root; nothing to join with.
    }
    let p = unsafe { parent_shared.deref() }
        .as_route()
        .expect("base's parent must be a route");

    let dir = if p.left.load(Acquire, guard) == b {
        Dir::Left
    } else {
        Dir::Right
    };
    let (near_slot, far_slot) = match dir {
        Dir::Left => (&p.left, &p.right),
        Dir::Right => (&p.right, &p.left),
    };

    // 1. Locate the nearest neighbor base on the far side.
    let far_root = far_slot.load(Acquire, guard);
    if far_root.is_null() {
        return;
    }
    let n0 = match dir {
        Dir::Left => leftmost_leaf(far_root, guard),
        Dir::Right => rightmost_leaf(far_root, guard),
    };
    let n0_node = unsafe { n0.deref() };

    // 2. Feasibility.
    if !crate::tree::replaceable(n0_node, guard) {
        return;
    }
    let n0_data = match n0_node.data() {
        Some(d) => d,
        None => return,
    };
    if base.data.treap.size() + n0_data.treap.size() > TREAP_CAPACITY {
        return;
    }

    // 3. Install join_main m in place of b.
    let m_ticket = match pools.nodes.acquire() {
        Ok(t) => t,
        Err(e) => {
            log::warn!("{}", e);
            return;
        }
    };
    let m_owned = Owned::new(Node::new_join_main(base.data.clone(), base.stat, Atomic::from(parent_shared), m_ticket));
    let m_shared = match try_replace(near_slot, b, m_owned, guard) {
        Ok(s) => s,
        Err(_) => return,
    };
    let m = unsafe { m_shared.deref() }.as_join_main().unwrap();

    // 4. Install join_neighbor n1 in place of n0.
    let n0_parent_slot = parent_slot_of(n0, root, guard);
    let n0_parent = n0_node
        .parent()
        .map(|p| p.load(Acquire, guard))
        .unwrap_or(Shared::null());
    let n1_ticket = match pools.nodes.acquire() {
        Ok(t) => t,
        Err(e) => {
            log::warn!("{}", e);
            back_out(m, m_shared, p, None, guard);
            return;
        }
    };
    let n1_owned = Owned::new(Node::new_join_neighbor(
        n0_data.clone(),
        n0_node.stat().unwrap_or(0),
        Atomic::from(n0_parent),
        Atomic::from(m_shared),
        n1_ticket,
    ));
    let n1_shared = match try_replace(n0_parent_slot, n0, n1_owned, guard) {
        Ok(s) => s,
        Err(_) => {
            back_out(m, m_shared, p, None, guard);
            return;
        }
    };

    // 5. Claim p.join_id.
    if p.join_id.compare_exchange(Shared::null(), m_shared, AcqRel, Acquire, guard).is_err() {
        back_out(m, m_shared, p, None, guard);
        return;
    }

    // 6. Locate and claim g.join_id (g = parent_of(p)).
    let g = match crate::adapt::parent_of(root, parent_shared, p.key, guard) {
        ParentLookup::NotFound => {
            back_out(m, m_shared, p, None, guard);
            return;
        }
        ParentLookup::Root => None,
        ParentLookup::Parent(g_shared) => {
            let g_route = unsafe { g_shared.deref() }.as_route().unwrap();
            if g_route
                .join_id
                .compare_exchange(Shared::null(), m_shared, AcqRel, Acquire, guard)
                .is_err()
            {
                back_out(m, m_shared, p, None, guard);
                return;
            }
            Some(g_shared)
        }
    };
    m.gparent.store(g.unwrap_or(Shared::null()), Release);

    // 7. Record otherb / neigh1.
    let otherb = far_slot.load(Acquire, guard);
    m.otherb.store(otherb, Release);
    m.neigh1.store(n1_shared, Release);

    // 8/9. Build the merged base and determine where it will end up.
    let merged_treap = match dir {
        Dir::Left => Treap::merge(&base.data.treap, &n0_data.treap),
        Dir::Right => Treap::merge(&n0_data.treap, &base.data.treap),
    };
    let merged_pooled = match PooledTreap::alloc(&pools.treaps, merged_treap) {
        Ok(t) => t,
        Err(e) => {
            log::warn!("{}", e);
            back_out(m, m_shared, p, g, guard);
            return;
        }
    };
    let joinedp = if otherb == n1_shared {
        g.unwrap_or(Shared::null())
    } else {
        unsafe { n1_shared.deref() }
            .parent()
            .map(|p| p.load(Acquire, guard))
            .unwrap_or(Shared::null())
    };
    let n2_ticket = match pools.nodes.acquire() {
        Ok(t) => t,
        Err(e) => {
            log::warn!("{}", e);
            back_out(m, m_shared, p, g, guard);
            return;
        }
    };
    // The merged base is a fresh base in all but name, so its contention history starts over,
    // the same as a freshly split base's.
    let n2_shared = Owned::new(Node::new_join_neighbor(
        merged_pooled,
        0,
        Atomic::from(joinedp),
        Atomic::from(m_shared),
        n2_ticket,
    ))
    .into_shared(guard);

    // 10. Publish n2 by swinging neigh2 from PREPARING to the merged base.
    match m.neigh2.compare_exchange(
        neigh2_preparing_shared(),
        n2_shared.with_tag(neigh2::INSTALLED),
        AcqRel,
        Acquire,
        guard,
    ) {
        Ok(_) => complete_join(root, m_shared, guard),
        Err(_) => {
            unsafe { reclaim_shared(n2_shared) };
            back_out(m, m_shared, p, g, guard);
        }
    }
}

/// Idempotent: safe for any thread to call once `m.neigh2` holds an installed merged base.
/// Swings the neighbor's own parent slot to the merged base, invalidates the spanned route, and
/// swings the route's own parent (or the tree root) to whatever survives in its place.
pub fn complete_join<'g>(root: &'g Atomic<Node>, m_shared: Shared<'g, Node>, guard: &'g Guard) {
    let m = unsafe { m_shared.deref() }.as_join_main().expect("complete_join on non-join_main");
    let (tag, n2) = crate::node::neigh2_tag(&m.neigh2, guard);
    if tag == neigh2::DONE {
        return;
    }
    debug_assert!(tag == neigh2::INSTALLED, "complete_join called before neigh2 installed");

    // `n2` is a back-reference shared with every concurrent caller of `complete_join` for this
    // join (read from `m.neigh2`, not freshly allocated here), so the swing below must not take
    // ownership of it the way a freshly built replacement would: a losing helper must leave it
    // alone rather than free what the winner just installed.
    let n1 = m.neigh1.load(Acquire, guard);
    let _ = try_replace_shared(parent_slot_of(n1, root, guard), n1, n2, guard);
    // Losing the race above just means a helper already completed this step; either way n2 ends
    // up installed, so press on regardless of the return value.

    let p_shared = m.parent.load(Acquire, guard);
    let p = unsafe { p_shared.deref() }.as_route().expect("join_main.parent must be a route");
    p.valid.store(false, Release);

    let otherb = m.otherb.load(Acquire, guard);
    let repl = if otherb == n1 { n2 } else { otherb };

    // p and m are garbage once `repl` takes p's place; only the thread that actually wins the
    // swing retires them, so a losing helper doesn't double-retire what the winner already did.
    let g = m.gparent.load(Acquire, guard);
    let won_swing = if g.is_null() {
        root.compare_exchange(p_shared, repl, AcqRel, Acquire, guard).is_ok()
    } else {
        let g_route = unsafe { g.deref() }.as_route().expect("gparent must be a route");
        let slot = if g_route.left.load(Acquire, guard) == p_shared {
            &g_route.left
        } else {
            &g_route.right
        };
        let won = slot.compare_exchange(p_shared, repl, AcqRel, Acquire, guard).is_ok();
        if won {
            let _ = g_route
                .join_id
                .compare_exchange(m_shared, Shared::null(), AcqRel, Acquire, guard);
        }
        won
    };
    if won_swing {
        unsafe {
            guard.defer_destroy(p_shared);
            guard.defer_destroy(m_shared);
        }
    }

    let _ = m.neigh2.compare_exchange(n2, n2.with_tag(neigh2::DONE), AcqRel, Acquire, guard);
}

/// Re-descends from `root` using `target`'s split key to find its current parent, for the route
/// node `target` (joins re-locate `g = parent_of(p)` this way since `p` itself carries no back
/// pointer of its own — only base-like nodes do).
pub fn parent_of<'g>(root: &'g Atomic<Node>, target: Shared<'g, Node>, target_key: i64, guard: &'g Guard) -> ParentLookup<'g> {
    let mut cur = root.load(Acquire, guard);
    if cur == target {
        return ParentLookup::Root;
    }
    loop {
        match unsafe { cur.deref() } {
            Node::Route(r) => {
                let child = if target_key <= r.key {
                    r.left.load(Acquire, guard)
                } else {
                    r.right.load(Acquire, guard)
                };
                if child == target {
                    return ParentLookup::Parent(cur);
                }
                if child.is_null() {
                    return ParentLookup::NotFound;
                }
                cur = child;
            }
            _ => return ParentLookup::NotFound,
        }
    }
}

pub enum ParentLookup<'g> {
    /// `target` is currently the tree root.
    Root,
    /// `target` is reachable; this is its current parent route.
    Parent(Shared<'g, Node>),
    /// `target` is no longer reachable along its own key path (already replaced elsewhere).
    NotFound,
}
