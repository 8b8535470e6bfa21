//! The tagged node representation backing the tree engine.
//!
//! Rather than the packed single-struct-with-ignored-fields layout the reference implementation
//! uses, this port leans on Rust's sum types: `Node` is an enum over the five variants, each its
//! own struct holding only the fields that variant actually uses. Every cross-node pointer —
//! owning or not — is a `crossbeam_epoch::Atomic<Node>`; ownership is a convention enforced by
//! which call sites are allowed to `defer_destroy` a value, not by the type system (the same
//! convention `scc`'s `TreeIndex` and the `circ`-based lock-free trees in this crate's reference
//! pool use for their `parent`/back-reference fields).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Shared};

use crate::pool::PoolTicket;
use crate::treap::PooledTreap;

/// Left/right child selector, used by the range-query stack to remember how it descended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dir {
    Left,
    Right,
}

pub struct Route {
    pub key: i64,
    pub left: Atomic<Node>,
    pub right: Atomic<Node>,
    /// Monotonic true -> false transition performed once, by the join that retires this route.
    pub valid: AtomicBool,
    /// Non-null only while a single `JoinMain` owns an adaptation spanning this route.
    pub join_id: Atomic<Node>,
    _ticket: PoolTicket,
}

pub struct Base {
    pub data: Arc<PooledTreap>,
    /// Fixed at construction time; never mutated in place — a replacement base is always built
    /// fresh and swung in via CAS rather than having its `stat` updated under the old node.
    pub stat: i32,
    /// Non-owning back-reference to the route this base currently hangs off of, or `None` if it
    /// is (or was, at construction time) the tree root.
    pub parent: Atomic<Node>,
    _ticket: PoolTicket,
}

/// Encodes `neigh2`'s four-state sentinel protocol (`PREPARING`/`ABORTED`/installed/`DONE`) as
/// tag bits on an otherwise-ordinary `Atomic<Node>`.
pub mod neigh2 {
    pub const PREPARING: usize = 0;
    pub const ABORTED: usize = 1;
    pub const INSTALLED: usize = 2;
    pub const DONE: usize = 3;
}

pub struct JoinMain {
    pub data: Arc<PooledTreap>,
    /// Carried over from the base this join-main replaced, so contention accounting doesn't
    /// reset just because a join was attempted (successfully or not) in the meantime.
    pub stat: i32,
    pub parent: Atomic<Node>,
    /// The sibling base being joined with, recast as a `JoinNeighbor`.
    pub neigh1: Atomic<Node>,
    /// Tag-encoded state machine; see the `neigh2` module.
    pub neigh2: Atomic<Node>,
    pub gparent: Atomic<Node>,
    /// The child of `parent` that was *not* this base (kept so `complete_join` can restore it).
    pub otherb: Atomic<Node>,
    _ticket: PoolTicket,
}

pub struct JoinNeighbor {
    pub data: Arc<PooledTreap>,
    /// Carried over from the base this join-neighbor replaced; see `JoinMain::stat`.
    pub stat: i32,
    pub parent: Atomic<Node>,
    pub main_node: Atomic<Node>,
    _ticket: PoolTicket,
}

pub struct Range {
    pub lo: i64,
    pub hi: i64,
    pub data: Arc<PooledTreap>,
    /// Carried over from the base this range node replaced; see `JoinMain::stat`.
    pub stat: i32,
    pub parent: Atomic<Node>,
    pub storage: Arc<ResultStore>,
    _ticket: PoolTicket,
}

pub enum Node {
    Route(Route),
    Base(Base),
    JoinMain(JoinMain),
    JoinNeighbor(JoinNeighbor),
    Range(Range),
}

impl Node {
    pub fn new_route(key: i64, left: Atomic<Node>, right: Atomic<Node>, ticket: PoolTicket) -> Node {
        Node::Route(Route {
            key,
            left,
            right,
            valid: AtomicBool::new(true),
            join_id: Atomic::null(),
            _ticket: ticket,
        })
    }

    pub fn new_base(data: Arc<PooledTreap>, stat: i32, parent: Atomic<Node>, ticket: PoolTicket) -> Node {
        Node::Base(Base {
            data,
            stat,
            parent,
            _ticket: ticket,
        })
    }

    pub fn new_join_main(
        data: Arc<PooledTreap>,
        stat: i32,
        parent: Atomic<Node>,
        ticket: PoolTicket,
    ) -> Node {
        Node::JoinMain(JoinMain {
            data,
            stat,
            parent,
            neigh1: Atomic::null(),
            neigh2: neigh2_preparing(),
            gparent: Atomic::null(),
            otherb: Atomic::null(),
            _ticket: ticket,
        })
    }

    pub fn new_join_neighbor(
        data: Arc<PooledTreap>,
        stat: i32,
        parent: Atomic<Node>,
        main_node: Atomic<Node>,
        ticket: PoolTicket,
    ) -> Node {
        Node::JoinNeighbor(JoinNeighbor {
            data,
            stat,
            parent,
            main_node,
            _ticket: ticket,
        })
    }

    pub fn new_range(
        lo: i64,
        hi: i64,
        data: Arc<PooledTreap>,
        stat: i32,
        parent: Atomic<Node>,
        storage: Arc<ResultStore>,
        ticket: PoolTicket,
    ) -> Node {
        Node::Range(Range {
            lo,
            hi,
            data,
            stat,
            parent,
            storage,
            _ticket: ticket,
        })
    }

    pub fn as_route(&self) -> Option<&Route> {
        match self {
            Node::Route(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_base(&self) -> Option<&Base> {
        match self {
            Node::Base(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_join_main(&self) -> Option<&JoinMain> {
        match self {
            Node::JoinMain(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_join_neighbor(&self) -> Option<&JoinNeighbor> {
        match self {
            Node::JoinNeighbor(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<&Range> {
        match self {
            Node::Range(r) => Some(r),
            _ => None,
        }
    }

    /// Short tag used in log messages; never exposed as a public discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Route(_) => "route",
            Node::Base(_) => "base",
            Node::JoinMain(_) => "join_main",
            Node::JoinNeighbor(_) => "join_neighbor",
            Node::Range(_) => "range",
        }
    }

    /// The treap snapshot pinned at this node, for every variant except `Route`.
    pub fn data(&self) -> Option<&Arc<PooledTreap>> {
        match self {
            Node::Base(b) => Some(&b.data),
            Node::JoinMain(m) => Some(&m.data),
            Node::JoinNeighbor(n) => Some(&n.data),
            Node::Range(r) => Some(&r.data),
            Node::Route(_) => None,
        }
    }

    /// The non-owning back-reference to this node's current parent route, for every
    /// variant except `Route` (routes are never replaced by the simple-CAS path and so never
    /// need a `parent` of their own in this protocol).
    pub fn parent(&self) -> Option<&Atomic<Node>> {
        match self {
            Node::Base(b) => Some(&b.parent),
            Node::JoinMain(m) => Some(&m.parent),
            Node::JoinNeighbor(n) => Some(&n.parent),
            Node::Range(r) => Some(&r.parent),
            Node::Route(_) => None,
        }
    }

    /// Every base-like variant carries `stat` forward from whatever it replaced, so a point
    /// operation that happens to land on a `Range`/`JoinMain`/`JoinNeighbor` node doesn't reset
    /// its contention history just because an unrelated range query or join touched it.
    pub fn stat(&self) -> Option<i32> {
        match self {
            Node::Base(b) => Some(b.stat),
            Node::JoinMain(m) => Some(m.stat),
            Node::JoinNeighbor(n) => Some(n.stat),
            Node::Range(r) => Some(r.stat),
            Node::Route(_) => None,
        }
    }
}

/// Per-range-query shared publication slot.
///
/// `result` starts `null` ("NOT_SET"); once a thread successfully CASes in a `ResultCell`, it is
/// immutable and every range node sharing this `ResultStore` observes the same vector.
pub struct ResultStore {
    result: Atomic<ResultCell>,
    more_than_one_base: AtomicBool,
    _ticket: PoolTicket,
}

pub struct ResultCell(pub Vec<i64>);

impl ResultStore {
    pub fn alloc(pool: &Arc<crate::pool::Pool>) -> Result<ResultStore, crate::error::Error> {
        let ticket = pool.acquire()?;
        Ok(ResultStore {
            result: Atomic::null(),
            more_than_one_base: AtomicBool::new(false),
            _ticket: ticket,
        })
    }

    pub fn is_set<'g>(&self, guard: &'g Guard) -> bool {
        !self.result.load(Ordering::Acquire, guard).is_null()
    }

    /// Reads the published result. Panics if called before publication; callers must check
    /// [`Self::is_set`] (or rely on a successful `try_publish`) first.
    pub fn get<'g>(&self, guard: &'g Guard) -> &'g [i64] {
        let shared = self.result.load(Ordering::Acquire, guard);
        assert!(!shared.is_null(), "ResultStore::get before publication");
        &unsafe { shared.deref() }.0
    }

    /// Attempts to publish `keys` as the query's final answer. Returns the winning, already
    /// globally-visible result either way (ours if we won the race, the other thread's if not).
    pub fn try_publish<'g>(&self, keys: Vec<i64>, guard: &'g Guard) -> &'g [i64] {
        let new = crossbeam_epoch::Owned::new(ResultCell(keys));
        match self
            .result
            .compare_exchange(Shared::null(), new, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => &unsafe { installed.deref() }.0,
            Err(e) => {
                // lost the race; drop our own vector and defer to the winner
                drop(e.new);
                &unsafe { self.result.load(Ordering::Acquire, guard).deref() }.0
            }
        }
    }

    pub fn set_more_than_one_base(&self) {
        self.more_than_one_base.store(true, Ordering::Relaxed);
    }

    pub fn more_than_one_base(&self) -> bool {
        self.more_than_one_base.load(Ordering::Relaxed)
    }
}

/// A frame recorded by `find_base_with_stack`: the route visited and which child was taken.
pub struct StackFrame<'g> {
    pub route: Shared<'g, Node>,
    pub dir: Dir,
}

pub fn route_child<'g>(route: &Route, dir: Dir, guard: &'g Guard) -> Shared<'g, Node> {
    match dir {
        Dir::Left => route.left.load(Ordering::Acquire, guard),
        Dir::Right => route.right.load(Ordering::Acquire, guard),
    }
}

pub fn route_child_slot(route: &Route, dir: Dir) -> &Atomic<Node> {
    match dir {
        Dir::Left => &route.left,
        Dir::Right => &route.right,
    }
}

// neigh2 tag helpers ------------------------------------------------------------------------

pub fn neigh2_preparing() -> Atomic<Node> {
    Atomic::from(Shared::<Node>::null().with_tag(neigh2::PREPARING))
}

/// The null pointer tagged `PREPARING`, for use as a `compare_exchange` `current` argument.
pub fn neigh2_preparing_shared<'g>() -> Shared<'g, Node> {
    Shared::null().with_tag(neigh2::PREPARING)
}

/// The null pointer tagged `ABORTED`, for use as a `compare_exchange` `new` argument.
pub fn neigh2_aborted_shared<'g>() -> Shared<'g, Node> {
    Shared::null().with_tag(neigh2::ABORTED)
}

pub fn neigh2_tag<'g>(neigh2_field: &Atomic<Node>, guard: &'g Guard) -> (usize, Shared<'g, Node>) {
    let shared = neigh2_field.load(Ordering::Acquire, guard);
    (shared.tag(), shared)
}
