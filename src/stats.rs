//! Contention accounting: the heuristic that decides when a base has earned a split or a join.

use crate::config::{CONTENDED_CONTRIB, JOIN_THRESHOLD, RANGE_CONTRIB, SPLIT_THRESHOLD, UNCONTENDED_CONTRIB};
use crate::node::{Base, Node};

/// Whether the point operation that just touched a base won its CAS on the first try.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Contention {
    Uncontended,
    Contended,
}

/// What a base's updated `stat` implies should happen to it next.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AdaptDecision {
    None,
    Split,
    Join,
}

/// Computes the `stat` a freshly built base should carry, given the base it replaces and the
/// contention observed while building the replacement.
///
/// Applied once per observation: if `prev` is a range base whose query spanned more than one
/// leaf, an additional [`RANGE_CONTRIB`] penalty is deducted every time that base is visited,
/// not just once per query (an ambiguity in the reference implementation this port resolves in
/// favor of "once per observation" per the design notes).
pub fn new_stat(prev: &Node, contention: Contention) -> i32 {
    let base_delta = match contention {
        Contention::Contended => CONTENDED_CONTRIB,
        Contention::Uncontended => UNCONTENDED_CONTRIB,
    };
    let prev_stat = prev.stat().unwrap_or(0);
    let range_penalty = match prev {
        Node::Range(r) if r.storage.more_than_one_base() => RANGE_CONTRIB,
        _ => 0,
    };
    prev_stat + base_delta - range_penalty
}

pub fn decide(base: &Base) -> AdaptDecision {
    if base.stat > SPLIT_THRESHOLD {
        AdaptDecision::Split
    } else if base.stat < JOIN_THRESHOLD {
        AdaptDecision::Join
    } else {
        AdaptDecision::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contended_increments_towards_split() {
        let mut stat = 0;
        let mut n = 0;
        while stat <= SPLIT_THRESHOLD {
            stat += CONTENDED_CONTRIB;
            n += 1;
        }
        assert!(n > 0);
    }

    #[test]
    fn test_uncontended_decrements_towards_join() {
        let mut stat = 0i32;
        let mut n = 0;
        while stat >= JOIN_THRESHOLD {
            stat += UNCONTENDED_CONTRIB;
            n += 1;
        }
        assert_eq!(n, (JOIN_THRESHOLD.unsigned_abs() + 1) as i32);
    }

    #[test]
    fn test_decide_thresholds() {
        use crate::pool::Pool;
        use crate::treap::{PooledTreap, Treap};
        use crossbeam_epoch::Atomic;

        let node_pool = Pool::new("test_nodes", 8);
        let treap_pool = Pool::new("test_treaps", 8);
        let data = PooledTreap::alloc(&treap_pool, Treap::new()).unwrap();
        let mk_base = |stat: i32| {
            let ticket = node_pool.acquire().unwrap();
            Node::new_base(data.clone(), stat, Atomic::null(), ticket)
        };

        assert_eq!(decide(mk_base(0).as_base().unwrap()), AdaptDecision::None);
        assert_eq!(
            decide(mk_base(SPLIT_THRESHOLD + 1).as_base().unwrap()),
            AdaptDecision::Split
        );
        assert_eq!(
            decide(mk_base(JOIN_THRESHOLD - 1).as_base().unwrap()),
            AdaptDecision::Join
        );
    }
}
