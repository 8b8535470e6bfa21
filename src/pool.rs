//! Bounded, fixed-capacity admission control for node/treap/result-store allocation.
//!
//! The design assumes an external "object pool" collaborator that bump-allocates from a
//! contiguous region and is sized up front by the caller. Actual storage for nodes still comes
//! from the ordinary global allocator (via [`crossbeam_epoch::Owned`], same as the rest of the
//! tree engine), but every allocation must first acquire a [`PoolTicket`] from the relevant
//! [`Pool`]; the ticket is carried inside the allocated value and releases its slot back to the
//! pool when the value is finally reclaimed. This turns "pool capacity" into a live-allocation
//! budget rather than a one-shot arena, which is what a long-running concurrent set actually
//! needs (see `DESIGN.md`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Error;

/// A single bounded pool of `capacity` logical slots.
pub struct Pool {
    name: &'static str,
    capacity: usize,
    live: AtomicUsize,
}

impl Pool {
    pub fn new(name: &'static str, capacity: usize) -> Arc<Pool> {
        Arc::new(Pool {
            name,
            capacity,
            live: AtomicUsize::new(0),
        })
    }

    /// Reserves one slot, failing with [`Error::PoolExhausted`] if the pool is at capacity.
    pub fn acquire(self: &Arc<Self>) -> Result<PoolTicket, Error> {
        loop {
            let cur = self.live.load(Ordering::Relaxed);
            if cur >= self.capacity {
                return Err(Error::PoolExhausted(self.name));
            }
            if self
                .live
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(PoolTicket { pool: self.clone() });
            }
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A held reservation against a [`Pool`]. Releases its slot on drop.
///
/// Embedded inside `Node`/`Treap`/`ResultStore` purely for this drop side effect; the ticket
/// itself carries no data consumers read.
pub struct PoolTicket {
    pool: Arc<Pool>,
}

impl Drop for PoolTicket {
    fn drop(&mut self) {
        self.pool.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The three pools backing a single `CaTreeSet`.
pub struct Pools {
    pub nodes: Arc<Pool>,
    pub treaps: Arc<Pool>,
    pub result_stores: Arc<Pool>,
}

impl Pools {
    /// Sizes the three pools from a single expected-key-count hint.
    ///
    /// Nodes and treaps scale with the number of base leaves a tree of that size is expected to
    /// have (generously overprovisioned to absorb transient split/join nodes); result stores
    /// scale with expected concurrent range-query fan-out.
    pub fn with_capacity_hint(expected_keys: usize) -> Pools {
        let expected_bases = (expected_keys / crate::config::TREAP_CAPACITY).max(1);
        // Every base may transiently own a route + two children during a split, plus join
        // transients (join_main/join_neighbor) touching up to three leaves at once.
        let node_capacity = expected_bases.saturating_mul(8).max(64);
        let treap_capacity = expected_bases.saturating_mul(4).max(64);
        let result_store_capacity = expected_bases.max(256);
        Pools {
            nodes: Pool::new("nodes", node_capacity),
            treaps: Pool::new("treaps", treap_capacity),
            result_stores: Pool::new("result_stores", result_store_capacity),
        }
    }
}

impl Default for Pools {
    fn default() -> Self {
        Pools::with_capacity_hint(crate::config::TREAP_CAPACITY * 1024)
    }
}
