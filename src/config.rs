//! Compile-time tunables for the set.
//!
//! There are no construction-time parameters (see the crate's public API contract); everything
//! that shapes behavior lives here as named constants, in the same spirit as the fixed capacities
//! used by the treap and splay-tree implementations this crate grew out of.

/// Maximum number of keys held by a single base node's treap (`T` in the design).
pub const TREAP_CAPACITY: usize = 64;

/// A base's `stat` crosses this threshold after enough contended observations to warrant a split.
pub const SPLIT_THRESHOLD: i32 = 1000;

/// A base's `stat` crosses this threshold after enough uncontended observations to warrant a join.
pub const JOIN_THRESHOLD: i32 = -1000;

/// Added to `stat` when an operation observes contention at a base (a lost CAS race).
pub const CONTENDED_CONTRIB: i32 = 250;

/// Added to `stat` when an operation completes without contention.
pub const UNCONTENDED_CONTRIB: i32 = -1;

/// Subtracted from `stat` on top of [`CONTENDED_CONTRIB`]/[`UNCONTENDED_CONTRIB`] when the base
/// being observed is a range base whose query spans more than one leaf.
pub const RANGE_CONTRIB: i32 = 100;
