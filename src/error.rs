//! Crate error type.
//!
//! Mirrors the hand-rolled `Error` enum used by the lsm-tree module this crate's tree engine is
//! descended from: a small enum, manual `Display`/`std::error::Error`, no `From<io::Error>` here
//! since the set has nothing to do with I/O.

use std::error;
use std::fmt;

/// The only externally observable failure mode of the set.
///
/// The public operations (`insert`, `remove`, `lookup`, `range`) are otherwise infallible; pool
/// exhaustion is the one condition treated as fatal rather than retryable.
#[derive(Debug)]
pub enum Error {
    /// One of the three fixed-capacity pools (nodes, treaps, result stores) ran out of room.
    ///
    /// The caller must size the set's pools (see [`crate::CaTreeSet::with_capacity_hint`]) to
    /// bound the worst-case number of live allocations.
    PoolExhausted(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PoolExhausted(pool) => write!(f, "pool exhausted: {}", pool),
        }
    }
}

impl error::Error for Error {}

/// Convenience `Result` type for fallible internal allocation paths.
pub type Result<T> = std::result::Result<T, Error>;
