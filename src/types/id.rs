//! Identifier types for interpreted entities.
//!
//! Threads, mutable cells, MVars, and TVars are all named by opaque integer
//! ids drawn from a single monotonic [`IdSource`]. Ids are never reused
//! within one run, and for a given source program the allocation order is
//! deterministic, so ids double as stable keys in traces.
//!
//! [`ThreadId`] additionally encodes *commit pseudo-threads*: synthetic
//! scheduling tokens that make a buffered write's commit an explicitly
//! schedulable step under TSO and PSO. A commit id is derived from the
//! writer (and, under PSO, the cell) so that the derivation itself decides
//! the commit-thread identity properties: one commit thread per writer under
//! TSO, one per (writer, cell) pair under PSO.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Tag bit distinguishing commit pseudo-threads from user threads.
const COMMIT_BIT: u64 = 1 << 63;
/// Cell field sentinel for TSO commit ids (one buffer per writer).
const CELL_NONE: u64 = 0xFFFF_FFFF;

/// Identifier of an interpreted thread, or of a commit pseudo-thread.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The root thread of every computation.
    pub const ROOT: Self = Self(0);

    pub(crate) const fn user(index: u32) -> Self {
        Self(index as u64)
    }

    /// The commit pseudo-thread for `writer` under TSO: one per writer,
    /// shared across all cells.
    #[must_use]
    pub const fn commit_tso(writer: Self) -> Self {
        Self(COMMIT_BIT | (writer.0 << 32) | CELL_NONE)
    }

    /// The commit pseudo-thread for `writer`'s buffered writes to `cell`
    /// under PSO: one per (writer, cell) pair.
    #[must_use]
    pub const fn commit_pso(writer: Self, cell: CellId) -> Self {
        Self(COMMIT_BIT | (writer.0 << 32) | cell.0 as u64)
    }

    /// True if this id names a commit pseudo-thread rather than a user
    /// thread.
    #[must_use]
    pub const fn is_commit(self) -> bool {
        self.0 & COMMIT_BIT != 0
    }

    /// For a commit pseudo-thread, the user thread whose buffer it drains.
    #[must_use]
    pub const fn commit_writer(self) -> Option<Self> {
        if self.is_commit() {
            Some(Self((self.0 & !COMMIT_BIT) >> 32))
        } else {
            None
        }
    }

    /// For a PSO commit pseudo-thread, the cell its buffer belongs to.
    #[must_use]
    pub const fn commit_cell(self) -> Option<CellId> {
        if self.is_commit() && self.0 & CELL_NONE != CELL_NONE {
            #[allow(clippy::cast_possible_truncation)]
            Some(CellId(self.0 as u32))
        } else {
            None
        }
    }

    pub(crate) const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({self})")
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.commit_writer(), self.commit_cell()) {
            (Some(w), Some(c)) => write!(f, "C{}.{}", w.0, c.0),
            (Some(w), None) => write!(f, "C{}", w.0),
            _ => write!(f, "T{}", self.0),
        }
    }
}

macro_rules! resource_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub(crate) const fn from_index(index: u32) -> Self {
                Self(index)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

resource_id!(
    /// Identifier of a mutable cell.
    CellId,
    "r"
);
resource_id!(
    /// Identifier of an MVar (blocking single-slot channel).
    MVarId,
    "m"
);
resource_id!(
    /// Identifier of a TVar (transactional variable).
    TVarId,
    "v"
);

/// Monotonic source of fresh identifiers.
///
/// One instance lives in the interpreter context. Restoring a snapshot
/// restores the source to its high-water mark, so ids allocated after the
/// prelude never collide with prelude-allocated ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSource {
    next_thread: u32,
    next_cell: u32,
    next_mvar: u32,
    next_tvar: u32,
}

impl IdSource {
    /// A fresh source. The first thread id handed out is [`ThreadId::ROOT`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_thread: 0,
            next_cell: 0,
            next_mvar: 0,
            next_tvar: 0,
        }
    }

    /// Allocates the next thread id.
    pub fn fresh_thread(&mut self) -> ThreadId {
        let id = ThreadId::user(self.next_thread);
        self.next_thread += 1;
        id
    }

    /// Allocates the next cell id.
    pub fn fresh_cell(&mut self) -> CellId {
        let id = CellId::from_index(self.next_cell);
        self.next_cell += 1;
        id
    }

    /// Allocates the next MVar id.
    pub fn fresh_mvar(&mut self) -> MVarId {
        let id = MVarId::from_index(self.next_mvar);
        self.next_mvar += 1;
        id
    }

    /// Allocates the next TVar id.
    pub fn fresh_tvar(&mut self) -> TVarId {
        let id = TVarId::from_index(self.next_tvar);
        self.next_tvar += 1;
        id
    }
}
