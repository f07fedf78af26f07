//! Weft: deterministic systematic concurrency testing for Rust.
//!
//! # Overview
//!
//! Weft takes a concurrent computation expressed over a restricted
//! primitive set — threads, mutable cells, blocking channels (MVars),
//! software-transactional memory, exceptions, masking — and executes it
//! under full scheduler control, systematically exploring a finite set of
//! interleavings sufficient to detect deadlocks, uncaught exceptions, and
//! result divergences. Relaxed memory (TSO and PSO) is simulated with
//! explicit write buffers whose commits are themselves scheduling
//! decisions.
//!
//! # Core Guarantees
//!
//! - **Determinism**: for fixed inputs, two explorations produce identical
//!   outcome sequences
//! - **Coverage**: dynamic partial-order reduction explores at least one
//!   representative of every interleaving equivalence class, subject to the
//!   configured bounds
//! - **Minimal witnesses**: failing schedules are simplified into
//!   context-switch-minimal, replay-validated traces
//!
//! # Quick Start
//!
//! ```
//! use weft::program::{self, Program};
//! use weft::{explore, MemType, Settings};
//!
//! // Two threads race to increment a counter non-atomically.
//! let settings = Settings::new().memtype(MemType::SequentialConsistency);
//! let report = explore(&settings, || {
//!     program::new_cell(Some("counter"), 0i32).and_then(|c| {
//!         program::new_mvar::<()>(None).and_then(move |done| {
//!             program::fork(None, c.modify(|v| v + 1).then(done.put(())))
//!                 .then(c.modify(|v| v + 1))
//!                 .then(done.take())
//!                 .then(c.read())
//!         })
//!     })
//! });
//! // The lost-update schedule is found systematically.
//! let mut results: Vec<i32> = report.successes().copied().collect();
//! results.sort_unstable();
//! assert_eq!(results, vec![1, 2]);
//! ```
//!
//! # Module Structure
//!
//! - [`program`]: the primitive API tested programs are written against
//! - [`settings`]: memory model, bounds, and outcome policies
//! - [`explore`]: the DPOR exploration driver
//! - [`trace`]: trace events, the dependency oracle, and the simplifier
//! - [`sched`]: the scheduler interface and baseline schedulers
//! - [`error`]: the failure taxonomy
//! - [`types`]: identifier types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
mod exec;
mod explore;
pub mod program;
pub mod sched;
pub mod settings;
mod snapshot;
pub mod trace;
pub mod types;

pub use error::{Failure, FailureKind};
pub use explore::{explore, Exploration};
pub use program::Program;
pub use settings::{Bounds, Discard, MemType, Outcome, Settings};
pub use snapshot::can_snapshot;
pub use trace::{Decision, Event, Lookahead, MaskState, ThreadAction, Trace};
pub use types::{CellId, MVarId, TVarId, ThreadId};
