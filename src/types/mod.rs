//! Core identifier types.

mod id;

pub use id::{CellId, IdSource, MVarId, TVarId, ThreadId};
