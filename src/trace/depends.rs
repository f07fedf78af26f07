//! The dependency oracle: decides whether two trace steps commute.
//!
//! Two steps `(t1, a1)` and `(t2, a2)` are *independent* iff swapping them
//! yields an execution with the same outcome. The relation is symmetric; a
//! step is never independent of another step of the same thread.
//!
//! | Pair | Verdict |
//! |------|---------|
//! | same thread | dependent |
//! | reads of disjoint cells | independent |
//! | two reads of one cell | independent |
//! | read and write of one cell | dependent |
//! | two writes of one cell | dependent |
//! | MVar ops on one MVar, at least one mutating | dependent |
//! | MVar ops on distinct MVars | independent |
//! | `throw_to(t, _)` and any step of `t` | dependent |
//! | commit of `(T, C)` and any op on `C` | dependent |
//! | commit and commit of the same writer | dependent (FIFO buffers) |
//! | barrier (CAS, atomic mod, STM commit) and any commit | dependent |
//! | fork of `t` and any step of `t` | dependent |
//! | two lifted effects | dependent (arbitrary host state) |
//! | capability get/set and capability set | dependent |
//! | id allocations (fork, new_cell, new_mvar) | independent (renumbering) |
//!
//! Everything else — yields, masks, handler pushes, messages — touches only
//! the acting thread and is independent across threads.

use crate::settings::MemType;
use crate::trace::ThreadAction;
use crate::types::{CellId, ThreadId};
use std::collections::BTreeMap;

/// How a step touches a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellAccess {
    Read,
    Write,
}

/// The cell a step touches, if any, and how.
///
/// CAS and atomic modifications count as writes; a commit is handled
/// separately because of its writer coupling.
fn cell_access(action: &ThreadAction) -> Option<(CellId, CellAccess)> {
    match action {
        // A non-atomic modify step is the read half; its write is a
        // separate `WriteCell` event.
        ThreadAction::ReadCell { cell }
        | ThreadAction::ReadForCas { cell }
        | ThreadAction::ModCell { cell } => Some((*cell, CellAccess::Read)),
        ThreadAction::WriteCell { cell }
        | ThreadAction::ModCellCas { cell }
        | ThreadAction::CasCell { cell, .. } => Some((*cell, CellAccess::Write)),
        ThreadAction::CommitWrite { cell, .. } => Some((*cell, CellAccess::Write)),
        _ => None,
    }
}

/// The MVar a step touches, if any, and whether it mutates the MVar state
/// (value or wait queues). Failed `try_*` probes and non-destructive reads
/// of a full MVar observe without mutating.
fn mvar_access(action: &ThreadAction) -> Option<(crate::types::MVarId, bool)> {
    match action {
        ThreadAction::PutMVar { mvar, .. } | ThreadAction::TakeMVar { mvar, .. } => {
            Some((*mvar, true))
        }
        ThreadAction::BlockedPutMVar { mvar }
        | ThreadAction::BlockedTakeMVar { mvar }
        | ThreadAction::BlockedReadMVar { mvar } => Some((*mvar, true)),
        ThreadAction::TryPutMVar {
            mvar, succeeded, ..
        }
        | ThreadAction::TryTakeMVar {
            mvar, succeeded, ..
        } => Some((*mvar, *succeeded)),
        ThreadAction::ReadMVar { mvar } | ThreadAction::TryReadMVar { mvar, .. } => {
            Some((*mvar, false))
        }
        _ => None,
    }
}

/// The thread another thread's step acts upon, if any.
fn acted_on_thread(action: &ThreadAction) -> Option<ThreadId> {
    match action {
        ThreadAction::Fork { child } | ThreadAction::ForkOs { child } => Some(*child),
        ThreadAction::ThrowTo { target, .. } | ThreadAction::BlockedThrowTo { target } => {
            Some(*target)
        }
        _ => None,
    }
}

/// True for steps that impose a memory barrier flushing write buffers.
#[must_use]
pub fn is_barrier(action: &ThreadAction) -> bool {
    match action {
        ThreadAction::CasCell { .. } | ThreadAction::ModCellCas { .. } => true,
        ThreadAction::Stm { written, .. } => !written.is_empty(),
        _ => false,
    }
}

/// Decides whether two steps are dependent (do not commute).
#[must_use]
pub fn dependent(a: &(ThreadId, ThreadAction), b: &(ThreadId, ThreadAction)) -> bool {
    let (ta, aa) = a;
    let (tb, ab) = b;

    // Steps of one thread are program-ordered.
    if ta == tb {
        return true;
    }

    // Sub lifecycle and prelude events pin the trace structure: nothing
    // reorders across them.
    let pinned = |x: &ThreadAction| {
        matches!(
            x,
            ThreadAction::SubStart | ThreadAction::SubEnd | ThreadAction::DontCheck { .. }
        )
    };
    if pinned(aa) || pinned(ab) {
        return true;
    }

    // Steps acting on the other thread: fork, synchronous throw_to.
    if acted_on_thread(aa) == Some(*tb)
        || acted_on_thread(ab) == Some(*ta)
        || matches!(
            (acted_on_thread(aa), acted_on_thread(ab)),
            (Some(x), Some(y)) if x == y
        )
    {
        return true;
    }

    // Cell conflicts: same cell with at least one write.
    if let (Some((ca, ma)), Some((cb, mb))) = (cell_access(aa), cell_access(ab)) {
        if ca == cb && (ma == CellAccess::Write || mb == CellAccess::Write) {
            return true;
        }
    }

    // Commit coupling: commits of one writer drain a FIFO buffer, and any
    // barrier may force commits of any buffer.
    match (aa, ab) {
        (
            ThreadAction::CommitWrite { writer: wa, .. },
            ThreadAction::CommitWrite { writer: wb, .. },
        ) if wa == wb => return true,
        (ThreadAction::CommitWrite { .. }, other) | (other, ThreadAction::CommitWrite { .. })
            if is_barrier(other) =>
        {
            return true;
        }
        _ => {}
    }

    // MVar conflicts: same MVar with at least one mutation.
    if let (Some((ma, xa)), Some((mb, xb))) = (mvar_access(aa), mvar_access(ab)) {
        if ma == mb && (xa || xb) {
            return true;
        }
    }

    // STM conflicts.
    match (aa, ab) {
        (ThreadAction::Stm { written: wa, .. }, ThreadAction::Stm { written: wb, .. }) => {
            // A committed transaction's read set is not recorded; treat two
            // writing commits as conflicting.
            if !wa.is_empty() && !wb.is_empty() {
                return true;
            }
        }
        (ThreadAction::Stm { written, .. }, ThreadAction::BlockedStm { read })
        | (ThreadAction::BlockedStm { read }, ThreadAction::Stm { written, .. }) => {
            if written.iter().any(|v| read.contains(v)) {
                return true;
            }
        }
        _ => {}
    }

    // Host effects may share arbitrary state.
    if matches!(aa, ThreadAction::LiftedEffect) && matches!(ab, ThreadAction::LiftedEffect) {
        return true;
    }

    // Capability counter.
    let caps = |x: &ThreadAction| {
        matches!(
            x,
            ThreadAction::GetNumCapabilities { .. } | ThreadAction::SetNumCapabilities { .. }
        )
    };
    let caps_write = |x: &ThreadAction| matches!(x, ThreadAction::SetNumCapabilities { .. });
    if caps(aa) && caps(ab) && (caps_write(aa) || caps_write(ab)) {
        return true;
    }

    false
}

/// Decides whether two steps are independent. Convenience inverse of
/// [`dependent`] for same-shaped call sites.
#[must_use]
pub fn independent(a: &(ThreadId, ThreadAction), b: &(ThreadId, ThreadAction)) -> bool {
    !dependent(a, b)
}

/// Rolling buffer state, threaded through a step sequence so the simplifier
/// can reason about pending commits without re-executing the computation.
///
/// Tracks, per `(writer, cell)`, how many writes are buffered but not yet
/// committed at the current position in the sequence.
#[derive(Debug, Clone, Default)]
pub struct DepState {
    memtype: MemType,
    buffered: BTreeMap<(ThreadId, CellId), usize>,
}

impl DepState {
    /// Initial state for the given memory model.
    #[must_use]
    pub fn new(memtype: MemType) -> Self {
        Self {
            memtype,
            buffered: BTreeMap::new(),
        }
    }

    /// Number of writes `writer` has buffered for `cell`.
    #[must_use]
    pub fn buffered(&self, writer: ThreadId, cell: CellId) -> usize {
        self.buffered.get(&(writer, cell)).copied().unwrap_or(0)
    }

    /// True if any write to `cell` is buffered by any thread.
    #[must_use]
    pub fn cell_has_pending(&self, cell: CellId) -> bool {
        self.buffered
            .iter()
            .any(|(&(_, c), &n)| c == cell && n > 0)
    }

    /// Advances the state over one step.
    pub fn apply(&mut self, tid: ThreadId, action: &ThreadAction) {
        if self.memtype == MemType::SequentialConsistency {
            return;
        }
        match action {
            ThreadAction::WriteCell { cell } => {
                *self.buffered.entry((tid, *cell)).or_insert(0) += 1;
            }
            ThreadAction::CommitWrite { writer, cell } => {
                if let Some(n) = self.buffered.get_mut(&(*writer, *cell)) {
                    *n = n.saturating_sub(1);
                }
            }
            ThreadAction::CasCell { cell, .. } | ThreadAction::ModCellCas { cell } => {
                // Per-cell barrier: every buffered write to this cell (and,
                // under TSO, anything FIFO-ordered before it) commits.
                let drained: Vec<(ThreadId, CellId)> = match self.memtype {
                    MemType::TotalStoreOrder => self
                        .buffered
                        .keys()
                        .filter(|(w, c)| {
                            c == cell
                                || self
                                    .buffered
                                    .get(&(*w, *cell))
                                    .is_some_and(|&n| n > 0)
                        })
                        .copied()
                        .collect(),
                    _ => self
                        .buffered
                        .keys()
                        .filter(|(_, c)| c == cell)
                        .copied()
                        .collect(),
                };
                for key in drained {
                    self.buffered.remove(&key);
                }
            }
            ThreadAction::Stm { written, .. } if !written.is_empty() => {
                // Full barrier on STM commit.
                self.buffered.clear();
            }
            _ => {}
        }
    }
}
