//! The reified action tree.
//!
//! A user computation is encoded as a tree of [`Action`] nodes. Each node
//! carries its success continuation as a boxed closure; the interpreter
//! consumes exactly one node per step and installs the continuation as the
//! thread's new remainder. The alphabet is closed: every suspension point of
//! the interpreted program is one of these variants.

use crate::program::stm::StmAction;
use crate::program::Exception;
use crate::trace::{Lookahead, MaskState};
use crate::types::{CellId, MVarId, ThreadId};
use core::fmt;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::rc::Rc;

/// A dynamically-typed value crossing the interpreter.
pub(crate) type Val = Rc<dyn Any>;

/// A success continuation consuming a value of type `A`.
pub(crate) type Cont<A> = Box<dyn FnOnce(A) -> Action>;

/// An opaque capability representing an observed cell version, used for
/// compare-and-swap. A ticket with a stale version fails the CAS.
#[derive(Clone)]
pub struct Ticket {
    pub(crate) cell: CellId,
    pub(crate) version: u64,
    pub(crate) observed: Val,
}

impl Ticket {
    /// The cell this ticket observes.
    #[must_use]
    pub fn cell(&self) -> CellId {
        self.cell
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ticket({} v{})", self.cell, self.version)
    }
}

/// Shared slot through which a nested computation (sub or prelude body)
/// delivers its final value to the enclosing continuation.
pub(crate) type ResultSlot = Rc<RefCell<Option<Val>>>;

pub(crate) enum Action {
    // === Control ===
    Fork {
        name: Option<String>,
        os: bool,
        body: Box<Action>,
        cont: Cont<ThreadId>,
    },
    MyThreadId(Cont<ThreadId>),
    Yield(Box<Action>),
    ThreadDelay(u64, Box<Action>),
    GetNumCapabilities(Cont<usize>),
    SetNumCapabilities(usize, Box<Action>),
    IsCurrentThreadBound(Cont<bool>),
    Lift(Box<dyn FnOnce() -> Action>),
    Message(String, Box<Action>),
    Stop,

    // === Cells ===
    NewCell {
        name: Option<String>,
        init: Val,
        cont: Cont<CellId>,
    },
    ReadCell {
        cell: CellId,
        cont: Cont<Val>,
    },
    ReadForCas {
        cell: CellId,
        cont: Cont<Ticket>,
    },
    WriteCell {
        cell: CellId,
        value: Val,
        cont: Box<Action>,
    },
    CasCell {
        cell: CellId,
        ticket: Ticket,
        value: Val,
        cont: Cont<(bool, Ticket)>,
    },
    ModCell {
        cell: CellId,
        f: Box<dyn FnOnce(&Val) -> Val>,
        cont: Cont<Val>,
    },
    ModCellCas {
        cell: CellId,
        f: Box<dyn FnOnce(&Val) -> Val>,
        cont: Cont<Val>,
    },

    // === MVars ===
    NewMVar {
        name: Option<String>,
        cont: Cont<MVarId>,
    },
    PutMVar {
        mvar: MVarId,
        value: Val,
        cont: Box<Action>,
    },
    TryPutMVar {
        mvar: MVarId,
        value: Val,
        cont: Cont<bool>,
    },
    TakeMVar {
        mvar: MVarId,
        cont: Cont<Val>,
    },
    TryTakeMVar {
        mvar: MVarId,
        cont: Cont<Option<Val>>,
    },
    ReadMVar {
        mvar: MVarId,
        cont: Cont<Val>,
    },
    TryReadMVar {
        mvar: MVarId,
        cont: Cont<Option<Val>>,
    },

    // === Exceptions and masking ===
    Throw(Exception),
    ThrowTo {
        target: ThreadId,
        exc: Exception,
        cont: Box<Action>,
    },
    Catching {
        exc_type: TypeId,
        handler: Box<dyn FnOnce(Exception) -> Action>,
        body: Box<Action>,
    },
    PopCatching(Box<Action>),
    Masking {
        state: MaskState,
        body: Box<Action>,
    },
    /// Restore the enclosing mask for the extent of `body` (the scoped
    /// capability handed to `mask` blocks).
    Unmasking {
        body: Box<Action>,
    },
    ResetMask(Box<Action>),

    // === STM ===
    Atomic {
        run: Box<dyn Fn() -> StmAction>,
        cont: Cont<Val>,
    },

    // === Meta ===
    Sub {
        body: Box<Action>,
        slot: ResultSlot,
        cont: Cont<Result<Val, crate::error::Failure>>,
    },
    DontCheck {
        bound: Option<usize>,
        body: Box<Action>,
        slot: ResultSlot,
        cont: Cont<Val>,
    },

    /// Interpreter-internal fault, raised when typed plumbing breaks (a
    /// failed downcast). Surfaces as `Failure::InternalError`.
    Fault(&'static str),
}

impl Action {
    /// Summarizes this action for schedulers and DPOR.
    pub(crate) fn lookahead(&self) -> Lookahead {
        match self {
            Self::Fork { os: false, .. } => Lookahead::WillFork,
            Self::Fork { os: true, .. } => Lookahead::WillForkOs,
            Self::MyThreadId(_) => Lookahead::WillMyThreadId,
            Self::Yield(_) => Lookahead::WillYield,
            Self::ThreadDelay(n, _) => Lookahead::WillThreadDelay { micros: *n },
            Self::GetNumCapabilities(_) => Lookahead::WillGetNumCapabilities,
            Self::SetNumCapabilities(n, _) => Lookahead::WillSetNumCapabilities { count: *n },
            Self::IsCurrentThreadBound(_) => Lookahead::WillIsCurrentThreadBound,
            Self::Lift(_) => Lookahead::WillLiftedEffect,
            Self::Message(..) => Lookahead::WillMessage,
            Self::Stop | Self::Fault(_) => Lookahead::WillStop,
            Self::NewCell { .. } => Lookahead::WillNewCell,
            Self::ReadCell { cell, .. } => Lookahead::WillReadCell { cell: *cell },
            Self::ReadForCas { cell, .. } => Lookahead::WillReadForCas { cell: *cell },
            Self::WriteCell { cell, .. } => Lookahead::WillWriteCell { cell: *cell },
            Self::CasCell { cell, .. } => Lookahead::WillCasCell { cell: *cell },
            Self::ModCell { cell, .. } => Lookahead::WillModCell { cell: *cell },
            Self::ModCellCas { cell, .. } => Lookahead::WillModCellCas { cell: *cell },
            Self::NewMVar { .. } => Lookahead::WillNewMVar,
            Self::PutMVar { mvar, .. } => Lookahead::WillPutMVar { mvar: *mvar },
            Self::TryPutMVar { mvar, .. } => Lookahead::WillTryPutMVar { mvar: *mvar },
            Self::TakeMVar { mvar, .. } => Lookahead::WillTakeMVar { mvar: *mvar },
            Self::TryTakeMVar { mvar, .. } => Lookahead::WillTryTakeMVar { mvar: *mvar },
            Self::ReadMVar { mvar, .. } => Lookahead::WillReadMVar { mvar: *mvar },
            Self::TryReadMVar { mvar, .. } => Lookahead::WillTryReadMVar { mvar: *mvar },
            Self::Throw(_) => Lookahead::WillThrow,
            Self::ThrowTo { target, .. } => Lookahead::WillThrowTo { target: *target },
            Self::Catching { .. } => Lookahead::WillCatching,
            Self::PopCatching(_) => Lookahead::WillPopCatching,
            Self::Masking { state, .. } => Lookahead::WillMask { state: *state },
            Self::Unmasking { .. } | Self::ResetMask(_) => Lookahead::WillResetMask {
                state: MaskState::Unmasked,
            },
            Self::Atomic { .. } => Lookahead::WillStm,
            Self::Sub { .. } => Lookahead::WillSub,
            Self::DontCheck { .. } => Lookahead::WillDontCheck,
        }
    }
}

impl fmt::Debug for Action {
    /// Renders an action by its lookahead summary; continuations are opaque.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({:?})", self.lookahead())
    }
}
