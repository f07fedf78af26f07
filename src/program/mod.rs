//! The primitive API consumed by tested programs.
//!
//! A tested computation is a [`Program`] value: a continuation-passing
//! description of effects over the restricted primitive set (threads, cells,
//! MVars, STM, exceptions, masking). Programs are *descriptions* — nothing
//! runs until an explorer executes them — and the explorer re-instantiates
//! the program for every schedule, so entry points take `Fn() -> Program<T>`
//! factories.
//!
//! ```
//! use weft::program::{self, Program};
//!
//! fn counter() -> Program<i32> {
//!     program::new_cell(Some("count"), 0i32).and_then(|c| {
//!         program::fork(Some("bump"), c.modify(|v| v + 1).then(Program::pure(())))
//!             .then(c.read())
//!     })
//! }
//! ```
//!
//! Primitives never leak interpreter state: they take and return plain
//! values, ids, and closures.

pub(crate) mod action;
pub mod stm;

use crate::error::Failure;
use crate::trace::MaskState;
use crate::types::{CellId, MVarId, ThreadId};
use action::{Action, Cont, ResultSlot, Ticket, Val};
use core::fmt;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use stm::{Stm, StmAction};

pub(crate) fn downcast_val<V: Any + Clone>(val: &Val) -> Option<V> {
    val.downcast_ref::<V>().cloned()
}

/// A dynamically-typed exception value.
///
/// Exceptions carry the [`TypeId`] of the thrown value; handlers installed
/// with [`catching`] match on that type, innermost first.
#[derive(Clone)]
pub struct Exception {
    type_id: TypeId,
    desc: String,
    payload: Rc<dyn Any>,
}

impl Exception {
    /// Wraps a value as an exception.
    #[must_use]
    pub fn new<E: Any + fmt::Debug>(exc: E) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            desc: format!("{exc:?}"),
            payload: Rc::new(exc),
        }
    }

    /// True if the payload is of type `E`.
    #[must_use]
    pub fn is<E: Any>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }

    /// The payload, if it is of type `E`.
    #[must_use]
    pub fn downcast<E: Any>(&self) -> Option<Rc<E>> {
        Rc::clone(&self.payload).downcast::<E>().ok()
    }

    /// Debug rendering of the payload, captured at construction.
    #[must_use]
    pub fn describe(&self) -> &str {
        &self.desc
    }

    pub(crate) fn matches_type(&self, type_id: TypeId) -> bool {
        self.type_id == type_id
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exception({})", self.desc)
    }
}

/// A composable concurrent computation returning `T`.
pub struct Program<T>(pub(crate) Box<dyn FnOnce(Cont<T>) -> Action>);

impl<T: 'static> Program<T> {
    /// A computation that returns `value` with no effects.
    pub fn pure(value: T) -> Self {
        Self(Box::new(move |k| k(value)))
    }

    /// Sequences `self` with a dependent continuation.
    #[must_use]
    pub fn and_then<U: 'static>(self, f: impl FnOnce(T) -> Program<U> + 'static) -> Program<U> {
        Program(Box::new(move |k| (self.0)(Box::new(move |t| (f(t).0)(k)))))
    }

    /// Applies a function to the result.
    #[must_use]
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Program<U> {
        self.and_then(|t| Program::pure(f(t)))
    }

    /// Sequences `self` with an independent follow-up, discarding `self`'s
    /// result.
    #[must_use]
    pub fn then<U: 'static>(self, next: Program<U>) -> Program<U> {
        self.and_then(move |_| next)
    }

    pub(crate) fn into_action(self, k: Cont<T>) -> Action {
        (self.0)(k)
    }
}

// === Control primitives ===

/// Forks `body` as a new thread and returns its id.
#[must_use]
pub fn fork(name: Option<&str>, body: Program<()>) -> Program<ThreadId> {
    fork_with(name, false, body)
}

/// Forks `body` as a new *bound* thread. Fails the run with
/// [`Failure::UnsupportedBoundThread`] if the settings disable bound-thread
/// support.
#[must_use]
pub fn fork_os(name: Option<&str>, body: Program<()>) -> Program<ThreadId> {
    fork_with(name, true, body)
}

fn fork_with(name: Option<&str>, os: bool, body: Program<()>) -> Program<ThreadId> {
    let name = name.map(str::to_owned);
    Program(Box::new(move |k| Action::Fork {
        name,
        os,
        body: Box::new(body.into_action(Box::new(|()| Action::Stop))),
        cont: k,
    }))
}

/// The current thread's id.
#[must_use]
pub fn my_thread_id() -> Program<ThreadId> {
    Program(Box::new(|k| Action::MyThreadId(k)))
}

/// An observable scheduling point.
#[must_use]
pub fn yield_now() -> Program<()> {
    Program(Box::new(|k| Action::Yield(Box::new(k(())))))
}

/// Delays the thread. Like [`yield_now`], an observable scheduling point;
/// no virtual clock advances.
#[must_use]
pub fn thread_delay(micros: u64) -> Program<()> {
    Program(Box::new(move |k| {
        Action::ThreadDelay(micros, Box::new(k(())))
    }))
}

/// Terminates the current thread immediately.
#[must_use]
pub fn stop<T: 'static>() -> Program<T> {
    Program(Box::new(|_| Action::Stop))
}

/// Reads the capability count.
#[must_use]
pub fn get_num_capabilities() -> Program<usize> {
    Program(Box::new(|k| Action::GetNumCapabilities(k)))
}

/// Sets the capability count.
#[must_use]
pub fn set_num_capabilities(count: usize) -> Program<()> {
    Program(Box::new(move |k| {
        Action::SetNumCapabilities(count, Box::new(k(())))
    }))
}

/// Whether the current thread is bound to an OS thread.
#[must_use]
pub fn is_current_thread_bound() -> Program<bool> {
    Program(Box::new(|k| Action::IsCurrentThreadBound(k)))
}

/// Performs a host effect, atomic from the interpreter's perspective.
///
/// The effect must not block on interpreted primitives. When a run resumes
/// from a snapshot the effect is executed again during the deterministic
/// fast-forward, so effects under a `dont_check` prelude must be idempotent.
#[must_use]
pub fn lift<V: Any>(effect: impl FnOnce() -> V + 'static) -> Program<V> {
    Program(Box::new(move |k| Action::Lift(Box::new(move || k(effect())))))
}

/// Emits a user annotation into the trace.
#[must_use]
pub fn message(payload: impl fmt::Debug) -> Program<()> {
    let text = format!("{payload:?}");
    Program(Box::new(move |k| Action::Message(text, Box::new(k(())))))
}

// === Exceptions and masking ===

/// Throws an exception in the current thread.
#[must_use]
pub fn throw<T: 'static, E: Any + fmt::Debug>(exc: E) -> Program<T> {
    Program(Box::new(move |_| Action::Throw(Exception::new(exc))))
}

/// Runs `body` with a handler for exceptions of type `E` installed.
///
/// On an exception, the innermost installed handler whose type matches runs
/// with the exception value; an unmatched exception keeps unwinding.
#[must_use]
pub fn catching<T: 'static, E: Any>(
    body: Program<T>,
    handler: impl FnOnce(Rc<E>) -> Program<T> + 'static,
) -> Program<T> {
    Program(Box::new(move |k| {
        let k = Rc::new(RefCell::new(Some(k)));
        let k_handler = Rc::clone(&k);
        Action::Catching {
            exc_type: TypeId::of::<E>(),
            handler: Box::new(move |exc| {
                match (exc.downcast::<E>(), k_handler.borrow_mut().take()) {
                    (Some(e), Some(k)) => handler(e).into_action(k),
                    _ => Action::Fault("exception handler invoked with mismatched type"),
                }
            }),
            body: Box::new(body.into_action(Box::new(move |t| {
                k.borrow_mut().take().map_or(
                    Action::Fault("catching continuation consumed twice"),
                    |k| Action::PopCatching(Box::new(k(t))),
                )
            }))),
        }
    }))
}

/// Throws an exception to another thread, synchronously: the caller blocks
/// until the target's mask state permits delivery.
#[must_use]
pub fn throw_to<E: Any + fmt::Debug>(target: ThreadId, exc: E) -> Program<()> {
    Program(Box::new(move |k| Action::ThrowTo {
        target,
        exc: Exception::new(exc),
        cont: Box::new(k(())),
    }))
}

/// A scoped capability restoring the enclosing mask state, handed to the
/// closure passed to [`mask`] and [`mask_uninterruptible`]. Only meaningful
/// within the dynamic extent of its masking block.
#[derive(Clone, Copy, Debug)]
pub struct Unmask(());

impl Unmask {
    /// Runs `body` under the mask state that was in effect outside the
    /// enclosing masking block.
    #[must_use]
    pub fn restore<T: 'static>(self, body: Program<T>) -> Program<T> {
        Program(Box::new(move |k| Action::Unmasking {
            body: Box::new(
                body.into_action(Box::new(move |t| Action::ResetMask(Box::new(k(t))))),
            ),
        }))
    }
}

/// Runs `body` with asynchronous exceptions masked (interruptible: delivery
/// may still occur while blocked on an MVar or in an STM retry).
#[must_use]
pub fn mask<T: 'static>(body: impl FnOnce(Unmask) -> Program<T> + 'static) -> Program<T> {
    masking(MaskState::MaskedInterruptible, body)
}

/// Runs `body` with asynchronous exceptions masked unconditionally.
#[must_use]
pub fn mask_uninterruptible<T: 'static>(
    body: impl FnOnce(Unmask) -> Program<T> + 'static,
) -> Program<T> {
    masking(MaskState::MaskedUninterruptible, body)
}

fn masking<T: 'static>(
    state: MaskState,
    body: impl FnOnce(Unmask) -> Program<T> + 'static,
) -> Program<T> {
    Program(Box::new(move |k| Action::Masking {
        state,
        body: Box::new(
            body(Unmask(())).into_action(Box::new(move |t| Action::ResetMask(Box::new(k(t))))),
        ),
    }))
}

// === STM entry ===

/// Executes a transaction atomically. `stm` is called once per attempt; a
/// retried transaction re-executes from a fresh instance.
#[must_use]
pub fn atomically<T: Any + Clone>(stm: impl Fn() -> Stm<T> + 'static) -> Program<T> {
    Program(Box::new(move |k| Action::Atomic {
        run: Box::new(move || {
            stm().into_action(Box::new(|t| StmAction::Stop(Rc::new(t) as Val)))
        }),
        cont: Box::new(move |val| match downcast_val::<T>(&val) {
            Some(v) => k(v),
            None => Action::Fault("transaction result had unexpected type"),
        }),
    }))
}

// === Meta ===

/// Runs `body` as a nested computation and captures its outcome instead of
/// propagating it. Nested `sub`s, and `sub` under a `dont_check` prelude,
/// fail the run with [`Failure::IllegalSubconcurrency`].
#[must_use]
pub fn sub<T: Any + Clone>(body: Program<T>) -> Program<Result<T, Failure>> {
    Program(Box::new(move |k| {
        let slot: ResultSlot = Rc::new(RefCell::new(None));
        let fill = Rc::clone(&slot);
        Action::Sub {
            body: Box::new(body.into_action(Box::new(move |t| {
                *fill.borrow_mut() = Some(Rc::new(t) as Val);
                Action::Stop
            }))),
            slot,
            cont: Box::new(move |res| match res {
                Ok(val) => match downcast_val::<T>(&val) {
                    Some(v) => k(Ok(v)),
                    None => Action::Fault("sub result had unexpected type"),
                },
                Err(failure) => k(Err(failure)),
            }),
        }
    }))
}

/// Executes `body` atomically as a deterministic prelude, exempt from
/// schedule bounds and eligible for snapshotting. Must be the very first
/// action of the computation; anywhere else the run fails with
/// [`Failure::IllegalDontCheck`].
#[must_use]
pub fn dont_check<T: Any + Clone>(bound: Option<usize>, body: Program<T>) -> Program<T> {
    Program(Box::new(move |k| {
        let slot: ResultSlot = Rc::new(RefCell::new(None));
        let fill = Rc::clone(&slot);
        Action::DontCheck {
            bound,
            body: Box::new(body.into_action(Box::new(move |t| {
                *fill.borrow_mut() = Some(Rc::new(t) as Val);
                Action::Stop
            }))),
            slot,
            cont: Box::new(move |val| match downcast_val::<T>(&val) {
                Some(v) => k(v),
                None => Action::Fault("prelude result had unexpected type"),
            }),
        }
    }))
}

// === Cells ===

/// Allocates a mutable cell holding `value`.
#[must_use]
pub fn new_cell<V: Any>(name: Option<&str>, value: V) -> Program<CellRef<V>> {
    let name = name.map(str::to_owned);
    Program(Box::new(move |k| Action::NewCell {
        name,
        init: Rc::new(value),
        cont: Box::new(move |id| {
            k(CellRef {
                id,
                _marker: PhantomData,
            })
        }),
    }))
}

/// A typed handle to a mutable cell.
pub struct CellRef<V> {
    id: CellId,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for CellRef<V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<V> Copy for CellRef<V> {}

impl<V> fmt::Debug for CellRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellRef({})", self.id)
    }
}

impl<V: Any> CellRef<V> {
    /// The raw id of this cell.
    #[must_use]
    pub fn id(self) -> CellId {
        self.id
    }

    /// Writes the cell. Under TSO/PSO the write lands in the writer's
    /// buffer; a separate commit step makes it globally visible.
    #[must_use]
    pub fn write(self, value: V) -> Program<()> {
        Program(Box::new(move |k| Action::WriteCell {
            cell: self.id,
            value: Rc::new(value),
            cont: Box::new(k(())),
        }))
    }
}

impl<V: Any + Clone> CellRef<V> {
    /// Reads the cell: the calling thread's most recent buffered write if
    /// any, else the committed value. Never blocks.
    #[must_use]
    pub fn read(self) -> Program<V> {
        Program(Box::new(move |k| Action::ReadCell {
            cell: self.id,
            cont: cast_cont(k, "cell value had unexpected type"),
        }))
    }

    /// Reads the cell and obtains a ticket for a later [`Self::cas`].
    #[must_use]
    pub fn read_for_cas(self) -> Program<CasTicket<V>> {
        Program(Box::new(move |k| Action::ReadForCas {
            cell: self.id,
            cont: Box::new(move |ticket| {
                k(CasTicket {
                    ticket,
                    _marker: PhantomData,
                })
            }),
        }))
    }

    /// Compare-and-swap: commits every pending write to this cell, then
    /// atomically replaces the value if `ticket` is still current. Returns
    /// whether the swap happened and a fresh ticket.
    #[must_use]
    pub fn cas(self, ticket: CasTicket<V>, value: V) -> Program<(bool, CasTicket<V>)> {
        Program(Box::new(move |k| Action::CasCell {
            cell: self.id,
            ticket: ticket.ticket,
            value: Rc::new(value),
            cont: Box::new(move |(ok, ticket)| {
                k((
                    ok,
                    CasTicket {
                        ticket,
                        _marker: PhantomData,
                    },
                ))
            }),
        }))
    }

    /// Applies `f` to the cell non-atomically (a read then a buffered
    /// write). Returns the previous value.
    #[must_use]
    pub fn modify(self, f: impl FnOnce(&V) -> V + 'static) -> Program<V> {
        Program(Box::new(move |k| Action::ModCell {
            cell: self.id,
            f: mod_fn(f),
            cont: cast_cont(k, "cell value had unexpected type"),
        }))
    }

    /// Applies `f` to the cell atomically, behind a per-cell barrier.
    /// Returns the previous value.
    #[must_use]
    pub fn modify_cas(self, f: impl FnOnce(&V) -> V + 'static) -> Program<V> {
        Program(Box::new(move |k| Action::ModCellCas {
            cell: self.id,
            f: mod_fn(f),
            cont: cast_cont(k, "cell value had unexpected type"),
        }))
    }
}

fn mod_fn<V: Any + Clone>(f: impl FnOnce(&V) -> V + 'static) -> Box<dyn FnOnce(&Val) -> Val> {
    Box::new(move |old| match old.downcast_ref::<V>() {
        Some(v) => Rc::new(f(v)) as Val,
        None => Rc::clone(old),
    })
}

fn cast_cont<V: Any + Clone>(k: Cont<V>, fault: &'static str) -> Cont<Val> {
    Box::new(move |val| match downcast_val::<V>(&val) {
        Some(v) => k(v),
        None => Action::Fault(fault),
    })
}

/// A typed CAS ticket: an observed version of a cell.
pub struct CasTicket<V> {
    ticket: Ticket,
    _marker: PhantomData<fn() -> V>,
}

impl<V> fmt::Debug for CasTicket<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ticket.fmt(f)
    }
}

impl<V: Any + Clone> CasTicket<V> {
    /// The value observed when this ticket was issued.
    #[must_use]
    pub fn peek(&self) -> Option<V> {
        downcast_val::<V>(&self.ticket.observed)
    }
}

// === MVars ===

/// Allocates an empty MVar.
#[must_use]
pub fn new_mvar<V: Any>(name: Option<&str>) -> Program<MVarRef<V>> {
    let name = name.map(str::to_owned);
    Program(Box::new(move |k| Action::NewMVar {
        name,
        cont: Box::new(move |id| {
            k(MVarRef {
                id,
                _marker: PhantomData,
            })
        }),
    }))
}

/// A typed handle to an MVar (blocking single-slot channel).
pub struct MVarRef<V> {
    id: MVarId,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for MVarRef<V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<V> Copy for MVarRef<V> {}

impl<V> fmt::Debug for MVarRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MVarRef({})", self.id)
    }
}

impl<V: Any> MVarRef<V> {
    /// The raw id of this MVar.
    #[must_use]
    pub fn id(self) -> MVarId {
        self.id
    }

    /// Puts a value, blocking while the MVar is full.
    #[must_use]
    pub fn put(self, value: V) -> Program<()> {
        Program(Box::new(move |k| Action::PutMVar {
            mvar: self.id,
            value: Rc::new(value),
            cont: Box::new(k(())),
        }))
    }

    /// Puts a value if the MVar is empty; never blocks.
    #[must_use]
    pub fn try_put(self, value: V) -> Program<bool> {
        Program(Box::new(move |k| Action::TryPutMVar {
            mvar: self.id,
            value: Rc::new(value),
            cont: k,
        }))
    }
}

impl<V: Any + Clone> MVarRef<V> {
    /// Takes the value, blocking while the MVar is empty.
    #[must_use]
    pub fn take(self) -> Program<V> {
        Program(Box::new(move |k| Action::TakeMVar {
            mvar: self.id,
            cont: cast_cont(k, "mvar value had unexpected type"),
        }))
    }

    /// Takes the value if present; never blocks.
    #[must_use]
    pub fn try_take(self) -> Program<Option<V>> {
        Program(Box::new(move |k| Action::TryTakeMVar {
            mvar: self.id,
            cont: cast_opt_cont(k),
        }))
    }

    /// Reads the value without taking it, blocking while empty.
    #[must_use]
    pub fn read(self) -> Program<V> {
        Program(Box::new(move |k| Action::ReadMVar {
            mvar: self.id,
            cont: cast_cont(k, "mvar value had unexpected type"),
        }))
    }

    /// Reads the value if present; never blocks.
    #[must_use]
    pub fn try_read(self) -> Program<Option<V>> {
        Program(Box::new(move |k| Action::TryReadMVar {
            mvar: self.id,
            cont: cast_opt_cont(k),
        }))
    }
}

fn cast_opt_cont<V: Any + Clone>(k: Cont<Option<V>>) -> Cont<Option<Val>> {
    Box::new(move |val| match val {
        None => k(None),
        Some(val) => match downcast_val::<V>(&val) {
            Some(v) => k(Some(v)),
            None => Action::Fault("mvar value had unexpected type"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Lookahead;

    fn head<T: 'static>(p: Program<T>) -> Action {
        p.into_action(Box::new(|_| Action::Stop))
    }

    #[test]
    fn pure_program_reaches_stop() {
        assert!(matches!(head(Program::pure(1)), Action::Stop));
    }

    #[test]
    fn and_then_threads_values() {
        let p = Program::pure(20).and_then(|v| Program::pure(v + 1));
        let action = p.into_action(Box::new(|v| {
            assert_eq!(v, 21);
            Action::Stop
        }));
        assert!(matches!(action, Action::Stop));
    }

    #[test]
    fn primitives_reify_to_expected_heads() {
        assert_eq!(head(yield_now()).lookahead(), Lookahead::WillYield);
        assert_eq!(head(my_thread_id()).lookahead(), Lookahead::WillMyThreadId);
        assert_eq!(
            head(new_cell(None, 0i32)).lookahead(),
            Lookahead::WillNewCell
        );
        assert_eq!(head(new_mvar::<i32>(None)).lookahead(), Lookahead::WillNewMVar);
        assert_eq!(
            head(throw::<(), _>("boom")).lookahead(),
            Lookahead::WillThrow
        );
        assert_eq!(
            head(atomically(|| Stm::pure(0i32))).lookahead(),
            Lookahead::WillStm
        );
        assert_eq!(
            head(dont_check(None, Program::pure(0i32))).lookahead(),
            Lookahead::WillDontCheck
        );
    }

    #[test]
    fn exceptions_match_by_type() {
        #[derive(Debug)]
        struct Custom(#[allow(dead_code)] i32);
        let exc = Exception::new(Custom(7));
        assert!(exc.is::<Custom>());
        assert!(!exc.is::<String>());
        assert_eq!(exc.downcast::<Custom>().map(|e| e.0), Some(7));
        assert_eq!(exc.describe(), "Custom(7)");
    }

    #[test]
    fn mask_builds_masking_node() {
        let p = mask(|_| Program::pure(1));
        assert!(matches!(
            head(p),
            Action::Masking {
                state: MaskState::MaskedInterruptible,
                ..
            }
        ));
    }
}
