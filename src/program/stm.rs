//! The transactional sub-language.
//!
//! An [`Stm`] value describes a transaction over TVars. Transactions execute
//! to completion within one visible interpreter step: reads and writes log
//! against the transaction, and the log applies under a single memory
//! barrier on commit. `retry` abandons the attempt and blocks the thread
//! until some TVar in the attempt's read set changes.
//!
//! Because a retried transaction re-executes from scratch, the entry point
//! [`crate::program::atomically`] takes a *factory* closure producing a
//! fresh `Stm` per attempt.

use crate::program::action::Val;
use crate::program::{downcast_val, Exception};
use crate::types::TVarId;
use core::fmt;
use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

pub(crate) type StmCont<A> = Box<dyn FnOnce(A) -> StmAction>;

pub(crate) enum StmAction {
    NewTVar {
        name: Option<String>,
        init: Val,
        cont: StmCont<TVarId>,
    },
    ReadTVar {
        tvar: TVarId,
        cont: StmCont<Val>,
    },
    WriteTVar {
        tvar: TVarId,
        value: Val,
        cont: Box<StmAction>,
    },
    Retry,
    Throw(Exception),
    Stop(Val),
    Fault(&'static str),
}

impl fmt::Debug for StmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::NewTVar { .. } => "new_tvar",
            Self::ReadTVar { .. } => "read_tvar",
            Self::WriteTVar { .. } => "write_tvar",
            Self::Retry => "retry",
            Self::Throw(_) => "throw",
            Self::Stop(_) => "stop",
            Self::Fault(_) => "fault",
        };
        write!(f, "StmAction({tag})")
    }
}

/// A composable transaction returning `T`.
pub struct Stm<T>(pub(crate) Box<dyn FnOnce(StmCont<T>) -> StmAction>);

impl<T: 'static> Stm<T> {
    /// A transaction that returns `value` without touching any TVar.
    pub fn pure(value: T) -> Self {
        Self(Box::new(move |k| k(value)))
    }

    /// Sequences `self` with a dependent continuation.
    #[must_use]
    pub fn and_then<U: 'static>(self, f: impl FnOnce(T) -> Stm<U> + 'static) -> Stm<U> {
        Stm(Box::new(move |k| (self.0)(Box::new(move |t| (f(t).0)(k)))))
    }

    /// Applies a function to the transaction's result.
    #[must_use]
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Stm<U> {
        self.and_then(|t| Stm::pure(f(t)))
    }

    /// Sequences `self` with an independent follow-up, discarding `self`'s
    /// result.
    #[must_use]
    pub fn then<U: 'static>(self, next: Stm<U>) -> Stm<U> {
        self.and_then(move |_| next)
    }

    pub(crate) fn into_action(self, k: StmCont<T>) -> StmAction {
        (self.0)(k)
    }
}

/// Abandons the current attempt; the thread blocks until a TVar in the
/// attempt's read set changes, then the transaction re-executes.
#[must_use]
pub fn retry<T: 'static>() -> Stm<T> {
    Stm(Box::new(|_| StmAction::Retry))
}

/// Aborts the transaction with an exception: the log is discarded and the
/// exception propagates in the calling thread.
#[must_use]
pub fn throw<T: 'static, E: Any + fmt::Debug>(exc: E) -> Stm<T> {
    Stm(Box::new(move |_| StmAction::Throw(Exception::new(exc))))
}

/// Allocates a fresh TVar holding `value`.
#[must_use]
pub fn new_tvar<V: Any>(name: Option<&str>, value: V) -> Stm<TVarRef<V>> {
    let name = name.map(str::to_owned);
    Stm(Box::new(move |k| StmAction::NewTVar {
        name,
        init: Rc::new(value),
        cont: Box::new(move |id| {
            k(TVarRef {
                id,
                _marker: PhantomData,
            })
        }),
    }))
}

/// `retry` unless `cond` holds.
#[must_use]
pub fn check(cond: bool) -> Stm<()> {
    if cond {
        Stm::pure(())
    } else {
        retry()
    }
}

/// A typed handle to a TVar, readable and writable only inside
/// transactions.
pub struct TVarRef<V> {
    id: TVarId,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for TVarRef<V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<V> Copy for TVarRef<V> {}

impl<V> fmt::Debug for TVarRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TVarRef({})", self.id)
    }
}

impl<V: Any> TVarRef<V> {
    pub(crate) fn from_raw(id: TVarId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The raw id of this TVar.
    #[must_use]
    pub fn id(self) -> TVarId {
        self.id
    }

    /// Writes the TVar within the transaction log.
    #[must_use]
    pub fn write(self, value: V) -> Stm<()> {
        Stm(Box::new(move |k| StmAction::WriteTVar {
            tvar: self.id,
            value: Rc::new(value),
            cont: Box::new(k(())),
        }))
    }
}

impl<V: Any + Clone> TVarRef<V> {
    /// Reads the TVar, recording its version in the transaction's read set.
    #[must_use]
    pub fn read(self) -> Stm<V> {
        Stm(Box::new(move |k| StmAction::ReadTVar {
            tvar: self.id,
            cont: Box::new(move |val| match downcast_val::<V>(&val) {
                Some(v) => k(v),
                None => StmAction::Fault("TVar value had unexpected type"),
            }),
        }))
    }

    /// Applies `f` to the TVar's value, returning the previous value.
    #[must_use]
    pub fn modify(self, f: impl FnOnce(&V) -> V + 'static) -> Stm<V> {
        self.read()
            .and_then(move |old| self.write(f(&old)).map(move |()| old))
    }
}
