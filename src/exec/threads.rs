//! The thread table.
//!
//! Each interpreted thread is a record holding its remaining computation
//! (an action tree), its blocking reason, its exception-handler stack
//! (inner to outer), and its mask state.
//!
//! A thread in the table is either runnable (no blocking reason) or blocked
//! on exactly one primitive. Threads are removed on terminal `Stop` or when
//! an uncaught exception kills them.

use crate::program::action::Action;
use crate::program::Exception;
use crate::trace::MaskState;
use crate::types::{MVarId, TVarId, ThreadId};
use std::any::TypeId;
use std::collections::BTreeMap;

/// Why a thread is not runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockReason {
    /// Waiting to put into a full MVar.
    MVarPut(MVarId),
    /// Waiting to take from an empty MVar.
    MVarTake(MVarId),
    /// Waiting to read an empty MVar.
    MVarRead(MVarId),
    /// Waiting in an STM retry for one of these TVars to change.
    Stm(Vec<TVarId>),
    /// Waiting for the target of a synchronous `throw_to` to become
    /// interruptible.
    ThrowTo(ThreadId),
    /// Waiting for a nested subcomputation to finish.
    Sub,
}

impl BlockReason {
    /// Blocking on these primitives is interruptible under
    /// `MaskedInterruptible`.
    pub(crate) const fn interruptible(&self) -> bool {
        matches!(
            self,
            Self::MVarPut(_) | Self::MVarTake(_) | Self::MVarRead(_) | Self::Stm(_)
        )
    }
}

/// An installed exception handler, with the mask state and mask-stack depth
/// to restore when it fires (unwinding may skip mask-block exits).
pub(crate) struct Handler {
    pub(crate) exc_type: TypeId,
    pub(crate) apply: Box<dyn FnOnce(Exception) -> Action>,
    pub(crate) saved_mask: MaskState,
    pub(crate) saved_depth: usize,
}

pub(crate) struct Thread {
    pub(crate) name: Option<String>,
    /// The remainder of the computation. `None` only transiently while the
    /// interpreter holds the action it is executing.
    pub(crate) continuation: Option<Action>,
    pub(crate) block: Option<BlockReason>,
    pub(crate) handlers: Vec<Handler>,
    pub(crate) masking: MaskState,
    pub(crate) mask_stack: Vec<MaskState>,
    pub(crate) bound: bool,
    /// Created during the currently-running subcomputation.
    pub(crate) in_sub: bool,
}

impl Thread {
    pub(crate) fn new(name: Option<String>, bound: bool, continuation: Action) -> Self {
        Self {
            name,
            continuation: Some(continuation),
            block: None,
            handlers: Vec::new(),
            masking: MaskState::Unmasked,
            mask_stack: Vec::new(),
            bound,
            in_sub: false,
        }
    }

    pub(crate) const fn runnable(&self) -> bool {
        self.block.is_none()
    }

    /// True if an asynchronous exception may be delivered right now.
    pub(crate) fn interruptible(&self) -> bool {
        match self.masking {
            MaskState::Unmasked => true,
            MaskState::MaskedInterruptible => self
                .block
                .as_ref()
                .is_some_and(BlockReason::interruptible),
            MaskState::MaskedUninterruptible => false,
        }
    }

    /// Unwinds the handler stack with `exc`. On a match, installs the
    /// handler's continuation, restoring its saved mask state and mask-stack
    /// depth, and returns true. Returns false when no handler matches; the
    /// thread must die.
    pub(crate) fn raise(&mut self, exc: Exception) -> bool {
        while let Some(handler) = self.handlers.pop() {
            if exc.matches_type(handler.exc_type) {
                self.mask_stack.truncate(handler.saved_depth);
                self.masking = handler.saved_mask;
                self.continuation = Some((handler.apply)(exc));
                self.block = None;
                return true;
            }
        }
        false
    }
}

/// All live threads, keyed by id. Iteration order is id order, which keeps
/// every consumer deterministic.
#[derive(Default)]
pub(crate) struct ThreadTable {
    threads: BTreeMap<ThreadId, Thread>,
}

impl ThreadTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, tid: ThreadId, thread: Thread) {
        self.threads.insert(tid, thread);
    }

    pub(crate) fn get(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub(crate) fn get_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub(crate) fn remove(&mut self, tid: ThreadId) -> Option<Thread> {
        self.threads.remove(&tid)
    }

    pub(crate) fn contains(&self, tid: ThreadId) -> bool {
        self.threads.contains_key(&tid)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ThreadId, &Thread)> {
        self.threads.iter().map(|(id, t)| (*id, t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> Thread {
        Thread::new(None, false, Action::Stop)
    }

    #[test]
    fn new_thread_is_runnable_and_unmasked() {
        let t = thread();
        assert!(t.runnable());
        assert!(t.interruptible());
        assert_eq!(t.masking, MaskState::Unmasked);
    }

    #[test]
    fn interruptible_depends_on_mask_and_block() {
        let mut t = thread();
        t.masking = MaskState::MaskedInterruptible;
        assert!(!t.interruptible());
        t.block = Some(BlockReason::MVarTake(MVarId::from_index(0)));
        assert!(t.interruptible());
        t.masking = MaskState::MaskedUninterruptible;
        assert!(!t.interruptible());
        t.block = Some(BlockReason::ThrowTo(ThreadId::ROOT));
        t.masking = MaskState::MaskedInterruptible;
        assert!(!t.interruptible());
    }

    #[test]
    fn raise_finds_matching_handler_and_restores_mask() {
        let mut t = thread();
        t.masking = MaskState::MaskedUninterruptible;
        t.mask_stack.push(MaskState::Unmasked);
        t.handlers.push(Handler {
            exc_type: TypeId::of::<&'static str>(),
            apply: Box::new(|_| Action::Stop),
            saved_mask: MaskState::Unmasked,
            saved_depth: 0,
        });
        assert!(t.raise(Exception::new("boom")));
        assert_eq!(t.masking, MaskState::Unmasked);
        // The mask entry skipped by the unwind is discarded.
        assert!(t.mask_stack.is_empty());
        assert!(t.continuation.is_some());
        assert!(t.handlers.is_empty());
    }

    #[test]
    fn raise_skips_mismatched_handlers() {
        let mut t = thread();
        t.handlers.push(Handler {
            exc_type: TypeId::of::<i32>(),
            apply: Box::new(|_| Action::Stop),
            saved_mask: MaskState::Unmasked,
            saved_depth: 0,
        });
        assert!(!t.raise(Exception::new("boom")));
        assert!(t.handlers.is_empty());
    }

    #[test]
    fn blocked_threads_are_not_runnable() {
        let mut t = thread();
        assert!(t.runnable());
        t.block = Some(BlockReason::Stm(vec![TVarId::from_index(0)]));
        assert!(!t.runnable());
        t.block = Some(BlockReason::MVarTake(MVarId::from_index(0)));
        assert!(!t.runnable());
    }
}
