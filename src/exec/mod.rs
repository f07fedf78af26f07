//! The action interpreter.
//!
//! [`Context`] bundles the thread table, the memory model, the MVar and TVar
//! stores, and the id source. [`Context::step`] advances exactly one action
//! of one thread (or one commit pseudo-thread) and reports what happened as
//! a [`ThreadAction`]; the exploration driver owns the loop around it.
//!
//! Blocking is modeled by parking the un-executed action back into the
//! thread table: a woken thread simply re-executes its action, which now
//! succeeds (or blocks again if it lost the race). A thread blocked in a
//! synchronous `throw_to` is special: it becomes runnable-by-proxy the
//! moment its target is interruptible or dead, and delivery happens when the
//! scheduler picks it again.

pub(crate) mod memory;
pub(crate) mod stm;
pub(crate) mod threads;

use crate::error::Failure;
use crate::program::action::{Action, ResultSlot, Val};
use crate::program::Exception;
use crate::settings::MemType;
use crate::trace::{Lookahead, MaskState, ThreadAction, ThreadSet, TVarSet};
use crate::types::{IdSource, MVarId, ThreadId};
use memory::MemoryModel;
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use stm::{run_transaction, TVarTable, TxOutcome};
use threads::{BlockReason, Handler, Thread, ThreadTable};

/// An MVar: an optional value plus FIFO wait queues. `consumers` holds both
/// take- and read-waiters in arrival order; `producers` holds put-waiters.
struct MVar {
    #[allow(dead_code)]
    name: Option<String>,
    value: Option<Val>,
    consumers: VecDeque<ThreadId>,
    producers: VecDeque<ThreadId>,
}

/// A running subcomputation.
struct SubState {
    caller: ThreadId,
    root: ThreadId,
    slot: ResultSlot,
    cont: Box<dyn FnOnce(Result<Val, Failure>) -> Action>,
}

/// What one interpreter step produced.
pub(crate) enum StepOutcome {
    /// A normal step; the action goes into the trace.
    Event(ThreadAction),
    /// The whole run ends with this failure. When the failing step itself
    /// was an observable action (an uncaught throw, say), it is carried
    /// along so the trace can end with it.
    Fatal(Failure, Option<ThreadAction>),
}

pub(crate) struct Context {
    pub(crate) threads: ThreadTable,
    pub(crate) memory: MemoryModel,
    mvars: BTreeMap<MVarId, MVar>,
    tvars: TVarTable,
    pub(crate) ids: IdSource,
    capabilities: usize,
    supports_bound_threads: bool,
    sub: Option<SubState>,
    in_dont_check: bool,
    steps_taken: usize,
    /// Step records of the deterministic prelude, kept as the replay log.
    pub(crate) prelude_log: Vec<ThreadAction>,
}

impl Context {
    /// A fresh context whose root thread runs `root`.
    pub(crate) fn new(memtype: MemType, supports_bound_threads: bool, root: Action) -> Self {
        let mut ids = IdSource::new();
        let root_tid = ids.fresh_thread();
        debug_assert_eq!(root_tid, ThreadId::ROOT);
        let mut threads = ThreadTable::new();
        threads.insert(root_tid, Thread::new(Some("main".to_owned()), false, root));
        Self {
            threads,
            memory: MemoryModel::new(memtype),
            mvars: BTreeMap::new(),
            tvars: TVarTable::new(),
            ids,
            capabilities: 2,
            supports_bound_threads,
            sub: None,
            in_dont_check: false,
            steps_taken: 0,
            prelude_log: Vec::new(),
        }
    }

    /// True once the root thread has left the table: the computation is
    /// over, whatever other threads remain.
    pub(crate) fn root_done(&self) -> bool {
        !self.threads.contains(ThreadId::ROOT)
    }

    pub(crate) fn sub_active(&self) -> bool {
        self.sub.is_some()
    }

    /// Whether `tid` may be scheduled right now. A thread blocked in
    /// `throw_to` is runnable-by-proxy once its target is interruptible or
    /// gone.
    fn is_runnable_now(&self, tid: ThreadId) -> bool {
        let Some(thread) = self.threads.get(tid) else {
            return false;
        };
        match &thread.block {
            None => true,
            Some(BlockReason::ThrowTo(target)) => self
                .threads
                .get(*target)
                .map_or(true, Thread::interruptible),
            Some(_) => false,
        }
    }

    /// Every schedulable id with its lookahead: runnable user threads in id
    /// order, then commit pseudo-threads.
    pub(crate) fn runnable(&self) -> Vec<(ThreadId, Lookahead)> {
        let mut out: Vec<(ThreadId, Lookahead)> = self
            .threads
            .iter()
            .filter(|(tid, _)| self.is_runnable_now(*tid))
            .filter_map(|(tid, t)| t.continuation.as_ref().map(|c| (tid, c.lookahead())))
            .collect();
        for opt in self.memory.commit_options() {
            out.push((
                opt.commit_tid,
                Lookahead::WillCommitWrite {
                    writer: opt.writer,
                    cell: opt.cell,
                },
            ));
        }
        out.sort_by_key(|(tid, _)| *tid);
        out
    }

    /// Classifies the failure when nothing is runnable, over the given
    /// thread subset.
    pub(crate) fn deadlock_failure(&self, only_sub: bool) -> Failure {
        let mut any = false;
        let mut all_stm = true;
        for (_, t) in self.threads.iter() {
            if only_sub && !t.in_sub {
                continue;
            }
            any = true;
            if !matches!(t.block, Some(BlockReason::Stm(_))) {
                all_stm = false;
            }
        }
        if any && all_stm {
            Failure::StmDeadlock
        } else {
            Failure::Deadlock
        }
    }

    /// Resolves a deadlocked subcomputation: kills its threads and resumes
    /// the caller with the failure. The runner calls this when nothing is
    /// runnable but a sub is active.
    pub(crate) fn fail_sub(&mut self) -> Option<(ThreadId, ThreadAction)> {
        if self.sub.is_none() {
            return None;
        }
        let failure = self.deadlock_failure(true);
        let caller = self.complete_sub(Err(failure));
        Some((caller, ThreadAction::SubEnd))
    }

    /// Advances `tid` by one action.
    pub(crate) fn step(&mut self, tid: ThreadId) -> StepOutcome {
        let first_step = self.steps_taken == 0;
        self.steps_taken += 1;

        if tid.is_commit() {
            return self.step_commit(tid);
        }
        if !self.is_runnable_now(tid) {
            return StepOutcome::Fatal(Failure::Deadlock, None);
        }
        let Some(action) = self
            .threads
            .get_mut(tid)
            .and_then(|t| t.continuation.take())
        else {
            return StepOutcome::Fatal(Failure::Deadlock, None);
        };
        self.dispatch(tid, action, first_step)
    }

    fn step_commit(&mut self, tid: ThreadId) -> StepOutcome {
        let Some(opt) = self
            .memory
            .commit_options()
            .into_iter()
            .find(|o| o.commit_tid == tid)
        else {
            return StepOutcome::Fatal(Failure::Deadlock, None);
        };
        match self.memory.commit(opt.writer, opt.cell) {
            Ok(()) => StepOutcome::Event(ThreadAction::CommitWrite {
                writer: opt.writer,
                cell: opt.cell,
            }),
            Err(msg) => StepOutcome::Fatal(Failure::InternalError(msg), None),
        }
    }

    fn resume(&mut self, tid: ThreadId, action: Action) {
        if let Some(t) = self.threads.get_mut(tid) {
            t.continuation = Some(action);
        }
    }

    fn block(&mut self, tid: ThreadId, action: Action, reason: BlockReason) {
        if let Some(t) = self.threads.get_mut(tid) {
            t.continuation = Some(action);
            t.block = Some(reason);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, tid: ThreadId, action: Action, first_step: bool) -> StepOutcome {
        match action {
            // === Control ===
            Action::Fork {
                name,
                os,
                body,
                cont,
            } => {
                if os && !self.supports_bound_threads {
                    return StepOutcome::Fatal(Failure::UnsupportedBoundThread, None);
                }
                let child = self.ids.fresh_thread();
                let mut thread = Thread::new(name, os, *body);
                thread.in_sub = self.threads.get(tid).is_some_and(|t| t.in_sub);
                self.threads.insert(child, thread);
                self.resume(tid, cont(child));
                StepOutcome::Event(if os {
                    ThreadAction::ForkOs { child }
                } else {
                    ThreadAction::Fork { child }
                })
            }
            Action::MyThreadId(cont) => {
                self.resume(tid, cont(tid));
                StepOutcome::Event(ThreadAction::MyThreadId)
            }
            Action::Yield(cont) => {
                self.resume(tid, *cont);
                StepOutcome::Event(ThreadAction::Yield)
            }
            Action::ThreadDelay(micros, cont) => {
                self.resume(tid, *cont);
                StepOutcome::Event(ThreadAction::ThreadDelay { micros })
            }
            Action::GetNumCapabilities(cont) => {
                let count = self.capabilities;
                self.resume(tid, cont(count));
                StepOutcome::Event(ThreadAction::GetNumCapabilities { count })
            }
            Action::SetNumCapabilities(count, cont) => {
                self.capabilities = count.max(1);
                self.resume(tid, *cont);
                StepOutcome::Event(ThreadAction::SetNumCapabilities { count })
            }
            Action::IsCurrentThreadBound(cont) => {
                let bound = self.threads.get(tid).is_some_and(|t| t.bound);
                self.resume(tid, cont(bound));
                StepOutcome::Event(ThreadAction::IsCurrentThreadBound { bound })
            }
            Action::Lift(effect) => {
                let next = effect();
                self.resume(tid, next);
                StepOutcome::Event(ThreadAction::LiftedEffect)
            }
            Action::Message(text, cont) => {
                self.resume(tid, *cont);
                StepOutcome::Event(ThreadAction::Message { text })
            }
            Action::Stop => self.stop_thread(tid),
            Action::Fault(msg) => StepOutcome::Fatal(Failure::InternalError(msg.to_owned()), None),

            // === Cells ===
            Action::NewCell { name, init, cont } => {
                let cell = self.ids.fresh_cell();
                self.memory.new_cell(cell, name, init);
                self.resume(tid, cont(cell));
                StepOutcome::Event(ThreadAction::NewCell { cell })
            }
            Action::ReadCell { cell, cont } => match self.memory.read(tid, cell) {
                Some(val) => {
                    self.resume(tid, cont(val));
                    StepOutcome::Event(ThreadAction::ReadCell { cell })
                }
                None => internal(format!("read of unknown cell {cell}")),
            },
            Action::ReadForCas { cell, cont } => match self.memory.ticket(cell) {
                Some(ticket) => {
                    self.resume(tid, cont(ticket));
                    StepOutcome::Event(ThreadAction::ReadForCas { cell })
                }
                None => internal(format!("ticket for unknown cell {cell}")),
            },
            Action::WriteCell { cell, value, cont } => {
                if !self.memory.cell_exists(cell) {
                    return internal(format!("write to unknown cell {cell}"));
                }
                self.memory.write(tid, cell, value);
                self.resume(tid, *cont);
                StepOutcome::Event(ThreadAction::WriteCell { cell })
            }
            Action::CasCell {
                cell,
                ticket,
                value,
                cont,
            } => {
                self.memory.barrier_cell(cell);
                match self.memory.cas(cell, &ticket, value) {
                    Ok((succeeded, fresh)) => {
                        self.resume(tid, cont((succeeded, fresh)));
                        StepOutcome::Event(ThreadAction::CasCell { cell, succeeded })
                    }
                    Err(msg) => internal(msg),
                }
            }
            Action::ModCell { cell, f, cont } => match self.memory.read(tid, cell) {
                // Non-atomic: this step only reads; the write is a separate
                // event, so another thread can interleave between the two.
                Some(old) => {
                    let new = f(&old);
                    self.resume(
                        tid,
                        Action::WriteCell {
                            cell,
                            value: new,
                            cont: Box::new(cont(old)),
                        },
                    );
                    StepOutcome::Event(ThreadAction::ModCell { cell })
                }
                None => internal(format!("modify of unknown cell {cell}")),
            },
            Action::ModCellCas { cell, f, cont } => {
                self.memory.barrier_cell(cell);
                match self.memory.committed(cell) {
                    Some((old, _)) => {
                        let new = f(&old);
                        self.memory.commit_value(cell, new);
                        self.resume(tid, cont(old));
                        StepOutcome::Event(ThreadAction::ModCellCas { cell })
                    }
                    None => internal(format!("modify of unknown cell {cell}")),
                }
            }

            // === MVars ===
            Action::NewMVar { name, cont } => {
                let mvar = self.ids.fresh_mvar();
                self.mvars.insert(
                    mvar,
                    MVar {
                        name,
                        value: None,
                        consumers: VecDeque::new(),
                        producers: VecDeque::new(),
                    },
                );
                self.resume(tid, cont(mvar));
                StepOutcome::Event(ThreadAction::NewMVar { mvar })
            }
            Action::PutMVar { mvar, value, cont } => {
                let Some(entry) = self.mvars.get_mut(&mvar) else {
                    return internal(format!("put to unknown mvar {mvar}"));
                };
                if entry.value.is_some() {
                    entry.producers.push_back(tid);
                    self.block(
                        tid,
                        Action::PutMVar { mvar, value, cont },
                        BlockReason::MVarPut(mvar),
                    );
                    StepOutcome::Event(ThreadAction::BlockedPutMVar { mvar })
                } else {
                    entry.value = Some(value);
                    let woken = self.wake_after_put(mvar);
                    self.resume(tid, *cont);
                    StepOutcome::Event(ThreadAction::PutMVar { mvar, woken })
                }
            }
            Action::TryPutMVar { mvar, value, cont } => {
                let Some(entry) = self.mvars.get_mut(&mvar) else {
                    return internal(format!("put to unknown mvar {mvar}"));
                };
                if entry.value.is_some() {
                    self.resume(tid, cont(false));
                    StepOutcome::Event(ThreadAction::TryPutMVar {
                        mvar,
                        succeeded: false,
                        woken: ThreadSet::new(),
                    })
                } else {
                    entry.value = Some(value);
                    let woken = self.wake_after_put(mvar);
                    self.resume(tid, cont(true));
                    StepOutcome::Event(ThreadAction::TryPutMVar {
                        mvar,
                        succeeded: true,
                        woken,
                    })
                }
            }
            Action::TakeMVar { mvar, cont } => {
                let Some(entry) = self.mvars.get_mut(&mvar) else {
                    return internal(format!("take from unknown mvar {mvar}"));
                };
                if let Some(value) = entry.value.take() {
                    let woken = self.wake_after_take(mvar);
                    self.resume(tid, cont(value));
                    StepOutcome::Event(ThreadAction::TakeMVar { mvar, woken })
                } else {
                    entry.consumers.push_back(tid);
                    self.block(
                        tid,
                        Action::TakeMVar { mvar, cont },
                        BlockReason::MVarTake(mvar),
                    );
                    StepOutcome::Event(ThreadAction::BlockedTakeMVar { mvar })
                }
            }
            Action::TryTakeMVar { mvar, cont } => {
                let Some(entry) = self.mvars.get_mut(&mvar) else {
                    return internal(format!("take from unknown mvar {mvar}"));
                };
                if let Some(value) = entry.value.take() {
                    let woken = self.wake_after_take(mvar);
                    self.resume(tid, cont(Some(value)));
                    StepOutcome::Event(ThreadAction::TryTakeMVar {
                        mvar,
                        succeeded: true,
                        woken,
                    })
                } else {
                    self.resume(tid, cont(None));
                    StepOutcome::Event(ThreadAction::TryTakeMVar {
                        mvar,
                        succeeded: false,
                        woken: ThreadSet::new(),
                    })
                }
            }
            Action::ReadMVar { mvar, cont } => {
                let Some(entry) = self.mvars.get_mut(&mvar) else {
                    return internal(format!("read of unknown mvar {mvar}"));
                };
                if let Some(value) = &entry.value {
                    let value = Rc::clone(value);
                    self.resume(tid, cont(value));
                    StepOutcome::Event(ThreadAction::ReadMVar { mvar })
                } else {
                    entry.consumers.push_back(tid);
                    self.block(
                        tid,
                        Action::ReadMVar { mvar, cont },
                        BlockReason::MVarRead(mvar),
                    );
                    StepOutcome::Event(ThreadAction::BlockedReadMVar { mvar })
                }
            }
            Action::TryReadMVar { mvar, cont } => {
                let Some(entry) = self.mvars.get(&mvar) else {
                    return internal(format!("read of unknown mvar {mvar}"));
                };
                let value = entry.value.as_ref().map(Rc::clone);
                let succeeded = value.is_some();
                self.resume(tid, cont(value));
                StepOutcome::Event(ThreadAction::TryReadMVar { mvar, succeeded })
            }

            // === Exceptions and masking ===
            Action::Throw(exc) => self.throw_in(tid, exc),
            Action::ThrowTo { target, exc, cont } => {
                if !self.threads.contains(target) {
                    // Delivery to a finished thread is a no-op.
                    self.resume(tid, *cont);
                    return StepOutcome::Event(ThreadAction::ThrowTo {
                        target,
                        delivered: true,
                    });
                }
                if self.threads.get(target).is_some_and(Thread::interruptible) {
                    self.cancel_block(target);
                    if let Some(fatal) = self.deliver(target, exc) {
                        return StepOutcome::Fatal(
                            fatal,
                            Some(ThreadAction::ThrowTo {
                                target,
                                delivered: true,
                            }),
                        );
                    }
                    self.resume(tid, *cont);
                    StepOutcome::Event(ThreadAction::ThrowTo {
                        target,
                        delivered: true,
                    })
                } else {
                    self.block(
                        tid,
                        Action::ThrowTo { target, exc, cont },
                        BlockReason::ThrowTo(target),
                    );
                    StepOutcome::Event(ThreadAction::BlockedThrowTo { target })
                }
            }
            Action::Catching {
                exc_type,
                handler,
                body,
            } => {
                if let Some(t) = self.threads.get_mut(tid) {
                    let saved_mask = t.masking;
                    let saved_depth = t.mask_stack.len();
                    t.handlers.push(Handler {
                        exc_type,
                        apply: handler,
                        saved_mask,
                        saved_depth,
                    });
                    t.continuation = Some(*body);
                }
                StepOutcome::Event(ThreadAction::Catching)
            }
            Action::PopCatching(cont) => {
                let Some(t) = self.threads.get_mut(tid) else {
                    return internal("pop_catching on missing thread".to_owned());
                };
                if t.handlers.pop().is_none() {
                    return internal("handler stack underflow".to_owned());
                }
                t.continuation = Some(*cont);
                StepOutcome::Event(ThreadAction::PopCatching)
            }
            Action::Masking { state, body } => {
                if let Some(t) = self.threads.get_mut(tid) {
                    t.mask_stack.push(t.masking);
                    t.masking = state;
                    t.continuation = Some(*body);
                }
                StepOutcome::Event(ThreadAction::Mask { state })
            }
            Action::Unmasking { body } => {
                let Some(t) = self.threads.get_mut(tid) else {
                    return internal("unmask on missing thread".to_owned());
                };
                let outer = t.mask_stack.last().copied().unwrap_or(MaskState::Unmasked);
                t.mask_stack.push(t.masking);
                t.masking = outer;
                t.continuation = Some(*body);
                StepOutcome::Event(ThreadAction::Mask { state: outer })
            }
            Action::ResetMask(cont) => {
                let Some(t) = self.threads.get_mut(tid) else {
                    return internal("reset_mask on missing thread".to_owned());
                };
                let state = t.mask_stack.pop().unwrap_or(MaskState::Unmasked);
                t.masking = state;
                t.continuation = Some(*cont);
                StepOutcome::Event(ThreadAction::ResetMask { state })
            }

            // === STM ===
            Action::Atomic { run, cont } => {
                match run_transaction(run.as_ref(), &mut self.tvars, &mut self.ids) {
                    TxOutcome::Committed { result, written } => {
                        // The commit is a full memory barrier.
                        if self.memory.memtype() != MemType::SequentialConsistency {
                            self.memory.barrier_all();
                        }
                        let woken = self.wake_stm(&written);
                        self.resume(tid, cont(result));
                        StepOutcome::Event(ThreadAction::Stm { written, woken })
                    }
                    TxOutcome::Retry { read } => {
                        let reason = BlockReason::Stm(read.to_vec());
                        self.block(tid, Action::Atomic { run, cont }, reason);
                        StepOutcome::Event(ThreadAction::BlockedStm { read })
                    }
                    TxOutcome::Aborted(exc) => self.throw_in(tid, exc),
                    TxOutcome::Fault(msg) => internal(msg.to_owned()),
                }
            }

            // === Meta ===
            Action::Sub { body, slot, cont } => {
                if self.sub.is_some() || self.in_dont_check {
                    return StepOutcome::Fatal(Failure::IllegalSubconcurrency, None);
                }
                let root = self.ids.fresh_thread();
                let mut thread = Thread::new(Some("sub".to_owned()), false, *body);
                thread.in_sub = true;
                self.threads.insert(root, thread);
                if let Some(t) = self.threads.get_mut(tid) {
                    t.block = Some(BlockReason::Sub);
                }
                self.sub = Some(SubState {
                    caller: tid,
                    root,
                    slot,
                    cont,
                });
                StepOutcome::Event(ThreadAction::SubStart)
            }
            Action::DontCheck {
                bound,
                body,
                slot,
                cont,
            } => {
                if !first_step || tid != ThreadId::ROOT {
                    return StepOutcome::Fatal(Failure::IllegalDontCheck, None);
                }
                self.run_prelude(bound, *body, &slot, cont)
            }
        }
    }

    // === Exception plumbing ===

    /// Raises `exc` in the acting thread itself.
    fn throw_in(&mut self, tid: ThreadId, exc: Exception) -> StepOutcome {
        let desc = exc.describe().to_owned();
        let handled = self
            .threads
            .get_mut(tid)
            .is_some_and(|t| t.raise(exc));
        if handled {
            return StepOutcome::Event(ThreadAction::Throw);
        }
        match self.thread_died_uncaught(tid, desc) {
            Some(fatal) => StepOutcome::Fatal(fatal, Some(ThreadAction::Throw)),
            None => StepOutcome::Event(ThreadAction::Throw),
        }
    }

    /// Delivers `exc` to an interruptible `target`. Returns a fatal failure
    /// if the target was the root and had no matching handler.
    fn deliver(&mut self, target: ThreadId, exc: Exception) -> Option<Failure> {
        let desc = exc.describe().to_owned();
        let handled = self
            .threads
            .get_mut(target)
            .is_some_and(|t| t.raise(exc));
        if handled {
            None
        } else {
            self.thread_died_uncaught(target, desc)
        }
    }

    /// Removes a thread killed by an unhandled exception. Root death fails
    /// the run; a sub root's death resolves the sub.
    fn thread_died_uncaught(&mut self, tid: ThreadId, desc: String) -> Option<Failure> {
        self.threads.remove(tid);
        if tid == ThreadId::ROOT {
            return Some(Failure::UncaughtException(desc));
        }
        if self.sub.as_ref().is_some_and(|s| s.root == tid) {
            self.complete_sub(Err(Failure::UncaughtException(desc)));
        }
        None
    }

    /// Clears a thread's blocking reason, removing it from whatever queue
    /// holds it. Tears down a subcomputation whose caller is interrupted.
    fn cancel_block(&mut self, tid: ThreadId) {
        let Some(t) = self.threads.get_mut(tid) else {
            return;
        };
        match t.block.take() {
            Some(BlockReason::MVarPut(m)) => {
                if let Some(entry) = self.mvars.get_mut(&m) {
                    entry.producers.retain(|&x| x != tid);
                }
            }
            Some(BlockReason::MVarTake(m) | BlockReason::MVarRead(m)) => {
                if let Some(entry) = self.mvars.get_mut(&m) {
                    entry.consumers.retain(|&x| x != tid);
                }
            }
            Some(BlockReason::Sub) => {
                if self.sub.as_ref().is_some_and(|s| s.caller == tid) {
                    self.abandon_sub();
                }
            }
            _ => {}
        }
    }

    // === Thread termination ===

    fn stop_thread(&mut self, tid: ThreadId) -> StepOutcome {
        if self.sub.as_ref().is_some_and(|s| s.root == tid) {
            self.threads.remove(tid);
            let result = self
                .sub
                .as_ref()
                .and_then(|s| s.slot.borrow_mut().take());
            match result {
                Some(val) => {
                    self.complete_sub(Ok(val));
                    StepOutcome::Event(ThreadAction::SubEnd)
                }
                None => internal("sub terminated without a result".to_owned()),
            }
        } else {
            self.threads.remove(tid);
            StepOutcome::Event(ThreadAction::Stop)
        }
    }

    /// Finishes the active sub: kills its threads and resumes the caller
    /// with `outcome`. Returns the caller id.
    fn complete_sub(&mut self, outcome: Result<Val, Failure>) -> ThreadId {
        let Some(state) = self.sub.take() else {
            unreachable!("complete_sub without an active sub");
        };
        self.kill_sub_threads();
        if let Some(caller) = self.threads.get_mut(state.caller) {
            caller.block = None;
            caller.continuation = Some((state.cont)(outcome));
        }
        state.caller
    }

    /// Discards the active sub without resuming anyone (the caller was
    /// killed by an asynchronous exception).
    fn abandon_sub(&mut self) {
        if self.sub.take().is_some() {
            self.kill_sub_threads();
        }
    }

    fn kill_sub_threads(&mut self) {
        let dead: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|(_, t)| t.in_sub)
            .map(|(tid, _)| tid)
            .collect();
        for tid in dead {
            self.cancel_block(tid);
            self.threads.remove(tid);
        }
    }

    // === MVar wake rules ===

    /// After a put fills the MVar: wake read-waiters from the front of the
    /// consumer queue, up to and including the first take-waiter.
    fn wake_after_put(&mut self, mvar: MVarId) -> ThreadSet {
        let mut woken = ThreadSet::new();
        loop {
            let Some(front) = self
                .mvars
                .get_mut(&mvar)
                .and_then(|e| e.consumers.pop_front())
            else {
                break;
            };
            let Some(t) = self.threads.get_mut(front) else {
                continue;
            };
            let was_take = matches!(t.block, Some(BlockReason::MVarTake(_)));
            t.block = None;
            woken.push(front);
            if was_take {
                break;
            }
        }
        woken
    }

    /// After a take empties the MVar: wake the oldest blocked producer.
    fn wake_after_take(&mut self, mvar: MVarId) -> ThreadSet {
        let mut woken = ThreadSet::new();
        if let Some(front) = self
            .mvars
            .get_mut(&mvar)
            .and_then(|e| e.producers.pop_front())
        {
            if let Some(t) = self.threads.get_mut(front) {
                t.block = None;
                woken.push(front);
            }
        }
        woken
    }

    /// Wakes every thread whose STM retry watches one of `written`.
    fn wake_stm(&mut self, written: &TVarSet) -> ThreadSet {
        let to_wake: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|(_, t)| match &t.block {
                Some(BlockReason::Stm(read)) => read.iter().any(|v| written.contains(v)),
                _ => false,
            })
            .map(|(tid, _)| tid)
            .collect();
        let mut woken = ThreadSet::new();
        for tid in to_wake {
            if let Some(t) = self.threads.get_mut(tid) {
                t.block = None;
                woken.push(tid);
            }
        }
        woken
    }

    // === The deterministic prelude ===

    /// Runs a `dont_check` body to completion under a run-to-completion
    /// round-robin scheduler with SC semantics, recording its steps as the
    /// replay log. The prelude is one visible step.
    fn run_prelude(
        &mut self,
        bound: Option<usize>,
        body: Action,
        slot: &ResultSlot,
        cont: Box<dyn FnOnce(Val) -> Action>,
    ) -> StepOutcome {
        self.resume(ThreadId::ROOT, body);
        self.in_dont_check = true;
        let mut steps = 0usize;
        let mut last: Option<ThreadId> = None;
        let outcome = loop {
            if slot.borrow().is_some() {
                break None;
            }
            if bound.is_some_and(|b| steps >= b) {
                break Some(Failure::Abort);
            }
            let Some(next) = self.round_robin_pick(last) else {
                break Some(self.deadlock_failure(false));
            };
            last = Some(next);
            match self.step(next) {
                StepOutcome::Event(action) => {
                    self.prelude_log.push(action);
                    // SC inside the prelude: nothing stays buffered.
                    self.memory.barrier_all();
                }
                StepOutcome::Fatal(failure, _) => break Some(failure),
            }
            steps += 1;
        };
        self.in_dont_check = false;
        if let Some(failure) = outcome {
            return StepOutcome::Fatal(failure, None);
        }
        let Some(val) = slot.borrow_mut().take() else {
            return internal("prelude finished without a result".to_owned());
        };
        self.resume(ThreadId::ROOT, cont(val));
        StepOutcome::Event(ThreadAction::DontCheck { steps })
    }

    /// Run-to-completion round-robin: keep the last thread while it can
    /// run, else the next runnable id in cyclic order.
    fn round_robin_pick(&self, last: Option<ThreadId>) -> Option<ThreadId> {
        let runnable: SmallVec<[ThreadId; 8]> = self
            .threads
            .iter()
            .map(|(tid, _)| tid)
            .filter(|&tid| self.is_runnable_now(tid))
            .collect();
        if runnable.is_empty() {
            return None;
        }
        match last {
            Some(l) if runnable.contains(&l) => Some(l),
            Some(l) => runnable
                .iter()
                .find(|&&t| t > l)
                .or_else(|| runnable.first())
                .copied(),
            None => runnable.first().copied(),
        }
    }
}

fn internal(msg: String) -> StepOutcome {
    StepOutcome::Fatal(Failure::InternalError(msg), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{self, Program};

    fn context_for(p: Program<i32>, memtype: MemType) -> (Context, ResultSlot) {
        let slot: ResultSlot = Rc::new(std::cell::RefCell::new(None));
        let fill = Rc::clone(&slot);
        let root = p.into_action(Box::new(move |v| {
            *fill.borrow_mut() = Some(Rc::new(v) as Val);
            Action::Stop
        }));
        (Context::new(memtype, true, root), slot)
    }

    /// Drives the context with the lowest runnable id until the root exits.
    fn run_lowest(ctx: &mut Context) -> Result<(), Failure> {
        for _ in 0..10_000 {
            if ctx.root_done() {
                return Ok(());
            }
            let runnable = ctx.runnable();
            let Some((tid, _)) = runnable.first() else {
                return Err(ctx.deadlock_failure(false));
            };
            match ctx.step(*tid) {
                StepOutcome::Event(_) => {}
                StepOutcome::Fatal(f, _) => return Err(f),
            }
        }
        panic!("run did not terminate");
    }

    fn result_i32(slot: &ResultSlot) -> i32 {
        *slot
            .borrow()
            .as_ref()
            .expect("result")
            .downcast_ref::<i32>()
            .expect("i32")
    }

    #[test]
    fn pure_program_completes() {
        let (mut ctx, slot) = context_for(Program::pure(42), MemType::SequentialConsistency);
        run_lowest(&mut ctx).unwrap();
        assert_eq!(result_i32(&slot), 42);
    }

    #[test]
    fn cells_read_back_under_sc() {
        let p = program::new_cell(None, 7i32)
            .and_then(|c| c.write(8).then(c.read()));
        let (mut ctx, slot) = context_for(p, MemType::SequentialConsistency);
        run_lowest(&mut ctx).unwrap();
        assert_eq!(result_i32(&slot), 8);
    }

    #[test]
    fn tso_read_sees_own_buffer() {
        let p = program::new_cell(None, 0i32)
            .and_then(|c| c.write(5).then(c.read()));
        let (mut ctx, slot) = context_for(p, MemType::TotalStoreOrder);
        run_lowest(&mut ctx).unwrap();
        assert_eq!(result_i32(&slot), 5);
    }

    #[test]
    fn take_on_empty_mvar_deadlocks() {
        let p = program::new_mvar::<i32>(None)
            .and_then(|m: program::MVarRef<i32>| m.take());
        let (mut ctx, _slot) = context_for(p, MemType::SequentialConsistency);
        assert_eq!(run_lowest(&mut ctx), Err(Failure::Deadlock));
    }

    #[test]
    fn fork_and_mvar_handoff() {
        let p = program::new_mvar::<i32>(None).and_then(|m| {
            program::fork(Some("producer"), m.put(9))
                .then(m.take())
        });
        let (mut ctx, slot) = context_for(p, MemType::SequentialConsistency);
        run_lowest(&mut ctx).unwrap();
        assert_eq!(result_i32(&slot), 9);
    }

    #[test]
    fn stm_retry_without_writer_is_stm_deadlock() {
        let p = program::atomically(|| crate::program::stm::retry::<i32>());
        let (mut ctx, _slot) = context_for(p, MemType::SequentialConsistency);
        assert_eq!(run_lowest(&mut ctx), Err(Failure::StmDeadlock));
    }

    #[test]
    fn uncaught_exception_on_root_fails() {
        let p = program::throw::<i32, _>("boom");
        let (mut ctx, _slot) = context_for(p, MemType::SequentialConsistency);
        assert!(matches!(
            run_lowest(&mut ctx),
            Err(Failure::UncaughtException(_))
        ));
    }

    #[test]
    fn catching_recovers() {
        let p = program::catching::<i32, &'static str>(
            program::throw::<i32, _>("boom"),
            |_| Program::pure(5),
        );
        let (mut ctx, slot) = context_for(p, MemType::SequentialConsistency);
        run_lowest(&mut ctx).unwrap();
        assert_eq!(result_i32(&slot), 5);
    }

    #[test]
    fn dont_check_must_be_first() {
        let p = program::yield_now()
            .then(program::dont_check(None, Program::pure(1)));
        let (mut ctx, _slot) = context_for(p, MemType::SequentialConsistency);
        assert_eq!(run_lowest(&mut ctx), Err(Failure::IllegalDontCheck));
    }

    #[test]
    fn dont_check_prelude_runs_atomically() {
        let p = program::dont_check(
            None,
            program::new_cell(None, 1i32).and_then(|c| c.read()),
        );
        let (mut ctx, slot) = context_for(p, MemType::TotalStoreOrder);
        run_lowest(&mut ctx).unwrap();
        assert_eq!(result_i32(&slot), 1);
        assert!(!ctx.prelude_log.is_empty());
    }

    #[test]
    fn sub_captures_failure() {
        let p = program::sub(program::throw::<i32, _>("inner")).map(|r| match r {
            Err(Failure::UncaughtException(_)) => 1,
            _ => 0,
        });
        let (mut ctx, slot) = context_for(p, MemType::SequentialConsistency);
        run_lowest(&mut ctx).unwrap();
        assert_eq!(result_i32(&slot), 1);
    }

    #[test]
    fn nested_sub_is_illegal() {
        let p = program::sub(program::sub(Program::pure(1)).map(|_| 2)).map(|_| 3);
        let (mut ctx, _slot) = context_for(p, MemType::SequentialConsistency);
        assert_eq!(run_lowest(&mut ctx), Err(Failure::IllegalSubconcurrency));
    }
}
