//! Execution traces: decisions, lookaheads, and the per-step action record.
//!
//! A trace is an ordered sequence of [`Event`]s, one per interpreter step.
//! Each event records the scheduling [`Decision`] that chose the acting
//! thread, a [`Lookahead`] summary for every runnable thread that was *not*
//! chosen (the alternatives DPOR branches on), and the richly-typed
//! [`ThreadAction`] describing what the chosen thread did.
//!
//! The trace is append-only during a run and frozen on completion. For
//! external reporters the trace serializes to the wire format of one object
//! per decision:
//!
//! ```json
//! { "kind": "switch", "tid": 1,
//!   "alternatives": [{ "tid": 0, "lookahead": { "kind": "will_read_cell", "cell": 0 } }],
//!   "action": { "kind": "write_cell", "cell": 0 } }
//! ```

pub mod depends;
pub(crate) mod simplify;

use crate::types::{CellId, MVarId, TVarId, ThreadId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A thread's masking state, as pushed and popped by `masking` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskState {
    /// Asynchronous exceptions may be delivered at any step.
    Unmasked,
    /// Delivery is deferred, except while blocked on an interruptible
    /// primitive (MVar operations, STM retry).
    MaskedInterruptible,
    /// Delivery is deferred unconditionally until the mask is lifted.
    MaskedUninterruptible,
}

/// How the scheduler arrived at the acting thread for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// First time this thread is ever scheduled.
    Start,
    /// Same thread as the previous step.
    Continue,
    /// A context switch to an already-started thread.
    Switch,
}

/// Inline capacity for the short id lists carried by events.
pub(crate) type ThreadSet = SmallVec<[ThreadId; 4]>;
pub(crate) type TVarSet = SmallVec<[TVarId; 4]>;

/// What a thread did in one interpreter step.
///
/// Mirrors the action alphabet one to one; payloads carry the ids the step
/// touched plus, for wake-capable operations, the threads it unblocked, so
/// downstream consumers never re-derive queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreadAction {
    /// Forked a new thread.
    Fork {
        /// Id of the newly created thread.
        child: ThreadId,
    },
    /// Forked a new bound (OS) thread.
    ForkOs {
        /// Id of the newly created thread.
        child: ThreadId,
    },
    /// Read the current thread's own id.
    MyThreadId,
    /// Voluntarily yielded.
    Yield,
    /// Delayed; an observable scheduling point like `Yield`.
    ThreadDelay {
        /// Requested delay in abstract time units.
        micros: u64,
    },
    /// Read the capability count.
    GetNumCapabilities {
        /// The observed count.
        count: usize,
    },
    /// Set the capability count.
    SetNumCapabilities {
        /// The new count.
        count: usize,
    },
    /// Queried whether the current thread is bound.
    IsCurrentThreadBound {
        /// The answer.
        bound: bool,
    },
    /// Ran a lifted host effect.
    LiftedEffect,
    /// Emitted a user annotation into the trace.
    Message {
        /// Debug rendering of the payload.
        text: String,
    },
    /// The thread terminated.
    Stop,

    /// Allocated a mutable cell.
    NewCell {
        /// The fresh cell id.
        cell: CellId,
    },
    /// Read a cell (buffered write if present, else committed value).
    ReadCell {
        /// The cell read.
        cell: CellId,
    },
    /// Read a cell and obtained a CAS ticket.
    ReadForCas {
        /// The cell read.
        cell: CellId,
    },
    /// Wrote a cell (buffered under TSO/PSO, committed inline under SC).
    WriteCell {
        /// The cell written.
        cell: CellId,
    },
    /// Compare-and-swap on a cell; imposes a per-cell barrier.
    CasCell {
        /// The cell targeted.
        cell: CellId,
        /// Whether the ticket was still current.
        succeeded: bool,
    },
    /// Non-atomic read-then-write of a cell.
    ModCell {
        /// The cell modified.
        cell: CellId,
    },
    /// Atomic barriered read-modify-write of a cell.
    ModCellCas {
        /// The cell modified.
        cell: CellId,
    },
    /// A commit pseudo-thread promoted one buffered write.
    CommitWrite {
        /// The thread whose buffer drained.
        writer: ThreadId,
        /// The cell whose committed value changed.
        cell: CellId,
    },

    /// Allocated an MVar.
    NewMVar {
        /// The fresh MVar id.
        mvar: MVarId,
    },
    /// Put into an empty MVar.
    PutMVar {
        /// The MVar written.
        mvar: MVarId,
        /// Threads unblocked by the put.
        woken: ThreadSet,
    },
    /// Blocked putting into a full MVar.
    BlockedPutMVar {
        /// The MVar in question.
        mvar: MVarId,
    },
    /// Non-blocking put attempt.
    TryPutMVar {
        /// The MVar targeted.
        mvar: MVarId,
        /// Whether the MVar was empty.
        succeeded: bool,
        /// Threads unblocked on success.
        woken: ThreadSet,
    },
    /// Took from a full MVar.
    TakeMVar {
        /// The MVar emptied.
        mvar: MVarId,
        /// Threads unblocked by the take.
        woken: ThreadSet,
    },
    /// Blocked taking from an empty MVar.
    BlockedTakeMVar {
        /// The MVar in question.
        mvar: MVarId,
    },
    /// Non-blocking take attempt.
    TryTakeMVar {
        /// The MVar targeted.
        mvar: MVarId,
        /// Whether a value was present.
        succeeded: bool,
        /// Threads unblocked on success.
        woken: ThreadSet,
    },
    /// Non-destructive read of a full MVar.
    ReadMVar {
        /// The MVar read.
        mvar: MVarId,
    },
    /// Blocked reading an empty MVar.
    BlockedReadMVar {
        /// The MVar in question.
        mvar: MVarId,
    },
    /// Non-blocking non-destructive read attempt.
    TryReadMVar {
        /// The MVar targeted.
        mvar: MVarId,
        /// Whether a value was present.
        succeeded: bool,
    },

    /// Threw an exception in the current thread.
    Throw,
    /// Delivered (or queued) an exception to another thread.
    ThrowTo {
        /// The target thread.
        target: ThreadId,
        /// Whether the target's mask permitted immediate delivery.
        delivered: bool,
    },
    /// Blocked in a synchronous `throw_to` against a masked target.
    BlockedThrowTo {
        /// The target thread.
        target: ThreadId,
    },
    /// Installed an exception handler.
    Catching,
    /// Left the dynamic extent of a handler.
    PopCatching,
    /// Entered a masking block.
    Mask {
        /// The mask state entered.
        state: MaskState,
    },
    /// Restored an enclosing mask state.
    ResetMask {
        /// The mask state restored.
        state: MaskState,
    },

    /// Allocated TVars and/or committed an STM transaction.
    Stm {
        /// TVars written by the committed transaction.
        written: TVarSet,
        /// Threads whose retry was woken by the commit.
        woken: ThreadSet,
    },
    /// An STM transaction retried; the thread blocks on its read set.
    BlockedStm {
        /// TVars whose change will wake the transaction.
        read: TVarSet,
    },

    /// Started a nested subcomputation.
    SubStart,
    /// A nested subcomputation finished and its caller resumed.
    SubEnd,
    /// Executed a deterministic prelude atomically.
    DontCheck {
        /// Number of interpreter steps the prelude took.
        steps: usize,
    },
}

impl ThreadAction {
    /// True for actions that are always observable scheduling points even
    /// when no context switch occurs.
    #[must_use]
    pub const fn is_voluntary_release(&self) -> bool {
        matches!(self, Self::Yield | Self::ThreadDelay { .. })
    }

    /// True for actions that left the acting thread blocked.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(
            self,
            Self::BlockedPutMVar { .. }
                | Self::BlockedTakeMVar { .. }
                | Self::BlockedReadMVar { .. }
                | Self::BlockedThrowTo { .. }
                | Self::BlockedStm { .. }
        )
    }

    /// Stable tag used by fingerprints; payload-free.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Fork { .. } => "fork",
            Self::ForkOs { .. } => "fork_os",
            Self::MyThreadId => "my_thread_id",
            Self::Yield => "yield",
            Self::ThreadDelay { .. } => "thread_delay",
            Self::GetNumCapabilities { .. } => "get_num_capabilities",
            Self::SetNumCapabilities { .. } => "set_num_capabilities",
            Self::IsCurrentThreadBound { .. } => "is_current_thread_bound",
            Self::LiftedEffect => "lifted_effect",
            Self::Message { .. } => "message",
            Self::Stop => "stop",
            Self::NewCell { .. } => "new_cell",
            Self::ReadCell { .. } => "read_cell",
            Self::ReadForCas { .. } => "read_for_cas",
            Self::WriteCell { .. } => "write_cell",
            Self::CasCell { .. } => "cas_cell",
            Self::ModCell { .. } => "mod_cell",
            Self::ModCellCas { .. } => "mod_cell_cas",
            Self::CommitWrite { .. } => "commit_write",
            Self::NewMVar { .. } => "new_mvar",
            Self::PutMVar { .. } => "put_mvar",
            Self::BlockedPutMVar { .. } => "blocked_put_mvar",
            Self::TryPutMVar { .. } => "try_put_mvar",
            Self::TakeMVar { .. } => "take_mvar",
            Self::BlockedTakeMVar { .. } => "blocked_take_mvar",
            Self::TryTakeMVar { .. } => "try_take_mvar",
            Self::ReadMVar { .. } => "read_mvar",
            Self::BlockedReadMVar { .. } => "blocked_read_mvar",
            Self::TryReadMVar { .. } => "try_read_mvar",
            Self::Throw => "throw",
            Self::ThrowTo { .. } => "throw_to",
            Self::BlockedThrowTo { .. } => "blocked_throw_to",
            Self::Catching => "catching",
            Self::PopCatching => "pop_catching",
            Self::Mask { .. } => "mask",
            Self::ResetMask { .. } => "reset_mask",
            Self::Stm { .. } => "stm",
            Self::BlockedStm { .. } => "blocked_stm",
            Self::SubStart => "sub_start",
            Self::SubEnd => "sub_end",
            Self::DontCheck { .. } => "dont_check",
        }
    }
}

/// A lookahead: the summary of a runnable thread's *next* action, used by
/// schedulers and by DPOR when seeding backtrack points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Lookahead {
    WillFork,
    WillForkOs,
    WillMyThreadId,
    WillYield,
    WillThreadDelay { micros: u64 },
    WillGetNumCapabilities,
    WillSetNumCapabilities { count: usize },
    WillIsCurrentThreadBound,
    WillLiftedEffect,
    WillMessage,
    WillStop,
    WillNewCell,
    WillReadCell { cell: CellId },
    WillReadForCas { cell: CellId },
    WillWriteCell { cell: CellId },
    WillCasCell { cell: CellId },
    WillModCell { cell: CellId },
    WillModCellCas { cell: CellId },
    WillCommitWrite { writer: ThreadId, cell: CellId },
    WillNewMVar,
    WillPutMVar { mvar: MVarId },
    WillTryPutMVar { mvar: MVarId },
    WillTakeMVar { mvar: MVarId },
    WillTryTakeMVar { mvar: MVarId },
    WillReadMVar { mvar: MVarId },
    WillTryReadMVar { mvar: MVarId },
    WillThrow,
    WillThrowTo { target: ThreadId },
    WillCatching,
    WillPopCatching,
    WillMask { state: MaskState },
    WillResetMask { state: MaskState },
    WillStm,
    WillSub,
    WillDontCheck,
}

/// A non-chosen runnable thread and what it would have done next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alternative {
    /// The runnable thread.
    pub tid: ThreadId,
    /// Its next action, summarized.
    pub lookahead: Lookahead,
}

/// One step of a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// How the acting thread was chosen.
    pub kind: Decision,
    /// The acting thread.
    pub tid: ThreadId,
    /// Runnable threads that were not chosen, with lookaheads.
    pub alternatives: Vec<Alternative>,
    /// What the acting thread did.
    pub action: ThreadAction,
}

impl Event {
    /// The full set of threads that were runnable at this step.
    pub fn enabled(&self) -> impl Iterator<Item = ThreadId> + '_ {
        std::iter::once(self.tid).chain(self.alternatives.iter().map(|a| a.tid))
    }
}

/// An append-only run trace, frozen when the run completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace {
    events: Vec<Event>,
}

impl Trace {
    /// An empty trace.
    #[must_use]
    pub const fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// The recorded events, in execution order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of recorded steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if no steps were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The `(thread, action)` skeleton of the trace, as consumed by the
    /// simplifier and the dependency oracle.
    #[must_use]
    pub fn steps(&self) -> Vec<(ThreadId, ThreadAction)> {
        self.events
            .iter()
            .map(|e| (e.tid, e.action.clone()))
            .collect()
    }

    /// A stable 64-bit fingerprint of the decision/action skeleton.
    ///
    /// Two traces with the same schedule and the same action shapes share a
    /// fingerprint; payload values (cell contents, messages) do not
    /// participate.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for event in &self.events {
            event.tid.raw().hash(&mut hasher);
            event.action.tag().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Serializes the trace to the wire format as a JSON value.
    #[must_use]
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Serializes the trace to the wire format as a JSON string.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string())
    }
}
