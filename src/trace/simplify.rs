//! The trace simplifier.
//!
//! Takes a reported schedule and rewrites it, via independence-preserving
//! permutations, into a lexicographically earlier sequence with fewer
//! context switches:
//!
//! 1. **Lexicographic normal form** — adjacent independent steps sort by
//!    thread id.
//! 2. **Commit elision** — under TSO/PSO, a commit whose cell's next
//!    dependent step is a barrier on that cell is redundant: the barrier
//!    commits the buffered write itself.
//! 3. **Pull back** — a step moves back to sit adjacent to its thread's
//!    previous step when everything between is independent of it.
//! 4. **Push forward** — the symmetric move towards its thread's next step.
//!
//! Each pass repeats to a fixpoint, bounded by the input length. The
//! simplified schedule is then id-renumbered (permuting fork and
//! allocation events changes the ids a replay would mint) and re-executed;
//! the re-execution is both the sanity check and the source of the
//! canonical reported trace. If the replay's outcome differs, the original
//! trace is reported unchanged and a diagnostic is logged.

use crate::program::Program;
use crate::sched::ReplayScheduler;
use crate::settings::{Outcome, Settings};
use crate::trace::depends::{independent, DepState};
use crate::trace::{ThreadAction, Trace};
use crate::types::{CellId, MVarId, ThreadId};
use std::collections::BTreeMap;
use std::fmt;

type Step = (ThreadId, ThreadAction);

/// What simplification produced.
pub(crate) enum SimplifyResult {
    /// The replayed canonical trace.
    Simplified(Trace),
    /// Replay diverged from the original outcome; the original trace
    /// stands. With `debug_fatal` set, the caller escalates this.
    Diverged,
}

/// Simplifies `trace`, re-executing the result to validate and canonicalize
/// it.
pub(crate) fn simplify<T>(
    program: &dyn Fn() -> Program<T>,
    settings: &Settings<T>,
    outcome: &Outcome<T>,
    trace: &Trace,
) -> SimplifyResult
where
    T: Clone + PartialEq + fmt::Debug + 'static,
{
    let mut steps = trace.steps();
    let budget = steps.len().max(1);
    for _ in 0..budget {
        let mut changed = normal_form_pass(&mut steps);
        changed |= elide_commits(&mut steps, settings);
        changed |= pull_back_pass(&mut steps);
        changed |= push_forward_pass(&mut steps);
        if !changed {
            break;
        }
    }
    renumber(&mut steps);

    let schedule: Vec<ThreadId> = steps.iter().map(|(tid, _)| *tid).collect();
    let mut replay_settings = settings.clone();
    replay_settings.bounds = crate::settings::Bounds::unbounded();
    let mut sched = ReplayScheduler::new(schedule);
    let run = crate::explore::run_schedule(program, &replay_settings, &mut sched, None);

    let preserved = match (outcome, &run.outcome) {
        (Ok(_), Ok(_)) => settings.outcomes_equal(outcome, &run.outcome)
            || !settings.has_equality(),
        _ => settings.outcomes_equal(outcome, &run.outcome),
    };
    if preserved {
        SimplifyResult::Simplified(run.trace)
    } else {
        settings.diagnose(&format!(
            "simplified schedule replayed to a different outcome \
             (original {}, replayed {}); reporting the original trace",
            describe(outcome),
            describe(&run.outcome),
        ));
        SimplifyResult::Diverged
    }
}

fn describe<T: fmt::Debug>(outcome: &Outcome<T>) -> String {
    match outcome {
        Ok(v) => format!("Ok({v:?})"),
        Err(f) => format!("Err({})", f.kind()),
    }
}

/// Pass 1: bubble adjacent independent steps into thread-id order.
fn normal_form_pass(steps: &mut [Step]) -> bool {
    let mut changed = false;
    let budget = steps.len().max(1);
    for _ in 0..budget {
        let mut swapped = false;
        for i in 0..steps.len().saturating_sub(1) {
            if steps[i].0 > steps[i + 1].0 && independent(&steps[i], &steps[i + 1]) {
                steps.swap(i, i + 1);
                swapped = true;
            }
        }
        changed |= swapped;
        if !swapped {
            break;
        }
    }
    changed
}

/// Pass 2: drop a commit whose cell's next dependent step is a barrier
/// covering that cell — the barrier performs the commit itself. A commit is
/// kept whenever any step before the barrier touches the cell, including
/// reads by third threads that would otherwise observe the uncommitted
/// value.
fn elide_commits<T>(steps: &mut Vec<Step>, settings: &Settings<T>) -> bool {
    if settings.memtype == crate::settings::MemType::SequentialConsistency {
        return false;
    }
    let mut i = 0;
    let mut changed = false;
    // Rolling buffer state: a commit is only elidable while its write is
    // actually pending, which guards against rewriting inconsistent traces.
    let mut ds = DepState::new(settings.memtype);
    while i < steps.len() {
        if let ThreadAction::CommitWrite { writer, cell } = &steps[i].1 {
            let (writer, cell) = (*writer, *cell);
            if ds.buffered(writer, cell) > 0
                && commit_absorbed_by_barrier(&steps[i + 1..], cell)
            {
                // The buffered write stays pending; the barrier commits it.
                steps.remove(i);
                changed = true;
                continue;
            }
        }
        ds.apply(steps[i].0, &steps[i].1);
        i += 1;
    }
    changed
}

/// True if the first later step involving `cell` is a barrier that covers
/// it (a CAS or atomic modify on the cell, or an STM commit).
fn commit_absorbed_by_barrier(later: &[Step], cell: CellId) -> bool {
    for (_, action) in later {
        let touches = matches!(
            action,
            ThreadAction::ReadCell { cell: c }
                | ThreadAction::ReadForCas { cell: c }
                | ThreadAction::WriteCell { cell: c }
                | ThreadAction::ModCell { cell: c }
                | ThreadAction::CommitWrite { cell: c, .. }
                if *c == cell
        );
        if touches {
            return false;
        }
        match action {
            ThreadAction::CasCell { cell: c, .. } | ThreadAction::ModCellCas { cell: c }
                if *c == cell =>
            {
                return true;
            }
            ThreadAction::Stm { written, .. } if !written.is_empty() => return true,
            _ => {}
        }
    }
    false
}

/// Pass 3: move a step back through independent predecessors until it sits
/// next to its thread's previous step.
fn pull_back_pass(steps: &mut [Step]) -> bool {
    let mut changed = false;
    for i in 1..steps.len() {
        let tid = steps[i].0;
        let Some(prev) = (0..i).rev().find(|&p| steps[p].0 == tid) else {
            continue;
        };
        if prev + 1 == i {
            continue;
        }
        if (prev + 1..i).all(|m| independent(&steps[m], &steps[i])) {
            steps[prev + 1..=i].rotate_right(1);
            changed = true;
        }
    }
    changed
}

/// Pass 4: move a step forward through independent successors until it sits
/// next to its thread's next step.
fn push_forward_pass(steps: &mut [Step]) -> bool {
    let mut changed = false;
    for i in (0..steps.len()).rev() {
        let tid = steps[i].0;
        let Some(next) = (i + 1..steps.len()).find(|&q| steps[q].0 == tid) else {
            continue;
        };
        if next == i + 1 {
            continue;
        }
        if (i + 1..next).all(|m| independent(&steps[i], &steps[m])) {
            steps[i..next].rotate_left(1);
            changed = true;
        }
    }
    changed
}

/// Rewrites ids so the permuted schedule stays valid: a replay mints thread,
/// cell, and MVar ids in allocation order, so permuting fork and allocation
/// events permutes the ids they receive. The original id sets are reassigned
/// per kind, in the permuted allocation order; ids with no allocation event
/// in the trace (the root, prelude allocations) map to themselves. TVar ids
/// need no rewrite: allocating transactions always have a non-empty write
/// set and therefore never reorder with each other.
fn renumber(steps: &mut [Step]) {
    let mut threads = Remap::<ThreadId>::new(steps.iter().filter_map(|(_, a)| match a {
        ThreadAction::Fork { child } | ThreadAction::ForkOs { child } => Some(*child),
        _ => None,
    }));
    let mut cells = Remap::<CellId>::new(steps.iter().filter_map(|(_, a)| match a {
        ThreadAction::NewCell { cell } => Some(*cell),
        _ => None,
    }));
    let mut mvars = Remap::<MVarId>::new(steps.iter().filter_map(|(_, a)| match a {
        ThreadAction::NewMVar { mvar } => Some(*mvar),
        _ => None,
    }));

    for (tid, action) in steps.iter_mut() {
        match action {
            ThreadAction::Fork { child } | ThreadAction::ForkOs { child } => {
                *child = threads.allocate(*child);
            }
            ThreadAction::NewCell { cell } => *cell = cells.allocate(*cell),
            ThreadAction::NewMVar { mvar } => *mvar = mvars.allocate(*mvar),
            _ => {}
        }
        rewrite_ids(action, &threads, &cells, &mvars);
        *tid = map_tid(*tid, &threads, &cells);
    }
}

/// Reassigns an id kind's allocated set in permuted allocation order.
struct Remap<I> {
    pool: Vec<I>,
    next: usize,
    map: BTreeMap<I, I>,
}

impl<I: Copy + Ord> Remap<I> {
    fn new(allocated: impl Iterator<Item = I>) -> Self {
        let mut pool: Vec<I> = allocated.collect();
        pool.sort_unstable();
        pool.dedup();
        Self {
            pool,
            next: 0,
            map: BTreeMap::new(),
        }
    }

    /// Called at this id's (re-ordered) allocation event: hands out the next
    /// id from the sorted pool.
    fn allocate(&mut self, old: I) -> I {
        let new = self.pool.get(self.next).copied().unwrap_or(old);
        self.next += 1;
        self.map.insert(old, new);
        new
    }

    fn get(&self, old: I) -> I {
        self.map.get(&old).copied().unwrap_or(old)
    }
}

fn map_tid(tid: ThreadId, threads: &Remap<ThreadId>, cells: &Remap<CellId>) -> ThreadId {
    match (tid.commit_writer(), tid.commit_cell()) {
        (Some(writer), Some(cell)) => {
            ThreadId::commit_pso(threads.get(writer), cells.get(cell))
        }
        (Some(writer), None) => ThreadId::commit_tso(threads.get(writer)),
        _ => threads.get(tid),
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn rewrite_ids(
    action: &mut ThreadAction,
    threads: &Remap<ThreadId>,
    cells: &Remap<CellId>,
    mvars: &Remap<MVarId>,
) {
    match action {
        ThreadAction::ReadCell { cell }
        | ThreadAction::ReadForCas { cell }
        | ThreadAction::WriteCell { cell }
        | ThreadAction::CasCell { cell, .. }
        | ThreadAction::ModCell { cell }
        | ThreadAction::ModCellCas { cell } => *cell = cells.get(*cell),
        ThreadAction::CommitWrite { writer, cell } => {
            *writer = threads.get(*writer);
            *cell = cells.get(*cell);
        }
        ThreadAction::PutMVar { mvar, woken }
        | ThreadAction::TakeMVar { mvar, woken }
        | ThreadAction::TryPutMVar { mvar, woken, .. }
        | ThreadAction::TryTakeMVar { mvar, woken, .. } => {
            *mvar = mvars.get(*mvar);
            for t in woken.iter_mut() {
                *t = threads.get(*t);
            }
        }
        ThreadAction::BlockedPutMVar { mvar }
        | ThreadAction::BlockedTakeMVar { mvar }
        | ThreadAction::BlockedReadMVar { mvar }
        | ThreadAction::ReadMVar { mvar }
        | ThreadAction::TryReadMVar { mvar, .. } => *mvar = mvars.get(*mvar),
        ThreadAction::ThrowTo { target, .. } | ThreadAction::BlockedThrowTo { target } => {
            *target = threads.get(*target);
        }
        ThreadAction::Stm { woken, .. } => {
            for t in woken.iter_mut() {
                *t = threads.get(*t);
            }
        }
        _ => {}
    }
}
