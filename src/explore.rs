//! The systematic exploration driver.
//!
//! [`explore`] runs a program factory under every schedule the DPOR tree
//! deems inequivalent, collecting one `(outcome, trace)` pair per distinct
//! outcome. The loop is: pop a schedule prefix, run it to completion under
//! the DPOR scheduler, fold the trace back into the tree (seeding backtrack
//! points from races), and repeat until the frontier drains.
//!
//! For fixed inputs the driver emits outcomes in a deterministic order —
//! every collection involved is ordered and the schedulers are
//! deterministic.

use crate::error::Failure;
use crate::program::action::Action;
use crate::program::Program;
use crate::sched::dpor::{DporScheduler, DporTree};
use crate::sched::Scheduler;
use crate::settings::{Discard, Outcome, Settings};
use crate::snapshot::{self, Snapshot};
use crate::trace::simplify::{self, SimplifyResult};
use crate::trace::{Alternative, Decision, Event, ThreadAction, Trace};
use crate::types::ThreadId;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use crate::exec::{Context, StepOutcome};

/// A single run's result.
pub(crate) struct RunOutput<T> {
    pub(crate) outcome: Outcome<T>,
    pub(crate) trace: Trace,
    /// The run was cut short by a bound (or the scheduler gave up); it is
    /// skipped in the report but still seeds backtrack points.
    pub(crate) bounded: bool,
}

/// Everything an exploration produced.
#[derive(Debug)]
pub struct Exploration<T> {
    /// Distinct outcomes in discovery order, each with its canonical trace
    /// (`None` when the discard policy suppressed it).
    pub outcomes: Vec<(Outcome<T>, Option<Trace>)>,
    /// Total schedules executed, including bounded ones.
    pub runs: usize,
    /// Schedules abandoned because a bound was exceeded.
    pub bounded_runs: usize,
    /// Whether the early-exit predicate stopped exploration.
    pub early_exited: bool,
}

impl<T> Exploration<T> {
    /// The distinct failures observed, with their traces.
    pub fn failures(&self) -> impl Iterator<Item = (&Failure, Option<&Trace>)> {
        self.outcomes.iter().filter_map(|(o, t)| match o {
            Err(f) => Some((f, t.as_ref())),
            Ok(_) => None,
        })
    }

    /// The distinct successful results observed.
    pub fn successes(&self) -> impl Iterator<Item = &T> {
        self.outcomes.iter().filter_map(|(o, _)| o.as_ref().ok())
    }

    /// True if any failure was observed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// Systematically explores `program` under `settings`.
///
/// The program factory is called once per schedule; it must build the same
/// computation every time, or exploration (and its determinism guarantee)
/// is meaningless.
pub fn explore<T, F>(settings: &Settings<T>, program: F) -> Exploration<T>
where
    T: Clone + PartialEq + fmt::Debug + 'static,
    F: Fn() -> Program<T>,
{
    let snapshot = snapshot::capture(settings, &program);
    if let Some(snap) = &snapshot {
        tracing::debug!(
            prelude_steps = snap.steps,
            "captured dont_check prelude snapshot"
        );
    }

    let mut tree = DporTree::new();
    let mut outcomes: Vec<(Outcome<T>, Option<Trace>)> = Vec::new();
    let mut runs = 0usize;
    let mut bounded_runs = 0usize;
    let mut early_exited = false;

    while let Some(prefix) = tree.next_prefix() {
        let mut sched = DporScheduler::new(prefix);
        let run = run_schedule(&program, settings, &mut sched, snapshot.as_ref());
        runs += 1;
        tree.integrate(run.trace.events());

        if run.bounded {
            bounded_runs += 1;
            continue;
        }

        let mut outcome = run.outcome;
        let wants_exit = settings.wants_early_exit(&outcome);
        let duplicate = outcomes
            .iter()
            .any(|(o, _)| settings.outcomes_equal(o, &outcome));
        if duplicate {
            if wants_exit {
                early_exited = true;
                break;
            }
            continue;
        }

        let final_trace = if settings.simplify {
            match simplify::simplify(&program, settings, &outcome, &run.trace) {
                SimplifyResult::Simplified(trace) => trace,
                SimplifyResult::Diverged => {
                    if settings.debug_fatal {
                        outcome = Err(Failure::InternalError(
                            "trace simplification diverged".to_owned(),
                        ));
                    }
                    run.trace
                }
            }
        } else {
            run.trace
        };

        match settings.discard_for(&outcome) {
            Some(Discard::ResultAndTrace) => {}
            Some(Discard::Trace) => outcomes.push((outcome, None)),
            None => outcomes.push((outcome, Some(final_trace))),
        }
        if wants_exit {
            early_exited = true;
            break;
        }
    }

    tracing::debug!(
        runs,
        bounded_runs,
        distinct = outcomes.len(),
        "exploration finished"
    );
    Exploration {
        outcomes,
        runs,
        bounded_runs,
        early_exited,
    }
}

/// Runs one schedule to completion under `sched`.
pub(crate) fn run_schedule<T>(
    program: &dyn Fn() -> Program<T>,
    settings: &Settings<T>,
    sched: &mut dyn Scheduler,
    snapshot: Option<&Snapshot>,
) -> RunOutput<T>
where
    T: Clone + 'static,
{
    let slot: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
    let fill = Rc::clone(&slot);
    let root = program().into_action(Box::new(move |value| {
        *fill.borrow_mut() = Some(value);
        Action::Stop
    }));
    let mut ctx = Context::new(settings.memtype, settings.supports_bound_threads, root);

    let mut trace = Trace::new();
    let mut started: BTreeSet<ThreadId> = BTreeSet::new();
    let mut prev: Option<(ThreadId, ThreadAction)> = None;
    let mut preemptions = 0usize;
    let mut yields: BTreeMap<ThreadId, usize> = BTreeMap::new();

    let outcome = loop {
        if ctx.root_done() {
            break match slot.borrow_mut().take() {
                Some(value) => Ok(value),
                None => Err(Failure::InternalError(
                    "root thread stopped without a result".to_owned(),
                )),
            };
        }

        let runnable = ctx.runnable();
        if runnable.is_empty() {
            // A deadlocked subcomputation resolves to a failure outcome for
            // its caller; the run itself continues.
            if let Some((caller, action)) = ctx.fail_sub() {
                push_event(&mut trace, &mut started, prev.as_ref(), caller, &[], &action);
                prev = Some((caller, action));
                continue;
            }
            break Err(ctx.deadlock_failure(false));
        }

        let Some(chosen) = sched.schedule(
            prev.as_ref().map(|(tid, action)| (*tid, action)),
            &runnable,
        ) else {
            return RunOutput {
                outcome: Err(Failure::Abort),
                trace,
                bounded: true,
            };
        };

        // Preemption bound: switching away from a thread that could have
        // continued, at a non-voluntary point. Commit pseudo-threads are
        // exempt on both sides; commits are memory-model bookkeeping, not
        // preemptions.
        if let Some((ptid, pact)) = &prev {
            let preempted = chosen != *ptid
                && !chosen.is_commit()
                && !ptid.is_commit()
                && !pact.is_blocked()
                && !pact.is_voluntary_release()
                && runnable.iter().any(|(t, _)| t == ptid);
            if preempted {
                preemptions += 1;
                if settings.bounds.preemptions.is_some_and(|b| preemptions > b) {
                    return RunOutput {
                        outcome: Err(Failure::Abort),
                        trace,
                        bounded: true,
                    };
                }
            }
        }

        let action = match ctx.step(chosen) {
            StepOutcome::Event(action) => action,
            StepOutcome::Fatal(failure, final_action) => {
                // A failing step that was itself an observable action (an
                // uncaught throw) closes the trace.
                if let Some(action) = final_action {
                    let alternatives: Vec<Alternative> = runnable
                        .iter()
                        .filter(|(t, _)| *t != chosen)
                        .map(|(t, l)| Alternative {
                            tid: *t,
                            lookahead: l.clone(),
                        })
                        .collect();
                    push_event(
                        &mut trace,
                        &mut started,
                        prev.as_ref(),
                        chosen,
                        &alternatives,
                        &action,
                    );
                }
                break Err(failure);
            }
        };

        if let (ThreadAction::DontCheck { .. }, Some(snap)) = (&action, snapshot) {
            if !snap.matches(&ctx.prelude_log) {
                settings.diagnose(
                    "prelude replay log diverged from snapshot; lifted effects may not be idempotent",
                );
                if settings.debug_fatal {
                    break Err(Failure::InternalError(
                        "prelude replay diverged from snapshot".to_owned(),
                    ));
                }
            }
        }

        let alternatives: Vec<Alternative> = runnable
            .iter()
            .filter(|(t, _)| *t != chosen)
            .map(|(t, l)| Alternative {
                tid: *t,
                lookahead: l.clone(),
            })
            .collect();
        push_event(
            &mut trace,
            &mut started,
            prev.as_ref(),
            chosen,
            &alternatives,
            &action,
        );

        // Fairness bound: yields and delays per thread.
        if action.is_voluntary_release() {
            let count = yields.entry(chosen).or_insert(0);
            *count += 1;
            if settings.bounds.fairness.is_some_and(|b| *count > b) {
                return RunOutput {
                    outcome: Err(Failure::Abort),
                    trace,
                    bounded: true,
                };
            }
        }
        // Length bound.
        if settings.bounds.length.is_some_and(|b| trace.len() > b) {
            return RunOutput {
                outcome: Err(Failure::Abort),
                trace,
                bounded: true,
            };
        }

        prev = Some((chosen, action));
    };

    RunOutput {
        outcome,
        trace,
        bounded: false,
    }
}

fn push_event(
    trace: &mut Trace,
    started: &mut BTreeSet<ThreadId>,
    prev: Option<&(ThreadId, ThreadAction)>,
    chosen: ThreadId,
    alternatives: &[Alternative],
    action: &ThreadAction,
) {
    let kind = if started.insert(chosen) {
        Decision::Start
    } else if prev.is_some_and(|(p, _)| *p == chosen) {
        Decision::Continue
    } else {
        Decision::Switch
    };
    trace.push(Event {
        kind,
        tid: chosen,
        alternatives: alternatives.to_vec(),
        action: action.clone(),
    });
}
