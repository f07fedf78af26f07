//! Dynamic partial-order reduction over the schedule-prefix tree.
//!
//! The tree records every decision point reached so far: which ids were
//! runnable, which decisions have been taken (children), and which
//! *backtrack* decisions still need exploring. After each run the trace is
//! walked in reverse: for each event, the most recent dependent event of
//! another thread marks a race, and the racing thread is seeded into the
//! backtrack set of the decision point just before that earlier event.
//!
//! Exploration is a depth-first drain of pending backtrack points. All
//! collections are ordered, so for fixed inputs the driver emits prefixes —
//! and therefore outcomes — in a deterministic order.
//!
//! # References
//!
//! - Flanagan & Godefroid, "Dynamic partial-order reduction" (POPL 2005)

use crate::sched::Scheduler;
use crate::trace::depends::dependent;
use crate::trace::{Event, Lookahead, ThreadAction};
use crate::types::ThreadId;
use std::collections::{BTreeMap, BTreeSet};

/// One decision point in the schedule-prefix tree.
#[derive(Debug, Default)]
struct Node {
    /// Ids runnable when this point was reached.
    enabled: BTreeSet<ThreadId>,
    /// Decisions already explored (or currently queued), by chosen id.
    children: BTreeMap<ThreadId, Node>,
    /// Decisions seeded by race analysis, pending exploration.
    backtrack: BTreeSet<ThreadId>,
    /// Backtrack decisions already turned into queued prefixes.
    queued: BTreeSet<ThreadId>,
}

/// The exploration frontier: the tree plus a stack of pending prefixes.
#[derive(Debug)]
pub(crate) struct DporTree {
    root: Node,
    pending: Vec<Vec<ThreadId>>,
    started: bool,
}

impl DporTree {
    pub(crate) fn new() -> Self {
        Self {
            root: Node::default(),
            pending: Vec::new(),
            started: false,
        }
    }

    /// The next schedule prefix to run, if exploration is not finished.
    pub(crate) fn next_prefix(&mut self) -> Option<Vec<ThreadId>> {
        if !self.started {
            self.started = true;
            return Some(Vec::new());
        }
        self.pending.pop()
    }

    /// Folds a completed (or bound-aborted) run back into the tree: records
    /// the decision path, runs race analysis, and queues new prefixes.
    pub(crate) fn integrate(&mut self, events: &[Event]) {
        self.record_path(events);
        self.seed_backtracks(events);
        self.queue_pending(events);
    }

    fn record_path(&mut self, events: &[Event]) {
        let mut node = &mut self.root;
        for event in events {
            node.enabled = event.enabled().collect();
            node = node.children.entry(event.tid).or_default();
        }
    }

    /// Reverse walk: for each event, the most recent dependent predecessor
    /// of a different thread is a race. The racing thread joins the
    /// backtrack set just before the earlier event; if it was not enabled
    /// there, every thread that *was* enabled is added instead.
    fn seed_backtracks(&mut self, events: &[Event]) {
        let steps: Vec<(ThreadId, ThreadAction)> =
            events.iter().map(|e| (e.tid, e.action.clone())).collect();
        for i in (1..steps.len()).rev() {
            let racer = steps[i].0;
            let Some(j) = (0..i)
                .rev()
                .find(|&j| steps[j].0 != racer && dependent(&steps[j], &steps[i]))
            else {
                continue;
            };
            let node = self.node_at_mut(events, j);
            if node.children.contains_key(&racer) || node.queued.contains(&racer) {
                continue;
            }
            if node.enabled.contains(&racer) {
                node.backtrack.insert(racer);
            } else {
                let enabled: Vec<ThreadId> = node.enabled.iter().copied().collect();
                for t in enabled {
                    if !node.children.contains_key(&t) && !node.queued.contains(&t) {
                        node.backtrack.insert(t);
                    }
                }
            }
        }
    }

    fn node_at_mut(&mut self, events: &[Event], depth: usize) -> &mut Node {
        let mut node = &mut self.root;
        for event in &events[..depth] {
            node = node.children.entry(event.tid).or_default();
        }
        node
    }

    /// Turns every unexplored backtrack decision along this run's path into
    /// a pending prefix. Only nodes on the path can have gained backtrack
    /// entries, so the walk is linear.
    fn queue_pending(&mut self, events: &[Event]) {
        let mut prefix: Vec<ThreadId> = Vec::new();
        let mut node = &mut self.root;
        loop {
            let fresh: Vec<ThreadId> = node
                .backtrack
                .iter()
                .filter(|t| !node.queued.contains(t) && !node.children.contains_key(t))
                .copied()
                .collect();
            for t in fresh {
                node.queued.insert(t);
                let mut p = prefix.clone();
                p.push(t);
                self.pending.push(p);
            }
            let Some(event) = events.get(prefix.len()) else {
                break;
            };
            prefix.push(event.tid);
            node = match node.children.get_mut(&event.tid) {
                Some(child) => child,
                None => break,
            };
        }
    }
}

/// The DPOR driver's scheduler: follows the pending prefix, then extends it
/// with a heuristic that prefers staying on the current thread (fewer
/// context switches), falling back to the lowest runnable id.
#[derive(Debug)]
pub(crate) struct DporScheduler {
    prefix: Vec<ThreadId>,
    pos: usize,
}

impl DporScheduler {
    pub(crate) fn new(prefix: Vec<ThreadId>) -> Self {
        Self { prefix, pos: 0 }
    }
}

impl Scheduler for DporScheduler {
    fn schedule(
        &mut self,
        previous: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        if self.pos < self.prefix.len() {
            let want = self.prefix[self.pos];
            self.pos += 1;
            return runnable
                .iter()
                .map(|(t, _)| *t)
                .find(|t| *t == want);
        }
        if let Some((prev, action)) = previous {
            if !action.is_blocked() && runnable.iter().any(|(t, _)| *t == prev) {
                return Some(prev);
            }
        }
        runnable.first().map(|(t, _)| *t)
    }
}
