//! Scheduler interface and baseline schedulers.
//!
//! A scheduler is asked, once per step, to pick the next runnable id given
//! the previous step and a lookahead for every candidate. Returning `None`
//! aborts the run. Schedulers must be deterministic functions of their own
//! state and their arguments; everything downstream (DPOR, replay,
//! simplification) relies on it.

pub(crate) mod dpor;

use crate::trace::{Lookahead, ThreadAction};
use crate::types::ThreadId;

/// Picks the next thread to run.
pub trait Scheduler {
    /// Chooses among `runnable` (never empty), given the previous step.
    fn schedule(
        &mut self,
        previous: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId>;
}

/// Non-preemptive round-robin: keeps the previous thread while it is
/// runnable, else takes the next id in cyclic order. Used for `dont_check`
/// preludes and snapshot fast-forwarding.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<ThreadId>,
}

impl RoundRobin {
    /// A fresh round-robin scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RoundRobin {
    fn schedule(
        &mut self,
        _previous: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        let chosen = match self.last {
            Some(last) if runnable.iter().any(|(t, _)| *t == last) => Some(last),
            Some(last) => runnable
                .iter()
                .map(|(t, _)| *t)
                .find(|t| *t > last)
                .or_else(|| runnable.first().map(|(t, _)| *t)),
            None => runnable.first().map(|(t, _)| *t),
        };
        self.last = chosen;
        chosen
    }
}

/// Replays a fixed `(thread)` sequence, skipping entries whose thread has
/// already exited. Used to re-execute simplified traces. Once the recorded
/// decisions run out (the step that ended the original run is not itself
/// recorded), it falls back to the continue-else-lowest heuristic so the
/// final action can still execute; any real divergence is caught by the
/// caller's outcome comparison.
#[derive(Debug)]
pub(crate) struct ReplayScheduler {
    seq: Vec<ThreadId>,
    pos: usize,
}

impl ReplayScheduler {
    pub(crate) fn new(seq: Vec<ThreadId>) -> Self {
        Self { seq, pos: 0 }
    }
}

impl Scheduler for ReplayScheduler {
    fn schedule(
        &mut self,
        previous: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        while self.pos < self.seq.len() {
            let want = self.seq[self.pos];
            self.pos += 1;
            if runnable.iter().any(|(t, _)| *t == want) {
                return Some(want);
            }
            // The thread is gone (it exited earlier than in the recorded
            // schedule); skip its remaining decisions.
        }
        if let Some((prev, action)) = previous {
            if !action.is_blocked() && runnable.iter().any(|(t, _)| *t == prev) {
                return Some(prev);
            }
        }
        runnable.first().map(|(t, _)| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdSource;

    fn tid(n: u32) -> ThreadId {
        let mut ids = IdSource::new();
        let mut t = ids.fresh_thread();
        for _ in 0..n {
            t = ids.fresh_thread();
        }
        t
    }

    fn runnable(ids: &[u32]) -> Vec<(ThreadId, Lookahead)> {
        ids.iter().map(|&n| (tid(n), Lookahead::WillYield)).collect()
    }

    #[test]
    fn round_robin_sticks_then_cycles() {
        let mut rr = RoundRobin::new();
        assert_eq!(rr.schedule(None, &runnable(&[0, 1, 2])), Some(tid(0)));
        assert_eq!(rr.schedule(None, &runnable(&[0, 1, 2])), Some(tid(0)));
        // 0 gone: advance to the next higher id.
        assert_eq!(rr.schedule(None, &runnable(&[1, 2])), Some(tid(1)));
        // 1 gone, nothing higher: wrap.
        assert_eq!(rr.schedule(None, &runnable(&[0, 2])), Some(tid(2)));
        assert_eq!(rr.schedule(None, &runnable(&[0])), Some(tid(0)));
    }

    #[test]
    fn replay_follows_and_skips_exited() {
        let mut replay = ReplayScheduler::new(vec![tid(1), tid(0), tid(1)]);
        assert_eq!(replay.schedule(None, &runnable(&[0, 1])), Some(tid(1)));
        // Thread 0 already exited: its decision is skipped, falling through
        // to the next entry.
        assert_eq!(replay.schedule(None, &runnable(&[1])), Some(tid(1)));
        // Sequence exhausted: deterministic fallback keeps the run moving.
        assert_eq!(replay.schedule(None, &runnable(&[0, 1])), Some(tid(0)));
    }
}
