//! Snapshotting of `dont_check` preludes.
//!
//! When a computation's first action is a `dont_check` prelude, the driver
//! runs the prelude once ahead of exploration, capturing its step log —
//! including every lifted-effect occurrence — as the *replay log*. Each
//! explored schedule then fast-forwards the prelude under the same
//! round-robin/SC regime and is checked against the capture: a mismatch
//! means a lifted effect was not idempotent (a user-contract violation) and
//! is reported as a diagnostic.
//!
//! The prelude contributes a single trace event and no branch points, so
//! exploration effectively starts from the post-prelude state.

use crate::exec::{Context, StepOutcome};
use crate::program::action::Action;
use crate::program::Program;
use crate::settings::Settings;
use crate::trace::ThreadAction;
use crate::types::ThreadId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// True iff the computation's very first step is a `dont_check` prelude,
/// making it eligible for snapshotting.
#[must_use]
pub fn can_snapshot<T: 'static>(program: impl FnOnce() -> Program<T>) -> bool {
    let head = program().into_action(Box::new(|_| Action::Stop));
    matches!(head, Action::DontCheck { .. })
}

/// A captured prelude: the replay log and its fingerprint.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    log: Vec<ThreadAction>,
    /// Number of interpreter steps the prelude took.
    pub(crate) steps: usize,
}

impl Snapshot {
    pub(crate) fn fingerprint(&self) -> u64 {
        log_fingerprint(&self.log)
    }

    /// Checks a run's prelude log against the capture.
    pub(crate) fn matches(&self, log: &[ThreadAction]) -> bool {
        log_fingerprint(log) == self.fingerprint()
    }

    /// Lifted-effect occurrences recorded verbatim in the replay log.
    pub(crate) fn lifted_effects(&self) -> usize {
        self.log
            .iter()
            .filter(|a| matches!(a, ThreadAction::LiftedEffect))
            .count()
    }
}

pub(crate) fn log_fingerprint(log: &[ThreadAction]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for action in log {
        action.tag().hash(&mut hasher);
    }
    hasher.finish()
}

/// Runs the prelude once and captures it. Returns `None` when the
/// computation has no prelude or the prelude itself fails — exploration
/// then proceeds without a snapshot and surfaces the failure normally.
pub(crate) fn capture<T: Clone + 'static>(
    settings: &Settings<T>,
    program: &dyn Fn() -> Program<T>,
) -> Option<Snapshot> {
    let root = program().into_action(Box::new(|_| Action::Stop));
    if !matches!(root, Action::DontCheck { .. }) {
        return None;
    }
    let mut ctx = Context::new(settings.memtype, settings.supports_bound_threads, root);
    match ctx.step(ThreadId::ROOT) {
        StepOutcome::Event(ThreadAction::DontCheck { steps }) => Some(Snapshot {
            log: std::mem::take(&mut ctx.prelude_log),
            steps,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program;

    #[test]
    fn can_snapshot_requires_leading_prelude() {
        assert!(can_snapshot(|| program::dont_check(
            None,
            Program::pure(1i32)
        )));
        assert!(!can_snapshot(|| Program::pure(1i32)));
        assert!(!can_snapshot(|| program::yield_now()
            .then(program::dont_check(None, Program::pure(1i32)))));
    }

    #[test]
    fn capture_records_the_replay_log() {
        let settings: Settings<i32> = Settings::new();
        let program = || {
            program::dont_check(
                None,
                program::lift(|| 5i32)
                    .and_then(|v| program::new_cell(None, v).and_then(|c| c.read())),
            )
        };
        let snapshot = capture(&settings, &program).expect("snapshot");
        assert!(snapshot.steps >= 2);
        assert_eq!(snapshot.lifted_effects(), 1);
        // Capturing again yields the same fingerprint: the prelude is
        // deterministic.
        let again = capture(&settings, &program).expect("snapshot");
        assert_eq!(snapshot.fingerprint(), again.fingerprint());
    }

    #[test]
    fn capture_is_none_without_prelude() {
        let settings: Settings<i32> = Settings::new();
        assert!(capture(&settings, &|| Program::pure(3i32)).is_none());
    }
}
