//! Failure conditions reported by the interpreter and the exploration driver.
//!
//! A failure is the `Err` side of a run's outcome. Failures are values, not
//! panics: within a run, exceptions unwind through installed handlers, and an
//! unhandled exception on the root thread terminates that run with
//! [`Failure::UncaughtException`]. Across runs, failures are recorded in the
//! report and never abort exploration unless the caller's early-exit
//! predicate asks for it.

use core::fmt;

/// Why a single run failed.
///
/// Failure outcomes compare by *kind*: two `UncaughtException` values are
/// equal regardless of the exception they carry. This is the equality used
/// for outcome deduplication.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Failure {
    /// No runnable thread remained while at least one thread was blocked on
    /// an MVar or a synchronous `throw_to`.
    #[error("deadlock: every live thread is blocked")]
    Deadlock,

    /// Every blocked thread was waiting in an STM retry that no remaining
    /// thread could wake.
    #[error("STM deadlock: every live thread is blocked in an STM retry")]
    StmDeadlock,

    /// An interpreter invariant was violated. Always a bug in the engine,
    /// never in the tested program.
    #[error("internal invariant violated: {0}")]
    InternalError(String),

    /// The root thread propagated an exception past every handler.
    #[error("uncaught exception: {0}")]
    UncaughtException(String),

    /// A `sub` computation was started inside another `sub`, or inside a
    /// `dont_check` prelude.
    #[error("illegal nested subconcurrency")]
    IllegalSubconcurrency,

    /// A `dont_check` prelude appeared somewhere other than the very first
    /// action of the computation.
    #[error("dont_check must be the first action of the computation")]
    IllegalDontCheck,

    /// The scheduler gave up or an exploration bound was exceeded.
    #[error("run aborted: schedule bound exceeded or scheduler stopped")]
    Abort,

    /// `fork_os` was executed but the settings report no bound-thread
    /// support.
    #[error("bound threads are not supported by this configuration")]
    UnsupportedBoundThread,
}

impl Failure {
    /// A coarse tag identifying the failure kind, ignoring payloads.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Deadlock => FailureKind::Deadlock,
            Self::StmDeadlock => FailureKind::StmDeadlock,
            Self::InternalError(_) => FailureKind::InternalError,
            Self::UncaughtException(_) => FailureKind::UncaughtException,
            Self::IllegalSubconcurrency => FailureKind::IllegalSubconcurrency,
            Self::IllegalDontCheck => FailureKind::IllegalDontCheck,
            Self::Abort => FailureKind::Abort,
            Self::UnsupportedBoundThread => FailureKind::UnsupportedBoundThread,
        }
    }

    /// True if this failure indicates a bug in the engine itself.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::InternalError(_))
    }
}

/// Payload-free failure discriminant, used for outcome equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    /// See [`Failure::Deadlock`].
    Deadlock,
    /// See [`Failure::StmDeadlock`].
    StmDeadlock,
    /// See [`Failure::InternalError`].
    InternalError,
    /// See [`Failure::UncaughtException`].
    UncaughtException,
    /// See [`Failure::IllegalSubconcurrency`].
    IllegalSubconcurrency,
    /// See [`Failure::IllegalDontCheck`].
    IllegalDontCheck,
    /// See [`Failure::Abort`].
    Abort,
    /// See [`Failure::UnsupportedBoundThread`].
    UnsupportedBoundThread,
}

impl PartialEq for Failure {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind()
    }
}

impl Eq for Failure {}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deadlock => "deadlock",
            Self::StmDeadlock => "stm-deadlock",
            Self::InternalError => "internal-error",
            Self::UncaughtException => "uncaught-exception",
            Self::IllegalSubconcurrency => "illegal-subconcurrency",
            Self::IllegalDontCheck => "illegal-dont-check",
            Self::Abort => "abort",
            Self::UnsupportedBoundThread => "unsupported-bound-thread",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_compare_by_kind() {
        let a = Failure::UncaughtException("boom".into());
        let b = Failure::UncaughtException("different".into());
        assert_eq!(a, b);
        assert_ne!(a, Failure::Deadlock);
    }

    #[test]
    fn internal_error_is_flagged() {
        assert!(Failure::InternalError("oops".into()).is_internal());
        assert!(!Failure::Deadlock.is_internal());
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(FailureKind::StmDeadlock.to_string(), "stm-deadlock");
    }
}
