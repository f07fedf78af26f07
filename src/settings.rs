//! Exploration settings.
//!
//! [`Settings`] bundles everything a caller can vary about an exploration:
//! the simulated memory model, the schedule bounds, the trace simplifier
//! switch, and the outcome policies (equality for deduplication, discarding,
//! early exit). Builder methods follow the usual chained style.

use crate::error::Failure;
use std::fmt;
use std::rc::Rc;

/// A single run's outcome: the root thread's result, or a failure.
pub type Outcome<T> = Result<T, Failure>;

/// The simulated memory model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemType {
    /// Writes commit atomically; no buffers exist.
    SequentialConsistency,
    /// One FIFO write buffer per thread, shared across all cells.
    #[default]
    TotalStoreOrder,
    /// One FIFO write buffer per (thread, cell) pair.
    PartialStoreOrder,
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SequentialConsistency => "SC",
            Self::TotalStoreOrder => "TSO",
            Self::PartialStoreOrder => "PSO",
        };
        f.write_str(s)
    }
}

/// Caps applied to every explored schedule, orthogonal to DPOR.
///
/// A run that exceeds a bound is abandoned and skipped in the report, though
/// its partial trace still seeds backtrack points. `dont_check` preludes are
/// exempt from all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    /// Maximum context switches not caused by blocking or a voluntary
    /// yield/delay. `None` disables the bound.
    pub preemptions: Option<usize>,
    /// Maximum yields plus delays per thread.
    pub fairness: Option<usize>,
    /// Maximum events per run.
    pub length: Option<usize>,
}

impl Bounds {
    /// No caps at all. Exploration terminates only if the computation does.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            preemptions: None,
            fairness: None,
            length: None,
        }
    }

    /// Sets the preemption cap.
    #[must_use]
    pub const fn preemptions(mut self, n: usize) -> Self {
        self.preemptions = Some(n);
        self
    }

    /// Sets the fairness cap.
    #[must_use]
    pub const fn fairness(mut self, n: usize) -> Self {
        self.fairness = Some(n);
        self
    }

    /// Sets the length cap.
    #[must_use]
    pub const fn length(mut self, n: usize) -> Self {
        self.length = Some(n);
        self
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            preemptions: Some(2),
            fairness: Some(5),
            length: Some(250),
        }
    }
}

/// How much of an uninteresting result to suppress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Keep the outcome but drop its trace.
    Trace,
    /// Drop the outcome entirely.
    ResultAndTrace,
}

type EqualityFn<T> = Rc<dyn Fn(&Outcome<T>, &Outcome<T>) -> bool>;
type DiscardFn<T> = Rc<dyn Fn(&Outcome<T>) -> Option<Discard>>;
type EarlyExitFn<T> = Rc<dyn Fn(&Outcome<T>) -> bool>;
type DebugSink = Rc<dyn Fn(&str)>;

/// Everything a caller can vary about an exploration.
#[derive(Clone)]
pub struct Settings<T> {
    /// The simulated memory model.
    pub memtype: MemType,
    /// Schedule bounds.
    pub bounds: Bounds,
    /// Whether to simplify reported traces.
    pub simplify: bool,
    /// Treat simplifier diagnostics as fatal, reporting `InternalError`
    /// instead of falling back to the original trace.
    pub debug_fatal: bool,
    /// Whether `fork_os` is permitted.
    pub supports_bound_threads: bool,
    equality: Option<EqualityFn<T>>,
    discard: Option<DiscardFn<T>>,
    early_exit: Option<EarlyExitFn<T>>,
    debug_sink: Option<DebugSink>,
}

impl<T> Settings<T> {
    /// Defaults: TSO, default bounds, simplification on.
    #[must_use]
    pub fn new() -> Self {
        Self {
            memtype: MemType::default(),
            bounds: Bounds::default(),
            simplify: true,
            debug_fatal: false,
            supports_bound_threads: true,
            equality: None,
            discard: None,
            early_exit: None,
            debug_sink: None,
        }
    }

    /// Selects the memory model.
    #[must_use]
    pub fn memtype(mut self, memtype: MemType) -> Self {
        self.memtype = memtype;
        self
    }

    /// Replaces the schedule bounds.
    #[must_use]
    pub fn bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Enables or disables trace simplification.
    ///
    /// When an `Ok` outcome is simplified and no equality predicate is set,
    /// the shrunk trace is accepted as long as the replay still succeeds —
    /// the returned values themselves are not compared.
    #[must_use]
    pub fn simplify(mut self, on: bool) -> Self {
        self.simplify = on;
        self
    }

    /// Treats simplifier diagnostics as fatal.
    #[must_use]
    pub fn debug_fatal(mut self, on: bool) -> Self {
        self.debug_fatal = on;
        self
    }

    /// Declares whether the host supports bound threads.
    #[must_use]
    pub fn supports_bound_threads(mut self, on: bool) -> Self {
        self.supports_bound_threads = on;
        self
    }

    /// Supplies an outcome equality predicate; duplicates are collapsed in
    /// the report.
    #[must_use]
    pub fn equality(mut self, eq: impl Fn(&Outcome<T>, &Outcome<T>) -> bool + 'static) -> Self {
        self.equality = Some(Rc::new(eq));
        self
    }

    /// Supplies a discard policy for uninteresting outcomes.
    #[must_use]
    pub fn discard(mut self, f: impl Fn(&Outcome<T>) -> Option<Discard> + 'static) -> Self {
        self.discard = Some(Rc::new(f));
        self
    }

    /// Terminates exploration as soon as a matching outcome is recorded.
    #[must_use]
    pub fn early_exit(mut self, f: impl Fn(&Outcome<T>) -> bool + 'static) -> Self {
        self.early_exit = Some(Rc::new(f));
        self
    }

    /// Supplies a sink for diagnostic messages (simplifier and snapshot
    /// divergences). Diagnostics are also emitted at `tracing::warn` level
    /// either way.
    #[must_use]
    pub fn debug_print(mut self, f: impl Fn(&str) + 'static) -> Self {
        self.debug_sink = Some(Rc::new(f));
        self
    }

    pub(crate) fn diagnose(&self, msg: &str) {
        tracing::warn!("{msg}");
        if let Some(sink) = &self.debug_sink {
            sink(msg);
        }
    }

    pub(crate) fn has_equality(&self) -> bool {
        self.equality.is_some()
    }

    pub(crate) fn discard_for(&self, outcome: &Outcome<T>) -> Option<Discard> {
        self.discard.as_ref().and_then(|f| f(outcome))
    }

    pub(crate) fn wants_early_exit(&self, outcome: &Outcome<T>) -> bool {
        self.early_exit.as_ref().is_some_and(|f| f(outcome))
    }
}

impl<T: PartialEq> Settings<T> {
    /// Compares two outcomes under the configured equality: the supplied
    /// predicate if any, else failure kinds on the `Err` side and `PartialEq`
    /// on the `Ok` side.
    pub(crate) fn outcomes_equal(&self, a: &Outcome<T>, b: &Outcome<T>) -> bool {
        match &self.equality {
            Some(eq) => eq(a, b),
            None => match (a, b) {
                (Ok(x), Ok(y)) => x == y,
                (Err(x), Err(y)) => x.kind() == y.kind(),
                _ => false,
            },
        }
    }
}

impl<T> Default for Settings<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Settings<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("memtype", &self.memtype)
            .field("bounds", &self.bounds)
            .field("simplify", &self.simplify)
            .field("debug_fatal", &self.debug_fatal)
            .field("supports_bound_threads", &self.supports_bound_threads)
            .field("equality", &self.equality.is_some())
            .field("discard", &self.discard.is_some())
            .field("early_exit", &self.early_exit.is_some())
            .field("debug_print", &self.debug_sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bounds() {
        let b = Bounds::default();
        assert_eq!(b.preemptions, Some(2));
        assert_eq!(b.fairness, Some(5));
        assert_eq!(b.length, Some(250));
        assert_eq!(Bounds::unbounded().preemptions, None);
    }

    #[test]
    fn builder_chains() {
        let s: Settings<i32> = Settings::new()
            .memtype(MemType::PartialStoreOrder)
            .bounds(Bounds::unbounded().length(10))
            .simplify(false);
        assert_eq!(s.memtype, MemType::PartialStoreOrder);
        assert_eq!(s.bounds.length, Some(10));
        assert!(!s.simplify);
    }

    #[test]
    fn default_equality_compares_failures_by_kind() {
        let s: Settings<i32> = Settings::new();
        assert!(s.outcomes_equal(
            &Err(Failure::UncaughtException("a".into())),
            &Err(Failure::UncaughtException("b".into())),
        ));
        assert!(!s.outcomes_equal(&Ok(1), &Ok(2)));
        assert!(s.outcomes_equal(&Ok(3), &Ok(3)));
    }

    #[test]
    fn custom_equality_wins() {
        let s: Settings<i32> = Settings::new().equality(|a, b| a.is_ok() == b.is_ok());
        assert!(s.outcomes_equal(&Ok(1), &Ok(2)));
    }

    #[test]
    fn discard_and_early_exit_policies() {
        let s: Settings<i32> = Settings::new()
            .discard(|o| o.is_ok().then_some(Discard::Trace))
            .early_exit(Outcome::is_err);
        assert_eq!(s.discard_for(&Ok(1)), Some(Discard::Trace));
        assert_eq!(s.discard_for(&Err(Failure::Deadlock)), None);
        assert!(s.wants_early_exit(&Err(Failure::Deadlock)));
        assert!(!s.wants_early_exit(&Ok(1)));
    }
}
