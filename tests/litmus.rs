//! Litmus scenarios: fixed programs with known outcome sets.
//!
//! Each test builds a small concurrent program and checks the exact set of
//! outcomes systematic exploration discovers, per memory model.

use weft::program::{self, Program};
use weft::{explore, Bounds, Failure, MemType, Settings};

fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// The litmus programs are small and finite, so the schedule bounds are
// lifted: coverage assertions must not depend on bound pruning.
fn settings(memtype: MemType) -> Settings<(i32, i32)> {
    Settings::new().memtype(memtype).bounds(Bounds::unbounded())
}

// ============================================================================
// Store buffering
// ============================================================================

/// The classic store-buffering shape: each thread writes its own flag and
/// reads the other's. `(a, b)` is (thread 1's read, thread 2's read).
fn store_buffering() -> Program<(i32, i32)> {
    program::new_cell(Some("r1"), 0i32).and_then(|r1| {
        program::new_cell(Some("r2"), 0i32).and_then(move |r2| {
            program::new_mvar::<i32>(None).and_then(move |m1| {
                program::new_mvar::<i32>(None).and_then(move |m2| {
                    program::fork(
                        Some("left"),
                        r1.write(1).then(r2.read()).and_then(move |v| m1.put(v)),
                    )
                    .then(program::fork(
                        Some("right"),
                        r2.write(1).then(r1.read()).and_then(move |v| m2.put(v)),
                    ))
                    .then(m1.take())
                    .and_then(move |a| m2.take().map(move |b| (a, b)))
                })
            })
        })
    })
}

fn store_buffering_outcomes(memtype: MemType) -> Vec<(i32, i32)> {
    let report = explore(&settings(memtype), store_buffering);
    assert!(!report.has_failures(), "unexpected failure under {memtype}");
    let mut results: Vec<(i32, i32)> = report.successes().copied().collect();
    results.sort_unstable();
    results
}

#[test]
fn store_buffering_under_sc() {
    init_test_logging();
    let results = store_buffering_outcomes(MemType::SequentialConsistency);
    assert_eq!(results, vec![(0, 1), (1, 0), (1, 1)]);
}

#[test]
fn store_buffering_under_tso_adds_both_zero() {
    init_test_logging();
    let results = store_buffering_outcomes(MemType::TotalStoreOrder);
    assert_eq!(results, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
}

#[test]
fn store_buffering_under_pso_adds_both_zero() {
    init_test_logging();
    let results = store_buffering_outcomes(MemType::PartialStoreOrder);
    assert_eq!(results, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
}

// ============================================================================
// Deadlock
// ============================================================================

#[test]
fn take_on_empty_mvar_deadlocks() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new().memtype(MemType::SequentialConsistency);
    let report = explore(&settings, || {
        program::new_mvar::<i32>(Some("m")).and_then(|m| m.take())
    });
    assert_eq!(report.outcomes.len(), 1);
    let (outcome, trace) = &report.outcomes[0];
    assert_eq!(*outcome, Err(Failure::Deadlock));
    // The witness trace ends blocked on the take.
    let trace = trace.as_ref().expect("trace");
    assert!(trace
        .events()
        .iter()
        .any(|e| matches!(e.action, weft::ThreadAction::BlockedTakeMVar { .. })));
}

// ============================================================================
// CAS contention
// ============================================================================

/// Two threads race a CAS from 0 to their own marker; exactly one wins.
fn cas_contention() -> Program<i32> {
    program::new_cell(Some("c"), 0i32).and_then(|c| {
        program::new_mvar::<()>(None).and_then(move |d1| {
            program::new_mvar::<()>(None).and_then(move |d2| {
                let contender = |value: i32, done: program::MVarRef<()>| {
                    c.read_for_cas()
                        .and_then(move |t| c.cas(t, value))
                        .then(done.put(()))
                };
                program::fork(Some("a"), contender(1, d1))
                    .then(program::fork(Some("b"), contender(2, d2)))
                    .then(d1.take())
                    .then(d2.take())
                    .then(c.read())
            })
        })
    })
}

fn cas_outcomes(memtype: MemType) -> Vec<i32> {
    let settings: Settings<i32> = Settings::new()
        .memtype(memtype)
        .bounds(Bounds::unbounded());
    let report = explore(&settings, cas_contention);
    assert!(!report.has_failures(), "unexpected failure under {memtype}");
    let mut results: Vec<i32> = report.successes().copied().collect();
    results.sort_unstable();
    results.dedup();
    results
}

#[test]
fn cas_contention_is_memtype_independent() {
    init_test_logging();
    for memtype in [
        MemType::SequentialConsistency,
        MemType::TotalStoreOrder,
        MemType::PartialStoreOrder,
    ] {
        assert_eq!(cas_outcomes(memtype), vec![1, 2], "under {memtype}");
    }
}

// ============================================================================
// STM
// ============================================================================

#[test]
fn stm_retry_with_no_writer_is_stm_deadlock() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new().memtype(MemType::SequentialConsistency);
    let report = explore(&settings, || {
        program::atomically(|| program::stm::retry::<i32>())
    });
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].0, Err(Failure::StmDeadlock));
}

#[test]
fn stm_handoff_wakes_the_retrying_thread() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new().memtype(MemType::SequentialConsistency);
    let report = explore(&settings, || {
        program::atomically(|| program::stm::new_tvar(Some("flag"), 0i32)).and_then(|tv| {
            program::fork(Some("setter"), program::atomically(move || tv.write(1)))
                .then(program::atomically(move || {
                    tv.read()
                        .and_then(|v| program::stm::check(v > 0).map(move |()| v))
                }))
        })
    });
    assert!(!report.has_failures());
    let results: Vec<i32> = report.successes().copied().collect();
    assert_eq!(results, vec![1]);
}

// ============================================================================
// Masking
// ============================================================================

/// A `throw_to` against an uninterruptibly-masked thread is deferred until
/// the mask lifts: the masked writes always complete, the final write races
/// the delivery.
#[test]
fn masked_throw_to_defers_delivery() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new()
        .memtype(MemType::SequentialConsistency)
        .bounds(Bounds::unbounded());
    let report = explore(&settings, || {
        program::new_cell(Some("c"), 0i32).and_then(|c| {
            program::new_mvar::<()>(Some("ready")).and_then(move |ready| {
                program::fork(
                    Some("victim"),
                    program::mask_uninterruptible(move |_| {
                        c.write(1)
                            .then(ready.put(()))
                            .then(program::yield_now())
                            .then(c.write(2))
                    })
                    .then(c.write(3)),
                )
                .and_then(move |victim| {
                    ready
                        .take()
                        .then(program::throw_to(victim, "die"))
                        .then(c.read())
                })
            })
        })
    });
    assert!(!report.has_failures(), "the exception must not surface");
    let results: Vec<i32> = report.successes().copied().collect();
    assert!(!results.is_empty());
    // Both masked writes always complete before delivery; only the
    // post-mask write races it.
    assert!(
        results.iter().all(|&v| v == 2 || v == 3),
        "observed {results:?}"
    );
    assert!(results.contains(&2), "delivery never interrupted the mask");
}

#[test]
fn unmask_restores_interruptibility() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new()
        .memtype(MemType::SequentialConsistency)
        .bounds(Bounds::unbounded());
    // The victim signals readiness from inside the mask, then unmasks
    // around a blocking take; the throw can only land in that window, where
    // the installed handler catches it.
    let report = explore(&settings, || {
        program::new_mvar::<()>(Some("never")).and_then(|never| {
            program::new_mvar::<()>(Some("ready")).and_then(move |ready| {
                program::new_mvar::<i32>(Some("out")).and_then(move |out| {
                    program::fork(
                        Some("victim"),
                        program::catching::<(), &'static str>(
                            program::mask_uninterruptible(move |unmask| {
                                ready.put(()).then(unmask.restore(never.take()))
                            }),
                            move |_| Program::pure(()),
                        )
                        .then(out.put(7)),
                    )
                    .and_then(move |victim| {
                        ready
                            .take()
                            .then(program::throw_to(victim, "wake"))
                            .then(out.take())
                    })
                })
            })
        })
    });
    assert!(!report.has_failures());
    let results: Vec<i32> = report.successes().copied().collect();
    assert_eq!(results, vec![7]);
}

// ============================================================================
// Snapshot replay
// ============================================================================

#[test]
fn snapshot_prelude_state_is_visible_in_every_run() {
    init_test_logging();
    assert!(weft::can_snapshot(|| program::dont_check(
        None,
        Program::pure(0i32)
    )));

    let settings: Settings<(i32, i32)> =
        Settings::new().memtype(MemType::SequentialConsistency);
    let report = explore(&settings, || {
        program::dont_check(
            None,
            program::new_cell(Some("c"), 0i32).and_then(|c| c.write(1).map(move |()| c)),
        )
        .and_then(|c| {
            program::new_mvar::<i32>(None).and_then(move |m| {
                program::fork(Some("reader"), c.read().and_then(move |v| m.put(v)))
                    .then(c.read())
                    .and_then(move |mine| m.take().map(move |theirs| (mine, theirs)))
            })
        })
    });
    assert!(!report.has_failures());
    assert!(report.runs >= 1);
    for value in report.successes() {
        assert_eq!(*value, (1, 1), "a run failed to observe the prelude write");
    }
}
