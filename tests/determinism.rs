//! Cross-cutting properties: determinism, memory-model inclusion, outcome
//! preservation under simplification, and bound behavior.

use weft::program::{self, Program};
use weft::{explore, Bounds, Failure, MemType, Settings, Trace};

fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A counter bumped non-atomically by two threads; the lost update shows up
/// as a final value of 1.
fn lost_update() -> Program<i32> {
    program::new_cell(Some("counter"), 0i32).and_then(|c| {
        program::new_mvar::<()>(None).and_then(move |done| {
            program::fork(
                Some("bump"),
                c.modify(|v| v + 1).then(done.put(())),
            )
            .then(c.modify(|v| v + 1))
            .then(done.take())
            .then(c.read())
        })
    })
}

fn racing_flags() -> Program<(i32, i32)> {
    program::new_cell(None, 0i32).and_then(|r1| {
        program::new_cell(None, 0i32).and_then(move |r2| {
            program::new_mvar::<i32>(None).and_then(move |m1| {
                program::new_mvar::<i32>(None).and_then(move |m2| {
                    program::fork(
                        None,
                        r1.write(1).then(r2.read()).and_then(move |v| m1.put(v)),
                    )
                    .then(program::fork(
                        None,
                        r2.write(1).then(r1.read()).and_then(move |v| m2.put(v)),
                    ))
                    .then(m1.take())
                    .and_then(move |a| m2.take().map(move |b| (a, b)))
                })
            })
        })
    })
}

fn outcomes_under(memtype: MemType) -> Vec<Result<(i32, i32), Failure>> {
    let settings: Settings<(i32, i32)> = Settings::new()
        .memtype(memtype)
        .bounds(Bounds::unbounded());
    explore(&settings, racing_flags)
        .outcomes
        .into_iter()
        .map(|(o, _)| o)
        .collect()
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn outcome_sequences_are_reproducible() {
    init_test_logging();
    for memtype in [
        MemType::SequentialConsistency,
        MemType::TotalStoreOrder,
        MemType::PartialStoreOrder,
    ] {
        let first = outcomes_under(memtype);
        let second = outcomes_under(memtype);
        assert_eq!(first, second, "under {memtype}");
    }
}

#[test]
fn traces_are_reproducible_by_fingerprint() {
    init_test_logging();
    let fingerprints = || -> Vec<u64> {
        let settings: Settings<i32> =
            Settings::new().memtype(MemType::SequentialConsistency);
        explore(&settings, lost_update)
            .outcomes
            .iter()
            .filter_map(|(_, t)| t.as_ref().map(Trace::fingerprint))
            .collect()
    };
    assert_eq!(fingerprints(), fingerprints());
}

// ============================================================================
// Coverage
// ============================================================================

#[test]
fn both_orders_of_a_race_are_explored() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new()
        .memtype(MemType::SequentialConsistency)
        .bounds(Bounds::unbounded());
    let report = explore(&settings, lost_update);
    assert!(!report.has_failures());
    let mut results: Vec<i32> = report.successes().copied().collect();
    results.sort_unstable();
    assert_eq!(results, vec![1, 2], "lost update must be discovered");
}

// ============================================================================
// Memory-model inclusion: SC ⊆ TSO ⊆ PSO
// ============================================================================

#[test]
fn weaker_models_only_add_outcomes() {
    init_test_logging();
    let sc = outcomes_under(MemType::SequentialConsistency);
    let tso = outcomes_under(MemType::TotalStoreOrder);
    let pso = outcomes_under(MemType::PartialStoreOrder);
    for outcome in &sc {
        assert!(tso.contains(outcome), "TSO lost SC outcome {outcome:?}");
    }
    for outcome in &tso {
        assert!(pso.contains(outcome), "PSO lost TSO outcome {outcome:?}");
    }
    // The relaxed models must exhibit an outcome SC cannot.
    assert!(tso.contains(&Ok((0, 0))));
    assert!(!sc.contains(&Ok((0, 0))));
}

// ============================================================================
// Simplification
// ============================================================================

#[test]
fn simplification_preserves_outcomes() {
    init_test_logging();
    let run = |simplify: bool| -> Vec<Result<i32, Failure>> {
        let settings: Settings<i32> = Settings::new()
            .memtype(MemType::SequentialConsistency)
            .simplify(simplify);
        explore(&settings, lost_update)
            .outcomes
            .into_iter()
            .map(|(o, _)| o)
            .collect()
    };
    assert_eq!(run(true), run(false));
}

#[test]
fn simplified_deadlock_trace_shrinks_or_matches() {
    init_test_logging();
    // A deadlock with an irrelevant concurrent thread: simplification
    // consolidates the noise thread's steps.
    let program = || {
        program::new_mvar::<i32>(None).and_then(|m| {
            program::fork(Some("noise"), program::yield_now().then(program::yield_now()))
                .then(m.take())
        })
    };
    let plain: Settings<i32> = Settings::new()
        .memtype(MemType::SequentialConsistency)
        .simplify(false);
    let simplifying: Settings<i32> = Settings::new()
        .memtype(MemType::SequentialConsistency)
        .simplify(true);

    let baseline = explore(&plain, program);
    let simplified = explore(&simplifying, program);
    let get = |r: &weft::Exploration<i32>| -> (Result<i32, Failure>, usize) {
        let (o, t) = &r.outcomes[0];
        (o.clone(), t.as_ref().map_or(0, Trace::len))
    };
    let (outcome_a, len_a) = get(&baseline);
    let (outcome_b, len_b) = get(&simplified);
    assert_eq!(outcome_a, Err(Failure::Deadlock));
    assert_eq!(outcome_a, outcome_b);
    assert!(len_b <= len_a, "simplified {len_b} > original {len_a}");
}

// ============================================================================
// Bounds
// ============================================================================

#[test]
fn fairness_bound_abandons_spinning_runs() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new()
        .memtype(MemType::SequentialConsistency)
        .bounds(Bounds::unbounded().fairness(3));
    let report = explore(&settings, || {
        let mut spin = Program::pure(());
        for _ in 0..10 {
            spin = spin.then(program::yield_now());
        }
        spin.then(Program::pure(0))
    });
    // Every schedule spins past the fairness cap: nothing is reported, but
    // the runs are counted.
    assert!(report.outcomes.is_empty());
    assert!(report.bounded_runs >= 1);
}

#[test]
fn length_bound_abandons_long_runs() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new()
        .memtype(MemType::SequentialConsistency)
        .bounds(Bounds::unbounded().length(5));
    let report = explore(&settings, || {
        let mut long = Program::pure(());
        for _ in 0..20 {
            long = long.then(program::my_thread_id().map(|_| ()));
        }
        long.then(Program::pure(0))
    });
    assert!(report.outcomes.is_empty());
    assert!(report.bounded_runs >= 1);
}

#[test]
fn dont_check_prelude_is_exempt_from_length_bound() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new()
        .memtype(MemType::SequentialConsistency)
        .bounds(Bounds::unbounded().length(5));
    let report = explore(&settings, || {
        let mut prelude = Program::pure(());
        for _ in 0..20 {
            prelude = prelude.then(program::my_thread_id().map(|_| ()));
        }
        program::dont_check(None, prelude.then(Program::pure(9))).and_then(Program::pure)
    });
    assert!(!report.has_failures());
    assert_eq!(report.successes().copied().collect::<Vec<_>>(), vec![9]);
}

// ============================================================================
// Wire format
// ============================================================================

#[test]
fn reported_traces_serialize_to_the_wire_format() {
    init_test_logging();
    let settings: Settings<i32> = Settings::new().memtype(MemType::SequentialConsistency);
    let report = explore(&settings, lost_update);
    let (_, trace) = &report.outcomes[0];
    let wire = trace.as_ref().expect("trace").to_wire();
    let steps = wire.as_array().expect("array of decisions");
    assert!(!steps.is_empty());
    for step in steps {
        assert!(step["kind"].is_string());
        assert!(step["tid"].is_number());
        assert!(step["alternatives"].is_array());
        assert!(step["action"]["kind"].is_string());
    }
}
