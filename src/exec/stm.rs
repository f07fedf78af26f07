//! The STM sub-interpreter.
//!
//! Runs a transaction attempt to completion against a log: reads record the
//! TVar version they observed, writes stay tentative. On commit every read
//! version is validated against the store; a mismatch discards the log and
//! re-executes the attempt. `retry` abandons the attempt and surfaces the
//! read set, which becomes the blocked thread's wake set. An exception
//! aborts the transaction: the log is discarded and the exception propagates
//! in the calling thread.

use crate::program::action::Val;
use crate::program::stm::StmAction;
use crate::program::Exception;
use crate::trace::TVarSet;
use crate::types::{IdSource, TVarId};
use std::collections::BTreeMap;
use std::rc::Rc;

pub(crate) struct TVar {
    #[allow(dead_code)]
    name: Option<String>,
    value: Val,
    version: u64,
}

/// The transactional store.
#[derive(Default)]
pub(crate) struct TVarTable {
    tvars: BTreeMap<TVarId, TVar>,
}

impl TVarTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, id: TVarId, name: Option<String>, value: Val) {
        self.tvars.insert(
            id,
            TVar {
                name,
                value,
                version: 0,
            },
        );
    }

    fn read(&self, id: TVarId) -> Option<(Val, u64)> {
        self.tvars.get(&id).map(|tv| (Rc::clone(&tv.value), tv.version))
    }

    fn commit_write(&mut self, id: TVarId, value: Val) {
        if let Some(tv) = self.tvars.get_mut(&id) {
            tv.value = value;
            tv.version += 1;
        }
    }
}

/// How a transaction ended.
pub(crate) enum TxOutcome {
    /// The log validated and applied.
    Committed {
        result: Val,
        written: TVarSet,
    },
    /// The attempt retried; the thread blocks until a TVar in `read`
    /// changes.
    Retry {
        read: TVarSet,
    },
    /// The transaction aborted with an exception.
    Aborted(Exception),
    /// Typed plumbing broke inside the transaction.
    Fault(&'static str),
}

struct TxLog {
    reads: BTreeMap<TVarId, u64>,
    writes: BTreeMap<TVarId, Val>,
    created: BTreeMap<TVarId, (Option<String>, Val)>,
}

impl TxLog {
    fn new() -> Self {
        Self {
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            created: BTreeMap::new(),
        }
    }

    fn read_set(&self) -> TVarSet {
        self.reads.keys().copied().collect()
    }
}

/// Executes one `atomically` block to completion, re-running the attempt
/// until the log validates. Runs entirely within a single visible
/// interpreter step.
pub(crate) fn run_transaction(
    run: &dyn Fn() -> StmAction,
    tvars: &mut TVarTable,
    ids: &mut IdSource,
) -> TxOutcome {
    loop {
        let mut log = TxLog::new();
        match attempt(run(), tvars, ids, &mut log) {
            Attempt::Done(result) => {
                // Validate every observed version. Within one interpreter
                // step nothing else can have committed, so this holds by
                // construction; a mismatch re-executes the attempt.
                let valid = log
                    .reads
                    .iter()
                    .all(|(id, seen)| tvars.read(*id).is_some_and(|(_, v)| v == *seen));
                if !valid {
                    continue;
                }
                let mut written: TVarSet = TVarSet::new();
                for (id, (name, value)) in log.created {
                    tvars.insert(id, name, value);
                }
                for (id, value) in log.writes {
                    tvars.commit_write(id, value);
                    written.push(id);
                }
                return TxOutcome::Committed { result, written };
            }
            Attempt::Retry => {
                return TxOutcome::Retry {
                    read: log.read_set(),
                }
            }
            Attempt::Abort(exc) => return TxOutcome::Aborted(exc),
            Attempt::Fault(msg) => return TxOutcome::Fault(msg),
        }
    }
}

enum Attempt {
    Done(Val),
    Retry,
    Abort(Exception),
    Fault(&'static str),
}

fn attempt(
    mut action: StmAction,
    tvars: &TVarTable,
    ids: &mut IdSource,
    log: &mut TxLog,
) -> Attempt {
    loop {
        action = match action {
            StmAction::NewTVar { name, init, cont } => {
                let id = ids.fresh_tvar();
                log.created.insert(id, (name, Rc::clone(&init)));
                log.writes.insert(id, init);
                cont(id)
            }
            StmAction::ReadTVar { tvar, cont } => {
                let value = if let Some(v) = log.writes.get(&tvar) {
                    Rc::clone(v)
                } else if let Some((_, init)) = log.created.get(&tvar) {
                    Rc::clone(init)
                } else if let Some((v, version)) = tvars.read(tvar) {
                    log.reads.entry(tvar).or_insert(version);
                    v
                } else {
                    return Attempt::Fault("transaction read an unknown TVar");
                };
                cont(value)
            }
            StmAction::WriteTVar { tvar, value, cont } => {
                if !log.created.contains_key(&tvar) && tvars.read(tvar).is_none() {
                    return Attempt::Fault("transaction wrote an unknown TVar");
                }
                log.writes.insert(tvar, value);
                *cont
            }
            StmAction::Retry => return Attempt::Retry,
            StmAction::Throw(exc) => return Attempt::Abort(exc),
            StmAction::Stop(result) => return Attempt::Done(result),
            StmAction::Fault(msg) => return Attempt::Fault(msg),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::stm::{self, Stm};

    fn runner<T: 'static>(stm: impl Fn() -> Stm<T> + 'static) -> impl Fn() -> StmAction {
        move || stm().into_action(Box::new(|t| StmAction::Stop(Rc::new(t))))
    }

    fn commit_i32(outcome: &TxOutcome) -> i32 {
        match outcome {
            TxOutcome::Committed { result, .. } => *result.downcast_ref::<i32>().expect("i32"),
            _ => panic!("expected commit"),
        }
    }

    #[test]
    fn commit_applies_writes_and_bumps_versions() {
        let mut tvars = TVarTable::new();
        let mut ids = IdSource::new();

        let run = runner(|| stm::new_tvar(Some("v"), 1i32).map(|_| 0i32));
        let out = run_transaction(&run, &mut tvars, &mut ids);
        assert_eq!(commit_i32(&out), 0);
        let id = TVarId::from_index(0);
        // Creation counts as the TVar's first write.
        let (val, version) = tvars.read(id).unwrap();
        assert_eq!(*val.downcast_ref::<i32>().unwrap(), 1);
        assert_eq!(version, 1);

        // A second transaction reads and rewrites the TVar.
        let run = runner(move || {
            let tv = fake_ref(id);
            tv.read().and_then(move |v| tv.write(v + 10).map(move |()| v))
        });
        let out = run_transaction(&run, &mut tvars, &mut ids);
        assert_eq!(commit_i32(&out), 1);
        let (val, version) = tvars.read(id).unwrap();
        assert_eq!(*val.downcast_ref::<i32>().unwrap(), 11);
        assert_eq!(version, 2);
        if let TxOutcome::Committed { written, .. } = out {
            assert_eq!(written.to_vec(), vec![id]);
        }
    }

    #[test]
    fn retry_reports_read_set() {
        let mut tvars = TVarTable::new();
        let mut ids = IdSource::new();
        let setup = runner(|| stm::new_tvar(None, 0i32).map(|_| 0i32));
        run_transaction(&setup, &mut tvars, &mut ids);

        let id = TVarId::from_index(0);
        let run = runner(move || fake_ref(id).read().and_then(|v| stm::check(v > 0).map(move |()| v)));
        match run_transaction(&run, &mut tvars, &mut ids) {
            TxOutcome::Retry { read } => assert_eq!(read.to_vec(), vec![id]),
            _ => panic!("expected retry"),
        }
        // The store is untouched beyond the setup write.
        assert_eq!(tvars.read(id).unwrap().1, 1);
    }

    #[test]
    fn abort_discards_the_log() {
        let mut tvars = TVarTable::new();
        let mut ids = IdSource::new();
        let setup = runner(|| stm::new_tvar(None, 0i32).map(|_| 0i32));
        run_transaction(&setup, &mut tvars, &mut ids);

        let id = TVarId::from_index(0);
        let run = runner(move || {
            fake_ref(id)
                .write(99)
                .then(stm::throw::<i32, _>("abort"))
        });
        match run_transaction(&run, &mut tvars, &mut ids) {
            TxOutcome::Aborted(exc) => assert!(exc.is::<&'static str>()),
            _ => panic!("expected abort"),
        }
        assert_eq!(
            *tvars.read(id).unwrap().0.downcast_ref::<i32>().unwrap(),
            0
        );
    }

    #[test]
    fn unknown_tvar_is_a_fault() {
        let mut tvars = TVarTable::new();
        let mut ids = IdSource::new();
        let run = runner(|| fake_ref(TVarId::from_index(9)).read());
        assert!(matches!(
            run_transaction(&run, &mut tvars, &mut ids),
            TxOutcome::Fault(_)
        ));
    }

    /// Builds a typed handle for an id minted by an earlier transaction.
    fn fake_ref(id: TVarId) -> stm::TVarRef<i32> {
        stm::TVarRef::from_raw(id)
    }
}
