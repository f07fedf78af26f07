//! The relaxed-memory simulator.
//!
//! Models SC, TSO, and PSO over the mutable cells. Writes either commit
//! atomically (SC) or land in an explicit FIFO write buffer; each non-empty
//! buffer head is exposed to the scheduler as a *commit pseudo-thread*, so
//! the moment a write becomes globally visible is itself a scheduling
//! decision.
//!
//! Buffer granularity decides the commit-thread identity: under TSO one
//! buffer per writer spans all cells, so a writer has a single commit
//! thread; under PSO each (writer, cell) pair buffers separately and gets
//! its own.
//!
//! Barriers force commits. A per-cell barrier (CAS, atomic modify) commits
//! every pending write to that cell — which under TSO drags along any older
//! writes queued ahead of them. A full barrier (STM commit) drains every
//! buffer.

use crate::program::action::{Ticket, Val};
use crate::settings::MemType;
use crate::types::{CellId, ThreadId};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

/// Buffer key: per writer under TSO, per (writer, cell) under PSO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BufferKey(ThreadId, Option<CellId>);

struct CellEntry {
    #[allow(dead_code)]
    name: Option<String>,
    value: Val,
    version: u64,
}

/// A pending commit visible to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommitOption {
    /// The synthetic schedulable id.
    pub(crate) commit_tid: ThreadId,
    /// The thread whose buffer head this is.
    pub(crate) writer: ThreadId,
    /// The cell the head write targets.
    pub(crate) cell: CellId,
}

pub(crate) struct MemoryModel {
    memtype: MemType,
    cells: BTreeMap<CellId, CellEntry>,
    buffers: BTreeMap<BufferKey, VecDeque<(CellId, Val)>>,
}

impl MemoryModel {
    pub(crate) fn new(memtype: MemType) -> Self {
        Self {
            memtype,
            cells: BTreeMap::new(),
            buffers: BTreeMap::new(),
        }
    }

    pub(crate) const fn memtype(&self) -> MemType {
        self.memtype
    }

    pub(crate) fn new_cell(&mut self, cell: CellId, name: Option<String>, init: Val) {
        self.cells.insert(
            cell,
            CellEntry {
                name,
                value: init,
                version: 0,
            },
        );
    }

    pub(crate) fn cell_exists(&self, cell: CellId) -> bool {
        self.cells.contains_key(&cell)
    }

    fn key_for(&self, writer: ThreadId, cell: CellId) -> BufferKey {
        match self.memtype {
            MemType::PartialStoreOrder => BufferKey(writer, Some(cell)),
            _ => BufferKey(writer, None),
        }
    }

    /// The value `reader` observes: its most recent buffered write to the
    /// cell if any, else the committed value. Reads never block.
    pub(crate) fn read(&self, reader: ThreadId, cell: CellId) -> Option<Val> {
        let key = self.key_for(reader, cell);
        if let Some(buffer) = self.buffers.get(&key) {
            if let Some((_, val)) = buffer.iter().rev().find(|(c, _)| *c == cell) {
                return Some(Rc::clone(val));
            }
        }
        self.cells.get(&cell).map(|e| Rc::clone(&e.value))
    }

    /// The committed value and version, bypassing buffers. This is the view
    /// a CAS ticket captures.
    pub(crate) fn committed(&self, cell: CellId) -> Option<(Val, u64)> {
        self.cells.get(&cell).map(|e| (Rc::clone(&e.value), e.version))
    }

    /// Enqueues a write. Under SC the write commits inline and `false` is
    /// returned; under TSO/PSO it is buffered and `true` is returned.
    pub(crate) fn write(&mut self, writer: ThreadId, cell: CellId, value: Val) -> bool {
        match self.memtype {
            MemType::SequentialConsistency => {
                self.commit_value(cell, value);
                false
            }
            _ => {
                let key = self.key_for(writer, cell);
                self.buffers.entry(key).or_default().push_back((cell, value));
                true
            }
        }
    }

    /// Commits a value directly, bumping the cell version.
    pub(crate) fn commit_value(&mut self, cell: CellId, value: Val) {
        if let Some(entry) = self.cells.get_mut(&cell) {
            entry.value = value;
            entry.version += 1;
        }
    }

    /// The schedulable commits: one per non-empty buffer head, in
    /// deterministic key order.
    pub(crate) fn commit_options(&self) -> Vec<CommitOption> {
        self.buffers
            .iter()
            .filter_map(|(&BufferKey(writer, _), buffer)| {
                buffer.front().map(|(cell, _)| CommitOption {
                    commit_tid: match self.memtype {
                        MemType::PartialStoreOrder => ThreadId::commit_pso(writer, *cell),
                        _ => ThreadId::commit_tso(writer),
                    },
                    writer,
                    cell: *cell,
                })
            })
            .collect()
    }

    /// Promotes the oldest buffered write of `writer` (to `cell`, under
    /// PSO) to the committed value. FIFO order within a buffer is an
    /// invariant: only heads commit.
    pub(crate) fn commit(&mut self, writer: ThreadId, cell: CellId) -> Result<(), String> {
        let key = self.key_for(writer, cell);
        let buffer = self
            .buffers
            .get_mut(&key)
            .ok_or_else(|| format!("commit for {writer}/{cell} with no buffer"))?;
        let (head_cell, value) = buffer
            .pop_front()
            .ok_or_else(|| format!("commit for {writer}/{cell} with empty buffer"))?;
        if head_cell != cell {
            return Err(format!(
                "commit order violation: head targets {head_cell}, commit asked for {cell}"
            ));
        }
        if buffer.is_empty() {
            self.buffers.remove(&key);
        }
        self.commit_value(cell, value);
        Ok(())
    }

    /// Forces every pending write to `cell` to commit. Under TSO the FIFO
    /// invariant drags along older writes to other cells queued ahead.
    pub(crate) fn barrier_cell(&mut self, cell: CellId) {
        let keys: Vec<BufferKey> = self.buffers.keys().copied().collect();
        for key in keys {
            loop {
                let Some(buffer) = self.buffers.get_mut(&key) else {
                    break;
                };
                if !buffer.iter().any(|(c, _)| *c == cell) {
                    break;
                }
                let (head_cell, value) = match buffer.pop_front() {
                    Some(entry) => entry,
                    None => break,
                };
                if buffer.is_empty() {
                    self.buffers.remove(&key);
                }
                self.commit_value(head_cell, value);
            }
        }
    }

    /// Forces every pending write of every thread to commit, in
    /// deterministic buffer order.
    pub(crate) fn barrier_all(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        for (_, buffer) in buffers {
            for (cell, value) in buffer {
                self.commit_value(cell, value);
            }
        }
    }

    /// Issues a CAS ticket observing the committed state of `cell`.
    pub(crate) fn ticket(&self, cell: CellId) -> Option<Ticket> {
        self.committed(cell).map(|(observed, version)| Ticket {
            cell,
            version,
            observed,
        })
    }

    /// Compare-and-swap: the caller must have barriered the cell first.
    /// Succeeds iff the ticket's version is current; returns the outcome and
    /// a fresh ticket.
    pub(crate) fn cas(
        &mut self,
        cell: CellId,
        ticket: &Ticket,
        value: Val,
    ) -> Result<(bool, Ticket), String> {
        let (_, version) = self
            .committed(cell)
            .ok_or_else(|| format!("cas on unknown cell {cell}"))?;
        let succeeded = ticket.version == version;
        if succeeded {
            self.commit_value(cell, value);
        }
        let fresh = self
            .ticket(cell)
            .ok_or_else(|| format!("cas on unknown cell {cell}"))?;
        Ok((succeeded, fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdSource;

    fn val(n: i32) -> Val {
        Rc::new(n)
    }

    fn get(v: &Val) -> i32 {
        *v.downcast_ref::<i32>().expect("i32")
    }

    fn setup(memtype: MemType) -> (MemoryModel, ThreadId, ThreadId, CellId) {
        let mut ids = IdSource::new();
        let t0 = ids.fresh_thread();
        let t1 = ids.fresh_thread();
        let c = ids.fresh_cell();
        let mut mem = MemoryModel::new(memtype);
        mem.new_cell(c, None, val(0));
        (mem, t0, t1, c)
    }

    #[test]
    fn sc_commits_inline() {
        let (mut mem, t0, t1, c) = setup(MemType::SequentialConsistency);
        assert!(!mem.write(t0, c, val(1)));
        assert_eq!(get(&mem.read(t1, c).unwrap()), 1);
        assert!(mem.commit_options().is_empty());
    }

    #[test]
    fn tso_buffers_until_commit() {
        let (mut mem, t0, t1, c) = setup(MemType::TotalStoreOrder);
        assert!(mem.write(t0, c, val(1)));
        // Writer sees its own buffered write; others see the committed value.
        assert_eq!(get(&mem.read(t0, c).unwrap()), 1);
        assert_eq!(get(&mem.read(t1, c).unwrap()), 0);

        let opts = mem.commit_options();
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0].writer, t0);
        assert_eq!(opts[0].cell, c);
        assert_eq!(opts[0].commit_tid, ThreadId::commit_tso(t0));

        mem.commit(t0, c).unwrap();
        assert_eq!(get(&mem.read(t1, c).unwrap()), 1);
        assert!(mem.commit_options().is_empty());
    }

    #[test]
    fn tso_single_buffer_fifo_across_cells() {
        let mut ids = IdSource::new();
        let t0 = ids.fresh_thread();
        let a = ids.fresh_cell();
        let b = ids.fresh_cell();
        let mut mem = MemoryModel::new(MemType::TotalStoreOrder);
        mem.new_cell(a, None, val(0));
        mem.new_cell(b, None, val(0));
        mem.write(t0, a, val(1));
        mem.write(t0, b, val(2));
        // Only the head (the write to `a`) is committable.
        let opts = mem.commit_options();
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0].cell, a);
        // Committing out of order is an invariant violation.
        assert!(mem.commit(t0, b).is_err());
        mem.commit(t0, a).unwrap();
        assert_eq!(mem.commit_options()[0].cell, b);
    }

    #[test]
    fn pso_buffers_are_per_cell() {
        let mut ids = IdSource::new();
        let t0 = ids.fresh_thread();
        let a = ids.fresh_cell();
        let b = ids.fresh_cell();
        let mut mem = MemoryModel::new(MemType::PartialStoreOrder);
        mem.new_cell(a, None, val(0));
        mem.new_cell(b, None, val(0));
        mem.write(t0, a, val(1));
        mem.write(t0, b, val(2));
        // Both heads are committable, under distinct commit threads.
        let opts = mem.commit_options();
        assert_eq!(opts.len(), 2);
        assert_ne!(opts[0].commit_tid, opts[1].commit_tid);
        // PSO permits committing `b` before `a`.
        mem.commit(t0, b).unwrap();
        assert_eq!(get(&mem.committed(b).unwrap().0), 2);
        assert_eq!(get(&mem.committed(a).unwrap().0), 0);
    }

    #[test]
    fn cell_barrier_drains_cell_and_tso_predecessors() {
        let mut ids = IdSource::new();
        let t0 = ids.fresh_thread();
        let a = ids.fresh_cell();
        let b = ids.fresh_cell();
        let mut mem = MemoryModel::new(MemType::TotalStoreOrder);
        mem.new_cell(a, None, val(0));
        mem.new_cell(b, None, val(0));
        mem.write(t0, a, val(1));
        mem.write(t0, b, val(2));
        mem.barrier_cell(b);
        // Draining `b` forced the older write to `a` out first.
        assert_eq!(get(&mem.committed(a).unwrap().0), 1);
        assert_eq!(get(&mem.committed(b).unwrap().0), 2);
        assert!(mem.commit_options().is_empty());
    }

    #[test]
    fn cas_respects_versions() {
        let (mut mem, t0, _, c) = setup(MemType::SequentialConsistency);
        let ticket = mem.ticket(c).unwrap();
        mem.write(t0, c, val(5));
        // The inline commit bumped the version: the old ticket is stale.
        let (ok, fresh) = mem.cas(c, &ticket, val(9)).unwrap();
        assert!(!ok);
        assert_eq!(get(&mem.committed(c).unwrap().0), 5);
        let (ok, _) = mem.cas(c, &fresh, val(9)).unwrap();
        assert!(ok);
        assert_eq!(get(&mem.committed(c).unwrap().0), 9);
    }

    #[test]
    fn barrier_all_flushes_everything() {
        let (mut mem, t0, t1, c) = setup(MemType::PartialStoreOrder);
        mem.write(t0, c, val(1));
        mem.write(t1, c, val(2));
        mem.barrier_all();
        assert!(mem.commit_options().is_empty());
        // Buffer drain order is key order: t1's write commits last.
        assert_eq!(get(&mem.committed(c).unwrap().0), 2);
    }
}
