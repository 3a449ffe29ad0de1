//! In-memory store state and live query diffing

use std::collections::BTreeMap;

use custodian_core::{ChangeSet, Query, Record, RecordId, ResultSet};
use rustc_hash::FxHashMap;

use crate::format::Op;

/// Committed contents of a store file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    /// Records by id
    pub records: BTreeMap<RecordId, Record>,
    /// Next id to hand out
    pub next_id: u64,
}

impl StoreState {
    /// Replay decoded frames into a fresh state.
    pub fn replay<'a, I>(frames: I) -> Self
    where
        I: IntoIterator<Item = &'a Vec<Op>>,
    {
        let mut state = StoreState::default();
        for ops in frames {
            for op in ops {
                state.apply(op.clone());
            }
        }
        state
    }

    /// Apply one operation.
    pub fn apply(&mut self, op: Op) {
        match op {
            Op::Put(record) => {
                self.next_id = self.next_id.max(record.id.as_u64() + 1);
                self.records.insert(record.id, record);
            }
            Op::Remove(id) => {
                self.records.remove(&id);
            }
            Op::Reserve(next_id) => {
                self.next_id = self.next_id.max(next_id);
            }
        }
    }

    /// Allocate a fresh record id.
    pub fn allocate_id(&mut self) -> RecordId {
        let id = RecordId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Evaluate a query, ordered by id.
    pub fn query(&self, query: &Query) -> ResultSet {
        ResultSet {
            records: self
                .records
                .values()
                .filter(|r| query.matches(r))
                .cloned()
                .collect(),
        }
    }

    /// The operations that rebuild this state from nothing.
    pub fn snapshot_ops(&self) -> Vec<Op> {
        let mut ops = Vec::with_capacity(self.records.len() + 1);
        ops.push(Op::Reserve(self.next_id));
        ops.extend(self.records.values().cloned().map(Op::Put));
        ops
    }
}

/// Diff two id-ordered result sets.
///
/// `removed` indexes `previous`; `inserted` and `modified` index `current`.
pub fn diff(previous: &ResultSet, current: &ResultSet) -> ChangeSet {
    let old_positions: FxHashMap<RecordId, usize> = previous
        .records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id, i))
        .collect();
    let new_ids: FxHashMap<RecordId, usize> = current
        .records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id, i))
        .collect();

    let mut changes = ChangeSet::default();
    for (i, record) in previous.records.iter().enumerate() {
        if !new_ids.contains_key(&record.id) {
            changes.removed.push(i);
        }
    }
    for (i, record) in current.records.iter().enumerate() {
        match old_positions.get(&record.id) {
            None => changes.inserted.push(i),
            Some(&old) if previous.records[old] != *record => changes.modified.push(i),
            Some(_) => {}
        }
    }
    changes
}
