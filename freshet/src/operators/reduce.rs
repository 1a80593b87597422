//! Keyed reduce with a completion predicate.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::{wrap_pair, StatefulOp};
use crate::dataflow::{CompletionCheck, Reducer};
use crate::errors::Error;
use crate::state::{KeyedState, SnapshotRecord, StateBytes, StateKey, StepId};
use crate::value::Value;

/// Accumulates values per key; the first value seeds the accumulator, and
/// once `is_complete` accepts it the pair is emitted and the cell deleted.
pub(crate) struct ReduceOp {
    state: KeyedState<Value>,
    reducer: Reducer,
    is_complete: CompletionCheck,
}

impl ReduceOp {
    pub(crate) fn new(step_id: StepId, reducer: Reducer, is_complete: CompletionCheck) -> Self {
        ReduceOp { state: KeyedState::new(step_id), reducer, is_complete }
    }
}

impl StatefulOp for ReduceOp {
    fn step_id(&self) -> &StepId {
        self.state.step_id()
    }

    fn on_item(
        &mut self,
        key: StateKey,
        value: Value,
        _timestamp: Option<DateTime<Utc>>,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        let acc = match self.state.remove(&key) {
            Some(prev) => (self.reducer)(prev, value)?,
            None => value,
        };
        if (self.is_complete)(&acc)? {
            // The cell is already removed; a tombstone lands at the next
            // snapshot if it had ever been persisted.
            out.push(wrap_pair(&key, acc));
        } else {
            self.state.put(key, acc);
        }
        Ok(())
    }

    fn snapshot(&mut self, epoch: u64) -> Vec<SnapshotRecord> {
        self.state.snapshot(epoch)
    }

    fn restore(&mut self, cells: HashMap<StateKey, StateBytes>) -> Result<(), Error> {
        for (key, bytes) in cells {
            self.state.restore(key, &bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_until(target: i64) -> ReduceOp {
        ReduceOp::new(
            StepId::from("count"),
            Box::new(|acc, v| {
                Ok(Value::Int(acc.as_int().unwrap_or(0) + v.as_int().unwrap_or(0)))
            }),
            Box::new(move |acc| Ok(acc.as_int().unwrap_or(0) >= target)),
        )
    }

    #[test]
    fn first_value_seeds_the_accumulator() {
        let mut op = sum_until(3);
        let key = StateKey::Text("k".into());
        let mut out = Vec::new();

        op.on_item(key.clone(), Value::Int(1), None, &mut out).unwrap();
        op.on_item(key.clone(), Value::Int(1), None, &mut out).unwrap();
        assert!(out.is_empty());

        op.on_item(key.clone(), Value::Int(1), None, &mut out).unwrap();
        assert_eq!(out, vec![Value::pair("k", 3_i64)]);
    }

    #[test]
    fn completion_tombstones_the_cell() {
        let mut op = sum_until(2);
        let key = StateKey::Text("k".into());
        let mut out = Vec::new();

        op.on_item(key.clone(), Value::Int(1), None, &mut out).unwrap();
        let first = op.snapshot(0);
        assert_eq!(first.len(), 1);
        assert!(first[0].state.is_some());

        op.on_item(key.clone(), Value::Int(1), None, &mut out).unwrap();
        let second = op.snapshot(1);
        assert_eq!(second.len(), 1);
        assert!(second[0].state.is_none());

        // A fresh key restarts from its first value.
        op.on_item(key, Value::Int(1), None, &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn restore_resumes_partial_accumulators() {
        let mut op = sum_until(5);
        let key = StateKey::Text("k".into());
        let mut out = Vec::new();
        op.on_item(key.clone(), Value::Int(2), None, &mut out).unwrap();
        let records = op.snapshot(0);

        let mut resumed = sum_until(5);
        resumed
            .restore(
                records
                    .into_iter()
                    .map(|r| (r.key, r.state.unwrap()))
                    .collect(),
            )
            .unwrap();
        resumed.on_item(key, Value::Int(3), None, &mut out).unwrap();
        assert_eq!(out, vec![Value::pair("k", 5_i64)]);
    }
}
