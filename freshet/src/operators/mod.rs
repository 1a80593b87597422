//! Per-operator execution.
//!
//! Stateless transforms run inline as records traverse the chain. Stateful
//! operators implement [`StatefulOp`]: the worker routes each `(key,
//! value)` record to the key's owner, and the owner applies it, snapshots
//! dirty cells at epoch boundaries, and restores them on resume.

pub(crate) mod reduce;
pub(crate) mod stateful_map;
pub(crate) mod window;

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::dataflow::{
    FilterLogic, FilterMapLogic, FlatMapLogic, InspectEpochLogic, InspectLogic, MapLogic,
};
use crate::errors::Error;
use crate::state::{SnapshotRecord, StateBytes, StateKey, StepId};
use crate::value::Value;

/// Shapes a record into its `(key, value)` routing pair, raising the typed
/// errors stateful operators guarantee.
pub(crate) fn extract_pair(record: Value) -> Result<(StateKey, Value), Error> {
    match record.into_pair() {
        Ok((key, value)) => Ok((StateKey::try_from_value(&key)?, value)),
        Err(other) => Err(Error::not_a_pair(&other)),
    }
}

/// Re-wraps an operator output as a `(key, value)` record.
pub(crate) fn wrap_pair(key: &StateKey, value: Value) -> Value {
    Value::List(vec![key.to_value(), value])
}

/// A stateless step at runtime.
pub(crate) enum StatelessOp {
    Map(MapLogic),
    Filter(FilterLogic),
    FilterMap(FilterMapLogic),
    FlatMap(FlatMapLogic),
    Inspect(InspectLogic),
    InspectEpoch(InspectEpochLogic),
}

impl StatelessOp {
    /// Applies the transform to one record, pushing outputs in order.
    pub(crate) fn apply(
        &mut self,
        epoch: u64,
        record: Value,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        match self {
            StatelessOp::Map(mapper) => out.push(mapper(record)?),
            StatelessOp::Filter(predicate) => {
                if predicate(&record)? {
                    out.push(record);
                }
            }
            StatelessOp::FilterMap(mapper) => {
                if let Some(mapped) = mapper(record)? {
                    out.push(mapped);
                }
            }
            StatelessOp::FlatMap(mapper) => out.extend(mapper(record)?),
            StatelessOp::Inspect(inspector) => {
                inspector(&record)?;
                out.push(record);
            }
            StatelessOp::InspectEpoch(inspector) => {
                inspector(epoch, &record)?;
                out.push(record);
            }
        }
        Ok(())
    }
}

/// A stateful step at runtime.
///
/// The worker only ever calls these methods for keys this worker owns.
pub(crate) trait StatefulOp {
    /// The step's snapshot namespace.
    fn step_id(&self) -> &StepId;

    /// Assigns the record's event timestamp at arrival, for operators that
    /// window. Must be captured at arrival because application can lag
    /// behind under cluster skew.
    fn stamp(&mut self, value: &Value) -> Option<DateTime<Utc>> {
        let _ = value;
        None
    }

    /// Applies one owned record, pushing any emissions in order.
    fn on_item(
        &mut self,
        key: StateKey,
        value: Value,
        timestamp: Option<DateTime<Utc>>,
        out: &mut Vec<Value>,
    ) -> Result<(), Error>;

    /// Gives the operator a chance to fire timers (window closes) against
    /// its clock. Called every scheduler pass.
    fn on_tick(&mut self, out: &mut Vec<Value>) -> Result<(), Error> {
        let _ = out;
        Ok(())
    }

    /// Flushes whatever the operator holds at end-of-stream.
    fn on_eof(&mut self, out: &mut Vec<Value>) -> Result<(), Error> {
        let _ = out;
        Ok(())
    }

    /// Drains dirty cells for the closing epoch.
    fn snapshot(&mut self, epoch: u64) -> Vec<SnapshotRecord>;

    /// Loads recovered cells before the run starts.
    fn restore(&mut self, cells: HashMap<StateKey, StateBytes>) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_pair_rejects_non_pairs() {
        let event = Value::map(vec![("user", "a"), ("type", "login")]);
        let err = extract_pair(event).unwrap_err();
        assert!(err.to_string().starts_with("Dataflow requires a `(key, value)` 2-tuple"));
    }

    #[test]
    fn extract_pair_rejects_unroutable_keys() {
        let record = Value::pair(Value::map(vec![("id", Value::Int(1))]), Value::Null);
        let err = extract_pair(record).unwrap_err();
        assert!(err.to_string().starts_with("Stateful logic functions must return"));
    }

    #[test]
    fn extract_and_wrap_round_trip() {
        let record = Value::pair("user-1", Value::Int(9));
        let (key, value) = extract_pair(record.clone()).unwrap();
        assert_eq!(wrap_pair(&key, value), record);
    }

    #[test]
    fn stateless_ops_preserve_sibling_order() {
        let mut op = StatelessOp::FlatMap(Box::new(|v: Value| match v {
            Value::Text(s) => Ok(s.split_whitespace().map(Value::from).collect()),
            other => Ok(vec![other]),
        }));
        let mut out = Vec::new();
        op.apply(0, Value::from("split this"), &mut out).unwrap();
        assert_eq!(out, vec![Value::from("split"), Value::from("this")]);
    }
}
