//! Keyed one-to-one transducer with explicit state.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::{wrap_pair, StatefulOp};
use crate::dataflow::{StateBuilder, StatefulMapper};
use crate::errors::Error;
use crate::state::{KeyedState, SnapshotRecord, StateBytes, StateKey, StepId};
use crate::value::Value;

/// For each key: state starts from `builder()`, every value maps
/// `(state, value)` to `(new_state, output)`, and `(key, output)` is
/// emitted. Returning `None` for the new state deletes the cell.
pub(crate) struct StatefulMapOp {
    state: KeyedState<Value>,
    builder: StateBuilder,
    mapper: StatefulMapper,
}

impl StatefulMapOp {
    pub(crate) fn new(step_id: StepId, builder: StateBuilder, mapper: StatefulMapper) -> Self {
        StatefulMapOp { state: KeyedState::new(step_id), builder, mapper }
    }
}

impl StatefulOp for StatefulMapOp {
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
        let current = match self.state.remove(&key) {
            Some(state) => state,
            None => (self.builder)()?,
        };
        let (next, output) = (self.mapper)(current, value)?;
        if let Some(next) = next {
            self.state.put(key.clone(), next);
        }
        out.push(wrap_pair(&key, output));
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
