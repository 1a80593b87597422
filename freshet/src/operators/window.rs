//! Windowed keyed aggregation: the shared runtime behind `reduce_window`
//! and `fold_window`.
//!
//! The two operators differ only in how a value enters an accumulator, so
//! they share [`WindowedOp`] parameterized by a [`WindowLogic`]. A record's
//! timestamp is assigned by the step's clock at arrival; window closes fire
//! whenever the watermark passes a window's end, checked on every applied
//! record and every scheduler pass, and everything left closes at
//! end-of-stream. Closes emit in ascending `(key, window)` order.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::{wrap_pair, StatefulOp};
use crate::dataflow::{Reducer, StateBuilder};
use crate::errors::{Error, UserError};
use crate::state::{KeyedState, SnapshotRecord, StateBytes, StateKey, StepId};
use crate::value::Value;
use crate::window::clock::Clock;
use crate::window::{TumblingWindower, WindowSet};

/// How a value enters a window accumulator.
pub(crate) trait WindowLogic: Send {
    /// Folds `value` into `acc`, or seeds a fresh accumulator when the
    /// window just opened.
    fn accumulate(&mut self, acc: Option<Value>, value: Value) -> Result<Value, UserError>;
}

/// Reduce semantics: the first value seeds the accumulator.
pub(crate) struct ReduceWindowLogic {
    reducer: Reducer,
}

impl ReduceWindowLogic {
    pub(crate) fn new(reducer: Reducer) -> Self {
        ReduceWindowLogic { reducer }
    }
}

impl WindowLogic for ReduceWindowLogic {
    fn accumulate(&mut self, acc: Option<Value>, value: Value) -> Result<Value, UserError> {
        match acc {
            Some(acc) => (self.reducer)(acc, value),
            None => Ok(value),
        }
    }
}

/// Fold semantics: the builder seeds the accumulator.
pub(crate) struct FoldWindowLogic {
    builder: StateBuilder,
    folder: Reducer,
}

impl FoldWindowLogic {
    pub(crate) fn new(builder: StateBuilder, folder: Reducer) -> Self {
        FoldWindowLogic { builder, folder }
    }
}

impl WindowLogic for FoldWindowLogic {
    fn accumulate(&mut self, acc: Option<Value>, value: Value) -> Result<Value, UserError> {
        let acc = match acc {
            Some(acc) => acc,
            None => (self.builder)()?,
        };
        (self.folder)(acc, value)
    }
}

/// The windowed stateful runtime over per-key [`WindowSet`] cells.
pub(crate) struct WindowedOp<L> {
    state: KeyedState<WindowSet>,
    clock: Box<dyn Clock>,
    windower: TumblingWindower,
    logic: L,
}

impl<L: WindowLogic> WindowedOp<L> {
    pub(crate) fn new(
        step_id: StepId,
        clock: Box<dyn Clock>,
        windower: TumblingWindower,
        logic: L,
    ) -> Self {
        WindowedOp { state: KeyedState::new(step_id), clock, windower, logic }
    }

    /// Closes every eligible window across all keys, emitting in ascending
    /// `(key, window)` order, and prunes emptied cells.
    fn close_eligible(&mut self, out: &mut Vec<Value>) {
        let watermark = self.clock.watermark();
        for key in self.state.keys() {
            let set = self.state.get_or_init(&key, WindowSet::default);
            let closed = set.drain_closable(&self.windower, watermark);
            let emptied = set.is_empty();
            for (_id, acc) in closed {
                out.push(wrap_pair(&key, acc));
            }
            if emptied {
                self.state.remove(&key);
            }
        }
    }
}

impl<L: WindowLogic> StatefulOp for WindowedOp<L> {
    fn step_id(&self) -> &StepId {
        self.state.step_id()
    }

    fn stamp(&mut self, value: &Value) -> Option<DateTime<Utc>> {
        Some(self.clock.now_for(value))
    }

    fn on_item(
        &mut self,
        key: StateKey,
        value: Value,
        timestamp: Option<DateTime<Utc>>,
        out: &mut Vec<Value>,
    ) -> Result<(), Error> {
        let t = match timestamp {
            Some(t) => t,
            None => self.clock.now_for(&value),
        };
        match self.windower.assign(t) {
            Some(id) => {
                let set = self.state.get_or_init(&key, WindowSet::default);
                let acc = set.take(id);
                let next = self.logic.accumulate(acc, value)?;
                set.put(id, next);
            }
            None => {
                tracing::warn!(
                    step = %self.state.step_id(),
                    %key,
                    timestamp = %t,
                    "dropping record timestamped before the window origin"
                );
            }
        }
        self.close_eligible(out);
        Ok(())
    }

    fn on_tick(&mut self, out: &mut Vec<Value>) -> Result<(), Error> {
        self.close_eligible(out);
        Ok(())
    }

    fn on_eof(&mut self, out: &mut Vec<Value>) -> Result<(), Error> {
        for key in self.state.keys() {
            if let Some(mut set) = self.state.remove(&key) {
                for (_id, acc) in set.drain_all() {
                    out.push(wrap_pair(&key, acc));
                }
            }
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
