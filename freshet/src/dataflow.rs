//! The declarative dataflow blueprint.
//!
//! A [`Dataflow`] is a linear pipeline: one input, a chain of operators,
//! and at least one capture. It is compiled into a running pipeline by each
//! worker at execution start and is immutable afterwards.
//!
//! User logic is bound as boxed closures at construction time. Every user
//! closure is fallible; a returned [`UserError`] tears down the run with
//! the message intact. Stateful operators require a stable `step_id`, which
//! names their snapshot namespace in the recovery store; stateless
//! operators are identified positionally.

use crate::errors::{Error, UserError};
use crate::inputs::{DynamicSource, InputConfig, Source};
use crate::outputs::Sink;
use crate::state::StepId;
use crate::value::Value;
use crate::window::clock::ClockConfig;
use crate::window::TumblingWindower;

/// Transforms one record into one record.
pub type MapLogic = Box<dyn FnMut(Value) -> Result<Value, UserError> + Send>;
/// Transforms one record into any number of records.
pub type FlatMapLogic = Box<dyn FnMut(Value) -> Result<Vec<Value>, UserError> + Send>;
/// Keeps records the predicate accepts.
pub type FilterLogic = Box<dyn FnMut(&Value) -> Result<bool, UserError> + Send>;
/// Transforms and filters in one step.
pub type FilterMapLogic = Box<dyn FnMut(Value) -> Result<Option<Value>, UserError> + Send>;
/// Observes records without changing them.
pub type InspectLogic = Box<dyn FnMut(&Value) -> Result<(), UserError> + Send>;
/// Observes records along with their epoch.
pub type InspectEpochLogic = Box<dyn FnMut(u64, &Value) -> Result<(), UserError> + Send>;
/// Builds a fresh state value for a newly observed key.
pub type StateBuilder = Box<dyn FnMut() -> Result<Value, UserError> + Send>;
/// Merges a value into an accumulator.
pub type Reducer = Box<dyn FnMut(Value, Value) -> Result<Value, UserError> + Send>;
/// Decides whether an accumulator is finished.
pub type CompletionCheck = Box<dyn FnMut(&Value) -> Result<bool, UserError> + Send>;
/// Advances per-key state and produces an output; `None` state deletes the
/// key's cell.
pub type StatefulMapper =
    Box<dyn FnMut(Value, Value) -> Result<(Option<Value>, Value), UserError> + Send>;

/// One step of the pipeline.
pub enum Step {
    /// The single input feeding the flow.
    Input {
        /// Names the source's resume-token namespace.
        step_id: StepId,
        /// How partitions are built.
        input: InputConfig,
    },
    /// Emits `f(x)` per input.
    Map {
        /// The mapping function.
        mapper: MapLogic,
    },
    /// Emits `x` iff `p(x)`.
    Filter {
        /// The predicate.
        predicate: FilterLogic,
    },
    /// Emits `f(x)` when it is `Some`.
    FilterMap {
        /// The mapping function.
        mapper: FilterMapLogic,
    },
    /// Emits zero or more outputs per input.
    FlatMap {
        /// The mapping function.
        mapper: FlatMapLogic,
    },
    /// Side effect only; passes records through unchanged.
    Inspect {
        /// The observer.
        inspector: InspectLogic,
    },
    /// Side effect with the record's epoch; passes records through.
    InspectEpoch {
        /// The observer.
        inspector: InspectEpochLogic,
    },
    /// Per-key accumulation until a completion predicate fires.
    Reduce {
        /// Snapshot namespace.
        step_id: StepId,
        /// Merges each value into the accumulator.
        reducer: Reducer,
        /// Emits and deletes the cell when true.
        is_complete: CompletionCheck,
    },
    /// Per-key transducer with explicit state.
    StatefulMap {
        /// Snapshot namespace.
        step_id: StepId,
        /// Builds state for a new key.
        builder: StateBuilder,
        /// Advances state and produces the output.
        mapper: StatefulMapper,
    },
    /// Windowed per-key reduction; first value seeds the accumulator.
    ReduceWindow {
        /// Snapshot namespace.
        step_id: StepId,
        /// Supplies timestamps and the watermark.
        clock: ClockConfig,
        /// Maps timestamps to windows.
        windower: TumblingWindower,
        /// Merges each value into the window accumulator.
        reducer: Reducer,
    },
    /// Windowed per-key fold with a built initial accumulator.
    FoldWindow {
        /// Snapshot namespace.
        step_id: StepId,
        /// Supplies timestamps and the watermark.
        clock: ClockConfig,
        /// Maps timestamps to windows.
        windower: TumblingWindower,
        /// Builds the initial accumulator.
        builder: StateBuilder,
        /// Folds each value into the accumulator.
        folder: Reducer,
    },
    /// Delivers records to a sink, passing them through unchanged.
    Capture {
        /// The sink to build per worker.
        sink: Box<dyn Sink>,
    },
}

impl Step {
    /// The stable id of a stateful step, if this step has one.
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            Step::Input { step_id, .. }
            | Step::Reduce { step_id, .. }
            | Step::StatefulMap { step_id, .. }
            | Step::ReduceWindow { step_id, .. }
            | Step::FoldWindow { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// A linear dataflow under construction.
///
/// ```
/// use freshet::dataflow::Dataflow;
/// use freshet::inputs::TestingSource;
/// use freshet::outputs::TestingSink;
/// use freshet::value::Value;
///
/// let mut flow = Dataflow::new();
/// flow.input("inp", TestingSource::new(vec![Value::Int(0), Value::Int(1)]));
/// flow.map(|x| Ok(Value::Int(x.as_int().unwrap() + 1)));
/// flow.capture(TestingSink::new());
/// ```
#[derive(Default)]
pub struct Dataflow {
    steps: Vec<Step>,
}

impl Dataflow {
    /// An empty flow.
    pub fn new() -> Dataflow {
        Dataflow::default()
    }

    /// Sets the partitioned input. Must be the first step.
    pub fn input(&mut self, step_id: &str, source: impl Source + 'static) {
        self.steps.push(Step::Input {
            step_id: StepId::from(step_id),
            input: InputConfig::Partitioned(Box::new(source)),
        });
    }

    /// Sets a dynamic (token-less) input. Must be the first step.
    pub fn input_dynamic(&mut self, step_id: &str, source: impl DynamicSource + 'static) {
        self.steps.push(Step::Input {
            step_id: StepId::from(step_id),
            input: InputConfig::Dynamic(Box::new(source)),
        });
    }

    /// Appends a map step.
    pub fn map(&mut self, mapper: impl FnMut(Value) -> Result<Value, UserError> + Send + 'static) {
        self.steps.push(Step::Map { mapper: Box::new(mapper) });
    }

    /// Appends a filter step.
    pub fn filter(
        &mut self,
        predicate: impl FnMut(&Value) -> Result<bool, UserError> + Send + 'static,
    ) {
        self.steps.push(Step::Filter { predicate: Box::new(predicate) });
    }

    /// Appends a combined map-and-filter step.
    pub fn filter_map(
        &mut self,
        mapper: impl FnMut(Value) -> Result<Option<Value>, UserError> + Send + 'static,
    ) {
        self.steps.push(Step::FilterMap { mapper: Box::new(mapper) });
    }

    /// Appends a flat-map step.
    pub fn flat_map(
        &mut self,
        mapper: impl FnMut(Value) -> Result<Vec<Value>, UserError> + Send + 'static,
    ) {
        self.steps.push(Step::FlatMap { mapper: Box::new(mapper) });
    }

    /// Appends a side-effect step.
    pub fn inspect(
        &mut self,
        inspector: impl FnMut(&Value) -> Result<(), UserError> + Send + 'static,
    ) {
        self.steps.push(Step::Inspect { inspector: Box::new(inspector) });
    }

    /// Appends a side-effect step observing epochs.
    pub fn inspect_epoch(
        &mut self,
        inspector: impl FnMut(u64, &Value) -> Result<(), UserError> + Send + 'static,
    ) {
        self.steps.push(Step::InspectEpoch { inspector: Box::new(inspector) });
    }

    /// Appends a keyed reduce with a completion predicate.
    pub fn reduce(
        &mut self,
        step_id: &str,
        reducer: impl FnMut(Value, Value) -> Result<Value, UserError> + Send + 'static,
        is_complete: impl FnMut(&Value) -> Result<bool, UserError> + Send + 'static,
    ) {
        self.steps.push(Step::Reduce {
            step_id: StepId::from(step_id),
            reducer: Box::new(reducer),
            is_complete: Box::new(is_complete),
        });
    }

    /// Appends a keyed stateful map.
    pub fn stateful_map(
        &mut self,
        step_id: &str,
        builder: impl FnMut() -> Result<Value, UserError> + Send + 'static,
        mapper: impl FnMut(Value, Value) -> Result<(Option<Value>, Value), UserError>
            + Send
            + 'static,
    ) {
        self.steps.push(Step::StatefulMap {
            step_id: StepId::from(step_id),
            builder: Box::new(builder),
            mapper: Box::new(mapper),
        });
    }

    /// Appends a windowed keyed reduce.
    pub fn reduce_window(
        &mut self,
        step_id: &str,
        clock: ClockConfig,
        windower: TumblingWindower,
        reducer: impl FnMut(Value, Value) -> Result<Value, UserError> + Send + 'static,
    ) {
        self.steps.push(Step::ReduceWindow {
            step_id: StepId::from(step_id),
            clock,
            windower,
            reducer: Box::new(reducer),
        });
    }

    /// Appends a windowed keyed fold.
    pub fn fold_window(
        &mut self,
        step_id: &str,
        clock: ClockConfig,
        windower: TumblingWindower,
        builder: impl FnMut() -> Result<Value, UserError> + Send + 'static,
        folder: impl FnMut(Value, Value) -> Result<Value, UserError> + Send + 'static,
    ) {
        self.steps.push(Step::FoldWindow {
            step_id: StepId::from(step_id),
            clock,
            windower,
            builder: Box::new(builder),
            folder: Box::new(folder),
        });
    }

    /// Appends a capture delivering to `sink`.
    pub fn capture(&mut self, sink: impl Sink + 'static) {
        self.steps.push(Step::Capture { sink: Box::new(sink) });
    }

    /// Checks the structural rules: input first, at least one capture,
    /// unique stateful step ids.
    pub fn validate(&self) -> Result<(), Error> {
        match self.steps.first() {
            Some(Step::Input { .. }) => {}
            _ => {
                return Err(Error::Build(
                    "dataflow needs to contain an input as its first step".to_string(),
                ))
            }
        }
        if self.steps[1..].iter().any(|s| matches!(s, Step::Input { .. })) {
            return Err(Error::Build("dataflow can contain only one input".to_string()));
        }
        if !self.steps.iter().any(|s| matches!(s, Step::Capture { .. })) {
            return Err(Error::Build(
                "dataflow needs to contain at least one capture".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if let Some(step_id) = step.step_id() {
                if !seen.insert(step_id.clone()) {
                    return Err(Error::Build(format!(
                        "step id {:?} is used by more than one step",
                        step_id.0
                    )));
                }
            }
        }
        Ok(())
    }

    /// Consumes the blueprint into its steps.
    pub(crate) fn into_steps(self) -> Vec<Step> {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::TestingSource;
    use crate::outputs::TestingSink;

    #[test]
    fn flows_need_an_input_first() {
        let mut flow = Dataflow::new();
        flow.map(Ok);
        flow.capture(TestingSink::new());
        assert!(matches!(flow.validate(), Err(Error::Build(_))));
    }

    #[test]
    fn flows_need_a_capture() {
        let mut flow = Dataflow::new();
        flow.input("inp", TestingSource::new(vec![]));
        flow.map(Ok);
        assert!(matches!(flow.validate(), Err(Error::Build(_))));
    }

    #[test]
    fn stateful_step_ids_must_be_unique() {
        let mut flow = Dataflow::new();
        flow.input("inp", TestingSource::new(vec![]));
        flow.reduce("dup", |acc, _| Ok(acc), |_| Ok(false));
        flow.reduce("dup", |acc, _| Ok(acc), |_| Ok(false));
        flow.capture(TestingSink::new());
        assert!(matches!(flow.validate(), Err(Error::Build(_))));
    }

    #[test]
    fn a_minimal_flow_validates() {
        let mut flow = Dataflow::new();
        flow.input("inp", TestingSource::new(vec![]));
        flow.capture(TestingSink::new());
        assert!(flow.validate().is_ok());
    }
}
