//! Freshet: an epoch-driven stream-processing runtime.
//!
//! A dataflow is a linear pipeline of operators over dynamically typed
//! records, executed cooperatively by one or more workers across one or
//! more processes. A logical clock of epochs tags every record at
//! ingestion; stateful operators route each `(key, value)` record to the
//! key's owning worker, and keyed state is snapshotted into a durable
//! recovery log as the cluster-wide epoch frontier advances, giving
//! restarts at-least-once delivery with consistent state.
//!
//! ```no_run
//! use freshet::dataflow::Dataflow;
//! use freshet::execute::run_main;
//! use freshet::inputs::TestingSource;
//! use freshet::outputs::StdOutSink;
//! use freshet::value::Value;
//!
//! let mut flow = Dataflow::new();
//! flow.input("inp", TestingSource::new((0..3).map(Value::Int).collect()));
//! flow.map(|x| Ok(Value::Int(x.as_int().unwrap() + 1)));
//! flow.capture(StdOutSink);
//! run_main(flow, None, None).unwrap();
//! ```
//!
//! The pieces: [`dataflow`] is the blueprint, the worker module the
//! cooperative scheduler, [`router`] the deterministic key-to-worker
//! map, [`state`] the keyed cells and their snapshot model, [`recovery`]
//! the durable log and resume plan, [`window`] clocks and window
//! assignment, and [`inputs`]/[`outputs`] the source and sink contracts.
//! Inter-worker exchange lives in the `freshet_communication` crate.

pub mod dataflow;
pub mod errors;
pub mod execute;
pub mod inputs;
pub mod operators;
pub mod outputs;
pub mod progress;
pub mod recovery;
pub mod router;
pub mod state;
pub mod trace;
pub mod value;
pub mod window;
pub(crate) mod worker;

pub use dataflow::Dataflow;
pub use errors::{Error, UserError};
pub use execute::{cluster_main, run_main, EpochConfig};
pub use recovery::RecoveryConfig;
pub use value::Value;
