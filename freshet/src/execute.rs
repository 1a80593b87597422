//! Starts dataflow execution from configuration and per-worker blueprints.
//!
//! [`run_main`] executes a flow on a single worker and blocks until it
//! completes; the common path for prototyping sources and sinks before
//! running a cluster. [`cluster_main`] executes this process's share of a
//! cluster: a builder closure produces each worker's copy of the flow, and
//! with no peer addresses the "cluster" is just worker threads in this
//! process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use freshet_communication::{initialize, Config};

use crate::dataflow::Dataflow;
use crate::errors::Error;
use crate::recovery::mem::InMemStore;
use crate::recovery::RecoveryConfig;
use crate::worker::{Message, Worker};

/// How epochs advance when the source does not drive them itself.
///
/// Sources may close epochs explicitly (the testing sources close one per
/// item); otherwise the worker closes the open epoch every interval.
#[derive(Debug, Clone, Copy)]
pub enum EpochConfig {
    /// Close the open epoch after this much wall time.
    Periodic(Duration),
}

impl Default for EpochConfig {
    fn default() -> EpochConfig {
        EpochConfig::Periodic(Duration::from_secs(10))
    }
}

/// Executes a dataflow on a single worker in the current process.
///
/// Blocks until the source is exhausted or the run fails. Without a
/// recovery config, state is snapshotted to a store that dies with the
/// run, so a restart replays from the beginning.
pub fn run_main(
    flow: Dataflow,
    epoch_config: Option<EpochConfig>,
    recovery_config: Option<RecoveryConfig>,
) -> Result<(), Error> {
    tracing::info!("running single worker on a single process");
    let flow = Mutex::new(Some(flow));
    execute(Config::Thread, move || {
        flow.lock().expect("poisoned").take().expect("single worker builds once")
    }, epoch_config, recovery_config)
}

/// Executes this process's workers as part of a cluster.
///
/// `addresses` lists one `host:port` per process in process order;
/// `process` is this process's position in that list. An empty address
/// list runs `workers_per_process` worker threads in this process alone.
/// The builder runs once per local worker to produce its copy of the flow.
pub fn cluster_main<F>(
    flow_builder: F,
    addresses: Vec<String>,
    process: usize,
    workers_per_process: usize,
    epoch_config: Option<EpochConfig>,
    recovery_config: Option<RecoveryConfig>,
) -> Result<(), Error>
where
    F: Fn() -> Dataflow + Send + Sync + 'static,
{
    let config = if addresses.is_empty() {
        if workers_per_process == 1 {
            Config::Thread
        } else {
            Config::Process(workers_per_process)
        }
    } else {
        Config::Cluster { threads: workers_per_process, process, addresses }
    };
    tracing::info!(
        workers = workers_per_process,
        process,
        "running {} worker(s) on this process",
        workers_per_process
    );
    execute(config, flow_builder, epoch_config, recovery_config)
}

fn execute<F>(
    config: Config,
    flow_builder: F,
    epoch_config: Option<EpochConfig>,
    recovery_config: Option<RecoveryConfig>,
) -> Result<(), Error>
where
    F: Fn() -> Dataflow + Send + Sync + 'static,
{
    let threads_per_process = match &config {
        Config::Thread => 1,
        Config::Process(threads) => *threads,
        Config::Cluster { threads, .. } => *threads,
    };
    let epoch_config = epoch_config.unwrap_or_default();
    let recovery_config =
        recovery_config.unwrap_or_else(|| RecoveryConfig::testing(InMemStore::new()));
    let interrupt = Arc::new(AtomicBool::new(false));
    let interrupt_in_worker = Arc::clone(&interrupt);

    let guards = initialize::<Message, _, _>(config, move |endpoint| {
        let index = endpoint.index();
        let result = Worker::new(
            endpoint,
            flow_builder(),
            epoch_config,
            recovery_config.clone(),
            Arc::clone(&interrupt_in_worker),
            threads_per_process,
        )
        .and_then(Worker::run);
        if let Err(err) = &result {
            interrupt_in_worker.store(true, Ordering::Relaxed);
            tracing::error!(worker = index, error = %err, "worker failed");
        }
        result
    })
    .map_err(Error::Transport)?;

    // The first worker to fail carries the run's cause; peers that shut
    // down in sympathy report `Aborted` and transport errors are the next
    // most informative.
    let mut cause: Option<Error> = None;
    for result in guards.join() {
        let error = match result {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => error,
            Err(panic) => Error::Transport(format!("worker thread panicked: {}", panic)),
        };
        let stronger = match (&cause, &error) {
            (None, _) => true,
            (Some(Error::Aborted), _) => !matches!(error, Error::Aborted),
            (Some(Error::Transport(_)), _) => {
                !matches!(error, Error::Aborted | Error::Transport(_))
            }
            _ => false,
        };
        if stronger {
            cause = Some(error);
        }
    }
    cause.map_or(Ok(()), Err)
}
