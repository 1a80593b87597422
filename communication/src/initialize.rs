//! Spawns worker threads over an initialized transport mesh.

use std::thread;

use crate::allocator::{process, thread as thread_alloc, Endpoint};
use crate::networking::cluster_endpoints;
use crate::{Config, ExchangeData};

/// Handles to spawned worker threads.
///
/// Joining recovers each worker's result; a panicked worker surfaces as an
/// `Err` carrying the panic message.
pub struct WorkerGuards<R> {
    handles: Vec<thread::JoinHandle<R>>,
}

impl<R> WorkerGuards<R> {
    /// Waits for all workers and collects their results.
    pub fn join(self) -> Vec<Result<R, String>> {
        self.handles
            .into_iter()
            .map(|handle| {
                handle.join().map_err(|payload| {
                    if let Some(msg) = payload.downcast_ref::<String>() {
                        msg.clone()
                    } else if let Some(msg) = payload.downcast_ref::<&str>() {
                        (*msg).to_string()
                    } else {
                        "worker thread panicked".to_string()
                    }
                })
            })
            .collect()
    }
}

/// Builds the transport mesh for `config` and runs `func` once per local
/// worker, each on its own thread.
///
/// Returns guards to join for the workers' results. With
/// [`Config::Thread`], the single worker still runs on its own thread so
/// the calling thread can coordinate.
pub fn initialize<T, R, F>(config: Config, func: F) -> Result<WorkerGuards<R>, String>
where
    T: ExchangeData,
    R: Send + 'static,
    F: Fn(Endpoint<T>) -> R + Send + Sync + 'static,
{
    let endpoints: Vec<Endpoint<T>> = match config {
        Config::Thread => vec![thread_alloc::endpoint()],
        Config::Process(threads) => process::endpoints(threads),
        Config::Cluster { threads, process, addresses } => {
            cluster_endpoints(threads, process, addresses)?
        }
    };

    let func = std::sync::Arc::new(func);
    let mut handles = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let func = std::sync::Arc::clone(&func);
        let index = endpoint.index();
        let handle = thread::Builder::new()
            .name(format!("freshet-worker-{}", index))
            .spawn(move || func(endpoint))
            .map_err(|e| e.to_string())?;
        handles.push(handle);
    }

    Ok(WorkerGuards { handles })
}
