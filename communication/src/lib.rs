//! Transport layer connecting the workers of a freshet cluster.
//!
//! Workers exchange typed messages over a full mesh: intra-process peers
//! through bounded channels, cross-process peers through TCP connections
//! established at start-up. The engine sees only an [`Endpoint`], which
//! hides whether a peer is a thread in this process or a worker on another
//! machine.
//!
//! [`initialize`](crate::initialize::initialize) builds the mesh from a
//! [`Config`] and spawns one thread per local worker.

pub mod allocator;
pub mod initialize;
pub mod networking;

pub use allocator::{Endpoint, Event};
pub use initialize::{initialize, WorkerGuards};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Messages exchanged between workers must be serializable and sendable.
pub trait ExchangeData: Serialize + DeserializeOwned + Send + 'static {}
impl<T: Serialize + DeserializeOwned + Send + 'static> ExchangeData for T {}

/// Capacity of each per-worker inbound queue. A full queue blocks the
/// sender, which is the engine's backpressure suspension point.
pub(crate) const QUEUE_CAPACITY: usize = 1 << 14;

/// Possible transport topologies for a run.
#[derive(Debug, Clone)]
pub enum Config {
    /// One worker on the calling thread.
    Thread,
    /// The given number of worker threads in this process.
    Process(usize),
    /// A multi-process cluster.
    Cluster {
        /// Worker threads per process.
        threads: usize,
        /// Identity of this process; `0 .. addresses.len()`.
        process: usize,
        /// One `host:port` per process, in process order.
        addresses: Vec<String>,
    },
}

impl Config {
    /// Total number of workers across the cluster.
    pub fn workers(&self) -> usize {
        match self {
            Config::Thread => 1,
            Config::Process(threads) => *threads,
            Config::Cluster { threads, addresses, .. } => threads * addresses.len(),
        }
    }

    /// Index of the first worker hosted by this process.
    pub fn first_worker(&self) -> usize {
        match self {
            Config::Thread | Config::Process(_) => 0,
            Config::Cluster { threads, process, .. } => threads * process,
        }
    }

    /// Constructs a configuration from command-line arguments.
    ///
    /// Understands `-w/--workers` (threads per process), `-n/--processes`,
    /// `-p/--process` (this process's identity), and `-h/--hostfile` (one
    /// `host:port` line per process). Without a hostfile, processes listen
    /// on `localhost` ports counting up from 2101.
    #[cfg(feature = "getopts")]
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Config, String> {
        let mut opts = getopts::Options::new();
        opts.optopt("w", "workers", "number of per-process worker threads", "NUM");
        opts.optopt("n", "processes", "number of processes", "NUM");
        opts.optopt("p", "process", "identity of this process", "IDX");
        opts.optopt("h", "hostfile", "text file whose lines are process addresses", "FILE");

        let matches = opts.parse(args).map_err(|e| e.to_string())?;

        let threads = matches
            .opt_get_default("w", 1_usize)
            .map_err(|e| e.to_string())?;
        let processes = matches
            .opt_get_default("n", 1_usize)
            .map_err(|e| e.to_string())?;
        let process = matches
            .opt_get_default("p", 0_usize)
            .map_err(|e| e.to_string())?;

        if process >= processes {
            return Err(format!("process index {} out of range 0..{}", process, processes));
        }

        if processes > 1 {
            let addresses = match matches.opt_str("h") {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .map_err(|e| format!("error reading hostfile {}: {}", path, e))?;
                    let addresses: Vec<String> =
                        text.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect();
                    if addresses.len() < processes {
                        return Err(format!(
                            "hostfile {} has {} addresses but {} processes requested",
                            path,
                            addresses.len(),
                            processes
                        ));
                    }
                    addresses.into_iter().take(processes).collect()
                }
                None => (0..processes).map(|i| format!("localhost:{}", 2101 + i as u64)).collect(),
            };
            Ok(Config::Cluster { threads, process, addresses })
        } else if threads > 1 {
            Ok(Config::Process(threads))
        } else {
            Ok(Config::Thread)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "getopts")]
    fn parse(args: &[&str]) -> Result<Config, String> {
        Config::from_args(args.iter().map(|s| s.to_string()))
    }

    #[cfg(feature = "getopts")]
    #[test]
    fn from_args_defaults_to_thread() {
        assert!(matches!(parse(&[]), Ok(Config::Thread)));
    }

    #[cfg(feature = "getopts")]
    #[test]
    fn from_args_process_workers() {
        match parse(&["-w", "3"]) {
            Ok(Config::Process(3)) => {}
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[cfg(feature = "getopts")]
    #[test]
    fn from_args_cluster_default_addresses() {
        match parse(&["-w", "2", "-n", "2", "-p", "1"]) {
            Ok(Config::Cluster { threads: 2, process: 1, addresses }) => {
                assert_eq!(addresses, vec!["localhost:2101", "localhost:2102"]);
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn workers_counts_cluster() {
        let config = Config::Cluster {
            threads: 2,
            process: 1,
            addresses: vec!["a:1".into(), "b:2".into(), "c:3".into()],
        };
        assert_eq!(config.workers(), 6);
        assert_eq!(config.first_worker(), 2);
    }
}
