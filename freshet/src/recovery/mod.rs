//! The durable recovery log and the resume plan computed from it.
//!
//! The log is an append-only sequence of two entry kinds: keyed-state
//! snapshots drained at epoch boundaries, and per-worker frontier records
//! carrying the source's resume token. Appends are durable before they
//! return; the ordering rule is that a frontier record for epoch `E` is
//! appended (and flushed) together with all snapshots of epochs `<= E`,
//! before `E` is acknowledged to the source.
//!
//! On restart each worker reads its own log, workers exchange their last
//! completed epochs, and the cluster resumes from the minimum. A torn
//! append without its frontier record is invisible to the resume plan.

pub mod mem;
pub mod sled;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::Error;
use crate::state::{SnapshotRecord, StateBytes, StateKey, StepId};

/// An opaque source position, logged at each epoch boundary.
///
/// The encoding belongs to the source that produced it; the engine only
/// stores and replays it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken(pub Vec<u8>);

impl ResumeToken {
    /// Encodes a source-defined position.
    pub fn encode<T: Serialize>(position: &T) -> ResumeToken {
        ResumeToken(bincode::serialize(position).expect("error encoding resume token"))
    }

    /// Decodes back into the source's position type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        bincode::deserialize(&self.0)
            .map_err(|err| Error::Resume(format!("corrupt resume token: {}", err)))
    }
}

/// A worker's progress through its source, recorded once the epoch's
/// snapshots were durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierRecord {
    /// The worker that completed the epoch.
    pub worker_index: usize,
    /// Cluster size at the time; a mismatch on resume refuses to start.
    pub worker_count: usize,
    /// The completed epoch.
    pub epoch: u64,
    /// Where the worker's source partition stood at that boundary.
    pub token: Option<ResumeToken>,
}

/// One record in the recovery log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// A keyed-state snapshot or tombstone.
    Snapshot(SnapshotRecord),
    /// A progress frontier.
    Frontier(FrontierRecord),
}

/// The abstract durable store behind recovery.
///
/// Entries carry monotonic sequence numbers assigned by the backend;
/// `append` returns only once the batch is durable.
pub trait RecoveryLog: Send {
    /// Durably appends a batch, in order.
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), Error>;

    /// Replays entries whose epoch is at least `epoch`, in sequence order.
    /// `read_from(0)` replays everything.
    fn read_from(&mut self, epoch: u64) -> Result<Vec<LogEntry>, Error>;

    /// Garbage-collects records superseded by later epochs: snapshots older
    /// than the latest per `(step, key)` at or below `up_to_epoch`, and all
    /// but the newest frontier record.
    fn truncate(&mut self, up_to_epoch: u64) -> Result<(), Error>;
}

/// What to keep in the log as the frontier advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Truncate superseded records after each commit.
    #[default]
    Compact,
    /// Keep the full history.
    KeepAll,
}

/// Where and how a run persists its recovery log.
#[derive(Clone)]
pub struct RecoveryConfig {
    /// The backing store.
    pub store: StoreConfig,
    /// Garbage-collection policy.
    pub retention: Retention,
}

/// Available recovery-log backends.
#[derive(Clone)]
pub enum StoreConfig {
    /// A sled database per worker under this directory.
    Sled {
        /// Root directory; created if absent.
        dir: PathBuf,
    },
    /// A shared in-memory store, for tests and recovery-less runs.
    Testing(mem::InMemStore),
}

impl RecoveryConfig {
    /// A durable sled-backed configuration rooted at `dir`.
    pub fn sled(dir: impl Into<PathBuf>) -> RecoveryConfig {
        RecoveryConfig { store: StoreConfig::Sled { dir: dir.into() }, retention: Retention::default() }
    }

    /// A configuration over a shared in-memory store.
    pub fn testing(store: mem::InMemStore) -> RecoveryConfig {
        RecoveryConfig { store: StoreConfig::Testing(store), retention: Retention::default() }
    }

    /// Opens this worker's log.
    pub(crate) fn open(&self, worker_index: usize) -> Result<Box<dyn RecoveryLog>, Error> {
        match &self.store {
            StoreConfig::Sled { dir } => {
                Ok(Box::new(sled::SledLog::open(dir, worker_index)?))
            }
            StoreConfig::Testing(store) => Ok(Box::new(store.log(worker_index))),
        }
    }
}

/// A worker's log split by entry kind, in sequence order.
pub struct LocalLogView {
    frontiers: Vec<FrontierRecord>,
    snapshots: Vec<SnapshotRecord>,
}

impl LocalLogView {
    /// Partitions replayed entries.
    pub fn from_entries(entries: Vec<LogEntry>) -> LocalLogView {
        let mut frontiers = Vec::new();
        let mut snapshots = Vec::new();
        for entry in entries {
            match entry {
                LogEntry::Frontier(f) => frontiers.push(f),
                LogEntry::Snapshot(s) => snapshots.push(s),
            }
        }
        LocalLogView { frontiers, snapshots }
    }

    /// The newest completed epoch this worker recorded, if any.
    pub fn last_completed(&self) -> Option<u64> {
        self.frontiers.iter().map(|f| f.epoch).max()
    }

    /// The newest frontier record at or below `epoch`.
    pub fn frontier_at_or_before(&self, epoch: u64) -> Option<&FrontierRecord> {
        self.frontiers
            .iter()
            .filter(|f| f.epoch <= epoch)
            .max_by_key(|f| f.epoch)
    }

    /// The recorded cluster size, if any record exists.
    pub fn recorded_worker_count(&self) -> Option<usize> {
        self.frontiers.last().map(|f| f.worker_count)
    }

    /// Reconstructs per-step state as of `up_to_epoch` (inclusive): the last
    /// durable snapshot per `(step, key)`, with tombstones applied.
    pub fn restored_state(&self, up_to_epoch: u64) -> RestoredState {
        let mut state: HashMap<StepId, HashMap<StateKey, StateBytes>> = HashMap::new();
        for record in self.snapshots.iter().filter(|s| s.epoch <= up_to_epoch) {
            let step = state.entry(record.step_id.clone()).or_default();
            match &record.state {
                Some(bytes) => {
                    step.insert(record.key.clone(), bytes.clone());
                }
                None => {
                    step.remove(&record.key);
                }
            }
        }
        RestoredState(state)
    }
}

/// Restored state for a whole dataflow, handed out step by step during
/// dataflow construction.
#[derive(Debug, Default)]
pub struct RestoredState(HashMap<StepId, HashMap<StateKey, StateBytes>>);

impl RestoredState {
    /// Takes the restored cells for one step.
    pub fn remove(&mut self, step_id: &StepId) -> HashMap<StateKey, StateBytes> {
        self.0.remove(step_id).unwrap_or_default()
    }

    /// Whether any restored state remains unclaimed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Step ids still holding unclaimed state.
    pub fn keys(&self) -> Vec<&StepId> {
        self.0.keys().collect()
    }
}

/// Computes which log records survive a truncation at `up_to_epoch`.
///
/// Shared by the backends: keeps the latest snapshot per `(step, key)` at
/// or below the bound (unless it is a tombstone, which can drop entirely),
/// every snapshot above the bound, and only the newest frontier record.
pub(crate) fn retained_sequences(entries: &[(u64, LogEntry)], up_to_epoch: u64) -> Vec<u64> {
    let mut latest_per_cell: HashMap<(StepId, StateKey), (u64, bool)> = HashMap::new();
    let mut latest_frontier: Option<u64> = None;
    let mut keep = Vec::new();

    for (seq, entry) in entries {
        match entry {
            LogEntry::Snapshot(s) if s.epoch <= up_to_epoch => {
                latest_per_cell.insert(
                    (s.step_id.clone(), s.key.clone()),
                    (*seq, s.state.is_some()),
                );
            }
            LogEntry::Snapshot(_) => keep.push(*seq),
            LogEntry::Frontier(_) => {
                latest_frontier = Some(*seq);
            }
        }
    }

    keep.extend(
        latest_per_cell
            .into_values()
            .filter(|(_, live)| *live)
            .map(|(seq, _)| seq),
    );
    keep.extend(latest_frontier);
    keep.sort_unstable();
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(step: &str, key: &str, epoch: u64, state: Option<&str>) -> LogEntry {
        LogEntry::Snapshot(SnapshotRecord {
            step_id: StepId::from(step),
            key: StateKey::Text(key.into()),
            epoch,
            state: state.map(|s| StateBytes::ser(&s.to_string())),
        })
    }

    fn frontier(epoch: u64) -> LogEntry {
        LogEntry::Frontier(FrontierRecord {
            worker_index: 0,
            worker_count: 1,
            epoch,
            token: Some(ResumeToken::encode(&(epoch + 1))),
        })
    }

    #[test]
    fn restored_state_takes_last_write_and_applies_tombstones() {
        let view = LocalLogView::from_entries(vec![
            snap("dedupe", "a", 0, Some("v0")),
            frontier(0),
            snap("dedupe", "a", 1, Some("v1")),
            snap("dedupe", "b", 1, Some("w0")),
            frontier(1),
            snap("dedupe", "b", 2, None),
            frontier(2),
        ]);

        let mut restored = view.restored_state(2);
        let cells = restored.remove(&StepId::from("dedupe"));
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[&StateKey::Text("a".into())].de::<String>().unwrap(), "v1");

        // Bounded restore ignores later epochs.
        let mut bounded = view.restored_state(0);
        let cells = bounded.remove(&StepId::from("dedupe"));
        assert_eq!(cells[&StateKey::Text("a".into())].de::<String>().unwrap(), "v0");
    }

    #[test]
    fn resume_plan_reads_newest_frontier() {
        let view = LocalLogView::from_entries(vec![frontier(0), frontier(1), frontier(2)]);
        assert_eq!(view.last_completed(), Some(2));
        assert_eq!(view.frontier_at_or_before(1).unwrap().epoch, 1);
        assert_eq!(view.recorded_worker_count(), Some(1));
    }

    #[test]
    fn truncation_keeps_latest_cell_and_frontier() {
        let entries: Vec<(u64, LogEntry)> = vec![
            (0, snap("dedupe", "a", 0, Some("v0"))),
            (1, frontier(0)),
            (2, snap("dedupe", "a", 1, Some("v1"))),
            (3, snap("dedupe", "b", 1, None)),
            (4, frontier(1)),
            (5, snap("dedupe", "c", 2, Some("x"))),
        ];
        let keep = retained_sequences(&entries, 1);
        // v1 survives, the tombstoned b drops, the epoch-2 snapshot is
        // beyond the bound, and only the newest frontier stays.
        assert_eq!(keep, vec![2, 4, 5]);
    }
}
