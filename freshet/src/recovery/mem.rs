//! In-memory recovery store, shared between runs of a test.
//!
//! Behaves like the durable backend minus the durability: a cloned
//! [`InMemStore`] handed to a second run observes everything the first run
//! committed, which is how crash/recover scenarios are driven without
//! touching disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{retained_sequences, LogEntry, RecoveryLog};
use crate::errors::Error;

#[derive(Default)]
struct Shared {
    // Per-worker logs as (sequence, entry); sequences are per worker.
    logs: HashMap<usize, Vec<(u64, LogEntry)>>,
    next_seq: u64,
}

/// A process-local recovery store backing every worker's log.
#[derive(Clone, Default)]
pub struct InMemStore(Arc<Mutex<Shared>>);

impl InMemStore {
    /// An empty store.
    pub fn new() -> InMemStore {
        InMemStore::default()
    }

    /// This worker's log handle.
    pub(crate) fn log(&self, worker_index: usize) -> InMemLog {
        InMemLog { shared: Arc::clone(&self.0), worker_index }
    }

    /// Number of entries currently held for a worker, visible to tests.
    pub fn len(&self, worker_index: usize) -> usize {
        self.0.lock().expect("poisoned").logs.get(&worker_index).map_or(0, Vec::len)
    }

    /// Whether the store holds nothing at all.
    pub fn is_empty(&self) -> bool {
        self.0.lock().expect("poisoned").logs.values().all(Vec::is_empty)
    }
}

pub(crate) struct InMemLog {
    shared: Arc<Mutex<Shared>>,
    worker_index: usize,
}

impl RecoveryLog for InMemLog {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), Error> {
        let mut shared = self.shared.lock().expect("poisoned");
        for entry in entries {
            let seq = shared.next_seq;
            shared.next_seq += 1;
            shared.logs.entry(self.worker_index).or_default().push((seq, entry.clone()));
        }
        Ok(())
    }

    fn read_from(&mut self, epoch: u64) -> Result<Vec<LogEntry>, Error> {
        let shared = self.shared.lock().expect("poisoned");
        Ok(shared
            .logs
            .get(&self.worker_index)
            .map(|log| {
                log.iter()
                    .filter(|(_, entry)| entry_epoch(entry) >= epoch)
                    .map(|(_, entry)| entry.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn truncate(&mut self, up_to_epoch: u64) -> Result<(), Error> {
        let mut shared = self.shared.lock().expect("poisoned");
        if let Some(log) = shared.logs.get_mut(&self.worker_index) {
            let keep = retained_sequences(log, up_to_epoch);
            log.retain(|(seq, _)| keep.binary_search(seq).is_ok());
        }
        Ok(())
    }
}

fn entry_epoch(entry: &LogEntry) -> u64 {
    match entry {
        LogEntry::Snapshot(s) => s.epoch,
        LogEntry::Frontier(f) => f.epoch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{FrontierRecord, LocalLogView};
    use crate::state::{SnapshotRecord, StateBytes, StateKey, StepId};

    #[test]
    fn appends_are_visible_to_a_fresh_handle() {
        let store = InMemStore::new();
        let mut log = store.log(0);
        log.append(&[LogEntry::Frontier(FrontierRecord {
            worker_index: 0,
            worker_count: 1,
            epoch: 3,
            token: None,
        })])
        .unwrap();

        // A second handle over the same store sees the entry, like a
        // process reopening a durable log.
        let mut reopened = store.log(0);
        let view = LocalLogView::from_entries(reopened.read_from(0).unwrap());
        assert_eq!(view.last_completed(), Some(3));
    }

    #[test]
    fn truncate_drops_superseded_snapshots() {
        let store = InMemStore::new();
        let mut log = store.log(0);
        for epoch in 0..3 {
            log.append(&[
                LogEntry::Snapshot(SnapshotRecord {
                    step_id: StepId::from("count"),
                    key: StateKey::Text("k".into()),
                    epoch,
                    state: Some(StateBytes::ser(&epoch)),
                }),
                LogEntry::Frontier(FrontierRecord {
                    worker_index: 0,
                    worker_count: 1,
                    epoch,
                    token: None,
                }),
            ])
            .unwrap();
        }
        assert_eq!(store.len(0), 6);
        log.truncate(2).unwrap();
        // Latest snapshot plus latest frontier survive.
        assert_eq!(store.len(0), 2);

        let view = LocalLogView::from_entries(log.read_from(0).unwrap());
        let mut restored = view.restored_state(2);
        let cells = restored.remove(&StepId::from("count"));
        assert_eq!(cells[&StateKey::Text("k".into())].de::<u64>().unwrap(), 2);
    }
}
