//! Durable recovery log over an embedded sled database.
//!
//! One database per worker under the configured root directory; entries
//! live in a single `log` tree keyed by a big-endian sequence number, so a
//! range scan replays in append order. `flush` after each batch is the
//! fsync barrier the ordering rule requires.

use byteorder::{BigEndian, ByteOrder};
use std::path::Path;

use super::{retained_sequences, LogEntry, RecoveryLog};
use crate::errors::Error;

const LOG_TREE: &[u8] = b"log";

fn store_err(err: impl std::fmt::Display) -> Error {
    Error::Resume(format!("recovery store error: {}", err))
}

/// A worker's sled-backed recovery log.
pub struct SledLog {
    db: sled::Db,
    log: sled::Tree,
    next_seq: u64,
}

impl SledLog {
    /// Opens (or creates) the log for `worker_index` under `dir`.
    pub fn open(dir: &Path, worker_index: usize) -> Result<SledLog, Error> {
        std::fs::create_dir_all(dir).map_err(store_err)?;
        let db = sled::open(dir.join(format!("worker-{}", worker_index))).map_err(store_err)?;
        let log = db.open_tree(LOG_TREE).map_err(store_err)?;
        let next_seq = log
            .last()
            .map_err(store_err)?
            .map(|(key, _)| BigEndian::read_u64(&key) + 1)
            .unwrap_or(0);
        tracing::debug!(worker = worker_index, next_seq, "opened recovery log");
        Ok(SledLog { db, log, next_seq })
    }

    fn decode_all(&self) -> Result<Vec<(u64, LogEntry)>, Error> {
        let mut entries = Vec::new();
        for item in self.log.iter() {
            let (key, value) = item.map_err(store_err)?;
            let seq = BigEndian::read_u64(&key);
            let entry: LogEntry = bincode::deserialize(&value)
                .map_err(|err| Error::Resume(format!("corrupt recovery log entry: {}", err)))?;
            entries.push((seq, entry));
        }
        Ok(entries)
    }
}

impl RecoveryLog for SledLog {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), Error> {
        let mut batch = sled::Batch::default();
        for entry in entries {
            let mut key = [0u8; 8];
            BigEndian::write_u64(&mut key, self.next_seq);
            self.next_seq += 1;
            let value = bincode::serialize(entry)
                .map_err(|err| store_err(format!("error encoding log entry: {}", err)))?;
            batch.insert(&key[..], value);
        }
        self.log.apply_batch(batch).map_err(store_err)?;
        // Blocks until the batch is on disk.
        self.db.flush().map_err(store_err)?;
        Ok(())
    }

    fn read_from(&mut self, epoch: u64) -> Result<Vec<LogEntry>, Error> {
        Ok(self
            .decode_all()?
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| match entry {
                LogEntry::Snapshot(s) => s.epoch >= epoch,
                LogEntry::Frontier(f) => f.epoch >= epoch,
            })
            .collect())
    }

    fn truncate(&mut self, up_to_epoch: u64) -> Result<(), Error> {
        let entries = self.decode_all()?;
        let keep = retained_sequences(&entries, up_to_epoch);
        let mut batch = sled::Batch::default();
        let mut removed = 0usize;
        for (seq, _) in &entries {
            if keep.binary_search(seq).is_err() {
                let mut key = [0u8; 8];
                BigEndian::write_u64(&mut key, *seq);
                batch.remove(&key[..]);
                removed += 1;
            }
        }
        if removed > 0 {
            self.log.apply_batch(batch).map_err(store_err)?;
            self.db.flush().map_err(store_err)?;
            tracing::debug!(up_to_epoch, removed, "truncated recovery log");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{FrontierRecord, LocalLogView, ResumeToken};
    use crate::state::{SnapshotRecord, StateBytes, StateKey, StepId};

    fn snapshot(epoch: u64, value: &str) -> LogEntry {
        LogEntry::Snapshot(SnapshotRecord {
            step_id: StepId::from("sessions"),
            key: StateKey::Text("a".into()),
            epoch,
            state: Some(StateBytes::ser(&value.to_string())),
        })
    }

    fn frontier(epoch: u64, consumed: u64) -> LogEntry {
        LogEntry::Frontier(FrontierRecord {
            worker_index: 0,
            worker_count: 1,
            epoch,
            token: Some(ResumeToken::encode(&consumed)),
        })
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut log = SledLog::open(dir.path(), 0).unwrap();
            log.append(&[snapshot(0, "v0"), frontier(0, 1)]).unwrap();
            log.append(&[snapshot(1, "v1"), frontier(1, 2)]).unwrap();
        }

        let mut log = SledLog::open(dir.path(), 0).unwrap();
        let view = LocalLogView::from_entries(log.read_from(0).unwrap());
        assert_eq!(view.last_completed(), Some(1));
        let token = view.frontier_at_or_before(1).unwrap().token.clone().unwrap();
        assert_eq!(token.decode::<u64>().unwrap(), 2);

        let mut restored = view.restored_state(1);
        let cells = restored.remove(&StepId::from("sessions"));
        assert_eq!(cells[&StateKey::Text("a".into())].de::<String>().unwrap(), "v1");
    }

    #[test]
    fn sequences_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = SledLog::open(dir.path(), 0).unwrap();
            log.append(&[frontier(0, 1)]).unwrap();
        }
        {
            let mut log = SledLog::open(dir.path(), 0).unwrap();
            log.append(&[frontier(1, 2)]).unwrap();
            let entries = log.decode_all().unwrap();
            assert_eq!(entries.len(), 2);
            assert!(entries[0].0 < entries[1].0);
        }
    }

    #[test]
    fn truncate_compacts_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SledLog::open(dir.path(), 0).unwrap();
        for epoch in 0..4 {
            log.append(&[snapshot(epoch, "x"), frontier(epoch, epoch + 1)]).unwrap();
        }
        log.truncate(3).unwrap();
        let entries = log.decode_all().unwrap();
        // One live snapshot and one frontier record remain.
        assert_eq!(entries.len(), 2);

        let view = LocalLogView::from_entries(log.read_from(0).unwrap());
        assert_eq!(view.last_completed(), Some(3));
    }

    #[test]
    fn workers_get_distinct_databases() {
        let dir = tempfile::tempdir().unwrap();
        let mut log0 = SledLog::open(dir.path(), 0).unwrap();
        let mut log1 = SledLog::open(dir.path(), 1).unwrap();
        log0.append(&[frontier(0, 1)]).unwrap();
        assert!(log1.read_from(0).unwrap().is_empty());
        assert_eq!(log0.read_from(0).unwrap().len(), 1);
    }
}
