//! Per-worker keyed state and its snapshot model.
//!
//! Every stateful step owns a [`KeyedState`]: a mapping from [`StateKey`] to
//! live, typed state. The engine only sees state as bytes at the snapshot
//! and restore boundaries; in between, operators mutate it in place.
//!
//! Dirty tracking is per cell, not per step, which keeps snapshot volume
//! proportional to the change volume of an epoch. A cell whose serialized
//! bytes equal its last durable snapshot is skipped even if it was touched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::type_name;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::errors::Error;
use crate::value::Value;

/// Unique ID for a step in a dataflow.
///
/// Recovery data is keyed off of this so state is never mixed between
/// operators; renaming a step orphans its state.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> StepId {
        StepId(s.to_string())
    }
}

/// Key routing state within a step.
///
/// Restricted to the shapes the router can hash deterministically; the
/// conversion from a record's key enforces the restriction with the typed
/// error stateful operators raise.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateKey {
    /// An integer key.
    Int(i64),
    /// A text key.
    Text(String),
    /// A raw byte-string key.
    Bytes(Vec<u8>),
}

impl StateKey {
    /// Shapes a record's key into a state key, rejecting unroutable types.
    pub fn try_from_value(key: &Value) -> Result<StateKey, Error> {
        match key {
            Value::Int(i) => Ok(StateKey::Int(*i)),
            Value::Text(s) => Ok(StateKey::Text(s.clone())),
            Value::Bytes(b) => Ok(StateKey::Bytes(b.clone())),
            other => Err(Error::bad_key(other)),
        }
    }

    /// The key as a record value, for emission.
    pub fn to_value(&self) -> Value {
        match self {
            StateKey::Int(i) => Value::Int(*i),
            StateKey::Text(s) => Value::Text(s.clone()),
            StateKey::Bytes(b) => Value::Bytes(b.clone()),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKey::Int(i) => write!(f, "{}", i),
            StateKey::Text(s) => write!(f, "{}", s),
            StateKey::Bytes(b) => write!(f, "{:?}", b),
        }
    }
}

/// Serialized state for one key within one step.
///
/// The recovery system deals only in bytes so each operator can persist its
/// own state type without generic gymnastics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serializes operator state into recovery bytes.
    pub fn ser<T: Serialize>(obj: &T) -> Self {
        let t_name = type_name::<T>();
        StateBytes(
            bincode::serialize(obj)
                .unwrap_or_else(|_| panic!("error serializing recovery state type {}", t_name)),
        )
    }

    /// Deserializes recovery bytes back into operator state.
    pub fn de<T: DeserializeOwned>(&self) -> Result<T, Error> {
        bincode::deserialize(&self.0).map_err(|err| {
            Error::Resume(format!(
                "corrupt state snapshot for type {}: {}",
                type_name::<T>(),
                err
            ))
        })
    }
}

/// A dirty cell drained at an epoch boundary: new bytes, or a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// The step whose cell changed.
    pub step_id: StepId,
    /// The cell's key.
    pub key: StateKey,
    /// The epoch at whose close the cell was drained.
    pub epoch: u64,
    /// The serialized state, or `None` for a deletion.
    pub state: Option<StateBytes>,
}

/// Keyed state cells for one stateful step, with per-cell dirty tracking.
pub struct KeyedState<S> {
    step_id: StepId,
    cells: HashMap<StateKey, S>,
    dirty: HashSet<StateKey>,
    last_snapshot: HashMap<StateKey, StateBytes>,
}

impl<S> KeyedState<S>
where
    S: Serialize + DeserializeOwned + PartialEq,
{
    /// An empty store for the given step.
    pub fn new(step_id: StepId) -> Self {
        KeyedState {
            step_id,
            cells: HashMap::new(),
            dirty: HashSet::new(),
            last_snapshot: HashMap::new(),
        }
    }

    /// The step this state belongs to.
    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    /// Whether a cell exists for `key`.
    pub fn contains(&self, key: &StateKey) -> bool {
        self.cells.contains_key(key)
    }

    /// Mutable access to the cell for `key`, constructing it with `builder`
    /// on first observation. Marks the cell dirty.
    pub fn get_or_init(&mut self, key: &StateKey, builder: impl FnOnce() -> S) -> &mut S {
        self.dirty.insert(key.clone());
        self.cells.entry(key.clone()).or_insert_with(builder)
    }

    /// Replaces the cell for `key` and marks it dirty.
    pub fn put(&mut self, key: StateKey, state: S) {
        self.dirty.insert(key.clone());
        self.cells.insert(key, state);
    }

    /// Removes the cell for `key`; a tombstone is persisted at the next
    /// snapshot if the cell had ever been written.
    pub fn remove(&mut self, key: &StateKey) -> Option<S> {
        self.dirty.insert(key.clone());
        self.cells.remove(key)
    }

    /// Drains dirty cells into snapshot records for the closing `epoch`.
    ///
    /// Cells whose bytes are unchanged since the last snapshot are skipped;
    /// removed cells become tombstones only if a snapshot of them was ever
    /// taken. The caller must persist the records before the frontier
    /// passes `epoch`; cells are considered clean from here on.
    pub fn snapshot(&mut self, epoch: u64) -> Vec<SnapshotRecord> {
        let mut records = Vec::new();
        let mut drained: Vec<StateKey> = self.dirty.drain().collect();
        drained.sort();
        for key in drained {
            match self.cells.get(&key) {
                Some(state) => {
                    let bytes = StateBytes::ser(state);
                    if self.last_snapshot.get(&key) == Some(&bytes) {
                        continue;
                    }
                    self.last_snapshot.insert(key.clone(), bytes.clone());
                    records.push(SnapshotRecord {
                        step_id: self.step_id.clone(),
                        key,
                        epoch,
                        state: Some(bytes),
                    });
                }
                None => {
                    if self.last_snapshot.remove(&key).is_some() {
                        records.push(SnapshotRecord {
                            step_id: self.step_id.clone(),
                            key,
                            epoch,
                            state: None,
                        });
                    }
                }
            }
        }
        records
    }

    /// Loads one restored cell, marking it clean at the restored bytes.
    pub fn restore(&mut self, key: StateKey, bytes: &StateBytes) -> Result<(), Error> {
        let state: S = bytes.de()?;
        self.last_snapshot.insert(key.clone(), bytes.clone());
        self.cells.insert(key, state);
        Ok(())
    }

    /// Keys with live cells, in ascending order.
    pub fn keys(&self) -> Vec<StateKey> {
        let mut keys: Vec<StateKey> = self.cells.keys().cloned().collect();
        keys.sort();
        keys
    }
}
