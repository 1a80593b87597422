//! Window assignment and per-key window cells.
//!
//! A windower maps a record timestamp to a window id; tumbling windows of
//! length `L` aligned to `start_at` assign `⌊(t − start_at)/L⌋`. A window
//! is eligible to close once the clock's watermark reaches the window's
//! end. Windows close in ascending id order per key.

pub mod clock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::value::Value;

/// Identifies a window within one `(step, key)`.
pub type WindowId = i64;

/// Tumbling windows: fixed length, gap-free, aligned to `start_at`.
#[derive(Clone, Debug)]
pub struct TumblingWindower {
    length: chrono::Duration,
    start_at: DateTime<Utc>,
}

impl TumblingWindower {
    /// Windows of `length`, the first one starting at `start_at`.
    pub fn new(length: chrono::Duration, start_at: DateTime<Utc>) -> TumblingWindower {
        assert!(length > chrono::Duration::zero(), "window length must be positive");
        TumblingWindower { length, start_at }
    }

    /// The window containing `t`, or `None` for timestamps before the
    /// alignment origin, which are dropped.
    pub fn assign(&self, t: DateTime<Utc>) -> Option<WindowId> {
        if t < self.start_at {
            return None;
        }
        let offset = (t - self.start_at).num_milliseconds();
        let length = self.length.num_milliseconds();
        Some(offset / length)
    }

    /// When window `id` may close.
    pub fn close_at(&self, id: WindowId) -> DateTime<Utc> {
        self.start_at + chrono::Duration::milliseconds(self.length.num_milliseconds() * (id + 1))
    }

    /// Whether window `id` is eligible to close under `watermark`.
    pub fn is_closable(&self, id: WindowId, watermark: DateTime<Utc>) -> bool {
        watermark >= self.close_at(id)
    }
}

/// Lifecycle of a window cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowState {
    /// Accepting values.
    Open,
    /// Watermark passed the close time; about to emit.
    Closing,
    /// Emitted; tombstoned at the next snapshot.
    Closed,
}

/// One window's accumulator and lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowCell {
    /// The running accumulator.
    pub acc: Value,
    /// Where the cell is in its lifecycle.
    pub state: WindowState,
}

/// All live windows for one key at one windowed step.
///
/// This is the unit of keyed state for windowed operators: it serializes
/// as a whole, and an emptied set tombstones the key's cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WindowSet {
    windows: BTreeMap<WindowId, WindowCell>,
}

impl WindowSet {
    /// Whether no windows remain open.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Removes and returns window `id`'s accumulator, if the window is
    /// open.
    pub fn take(&mut self, id: WindowId) -> Option<Value> {
        self.windows.remove(&id).map(|cell| cell.acc)
    }

    /// Opens (or replaces) window `id` with the given accumulator.
    pub fn put(&mut self, id: WindowId, acc: Value) {
        self.windows.insert(id, WindowCell { acc, state: WindowState::Open });
    }

    /// Closes and removes every window eligible under `watermark`,
    /// returning `(id, accumulator)` in ascending id order.
    pub fn drain_closable(
        &mut self,
        windower: &TumblingWindower,
        watermark: DateTime<Utc>,
    ) -> Vec<(WindowId, Value)> {
        for (id, cell) in self.windows.iter_mut() {
            if cell.state == WindowState::Open && windower.is_closable(*id, watermark) {
                cell.state = WindowState::Closing;
            }
        }
        self.take_closing()
    }

    /// Closes every remaining window, in id order. Used at end-of-stream.
    pub fn drain_all(&mut self) -> Vec<(WindowId, Value)> {
        for cell in self.windows.values_mut() {
            if cell.state == WindowState::Open {
                cell.state = WindowState::Closing;
            }
        }
        self.take_closing()
    }

    fn take_closing(&mut self) -> Vec<(WindowId, Value)> {
        let mut emitted = Vec::new();
        for (id, cell) in self.windows.iter_mut() {
            if cell.state == WindowState::Closing {
                cell.state = WindowState::Closed;
                emitted.push((*id, cell.acc.clone()));
            }
        }
        self.windows.retain(|_, cell| cell.state != WindowState::Closed);
        emitted
    }
}
