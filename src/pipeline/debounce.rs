//! Debouncing of bursty chunk-column loads.
//!
//! Terrain streaming tends to deliver columns in ragged bursts. Dispatching
//! each column the moment it arrives would broadcast one `Chunk` message per
//! column and mark its sections dirty across several frames; holding the
//! burst for a short window lets the whole neighborhood go out as one
//! batched dispatch instead.
//!
//! The window is anchored at the first queued load and is not extended by
//! later arrivals, so a steady trickle of columns still dispatches at the
//! window rate rather than being starved forever.

use serde_json::Value;
use web_time::{Duration, Instant};

use crate::protocol::ChunkColumnKey;
use crate::world::ChunkColumn;

/// A column load waiting for the debounce window to close.
pub struct PendingColumnLoad {
    /// The column's chunk coordinates.
    pub key: ChunkColumnKey,
    /// The column's section data.
    pub column: ChunkColumn,
    /// Optional custom block model overrides for the column.
    pub custom_block_models: Option<Value>,
}

/// Coalesces column loads arriving within a fixed window into one dispatch.
pub struct ChunkLoadDebouncer {
    window: Duration,
    pending: Vec<PendingColumnLoad>,
    deadline: Option<Instant>,
}

impl ChunkLoadDebouncer {
    /// Creates a debouncer with the given coalescing window.
    pub fn new(window: Duration) -> Self {
        ChunkLoadDebouncer {
            window,
            pending: Vec::new(),
            deadline: None,
        }
    }

    /// Queues a column load. A load for a column already pending replaces
    /// the queued data instead of dispatching the column twice.
    pub fn queue_load(&mut self, load: PendingColumnLoad, now: Instant) {
        if let Some(existing) = self.pending.iter_mut().find(|p| p.key == load.key) {
            *existing = load;
            return;
        }
        if self.pending.is_empty() {
            self.deadline = Some(now + self.window);
        }
        self.pending.push(load);
    }

    /// Returns every pending load once the window has elapsed, or an empty
    /// vec while the window is still open.
    pub fn take_ready(&mut self, now: Instant) -> Vec<PendingColumnLoad> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                std::mem::take(&mut self.pending)
            }
            _ => Vec::new(),
        }
    }

    /// True while a load for the column sits in the window.
    pub fn is_pending(&self, key: ChunkColumnKey) -> bool {
        self.pending.iter().any(|p| p.key == key)
    }

    /// Drops a pending load, as when its column unloads before dispatch.
    /// Returns true when a load was actually removed.
    pub fn cancel(&mut self, key: ChunkColumnKey) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.key != key);
        if self.pending.is_empty() {
            self.deadline = None;
        }
        self.pending.len() != before
    }

    /// Number of loads waiting in the window.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
