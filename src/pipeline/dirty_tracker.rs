//! Orchestrator-side mirror of outstanding section rebuilds.
//!
//! The pending-count invariant (N coalesced dirty marks produce exactly N
//! completions) is easy to break when the underlying map is mutated from
//! several call sites, so this component owns the map outright and exposes
//! only the transitions the orchestrator needs.

use std::collections::{HashMap, HashSet};

use log::error;

use crate::protocol::{ChunkColumnKey, SectionKey};

/// Outcome of consuming one `SectionFinished` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The key's counter reached zero; it is now a finished section.
    Settled,
    /// Completions are still outstanding for the key.
    StillWaiting,
    /// The key was settled early (unmarked or its column unloaded) and this
    /// is a late completion that was already in flight; dropped silently.
    Discarded,
    /// No pending count existed; an invariant violation, already logged.
    Unexpected,
}

/// Tracks how many completions each section still owes and which sections
/// have fully finished.
///
/// A key is removed from the waiting map exactly when its counter reaches
/// zero, at which point it moves to the finished set.
///
/// Settling a key early (unmark, column unload) does not stop completions
/// the worker already emitted; those keys enter a grace set so their late
/// completions are discarded instead of tripping the no-pending-count
/// violation. The grace ends when the key is marked again.
#[derive(Debug, Default)]
pub struct DirtySectionTracker {
    sections_waiting: HashMap<SectionKey, u32>,
    finished_sections: HashSet<SectionKey>,
    settled_early: HashSet<SectionKey>,
}

impl DirtySectionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        DirtySectionTracker::default()
    }

    /// Records one dirty mark for the key. Returns true when the key was
    /// not waiting before (its first outstanding completion).
    pub fn mark_pending(&mut self, key: SectionKey) -> bool {
        self.finished_sections.remove(&key);
        self.settled_early.remove(&key);
        let counter = self.sections_waiting.entry(key).or_insert(0);
        *counter += 1;
        *counter == 1
    }

    /// Consumes one completion event for the key.
    ///
    /// Late completions for keys that were settled early are discarded. A
    /// completion with neither a pending count nor an early settle behind it
    /// is a programmer error: it aborts in debug builds and is logged and
    /// skipped in production.
    pub fn on_finished(&mut self, key: SectionKey) -> FinishOutcome {
        match self.sections_waiting.get_mut(&key) {
            Some(counter) if *counter > 1 => {
                *counter -= 1;
                FinishOutcome::StillWaiting
            }
            Some(_) => {
                self.sections_waiting.remove(&key);
                self.finished_sections.insert(key);
                FinishOutcome::Settled
            }
            None if self.settled_early.contains(&key) => FinishOutcome::Discarded,
            None => {
                debug_assert!(false, "SectionFinished for {key:?} with no pending count");
                error!("SectionFinished for {key:?} with no pending count, skipped");
                FinishOutcome::Unexpected
            }
        }
    }

    /// Drops every outstanding completion for the key at once, as when its
    /// column unloads. Returns the count that was outstanding; when nonzero
    /// the key is recorded as finished and its late completions (workers may
    /// have emitted them already) are granted the discard grace.
    pub fn settle(&mut self, key: SectionKey) -> u32 {
        match self.sections_waiting.remove(&key) {
            Some(outstanding) => {
                self.finished_sections.insert(key);
                self.settled_early.insert(key);
                outstanding
            }
            None => 0,
        }
    }

    /// True while completions are outstanding for the key.
    pub fn is_waiting(&self, key: SectionKey) -> bool {
        self.sections_waiting.contains_key(&key)
    }

    /// True once the key has settled and not been re-marked since.
    pub fn is_finished(&self, key: SectionKey) -> bool {
        self.finished_sections.contains(&key)
    }

    /// Number of keys with outstanding completions.
    pub fn waiting_count(&self) -> usize {
        self.sections_waiting.len()
    }

    /// Waiting keys belonging to one column.
    pub fn waiting_keys_in_column(&self, column: ChunkColumnKey) -> Vec<SectionKey> {
        self.sections_waiting
            .keys()
            .filter(|key| key.column() == column)
            .copied()
            .collect()
    }

    /// Forgets every key of a column, waiting or finished, so unloaded
    /// columns do not pin bookkeeping forever. Keys that were still waiting
    /// keep the discard grace, in case the column reloads while their late
    /// completions are in flight.
    pub fn remove_column(&mut self, column: ChunkColumnKey) {
        let settled_early = &mut self.settled_early;
        self.sections_waiting.retain(|key, _| {
            if key.column() == column {
                settled_early.insert(*key);
                false
            } else {
                true
            }
        });
        self.finished_sections.retain(|key| key.column() != column);
    }

    /// Drops all state.
    pub fn clear(&mut self) {
        self.sections_waiting.clear();
        self.finished_sections.clear();
        self.settled_early.clear();
    }
}
