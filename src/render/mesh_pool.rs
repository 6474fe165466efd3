//! Bounded pool of reusable per-section mesh buffers.
//!
//! Chunk churn would otherwise allocate and free GPU buffers every frame;
//! the pool keeps a working set of preallocated buffers and rebinds them to
//! sections as they stream in and out. Size limits derive from the current
//! view distance: the minimum target assumes the average section count per
//! column, the hard ceiling assumes fully populated columns. When even the
//! ceiling is exhausted the pool over-allocates and warns instead of failing
//! the caller. A missing mesh is a visible hole in the world.

use std::collections::HashMap;

use log::{debug, warn};
use web_time::Instant;

use super::{AttributeChannel, MeshBuffers};
use crate::config::StreamerConfig;
use crate::protocol::SectionKey;

/// One pooled buffer slot.
pub struct MeshPoolEntry<M> {
    /// The reusable buffer storage.
    pub buffers: M,
    /// Whether the entry is currently bound to a section.
    pub in_use: bool,
    /// When the entry last changed hands, for shrink ordering.
    pub last_used: Instant,
    /// The section the entry is bound to while in use.
    pub bound_section: Option<SectionKey>,
}

/// Cumulative pool counters, for capacity tuning rather than correctness.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeshPoolStats {
    /// Acquires satisfied by an existing binding or a free slot.
    pub hits: u64,
    /// Acquires that had to grow the pool first.
    pub misses: u64,
    /// Growth steps performed.
    pub grows: u64,
    /// Growth steps past the computed ceiling.
    pub emergency_grows: u64,
    /// Entries disposed by shrinking.
    pub shrinks: u64,
}

/// A bounded, dynamically resized pool of mesh buffers keyed by section.
///
/// Only the orchestrator thread mutates the pool, so the invariants hold
/// without locking: every `bound_section` among in-use entries is unique,
/// and `active_count + free_count` always equals the pool size.
pub struct MeshPool<M> {
    entries: Vec<MeshPoolEntry<M>>,
    bound: HashMap<SectionKey, usize>,
    min_size: usize,
    max_size: usize,
    growth_increment: usize,
    vertex_capacity: usize,
    avg_sections_per_column: usize,
    max_sections_per_column: usize,
    stats: MeshPoolStats,
}

impl<M: MeshBuffers> MeshPool<M> {
    /// Creates a pool sized for the configured view distance, eagerly grown
    /// to the minimum target.
    pub fn new(config: &StreamerConfig) -> Self {
        let mut pool = MeshPool {
            entries: Vec::new(),
            bound: HashMap::new(),
            min_size: 0,
            max_size: 0,
            growth_increment: config.pool_growth_increment.max(1),
            vertex_capacity: config.pool_vertex_capacity,
            avg_sections_per_column: config.avg_sections_per_column as usize,
            max_sections_per_column: config.max_sections_per_column as usize,
            stats: MeshPoolStats::default(),
        };
        pool.set_view_distance(config.view_distance);
        pool
    }

    /// Recomputes the size limits for a new view distance and grows ahead of
    /// demand when the minimum target rose above the current size.
    pub fn set_view_distance(&mut self, view_distance: u32) {
        let columns_in_view = StreamerConfig::columns_in_view(view_distance);
        self.min_size = columns_in_view * self.avg_sections_per_column;
        self.max_size = columns_in_view * self.max_sections_per_column;

        if self.entries.len() < self.min_size {
            let needed = self.min_size - self.entries.len();
            self.grow(needed);
            debug!(
                "mesh pool grown predictively to {} entries (view distance {})",
                self.entries.len(),
                view_distance
            );
        }
    }

    fn grow(&mut self, count: usize) {
        self.entries.reserve(count);
        for _ in 0..count {
            self.entries.push(MeshPoolEntry {
                buffers: M::allocate(self.vertex_capacity),
                in_use: false,
                last_used: Instant::now(),
                bound_section: None,
            });
        }
        self.stats.grows += 1;
    }

    fn find_free(&self) -> Option<usize> {
        self.entries.iter().position(|entry| !entry.in_use)
    }

    /// Acquires the entry bound to `key`, reusing the existing binding, a
    /// free slot, or growth, in that order. Never fails: when the ceiling
    /// is reached the pool over-allocates and warns.
    pub fn acquire(&mut self, key: SectionKey) -> &mut MeshPoolEntry<M> {
        if let Some(&index) = self.bound.get(&key) {
            self.stats.hits += 1;
            let entry = &mut self.entries[index];
            entry.last_used = Instant::now();
            return entry;
        }

        let index = match self.find_free() {
            Some(index) => {
                self.stats.hits += 1;
                index
            }
            None => {
                self.stats.misses += 1;
                if self.entries.len() >= self.max_size {
                    self.stats.emergency_grows += 1;
                    warn!(
                        "mesh pool exhausted at ceiling {}, over-allocating",
                        self.max_size
                    );
                }
                let step = self
                    .growth_increment
                    .min(self.max_size.saturating_sub(self.entries.len()))
                    .max(1);
                let first_new = self.entries.len();
                self.grow(step);
                first_new
            }
        };

        let entry = &mut self.entries[index];
        entry.in_use = true;
        entry.bound_section = Some(key);
        entry.last_used = Instant::now();
        self.bound.insert(key, index);
        entry
    }

    /// Releases the entry bound to `key`: the binding is detached and the
    /// buffer contents cleared (not deallocated) for cheap rewriting. When
    /// the pool has outgrown its ceiling, excess free entries are disposed.
    /// Returns true when a binding existed.
    pub fn release(&mut self, key: SectionKey) -> bool {
        let Some(index) = self.bound.remove(&key) else {
            return false;
        };

        let entry = &mut self.entries[index];
        entry.in_use = false;
        entry.bound_section = None;
        entry.buffers.clear();
        entry.last_used = Instant::now();

        self.shrink_to_limit();
        true
    }

    fn shrink_to_limit(&mut self) {
        while self.entries.len() > self.max_size {
            // Dispose the least recently used free entry; stop when only
            // in-use entries remain.
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| !entry.in_use)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(index, _)| index);
            let Some(index) = victim else {
                break;
            };

            self.entries[index].buffers.dispose();
            self.entries.swap_remove(index);
            self.stats.shrinks += 1;

            // swap_remove moved the former tail into `index`; its binding
            // still points at the old position.
            if index < self.entries.len() {
                if let Some(moved_key) = self.entries[index].bound_section {
                    self.bound.insert(moved_key, index);
                }
            }
        }
    }

    /// True when `key` currently holds a pooled buffer.
    pub fn is_bound(&self, key: SectionKey) -> bool {
        self.bound.contains_key(&key)
    }

    /// Number of entries currently bound to sections.
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.in_use).count()
    }

    /// Number of free entries.
    pub fn free_count(&self) -> usize {
        self.entries.len() - self.active_count()
    }

    /// Total entries, bound or free.
    pub fn pool_size(&self) -> usize {
        self.entries.len()
    }

    /// The computed minimum size target.
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// The computed hard ceiling.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Cumulative counters.
    pub fn stats(&self) -> MeshPoolStats {
        self.stats
    }

    /// Estimated allocated bytes for one attribute channel across the pool.
    pub fn channel_footprint(&self, channel: AttributeChannel) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.buffers.allocated_bytes(channel))
            .sum()
    }

    /// Disposes every buffer and empties the pool.
    pub fn dispose_all(&mut self) {
        for entry in &mut self.entries {
            entry.buffers.dispose();
        }
        self.entries.clear();
        self.bound.clear();
    }
}
