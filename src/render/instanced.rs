//! Per-block-type instanced draw batches with gap-free removal.
//!
//! Full-cube, non-composite block types are rendered as per-instance
//! transforms instead of per-vertex geometry. Each block type owns one
//! fixed-capacity batch; sections append instances at the tail and removal
//! runs a full compaction pass so the live range stays contiguous `[0,
//! count)` and a single draw covers the whole batch. Removal is therefore
//! not O(1); the trade is zero fragmentation.

use std::collections::HashMap;

use log::warn;

use crate::protocol::SectionKey;

/// A fixed-capacity instance batch for one block type.
pub struct InstanceBatch {
    transforms: Vec<[f32; 3]>,
    count: usize,
    capacity: usize,
    section_slots: HashMap<SectionKey, Vec<usize>>,
}

impl InstanceBatch {
    fn new(capacity: usize) -> Self {
        InstanceBatch {
            transforms: vec![[0.0; 3]; capacity],
            count: 0,
            capacity,
            section_slots: HashMap::new(),
        }
    }

    /// Live instance transforms, contiguous from slot 0.
    pub fn instances(&self) -> &[[f32; 3]] {
        &self.transforms[..self.count]
    }

    /// Number of live instances.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Appends instances for one section, refusing any overflow past the
    /// fixed capacity rather than corrupting neighboring instances.
    fn append(&mut self, key: SectionKey, positions: &[[f32; 3]]) -> usize {
        let space = self.capacity - self.count;
        let accepted = positions.len().min(space);

        if accepted < positions.len() {
            warn!(
                "instance batch full ({} / {}): refusing {} instances for section {:?}",
                self.count,
                self.capacity,
                positions.len() - accepted,
                key
            );
        }
        if accepted == 0 {
            return 0;
        }

        let slots = self.section_slots.entry(key).or_default();
        slots.reserve(accepted);
        for (offset, position) in positions[..accepted].iter().enumerate() {
            self.transforms[self.count + offset] = *position;
            slots.push(self.count + offset);
        }
        self.count += accepted;
        accepted
    }

    /// Removes one section's instances by compacting the live range, then
    /// remaps every other section's recorded slots to the new positions.
    fn remove_section(&mut self, key: SectionKey) {
        let Some(removed_slots) = self.section_slots.remove(&key) else {
            return;
        };

        const REMOVED: usize = usize::MAX;
        let mut remap = vec![0usize; self.count];
        for &slot in &removed_slots {
            remap[slot] = REMOVED;
        }

        let mut write = 0;
        for read in 0..self.count {
            if remap[read] == REMOVED {
                continue;
            }
            if write != read {
                self.transforms[write] = self.transforms[read];
            }
            remap[read] = write;
            write += 1;
        }
        self.count = write;

        for slots in self.section_slots.values_mut() {
            for slot in slots.iter_mut() {
                *slot = remap[*slot];
            }
        }
    }
}

/// Maintains instanced draw batches per block type and compacts them as
/// sections unload.
///
/// Batches are created lazily on first sighting of a block type and live
/// until full teardown; individual sections come and go without destroying
/// any batch.
pub struct InstancedBlockRenderer {
    batches: HashMap<u32, InstanceBatch>,
    capacity: usize,
}

impl InstancedBlockRenderer {
    /// Creates a renderer whose batches hold up to `capacity` instances each.
    pub fn new(capacity: usize) -> Self {
        InstancedBlockRenderer {
            batches: HashMap::new(),
            capacity,
        }
    }

    /// Appends a section's instanced placements, batch per block type.
    pub fn add_section_instances(
        &mut self,
        key: SectionKey,
        per_block_type: &HashMap<u32, Vec<[f32; 3]>>,
    ) {
        let capacity = self.capacity;
        for (&block_type, positions) in per_block_type {
            self.batches
                .entry(block_type)
                .or_insert_with(|| InstanceBatch::new(capacity))
                .append(key, positions);
        }
    }

    /// Removes a section's instances from every batch, compacting each.
    pub fn remove_section_instances(&mut self, key: SectionKey) {
        for batch in self.batches.values_mut() {
            batch.remove_section(key);
        }
    }

    /// The batch for a block type, if any instances were ever added.
    pub fn batch(&self, block_type: u32) -> Option<&InstanceBatch> {
        self.batches.get(&block_type)
    }

    /// Total live instances across all batches.
    pub fn total_instances(&self) -> usize {
        self.batches.values().map(InstanceBatch::count).sum()
    }

    /// Full teardown; drops every batch.
    pub fn clear(&mut self) {
        self.batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(x: i32) -> SectionKey {
        SectionKey { x: x * 16, y: 0, z: 0 }
    }

    fn positions(base: f32, n: usize) -> Vec<[f32; 3]> {
        (0..n).map(|i| [base + i as f32, 0.0, 0.0]).collect()
    }

    #[test]
    fn removal_compacts_to_the_surviving_section() {
        let mut renderer = InstancedBlockRenderer::new(16);
        let mut adds = HashMap::new();
        adds.insert(1u32, positions(0.0, 3));
        renderer.add_section_instances(key(0), &adds);

        let mut adds_b = HashMap::new();
        adds_b.insert(1u32, positions(100.0, 2));
        renderer.add_section_instances(key(1), &adds_b);

        renderer.remove_section_instances(key(0));

        let batch = renderer.batch(1).unwrap();
        assert_eq!(batch.count(), 2);
        assert_eq!(batch.instances(), &[[100.0, 0.0, 0.0], [101.0, 0.0, 0.0]]);

        renderer.remove_section_instances(key(1));
        assert_eq!(renderer.batch(1).unwrap().count(), 0);
    }

    #[test]
    fn remap_survives_repeated_interleaved_removal() {
        let mut renderer = InstancedBlockRenderer::new(64);
        for section in 0..4 {
            let mut adds = HashMap::new();
            adds.insert(7u32, positions(section as f32 * 10.0, 3));
            renderer.add_section_instances(key(section), &adds);
        }

        renderer.remove_section_instances(key(1));
        renderer.remove_section_instances(key(2));

        let batch = renderer.batch(7).unwrap();
        assert_eq!(batch.count(), 6);
        let expected: Vec<[f32; 3]> = positions(0.0, 3)
            .into_iter()
            .chain(positions(30.0, 3))
            .collect();
        assert_eq!(batch.instances(), expected.as_slice());

        renderer.remove_section_instances(key(0));
        renderer.remove_section_instances(key(3));
        assert_eq!(renderer.batch(7).unwrap().count(), 0);
    }

    #[test]
    fn overflow_is_refused_not_corrupted() {
        let mut renderer = InstancedBlockRenderer::new(4);
        let mut adds = HashMap::new();
        adds.insert(1u32, positions(0.0, 3));
        renderer.add_section_instances(key(0), &adds);

        let mut overflow = HashMap::new();
        overflow.insert(1u32, positions(50.0, 3));
        renderer.add_section_instances(key(1), &overflow);

        let batch = renderer.batch(1).unwrap();
        assert_eq!(batch.count(), 4);
        assert_eq!(batch.instances()[..3], positions(0.0, 3)[..]);
        assert_eq!(batch.instances()[3], [50.0, 0.0, 0.0]);

        // The refused tail must not resurface after compaction.
        renderer.remove_section_instances(key(0));
        assert_eq!(renderer.batch(1).unwrap().count(), 1);
    }

    #[test]
    fn batches_are_lazy_and_survive_section_removal() {
        let mut renderer = InstancedBlockRenderer::new(8);
        assert!(renderer.batch(9).is_none());

        let mut adds = HashMap::new();
        adds.insert(9u32, positions(0.0, 2));
        renderer.add_section_instances(key(0), &adds);
        renderer.remove_section_instances(key(0));

        assert!(renderer.batch(9).is_some());
        assert_eq!(renderer.total_instances(), 0);
    }
}
