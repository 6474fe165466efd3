//! # Voxel Column Storage
//!
//! Minimal section/column storage backing each worker's private voxel cache.
//! The storage format itself is not the interesting part of the pipeline;
//! this module provides just enough structure for workers to answer "does
//! this section exist", run the geometry builder over live data, and serve
//! heightmap/custom-model queries.
//!
//! Columns are stored sparsely: only sections that contain blocks occupy
//! memory, which keeps effectively infinite worlds affordable.

use std::collections::HashMap;

use cgmath::Point3;

use crate::protocol::{ChunkColumnKey, SectionKey, SECTION_SIZE};

const BLOCKS_PER_SECTION: usize = (SECTION_SIZE * SECTION_SIZE * SECTION_SIZE) as usize;

/// A 16x16x16 cube of block state ids, the unit of mesh regeneration.
#[derive(Clone, Debug)]
pub struct Section {
    blocks: Vec<u16>,
    non_air: u32,
}

impl Section {
    /// Creates an all-air section.
    pub fn empty() -> Self {
        Section {
            blocks: vec![0; BLOCKS_PER_SECTION],
            non_air: 0,
        }
    }

    fn index(x: i32, y: i32, z: i32) -> usize {
        debug_assert!((0..SECTION_SIZE).contains(&x));
        debug_assert!((0..SECTION_SIZE).contains(&y));
        debug_assert!((0..SECTION_SIZE).contains(&z));
        ((y * SECTION_SIZE + z) * SECTION_SIZE + x) as usize
    }

    /// Block state id at section-local coordinates.
    pub fn get_block(&self, x: i32, y: i32, z: i32) -> u16 {
        self.blocks[Self::index(x, y, z)]
    }

    /// Sets the block state id at section-local coordinates.
    pub fn set_block(&mut self, x: i32, y: i32, z: i32, state_id: u16) {
        let slot = &mut self.blocks[Self::index(x, y, z)];
        match (*slot, state_id) {
            (0, id) if id != 0 => self.non_air += 1,
            (old, 0) if old != 0 => self.non_air -= 1,
            _ => {}
        }
        *slot = state_id;
    }

    /// True when every block is air.
    pub fn is_empty(&self) -> bool {
        self.non_air == 0
    }
}

/// A vertical stack of sections sharing the same chunk (x, z).
///
/// Sections are keyed by their minimum world y (a multiple of 16), mirroring
/// [`SectionKey`] so lookups need no translation.
#[derive(Clone, Debug, Default)]
pub struct ChunkColumn {
    sections: HashMap<i32, Section>,
}

impl ChunkColumn {
    /// Creates a column with no sections.
    pub fn new() -> Self {
        ChunkColumn::default()
    }

    /// Inserts or replaces the section starting at world y.
    pub fn insert_section(&mut self, section_y: i32, section: Section) {
        debug_assert_eq!(section_y.rem_euclid(SECTION_SIZE), 0);
        self.sections.insert(section_y, section);
    }

    /// The section starting at world y, if present.
    pub fn section_at(&self, section_y: i32) -> Option<&Section> {
        self.sections.get(&section_y)
    }

    /// World y values of every stored section.
    pub fn section_ys(&self) -> impl Iterator<Item = i32> + '_ {
        self.sections.keys().copied()
    }

    /// Number of stored sections.
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Sets a block by world-space y and column-local x/z, creating the
    /// section on demand.
    pub fn set_block(&mut self, x: i32, y: i32, z: i32, state_id: u16) {
        let section_y = y.div_euclid(SECTION_SIZE) * SECTION_SIZE;
        let section = self.sections.entry(section_y).or_insert_with(Section::empty);
        section.set_block(x, y - section_y, z, state_id);
    }

    /// Block state id by world-space y and column-local x/z; air when the
    /// section does not exist.
    pub fn get_block(&self, x: i32, y: i32, z: i32) -> u16 {
        let section_y = y.div_euclid(SECTION_SIZE) * SECTION_SIZE;
        match self.sections.get(&section_y) {
            Some(section) => section.get_block(x, y - section_y, z),
            None => 0,
        }
    }

    /// Highest non-air block y per cell, row-major 16x16. Cells with no
    /// blocks report `i32::MIN`.
    pub fn heightmap(&self) -> Vec<i32> {
        let mut heights = vec![i32::MIN; (SECTION_SIZE * SECTION_SIZE) as usize];
        let mut ys: Vec<i32> = self.sections.keys().copied().collect();
        ys.sort_unstable();

        for section_y in ys {
            let section = &self.sections[&section_y];
            if section.is_empty() {
                continue;
            }
            for z in 0..SECTION_SIZE {
                for x in 0..SECTION_SIZE {
                    let cell = (z * SECTION_SIZE + x) as usize;
                    for y in (0..SECTION_SIZE).rev() {
                        if section.get_block(x, y, z) != 0 {
                            heights[cell] = heights[cell].max(section_y + y);
                            break;
                        }
                    }
                }
            }
        }

        heights
    }
}

/// A worker's private view of the loaded world.
///
/// Each mesher worker owns one of these; there is no sharing between workers
/// or with the orchestrator, so no locking is involved anywhere.
#[derive(Debug, Default)]
pub struct LocalWorld {
    columns: HashMap<ChunkColumnKey, ChunkColumn>,
    custom_block_models: HashMap<ChunkColumnKey, serde_json::Value>,
}

impl LocalWorld {
    /// Creates an empty world cache.
    pub fn new() -> Self {
        LocalWorld::default()
    }

    /// Adds or replaces a column and its custom model overrides.
    pub fn add_column(
        &mut self,
        key: ChunkColumnKey,
        column: ChunkColumn,
        custom_block_models: Option<serde_json::Value>,
    ) {
        self.columns.insert(key, column);
        match custom_block_models {
            Some(models) => {
                self.custom_block_models.insert(key, models);
            }
            None => {
                self.custom_block_models.remove(&key);
            }
        }
    }

    /// Removes a column; returns true when it was present.
    pub fn remove_column(&mut self, key: ChunkColumnKey) -> bool {
        self.custom_block_models.remove(&key);
        self.columns.remove(&key).is_some()
    }

    /// True when no columns remain loaded.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Number of loaded columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// The column at the given key, if loaded.
    pub fn column(&self, key: ChunkColumnKey) -> Option<&ChunkColumn> {
        self.columns.get(&key)
    }

    /// True when the section identified by the key is present in the cache.
    pub fn has_section(&self, key: SectionKey) -> bool {
        self.columns
            .get(&key.column())
            .is_some_and(|column| column.section_at(key.y).is_some())
    }

    /// Block state id at a world position; air when unloaded.
    pub fn get_block(&self, pos: Point3<i32>) -> u16 {
        match self.columns.get(&ChunkColumnKey::containing(pos)) {
            Some(column) => column.get_block(
                pos.x.rem_euclid(SECTION_SIZE),
                pos.y,
                pos.z.rem_euclid(SECTION_SIZE),
            ),
            None => 0,
        }
    }

    /// Applies a single-block change; ignored when the column is unloaded.
    /// Returns true when the change landed.
    pub fn set_block(&mut self, pos: Point3<i32>, state_id: u16) -> bool {
        let key = ChunkColumnKey::containing(pos);
        match self.columns.get_mut(&key) {
            Some(column) => {
                column.set_block(
                    pos.x.rem_euclid(SECTION_SIZE),
                    pos.y,
                    pos.z.rem_euclid(SECTION_SIZE),
                    state_id,
                );
                true
            }
            None => false,
        }
    }

    /// Replaces a column's custom block model overrides.
    pub fn set_custom_block_models(
        &mut self,
        key: ChunkColumnKey,
        models: Option<serde_json::Value>,
    ) {
        match models {
            Some(models) => {
                self.custom_block_models.insert(key, models);
            }
            None => {
                self.custom_block_models.remove(&key);
            }
        }
    }

    /// Custom block model at a world position, looked up by the column's
    /// `"x,y,z"` override table.
    pub fn custom_block_model(&self, pos: Point3<i32>) -> Option<serde_json::Value> {
        let models = self.custom_block_models.get(&ChunkColumnKey::containing(pos))?;
        models
            .get(format!("{},{},{}", pos.x, pos.y, pos.z))
            .cloned()
    }

    /// Drops every column and override.
    pub fn clear(&mut self) {
        self.columns.clear();
        self.custom_block_models.clear();
    }
}
