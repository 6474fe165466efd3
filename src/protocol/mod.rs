//! # Worker Protocol
//!
//! Shared message and key definitions exchanged between the orchestrator and
//! the mesher workers. This module carries no logic beyond key arithmetic and
//! envelope unpacking; every cross-thread payload in the pipeline is defined
//! here so both sides match on the same exhaustive enums.
//!
//! ## Message Envelopes
//!
//! Messages may be delivered individually or batched as an array. Receivers
//! must accept both forms, so every channel in the pipeline carries a
//! [`MessageEnvelope`] and unpacks it with [`MessageEnvelope::into_iter`],
//! which preserves the original ordering.

use std::collections::HashMap;

use cgmath::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Edge length of a cubic section in blocks.
pub const SECTION_SIZE: i32 = 16;

/// Identifies a 16x16x16 voxel section by its minimum world corner.
///
/// The coordinates are always floored to multiples of 16; construct keys via
/// [`SectionKey::containing`] rather than from raw coordinates so that the
/// invariant holds for negative positions as well.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectionKey {
    /// Minimum world x of the section (multiple of 16).
    pub x: i32,
    /// Minimum world y of the section (multiple of 16).
    pub y: i32,
    /// Minimum world z of the section (multiple of 16).
    pub z: i32,
}

impl SectionKey {
    /// Returns the key of the section containing the given world position.
    pub fn containing(pos: Point3<i32>) -> Self {
        SectionKey {
            x: pos.x.div_euclid(SECTION_SIZE) * SECTION_SIZE,
            y: pos.y.div_euclid(SECTION_SIZE) * SECTION_SIZE,
            z: pos.z.div_euclid(SECTION_SIZE) * SECTION_SIZE,
        }
    }

    /// The section's coordinates in section units (world divided by 16).
    pub fn section_coords(&self) -> Point3<i32> {
        Point3::new(
            self.x / SECTION_SIZE,
            self.y / SECTION_SIZE,
            self.z / SECTION_SIZE,
        )
    }

    /// The chunk column this section belongs to.
    pub fn column(&self) -> ChunkColumnKey {
        ChunkColumnKey {
            x: self.x.div_euclid(SECTION_SIZE),
            z: self.z.div_euclid(SECTION_SIZE),
        }
    }

    /// The section's minimum corner as a world position.
    pub fn origin(&self) -> Point3<i32> {
        Point3::new(self.x, self.y, self.z)
    }
}

/// Identifies a vertical stack of sections by its chunk coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkColumnKey {
    /// Chunk x coordinate (world x divided by 16).
    pub x: i32,
    /// Chunk z coordinate (world z divided by 16).
    pub z: i32,
}

impl ChunkColumnKey {
    /// Creates a column key from chunk coordinates.
    pub fn new(x: i32, z: i32) -> Self {
        ChunkColumnKey { x, z }
    }

    /// Returns the column containing the given world position.
    pub fn containing(pos: Point3<i32>) -> Self {
        ChunkColumnKey {
            x: pos.x.div_euclid(SECTION_SIZE),
            z: pos.z.div_euclid(SECTION_SIZE),
        }
    }

    /// World-space position of the column's minimum corner in the XZ plane.
    pub fn world_origin(&self) -> Point2<i32> {
        Point2::new(self.x * SECTION_SIZE, self.z * SECTION_SIZE)
    }
}

/// How a section's geometry should treat simple full-cube blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstancingMode {
    /// All blocks are emitted as per-vertex mesh geometry.
    #[default]
    Disabled,
    /// Full-cube non-composite blocks are emitted as instance placements
    /// instead of vertex data.
    Enabled,
}

/// Immutable geometry produced by a worker for one section.
///
/// Ownership transfers to the orchestrator when the result is emitted; the
/// worker never touches a result after sending it.
#[derive(Clone, Debug, Default)]
pub struct GeometryOutput {
    /// Vertex positions, three floats per vertex.
    pub positions: Vec<f32>,
    /// Vertex normals, three floats per vertex.
    pub normals: Vec<f32>,
    /// Vertex colors, three floats per vertex.
    pub colors: Vec<f32>,
    /// Texture coordinates, two floats per vertex.
    pub uvs: Vec<f32>,
    /// Triangle indices into the vertex attributes.
    pub indices: Vec<u32>,
    /// Per-position sign metadata keyed by an encoded block position.
    pub signs: HashMap<String, serde_json::Value>,
    /// Instanced-block placements: block state id to world positions.
    pub instanced: HashMap<u32, Vec<[f32; 3]>>,
    /// True when the build hit recoverable errors; the result is still
    /// applied (a visibly wrong section beats a permanently missing one).
    pub had_errors: bool,
}

impl GeometryOutput {
    /// Number of vertices carried by the position attribute.
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }
}

/// Messages sent from the orchestrator to a mesher worker.
#[derive(Clone, Debug)]
pub enum ToWorker {
    /// Static game and model reference data, sent once (or on version
    /// change). Moves a fresh worker out of `Uninitialized`.
    GameData {
        /// Opaque game data consumed by the geometry builder.
        data: serde_json::Value,
    },
    /// Block-state models, atlas metadata and output format. Receiving this
    /// after `GameData` flips the worker to `Ready`.
    MesherData {
        /// Resolved block-state model table.
        models: serde_json::Value,
        /// Texture atlas metadata.
        atlas: serde_json::Value,
    },
    /// Mark (`added == true`) or unmark a section dirty.
    Dirty {
        /// World x of the affected position.
        x: i32,
        /// World y of the affected position.
        y: i32,
        /// World z of the affected position.
        z: i32,
        /// Whether the section is being marked (true) or dropped (false).
        added: bool,
        /// Instancing mode the rebuild should use.
        mode: InstancingMode,
    },
    /// Add a chunk column to the worker's local cache.
    Chunk {
        /// Chunk x coordinate.
        x: i32,
        /// Chunk z coordinate.
        z: i32,
        /// The column's section data.
        column: crate::world::ChunkColumn,
        /// Optional per-column custom block model overrides.
        custom_block_models: Option<serde_json::Value>,
    },
    /// Remove a chunk column from the worker's local cache.
    UnloadChunk {
        /// Chunk x coordinate.
        x: i32,
        /// Chunk z coordinate.
        z: i32,
    },
    /// Apply a single-block change to the local cache.
    BlockUpdate {
        /// World position of the changed block.
        pos: Point3<i32>,
        /// New block state id.
        state_id: u16,
        /// Custom block model overrides for the block's column.
        custom_block_models: Option<serde_json::Value>,
    },
    /// Clear all worker state (caches, dirty set, readiness data stays).
    Reset,
    /// Query the custom block model at a position; answered with
    /// [`FromWorker::CustomBlockModel`].
    GetCustomBlockModel {
        /// World position to query.
        pos: Point3<i32>,
    },
    /// Query a column's heightmap; answered with [`FromWorker::Heightmap`].
    GetHeightmap {
        /// Chunk x coordinate.
        x: i32,
        /// Chunk z coordinate.
        z: i32,
    },
}

/// Messages sent from a mesher worker back to the orchestrator.
#[derive(Clone, Debug)]
pub enum FromWorker {
    /// A rebuilt section's geometry.
    Geometry {
        /// The section the geometry belongs to.
        key: SectionKey,
        /// The produced buffers and metadata.
        geometry: GeometryOutput,
        /// Index of the producing worker.
        worker_index: usize,
    },
    /// One completion event per coalesced dirty mark for a section.
    SectionFinished {
        /// The section that finished processing.
        key: SectionKey,
        /// Index of the producing worker.
        worker_index: usize,
        /// Milliseconds spent building, when a build actually ran.
        process_time_ms: Option<f64>,
    },
    /// Newly discovered block-state model metadata; each cache key is
    /// reported at most once per worker lifetime.
    BlockStateModelInfo {
        /// Cache key to model metadata.
        info: HashMap<String, serde_json::Value>,
    },
    /// Response to [`ToWorker::GetHeightmap`].
    Heightmap {
        /// Chunk x coordinate.
        x: i32,
        /// Chunk z coordinate.
        z: i32,
        /// Highest non-empty block y per column cell, row-major 16x16.
        heights: Vec<i32>,
    },
    /// Response to [`ToWorker::GetCustomBlockModel`].
    CustomBlockModel {
        /// The queried world position.
        pos: Point3<i32>,
        /// The model override, if any.
        model: Option<serde_json::Value>,
    },
}

/// A message delivery that is either a single message or an ordered batch.
///
/// Both forms are legal on every channel in the pipeline; receivers unpack
/// envelopes through iteration so the distinction never leaks further.
#[derive(Clone, Debug)]
pub enum MessageEnvelope<T> {
    /// One message on its own.
    Single(T),
    /// Several messages delivered together, in order.
    Batch(Vec<T>),
}

impl<T> MessageEnvelope<T> {
    /// Wraps a batch, collapsing one-element batches into `Single`.
    pub fn from_batch(mut messages: Vec<T>) -> Self {
        if messages.len() == 1 {
            MessageEnvelope::Single(messages.pop().expect("len checked"))
        } else {
            MessageEnvelope::Batch(messages)
        }
    }

    /// Number of messages carried.
    pub fn len(&self) -> usize {
        match self {
            MessageEnvelope::Single(_) => 1,
            MessageEnvelope::Batch(messages) => messages.len(),
        }
    }

    /// True when the envelope carries no messages (an empty batch).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> IntoIterator for MessageEnvelope<T> {
    type Item = T;
    type IntoIter = EnvelopeIter<T>;

    fn into_iter(self) -> EnvelopeIter<T> {
        match self {
            MessageEnvelope::Single(message) => EnvelopeIter::Single(Some(message)),
            MessageEnvelope::Batch(messages) => EnvelopeIter::Batch(messages.into_iter()),
        }
    }
}

/// Iterator over the messages of a [`MessageEnvelope`].
pub enum EnvelopeIter<T> {
    /// Iterator state for a single message.
    Single(Option<T>),
    /// Iterator state for a batch.
    Batch(std::vec::IntoIter<T>),
}

impl<T> Iterator for EnvelopeIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self {
            EnvelopeIter::Single(message) => message.take(),
            EnvelopeIter::Batch(messages) => messages.next(),
        }
    }
}
