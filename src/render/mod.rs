//! # Render Resources
//!
//! GPU-facing resource management for the streaming pipeline: the
//! [`MeshBuffers`] abstraction over per-section attribute storage, the
//! bounded [`MeshPool`](mesh_pool::MeshPool) that reuses those buffers across
//! sections, and the [`InstancedBlockRenderer`](instanced::InstancedBlockRenderer)
//! that batches simple full-cube blocks as per-instance transforms.
//!
//! Workers never touch these types; they produce plain data buffers and the
//! orchestrator thread is the only mutator, so nothing here needs locking.

use crate::protocol::GeometryOutput;

mod instanced;
mod mesh_pool;

pub use instanced::{InstanceBatch, InstancedBlockRenderer};
pub use mesh_pool::{MeshPool, MeshPoolEntry, MeshPoolStats};

/// Vertex attribute channels stored per pooled mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeChannel {
    /// Vertex positions, 12 bytes per vertex.
    Position,
    /// Vertex normals, 12 bytes per vertex.
    Normal,
    /// Vertex colors, 12 bytes per vertex.
    Color,
    /// Texture coordinates, 8 bytes per vertex.
    Uv,
    /// Triangle indices, 4 bytes per element.
    Index,
}

impl AttributeChannel {
    /// All channels, in upload order.
    pub const ALL: [AttributeChannel; 5] = [
        AttributeChannel::Position,
        AttributeChannel::Normal,
        AttributeChannel::Color,
        AttributeChannel::Uv,
        AttributeChannel::Index,
    ];

    /// Bytes one vertex (or index element) occupies in this channel.
    pub fn bytes_per_element(&self) -> usize {
        match self {
            AttributeChannel::Position
            | AttributeChannel::Normal
            | AttributeChannel::Color => 3 * std::mem::size_of::<f32>(),
            AttributeChannel::Uv => 2 * std::mem::size_of::<f32>(),
            AttributeChannel::Index => std::mem::size_of::<u32>(),
        }
    }
}

/// The consumed GPU buffer abstraction.
///
/// The pipeline does not define any rendering-API specifics; it only needs
/// to allocate attribute storage once, rewrite it cheaply on reuse, and
/// dispose of it on pool shrink. Applications implement this over their
/// actual GPU backend; [`AttributeStore`] is the CPU-backed implementation
/// used by tests and headless consumers.
pub trait MeshBuffers {
    /// Allocates storage sized for `vertex_capacity` vertices (indices get
    /// 1.5x that many elements, the usual quad ratio).
    fn allocate(vertex_capacity: usize) -> Self;

    /// Overwrites one attribute channel with raw bytes.
    fn write_attribute(&mut self, channel: AttributeChannel, data: &[u8]);

    /// Clears written contents without deallocating the storage.
    fn clear(&mut self);

    /// Releases the underlying storage; the buffer is dead afterwards.
    fn dispose(&mut self);

    /// Estimated byte footprint of one channel's allocation.
    fn allocated_bytes(&self, channel: AttributeChannel) -> usize;
}

/// Writes a [`GeometryOutput`]'s vertex data into a mesh buffer, channel by
/// channel. Instanced placements and sign metadata are not part of the mesh
/// and are handled by their own components.
pub fn write_geometry<M: MeshBuffers>(buffers: &mut M, geometry: &GeometryOutput) {
    buffers.write_attribute(
        AttributeChannel::Position,
        bytemuck::cast_slice(&geometry.positions),
    );
    buffers.write_attribute(
        AttributeChannel::Normal,
        bytemuck::cast_slice(&geometry.normals),
    );
    buffers.write_attribute(
        AttributeChannel::Color,
        bytemuck::cast_slice(&geometry.colors),
    );
    buffers.write_attribute(AttributeChannel::Uv, bytemuck::cast_slice(&geometry.uvs));
    buffers.write_attribute(
        AttributeChannel::Index,
        bytemuck::cast_slice(&geometry.indices),
    );
}

/// CPU-backed [`MeshBuffers`] implementation.
///
/// Storage is allocated once at pool-growth time and only ever truncated on
/// [`clear`](MeshBuffers::clear), so reuse never reallocates.
#[derive(Debug, Default)]
pub struct AttributeStore {
    positions: Vec<u8>,
    normals: Vec<u8>,
    colors: Vec<u8>,
    uvs: Vec<u8>,
    indices: Vec<u8>,
}

impl AttributeStore {
    fn channel_mut(&mut self, channel: AttributeChannel) -> &mut Vec<u8> {
        match channel {
            AttributeChannel::Position => &mut self.positions,
            AttributeChannel::Normal => &mut self.normals,
            AttributeChannel::Color => &mut self.colors,
            AttributeChannel::Uv => &mut self.uvs,
            AttributeChannel::Index => &mut self.indices,
        }
    }

    fn channel(&self, channel: AttributeChannel) -> &Vec<u8> {
        match channel {
            AttributeChannel::Position => &self.positions,
            AttributeChannel::Normal => &self.normals,
            AttributeChannel::Color => &self.colors,
            AttributeChannel::Uv => &self.uvs,
            AttributeChannel::Index => &self.indices,
        }
    }

    /// Currently written bytes of one channel.
    pub fn written_bytes(&self, channel: AttributeChannel) -> usize {
        self.channel(channel).len()
    }
}

impl MeshBuffers for AttributeStore {
    fn allocate(vertex_capacity: usize) -> Self {
        let mut store = AttributeStore::default();
        for channel in AttributeChannel::ALL {
            let elements = match channel {
                AttributeChannel::Index => vertex_capacity * 3 / 2,
                _ => vertex_capacity,
            };
            store
                .channel_mut(channel)
                .reserve_exact(elements * channel.bytes_per_element());
        }
        store
    }

    fn write_attribute(&mut self, channel: AttributeChannel, data: &[u8]) {
        let storage = self.channel_mut(channel);
        storage.clear();
        storage.extend_from_slice(data);
    }

    fn clear(&mut self) {
        for channel in AttributeChannel::ALL {
            self.channel_mut(channel).clear();
        }
    }

    fn dispose(&mut self) {
        for channel in AttributeChannel::ALL {
            *self.channel_mut(channel) = Vec::new();
        }
    }

    fn allocated_bytes(&self, channel: AttributeChannel) -> usize {
        self.channel(channel).capacity()
    }
}
