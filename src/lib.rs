#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Voxel Streamer
//!
//! A chunk streaming and meshing pipeline for voxel worlds: background
//! workers rebuild dirty 16x16x16 sections while the orchestrator keeps a
//! bounded pool of mesh buffers and per-block-type instance batches in sync
//! with whatever geometry arrives.
//!
//! ## Key Modules
//!
//! * `protocol` - Message and key types exchanged between the orchestrator
//!   and the workers
//! * `world` - Sparse section/column storage backing each worker's private
//!   voxel cache
//! * `mesher` - The worker state machine and its thread/channel loop
//! * `pipeline` - The orchestrator: dirty tracking, routing, batching,
//!   debouncing and the per-frame update loop
//! * `render` - The mesh buffer abstraction, the bounded mesh pool, and the
//!   instanced-block batches
//!
//! ## Architecture
//!
//! Workers share no memory with the orchestrator or each other. Every
//! interaction crosses a channel as a [`protocol::MessageEnvelope`], either a
//! single message or an ordered batch; both directions batch aggressively.
//! Dirty marks route deterministically by section coordinates so repeat
//! marks for one section always coalesce on the same worker, and every mark
//! is balanced by exactly one completion event.
//!
//! The geometry algorithm itself lives behind the
//! [`mesher::GeometryBuilder`] trait, and GPU buffers behind
//! [`render::MeshBuffers`]; the pipeline orchestrates both without knowing
//! either's internals.
//!
//! ## Usage
//!
//! ```no_run
//! use voxel_streamer::{ChunkStreamer, StreamerConfig};
//! # fn builder(_: usize) -> Box<dyn voxel_streamer::GeometryBuilder> { unimplemented!() }
//!
//! let mut streamer: ChunkStreamer = ChunkStreamer::new(StreamerConfig::default(), builder);
//! streamer.configure(
//!     serde_json::json!({}),
//!     serde_json::json!({}),
//!     serde_json::json!({}),
//! );
//! loop {
//!     // load/unload columns, apply block updates ...
//!     streamer.update();
//! }
//! ```

pub mod config;
pub mod mesher;
pub mod pipeline;
pub mod protocol;
pub mod render;
pub mod world;

pub use config::StreamerConfig;
pub use mesher::{GeometryBuilder, MesherWorker, WorkerReadiness};
pub use pipeline::{ChunkStreamer, StreamerEvents, StreamerStats};
pub use protocol::{
    ChunkColumnKey, FromWorker, GeometryOutput, InstancingMode, MessageEnvelope, SectionKey,
    ToWorker,
};
pub use render::{AttributeChannel, AttributeStore, MeshBuffers, MeshPool};
pub use world::{ChunkColumn, LocalWorld, Section};
