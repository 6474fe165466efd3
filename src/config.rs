//! # Streamer Configuration
//!
//! Tuning knobs for the chunk streaming pipeline, gathered into a single
//! struct so that applications (and tests) can tighten or loosen timings
//! without touching the components themselves.
//!
//! The defaults reflect interactive use: a 50ms worker rebuild tick, a 30ms
//! inbound drain budget per frame, and a 200ms debounce window for bursty
//! chunk-column loads.

use web_time::Duration;

/// Configuration for a [`ChunkStreamer`](crate::pipeline::ChunkStreamer) and
/// the worker pool it owns.
///
/// # Examples
///
/// ```
/// use voxel_streamer::StreamerConfig;
///
/// let config = StreamerConfig {
///     worker_count: 4,
///     view_distance: 8,
///     ..StreamerConfig::default()
/// };
/// assert_eq!(config.worker_count, 4);
/// ```
#[derive(Clone, Debug)]
pub struct StreamerConfig {
    /// Number of mesher workers to spawn. Worker 0 is reserved as the
    /// overflow lane for rerouted dirty marks, so at least 2 are required.
    pub worker_count: usize,
    /// Interval between dirty-section rebuild passes on each worker.
    pub tick_interval: Duration,
    /// Wall-clock budget for draining worker messages in one frame.
    pub drain_budget: Duration,
    /// When enabled and the previous frame ran long, the inbound drain
    /// defers one extra frame before starting (latency for frame stability).
    pub smooth_loading: bool,
    /// Frame duration above which smooth loading kicks in.
    pub slow_frame_threshold: Duration,
    /// Window within which `add_column` calls coalesce into one dispatch.
    pub debounce_window: Duration,
    /// View distance in chunk columns, drives mesh pool sizing.
    pub view_distance: u32,
    /// Average number of non-empty sections per column, for the pool's
    /// minimum size target.
    pub avg_sections_per_column: u32,
    /// Maximum number of sections a column can hold vertically, for the
    /// pool's hard ceiling.
    pub max_sections_per_column: u32,
    /// Number of entries added per mesh pool growth step.
    pub pool_growth_increment: usize,
    /// Vertex capacity preallocated per pooled mesh.
    pub pool_vertex_capacity: usize,
    /// Outbound messages accumulated per worker before a forced flush.
    pub max_batch_len: usize,
    /// Instance capacity of each per-block-type batch.
    pub instance_capacity: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        StreamerConfig {
            worker_count: 4,
            tick_interval: Duration::from_millis(50),
            drain_budget: Duration::from_millis(30),
            smooth_loading: false,
            slow_frame_threshold: Duration::from_millis(30),
            debounce_window: Duration::from_millis(200),
            view_distance: 8,
            avg_sections_per_column: 5,
            max_sections_per_column: 24,
            pool_growth_increment: 64,
            pool_vertex_capacity: 4096,
            max_batch_len: 512,
            instance_capacity: 65536,
        }
    }
}

impl StreamerConfig {
    /// Number of chunk columns inside a view distance, used to derive the
    /// mesh pool's size limits.
    pub fn columns_in_view(view_distance: u32) -> usize {
        let d = view_distance as usize * 2 + 1;
        d * d
    }
}
