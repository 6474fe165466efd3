//! # Streaming Pipeline
//!
//! The orchestrator half of the chunk streaming pipeline. A
//! [`ChunkStreamer`] owns the worker pool, the dirty-section bookkeeping,
//! the mesh pool and the instanced batches, and advances everything once per
//! frame from [`ChunkStreamer::update`].
//!
//! ## Frame Loop
//!
//! Each update dispatches debounced column loads, drains worker results
//! under a wall-clock budget, applies geometry to pooled buffers, and
//! finally flushes the outbound batches accumulated during the frame. All
//! mutation happens on the calling thread; workers only ever see protocol
//! messages.
//!
//! ## Completion Accounting
//!
//! Every dirty mark increments a per-section pending count and every
//! [`FromWorker::SectionFinished`] decrements it. A chunk column is reported
//! finished exactly when its last waiting section settles. Results for
//! columns that unloaded mid-flight are discarded silently; the unload
//! itself already settled their counts.

use std::collections::{HashMap, HashSet};

use cgmath::Point3;
use log::{debug, info, warn};
use web_time::{Duration, Instant};

use crate::config::StreamerConfig;
use crate::mesher::GeometryBuilder;
use crate::protocol::{
    ChunkColumnKey, FromWorker, GeometryOutput, InstancingMode, SectionKey, ToWorker,
    SECTION_SIZE,
};
use crate::render::{
    write_geometry, AttributeStore, InstancedBlockRenderer, MeshBuffers, MeshPool,
    MeshPoolStats,
};
use crate::world::ChunkColumn;

mod debounce;
mod dirty_tracker;
mod inbound;
mod worker_pool;

pub use debounce::{ChunkLoadDebouncer, PendingColumnLoad};
pub use dirty_tracker::{DirtySectionTracker, FinishOutcome};
pub use inbound::InboundQueue;
pub use worker_pool::{worker_for, OutboundBatcher, WorkerPool};

/// Callbacks the streamer fires as the world changes shape.
///
/// All hooks are optional; unset hooks cost one branch. They are invoked on
/// the orchestrator thread during [`ChunkStreamer::update`].
#[derive(Default)]
pub struct StreamerEvents {
    on_column_loaded: Option<Box<dyn FnMut(ChunkColumnKey)>>,
    on_column_finished: Option<Box<dyn FnMut(ChunkColumnKey)>>,
    on_section_invalidated: Option<Box<dyn FnMut(SectionKey)>>,
    on_section_applied: Option<Box<dyn FnMut(SectionKey, &GeometryOutput)>>,
    on_model_info: Option<Box<dyn FnMut(&HashMap<String, serde_json::Value>)>>,
    on_heightmap: Option<Box<dyn FnMut(i32, i32, Vec<i32>)>>,
    on_custom_block_model: Option<Box<dyn FnMut(Point3<i32>, Option<serde_json::Value>)>>,
}

/// Cumulative orchestrator counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamerStats {
    /// Geometry results written into pooled buffers.
    pub sections_applied: u64,
    /// Geometry results dropped because their column had unloaded.
    pub stale_discarded: u64,
    /// Applied results whose build reported recoverable errors.
    pub errored_sections: u64,
    /// Block updates deferred until their column's pending load dispatched.
    pub updates_deferred: u64,
    /// Chunk columns dispatched to the workers.
    pub columns_dispatched: u64,
    /// Total build time the workers reported, in milliseconds.
    pub build_time_ms: f64,
}

struct DeferredBlockUpdate {
    pos: Point3<i32>,
    state_id: u16,
    custom_block_models: Option<serde_json::Value>,
}

/// The chunk streaming orchestrator.
///
/// Owns the mesher workers, routes dirty marks to them, and turns their
/// results into bound mesh-pool buffers and instanced batches. Generic over
/// the mesh buffer backend; headless consumers and tests use the default
/// CPU-backed [`AttributeStore`].
pub struct ChunkStreamer<M: MeshBuffers = AttributeStore> {
    config: StreamerConfig,
    workers: WorkerPool,
    inbound: InboundQueue,
    tracker: DirtySectionTracker,
    debouncer: ChunkLoadDebouncer,
    mesh_pool: MeshPool<M>,
    instanced: InstancedBlockRenderer,
    events: StreamerEvents,
    stats: StreamerStats,
    instancing_mode: InstancingMode,

    loaded_columns: HashSet<ChunkColumnKey>,
    /// Waiting-section count per column, for column-finished detection.
    column_waiting: HashMap<ChunkColumnKey, usize>,
    finished_columns: HashSet<ChunkColumnKey>,
    /// Which worker currently holds each in-flight key, so repeat marks and
    /// unmarks follow the first routing decision.
    in_flight: HashMap<SectionKey, usize>,
    /// Sections whose geometry has been applied, grouped by column for
    /// release on unload.
    applied_sections: HashMap<ChunkColumnKey, HashSet<SectionKey>>,
    /// Block updates held back while their column's load sits in the
    /// debounce window.
    deferred_updates: Vec<DeferredBlockUpdate>,
    /// Model-info cache keys already surfaced to the application. Workers
    /// deduplicate per worker; this set deduplicates across them.
    seen_model_info: HashSet<String>,
    last_update: Option<Instant>,
}

impl<M: MeshBuffers> ChunkStreamer<M> {
    /// Spawns the worker pool and assembles the pipeline around it.
    ///
    /// `builder_factory` is called once per worker with the worker's index.
    pub fn new(
        config: StreamerConfig,
        builder_factory: impl Fn(usize) -> Box<dyn GeometryBuilder>,
    ) -> Self {
        let (workers, results) = WorkerPool::spawn(&config, builder_factory);
        info!(
            "chunk streamer starting with {} workers, view distance {}",
            workers.worker_count(),
            config.view_distance
        );

        ChunkStreamer {
            mesh_pool: MeshPool::new(&config),
            instanced: InstancedBlockRenderer::new(config.instance_capacity),
            debouncer: ChunkLoadDebouncer::new(config.debounce_window),
            inbound: InboundQueue::new(results),
            tracker: DirtySectionTracker::new(),
            events: StreamerEvents::default(),
            stats: StreamerStats::default(),
            instancing_mode: InstancingMode::default(),
            loaded_columns: HashSet::new(),
            column_waiting: HashMap::new(),
            finished_columns: HashSet::new(),
            in_flight: HashMap::new(),
            applied_sections: HashMap::new(),
            deferred_updates: Vec::new(),
            seen_model_info: HashSet::new(),
            last_update: None,
            workers,
            config,
        }
    }

    /// Sends game and mesher configuration to every worker, moving them to
    /// their ready state. Must happen before any column is loaded; work
    /// arriving at an unconfigured worker is dropped there.
    pub fn configure(
        &mut self,
        game_data: serde_json::Value,
        models: serde_json::Value,
        atlas: serde_json::Value,
    ) {
        self.workers.broadcast(ToWorker::GameData { data: game_data });
        self.workers.broadcast(ToWorker::MesherData { models, atlas });
        self.workers.flush();
    }

    /// Selects how subsequent rebuilds treat simple full-cube blocks.
    pub fn set_instancing_mode(&mut self, mode: InstancingMode) {
        self.instancing_mode = mode;
    }

    /// Updates the view distance, letting the mesh pool grow ahead of the
    /// larger working set.
    pub fn set_view_distance(&mut self, view_distance: u32) {
        self.config.view_distance = view_distance;
        self.mesh_pool.set_view_distance(view_distance);
    }

    /// Queues a chunk column for loading. Loads arriving within the
    /// debounce window dispatch together on a later [`update`].
    ///
    /// [`update`]: ChunkStreamer::update
    pub fn add_column(
        &mut self,
        key: ChunkColumnKey,
        column: ChunkColumn,
        custom_block_models: Option<serde_json::Value>,
    ) {
        self.debouncer.queue_load(
            PendingColumnLoad { key, column, custom_block_models },
            Instant::now(),
        );
    }

    /// Unloads a chunk column: cancels any pending load, tells the workers
    /// to drop their caches, settles outstanding completions, and releases
    /// the column's mesh buffers and instances.
    pub fn remove_column(&mut self, key: ChunkColumnKey) {
        if self.debouncer.cancel(key) {
            debug!("column {key:?} unloaded before its debounced load dispatched");
        }
        self.deferred_updates
            .retain(|update| ChunkColumnKey::containing(update.pos) != key);
        if !self.loaded_columns.remove(&key) {
            return;
        }

        self.workers.broadcast(ToWorker::UnloadChunk { x: key.x, z: key.z });

        for section in self.tracker.waiting_keys_in_column(key) {
            self.in_flight.remove(&section);
        }
        self.tracker.remove_column(key);
        self.column_waiting.remove(&key);
        self.finished_columns.remove(&key);

        if let Some(sections) = self.applied_sections.remove(&key) {
            for section in sections {
                self.mesh_pool.release(section);
                self.instanced.remove_section_instances(section);
            }
        }
    }

    /// Applies a single-block change.
    ///
    /// While the block's column sits in the debounce window the update is
    /// deferred and replayed right after the column dispatches; otherwise it
    /// goes straight to the workers and the affected sections (the block's
    /// own, plus face-adjacent neighbors when the block lies on a section
    /// boundary) are marked dirty.
    pub fn set_block_state_id(
        &mut self,
        pos: Point3<i32>,
        state_id: u16,
        custom_block_models: Option<serde_json::Value>,
    ) {
        if self.debouncer.is_pending(ChunkColumnKey::containing(pos)) {
            self.stats.updates_deferred += 1;
            self.deferred_updates.push(DeferredBlockUpdate {
                pos,
                state_id,
                custom_block_models,
            });
            return;
        }
        self.apply_block_update(pos, state_id, custom_block_models);
    }

    fn apply_block_update(
        &mut self,
        pos: Point3<i32>,
        state_id: u16,
        custom_block_models: Option<serde_json::Value>,
    ) {
        self.workers.broadcast(ToWorker::BlockUpdate {
            pos,
            state_id,
            custom_block_models,
        });
        for key in sections_touched_by(pos) {
            self.mark_section_dirty(key, false);
        }
    }

    /// Marks one section for rebuild.
    ///
    /// Repeat marks for an in-flight key follow its original routing so a
    /// single worker coalesces them; `avoid_collision` requests the
    /// overflow lane for keys that are not in flight.
    pub fn mark_section_dirty(&mut self, key: SectionKey, avoid_collision: bool) {
        if let Some(hook) = self.events.on_section_invalidated.as_mut() {
            hook(key);
        }
        let column = key.column();
        if !self.loaded_columns.contains(&column) {
            debug!("dirty mark for {key:?} ignored: column not loaded");
            return;
        }

        let worker = match self.in_flight.get(&key) {
            Some(&worker) => worker,
            None => self.workers.route(key, avoid_collision, false),
        };
        if self.tracker.mark_pending(key) {
            *self.column_waiting.entry(column).or_insert(0) += 1;
            self.finished_columns.remove(&column);
        }
        self.in_flight.insert(key, worker);

        let origin = key.origin();
        self.workers.queue(
            worker,
            ToWorker::Dirty {
                x: origin.x,
                y: origin.y,
                z: origin.z,
                added: true,
                mode: self.instancing_mode,
            },
        );
    }

    /// Withdraws a section's outstanding rebuilds, consuming every pending
    /// completion at once.
    pub fn unmark_section(&mut self, key: SectionKey) {
        if let Some(worker) = self.in_flight.remove(&key) {
            let origin = key.origin();
            self.workers.queue(
                worker,
                ToWorker::Dirty {
                    x: origin.x,
                    y: origin.y,
                    z: origin.z,
                    added: false,
                    mode: self.instancing_mode,
                },
            );
        }
        if self.tracker.settle(key) > 0 {
            self.column_settled(key.column());
        }
    }

    /// Asks the worker caching the column for its heightmap; the response
    /// arrives through [`StreamerEvents`] on a later update.
    pub fn request_heightmap(&mut self, x: i32, z: i32) {
        let worker = self.query_worker(x, z);
        self.workers.queue(worker, ToWorker::GetHeightmap { x, z });
    }

    /// Asks for the custom block model at a position, if any.
    pub fn request_custom_block_model(&mut self, pos: Point3<i32>) {
        let column = ChunkColumnKey::containing(pos);
        let worker = self.query_worker(column.x, column.z);
        self.workers.queue(worker, ToWorker::GetCustomBlockModel { pos });
    }

    /// Every worker caches every column, so queries can go to any non-
    /// overflow worker; spreading them by column coordinates avoids
    /// serializing all queries behind one worker's tick.
    fn query_worker(&self, x: i32, z: i32) -> usize {
        (x + z).rem_euclid(self.workers.worker_count() as i32 - 1) as usize + 1
    }

    /// Advances the pipeline by one frame.
    ///
    /// Dispatches due column loads, drains worker results under the
    /// configured wall-clock budget, and flushes outbound batches. Returns
    /// the number of worker messages processed.
    pub fn update(&mut self) -> usize {
        let now = Instant::now();
        let slow_frame = self
            .last_update
            .is_some_and(|last| now - last > self.config.slow_frame_threshold);
        self.last_update = Some(now);

        self.dispatch_loads(now);

        let mut processed = 0;
        let skip_drain = self.config.smooth_loading && self.inbound.maybe_defer(slow_frame);
        if !skip_drain {
            self.inbound.pump();
            let deadline = Instant::now() + self.config.drain_budget;
            while let Some(message) = self.inbound.pop() {
                self.handle_from_worker(message);
                processed += 1;
                if Instant::now() >= deadline {
                    break;
                }
            }
            if self.inbound.has_backlog() {
                debug!(
                    "drain budget spent, {} messages carried to next frame",
                    self.inbound.backlog_len()
                );
            }
        }

        self.workers.flush();
        processed
    }

    fn dispatch_loads(&mut self, now: Instant) {
        let ready = self.debouncer.take_ready(now);
        if ready.is_empty() {
            return;
        }
        debug!("dispatching {} debounced column loads", ready.len());

        for load in ready {
            let key = load.key;
            let section_ys: Vec<i32> = load.column.section_ys().collect();
            self.loaded_columns.insert(key);
            self.stats.columns_dispatched += 1;
            self.workers.broadcast(ToWorker::Chunk {
                x: key.x,
                z: key.z,
                column: load.column,
                custom_block_models: load.custom_block_models,
            });

            let origin = key.world_origin();
            for section_y in &section_ys {
                self.mark_section_dirty(
                    SectionKey { x: origin.x, y: *section_y, z: origin.y },
                    false,
                );
            }

            let deferred: Vec<DeferredBlockUpdate> = {
                let (matching, rest) = std::mem::take(&mut self.deferred_updates)
                    .into_iter()
                    .partition(|update| ChunkColumnKey::containing(update.pos) == key);
                self.deferred_updates = rest;
                matching
            };
            for update in deferred {
                self.apply_block_update(update.pos, update.state_id, update.custom_block_models);
            }

            if let Some(hook) = self.events.on_column_loaded.as_mut() {
                hook(key);
            }
            // A column with no stored sections has nothing to wait for.
            if section_ys.is_empty() {
                self.finished_columns.insert(key);
                if let Some(hook) = self.events.on_column_finished.as_mut() {
                    hook(key);
                }
            }
        }
    }

    fn handle_from_worker(&mut self, message: FromWorker) {
        match message {
            FromWorker::Geometry { key, geometry, worker_index } => {
                if !self.loaded_columns.contains(&key.column()) {
                    // The column unloaded while the build was in flight.
                    self.stats.stale_discarded += 1;
                    return;
                }
                self.apply_geometry(key, geometry, worker_index);
            }
            FromWorker::SectionFinished { key, process_time_ms, .. } => {
                if let Some(ms) = process_time_ms {
                    self.stats.build_time_ms += ms;
                }
                // Liveness is column-granular, not per load epoch: a finish
                // emitted before an unload counts toward the key's current
                // pending count if the column has reloaded and re-marked it.
                // Keys the reloaded column no longer carries keep the
                // tracker's discard grace instead.
                if !self.loaded_columns.contains(&key.column()) {
                    // Settled already by the unload; not an accounting error.
                    return;
                }
                match self.tracker.on_finished(key) {
                    FinishOutcome::Settled => {
                        self.in_flight.remove(&key);
                        self.column_settled(key.column());
                    }
                    FinishOutcome::StillWaiting
                    | FinishOutcome::Discarded
                    | FinishOutcome::Unexpected => {}
                }
            }
            FromWorker::BlockStateModelInfo { info } => {
                let fresh: HashMap<String, serde_json::Value> = info
                    .into_iter()
                    .filter(|(cache_key, _)| self.seen_model_info.insert(cache_key.clone()))
                    .collect();
                if !fresh.is_empty() {
                    if let Some(hook) = self.events.on_model_info.as_mut() {
                        hook(&fresh);
                    }
                }
            }
            FromWorker::Heightmap { x, z, heights } => {
                if let Some(hook) = self.events.on_heightmap.as_mut() {
                    hook(x, z, heights);
                }
            }
            FromWorker::CustomBlockModel { pos, model } => {
                if let Some(hook) = self.events.on_custom_block_model.as_mut() {
                    hook(pos, model);
                }
            }
        }
    }

    fn apply_geometry(&mut self, key: SectionKey, geometry: GeometryOutput, worker_index: usize) {
        if geometry.had_errors {
            // Still applied: a visibly wrong section beats a hole.
            self.stats.errored_sections += 1;
            warn!("section {key:?} built with errors on worker {worker_index}");
        }

        let entry = self.mesh_pool.acquire(key);
        write_geometry(&mut entry.buffers, &geometry);

        self.instanced.remove_section_instances(key);
        if !geometry.instanced.is_empty() {
            self.instanced.add_section_instances(key, &geometry.instanced);
        }

        self.applied_sections
            .entry(key.column())
            .or_default()
            .insert(key);
        self.stats.sections_applied += 1;

        if let Some(hook) = self.events.on_section_applied.as_mut() {
            hook(key, &geometry);
        }
    }

    fn column_settled(&mut self, column: ChunkColumnKey) {
        let Some(waiting) = self.column_waiting.get_mut(&column) else {
            return;
        };
        *waiting -= 1;
        if *waiting > 0 {
            return;
        }
        self.column_waiting.remove(&column);
        self.finished_columns.insert(column);
        if let Some(hook) = self.events.on_column_finished.as_mut() {
            hook(column);
        }
    }

    /// Drops all loaded state on both sides of the channel. Worker
    /// configuration survives, so the streamer is immediately usable.
    pub fn reset(&mut self) {
        self.workers.broadcast(ToWorker::Reset);
        self.workers.flush();
        self.inbound.clear();
        self.tracker.clear();
        self.loaded_columns.clear();
        self.column_waiting.clear();
        self.finished_columns.clear();
        self.in_flight.clear();
        self.deferred_updates.clear();
        self.seen_model_info.clear();

        for sections in std::mem::take(&mut self.applied_sections).into_values() {
            for section in sections {
                self.mesh_pool.release(section);
            }
        }
        self.instanced.clear();
        info!("chunk streamer reset");
    }

    /// Flushes outstanding messages and joins every worker thread.
    pub fn shutdown(self, grace: Duration) {
        self.workers.shutdown(grace);
    }

    /// Registers event hooks. Replaces any previously registered set.
    pub fn set_events(&mut self, events: StreamerEvents) {
        self.events = events;
    }

    /// True once every section of the column has settled since its load.
    pub fn is_column_finished(&self, key: ChunkColumnKey) -> bool {
        self.finished_columns.contains(&key)
    }

    /// True while the column is loaded (dispatched and not removed).
    pub fn is_column_loaded(&self, key: ChunkColumnKey) -> bool {
        self.loaded_columns.contains(&key)
    }

    /// Sections with outstanding completions.
    pub fn waiting_section_count(&self) -> usize {
        self.tracker.waiting_count()
    }

    /// Cumulative orchestrator counters.
    pub fn stats(&self) -> StreamerStats {
        self.stats
    }

    /// Cumulative mesh pool counters.
    pub fn mesh_pool_stats(&self) -> MeshPoolStats {
        self.mesh_pool.stats()
    }

    /// The mesh pool, for draw-time buffer access.
    pub fn mesh_pool(&self) -> &MeshPool<M> {
        &self.mesh_pool
    }

    /// The instanced batches, for draw-time instance access.
    pub fn instanced(&self) -> &InstancedBlockRenderer {
        &self.instanced
    }
}

impl StreamerEvents {
    /// Called when a column's debounced load dispatches to the workers.
    pub fn on_column_loaded(mut self, hook: impl FnMut(ChunkColumnKey) + 'static) -> Self {
        self.on_column_loaded = Some(Box::new(hook));
        self
    }

    /// Called when a column's last waiting section settles.
    pub fn on_column_finished(mut self, hook: impl FnMut(ChunkColumnKey) + 'static) -> Self {
        self.on_column_finished = Some(Box::new(hook));
        self
    }

    /// Called for every dirty mark before it is routed.
    pub fn on_section_invalidated(mut self, hook: impl FnMut(SectionKey) + 'static) -> Self {
        self.on_section_invalidated = Some(Box::new(hook));
        self
    }

    /// Called after a section's geometry lands in its pooled buffer.
    pub fn on_section_applied(
        mut self,
        hook: impl FnMut(SectionKey, &GeometryOutput) + 'static,
    ) -> Self {
        self.on_section_applied = Some(Box::new(hook));
        self
    }

    /// Called with newly discovered block-state model metadata.
    pub fn on_model_info(
        mut self,
        hook: impl FnMut(&HashMap<String, serde_json::Value>) + 'static,
    ) -> Self {
        self.on_model_info = Some(Box::new(hook));
        self
    }

    /// Called with heightmap query responses.
    pub fn on_heightmap(mut self, hook: impl FnMut(i32, i32, Vec<i32>) + 'static) -> Self {
        self.on_heightmap = Some(Box::new(hook));
        self
    }

    /// Called with custom-block-model query responses.
    pub fn on_custom_block_model(
        mut self,
        hook: impl FnMut(Point3<i32>, Option<serde_json::Value>) + 'static,
    ) -> Self {
        self.on_custom_block_model = Some(Box::new(hook));
        self
    }
}

/// The sections a block change invalidates: the block's own section plus
/// each face-adjacent neighbor when the block sits on that boundary.
fn sections_touched_by(pos: Point3<i32>) -> Vec<SectionKey> {
    let mut keys = vec![SectionKey::containing(pos)];
    let mut push = |neighbor: Point3<i32>| {
        let key = SectionKey::containing(neighbor);
        if !keys.contains(&key) {
            keys.push(key);
        }
    };

    if pos.x.rem_euclid(SECTION_SIZE) == 0 {
        push(Point3::new(pos.x - 1, pos.y, pos.z));
    } else if pos.x.rem_euclid(SECTION_SIZE) == SECTION_SIZE - 1 {
        push(Point3::new(pos.x + 1, pos.y, pos.z));
    }
    if pos.y.rem_euclid(SECTION_SIZE) == 0 {
        push(Point3::new(pos.x, pos.y - 1, pos.z));
    } else if pos.y.rem_euclid(SECTION_SIZE) == SECTION_SIZE - 1 {
        push(Point3::new(pos.x, pos.y + 1, pos.z));
    }
    if pos.z.rem_euclid(SECTION_SIZE) == 0 {
        push(Point3::new(pos.x, pos.y, pos.z - 1));
    } else if pos.z.rem_euclid(SECTION_SIZE) == SECTION_SIZE - 1 {
        push(Point3::new(pos.x, pos.y, pos.z + 1));
    }

    keys
}
