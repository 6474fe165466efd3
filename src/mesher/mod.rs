//! # Mesher Worker
//!
//! The worker half of the streaming pipeline. Each worker owns a private
//! voxel cache, consumes dirty/chunk/update messages, and periodically
//! rebuilds geometry for dirty sections on a fixed tick. Workers share no
//! memory with the orchestrator or each other; everything crosses the
//! boundary as protocol messages.
//!
//! ## State Machine
//!
//! A worker starts `Uninitialized`, moves to `AwaitingBaseData` on its first
//! configuration message, and becomes `Ready` once both game data and
//! block-state/atlas model data have arrived. While not ready, every other
//! message except `Reset` is ignored with a debug log. The orchestrator
//! always configures a worker before routing work at it, so this is a
//! startup ordering guard rather than a buffering layer.
//!
//! ## Completion Accounting
//!
//! Dirty marks carry a coalesced pending count. On every tick the worker
//! emits exactly `pending` [`FromWorker::SectionFinished`] events per dirty
//! key before clearing it, whether or not a geometry build actually ran.
//! This is the worker-side half of the dirty/finished balance invariant.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};

use cgmath::Point3;
use log::{debug, error};
use lru::LruCache;
use web_time::Instant;

use crate::protocol::{
    ChunkColumnKey, FromWorker, GeometryOutput, InstancingMode, SectionKey, ToWorker,
};
use crate::world::LocalWorld;

mod worker_thread;

pub use worker_thread::{spawn_worker, WorkerHandle};

/// Capacity of the derived block-model lookup cache.
const MODEL_CACHE_CAPACITY: usize = 4096;

/// The external geometry-building algorithm.
///
/// Face culling, ambient occlusion and UV layout live behind this seam; the
/// pipeline only orchestrates when builds run and what happens to their
/// results. The builder may use the provided LRU cache for computed
/// block-model lookups; the worker owns the cache and clears it when the
/// last column unloads.
pub trait GeometryBuilder: Send {
    /// Receives the game data plus block-state models and atlas metadata
    /// once both configuration messages have arrived, and again whenever
    /// either is resent (a version change).
    fn configure(
        &mut self,
        _game_data: &serde_json::Value,
        _models: &serde_json::Value,
        _atlas: &serde_json::Value,
    ) {
    }

    /// Builds the geometry for one section from the worker's local cache.
    fn build_section(
        &mut self,
        key: SectionKey,
        world: &LocalWorld,
        mode: InstancingMode,
        model_cache: &mut LruCache<String, serde_json::Value>,
    ) -> GeometryOutput;

    /// Drains block-state model metadata discovered since the last call,
    /// keyed by cache key. The worker deduplicates across its lifetime.
    fn take_model_info(&mut self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }
}

/// Readiness of a worker's configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerReadiness {
    /// No configuration received yet.
    Uninitialized,
    /// One of the two configuration messages has arrived.
    AwaitingBaseData,
    /// Both game data and mesher data are present; work is accepted.
    Ready,
}

#[derive(Clone, Copy, Debug)]
struct DirtyEntry {
    pending: u32,
    mode: InstancingMode,
}

/// A mesher worker's complete state, explicit and owned; no ambient
/// globals. [`spawn_worker`] threads one of these through a channel loop;
/// tests drive it directly.
pub struct MesherWorker {
    index: usize,
    world: LocalWorld,
    dirty: HashMap<SectionKey, DirtyEntry>,
    sent_model_info: HashSet<String>,
    model_cache: LruCache<String, serde_json::Value>,
    builder: Box<dyn GeometryBuilder>,
    game_data: Option<serde_json::Value>,
    models: Option<serde_json::Value>,
    atlas: Option<serde_json::Value>,
}

impl MesherWorker {
    /// Creates an unconfigured worker around a geometry builder.
    pub fn new(index: usize, builder: Box<dyn GeometryBuilder>) -> Self {
        MesherWorker {
            index,
            world: LocalWorld::new(),
            dirty: HashMap::new(),
            sent_model_info: HashSet::new(),
            model_cache: LruCache::new(
                NonZeroUsize::new(MODEL_CACHE_CAPACITY).expect("nonzero capacity"),
            ),
            builder,
            game_data: None,
            models: None,
            atlas: None,
        }
    }

    /// Current configuration state.
    pub fn readiness(&self) -> WorkerReadiness {
        match (&self.game_data, &self.models) {
            (None, None) => WorkerReadiness::Uninitialized,
            (Some(_), Some(_)) => WorkerReadiness::Ready,
            _ => WorkerReadiness::AwaitingBaseData,
        }
    }

    /// Hands the configuration payloads to the builder once both halves
    /// are present; resends reconfigure it.
    fn configure_builder(&mut self) {
        if let (Some(game_data), Some(models), Some(atlas)) =
            (&self.game_data, &self.models, &self.atlas)
        {
            self.builder.configure(game_data, models, atlas);
        }
    }

    fn is_ready(&self) -> bool {
        self.readiness() == WorkerReadiness::Ready
    }

    /// Number of keys currently marked dirty.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Loaded columns in the local cache.
    pub fn column_count(&self) -> usize {
        self.world.column_count()
    }

    /// Handles one message, returning any immediate responses.
    pub fn handle_message(&mut self, message: ToWorker) -> Vec<FromWorker> {
        match message {
            ToWorker::GameData { data } => {
                self.game_data = Some(data);
                self.configure_builder();
                Vec::new()
            }
            ToWorker::MesherData { models, atlas } => {
                self.models = Some(models);
                self.atlas = Some(atlas);
                self.configure_builder();
                Vec::new()
            }
            ToWorker::Reset => {
                // Configuration survives a reset so the orchestrator does
                // not have to resend game and model data.
                self.world.clear();
                self.dirty.clear();
                self.model_cache.clear();
                self.sent_model_info.clear();
                Vec::new()
            }
            other if !self.is_ready() => {
                debug!(
                    "worker {}: ignoring {:?} while {:?}",
                    self.index,
                    std::mem::discriminant(&other),
                    self.readiness()
                );
                Vec::new()
            }
            ToWorker::Dirty { x, y, z, added, mode } => {
                let key = SectionKey::containing(Point3::new(x, y, z));
                if added {
                    let entry = self
                        .dirty
                        .entry(key)
                        .or_insert(DirtyEntry { pending: 0, mode });
                    entry.pending += 1;
                    entry.mode = mode;
                } else {
                    // The orchestrator has already synthesized the
                    // completion; just drop the local entry.
                    self.dirty.remove(&key);
                }
                Vec::new()
            }
            ToWorker::Chunk { x, z, column, custom_block_models } => {
                self.world
                    .add_column(ChunkColumnKey::new(x, z), column, custom_block_models);
                Vec::new()
            }
            ToWorker::UnloadChunk { x, z } => {
                let key = ChunkColumnKey::new(x, z);
                self.world.remove_column(key);
                // Pending counts for this column were settled by the
                // orchestrator when it initiated the unload.
                self.dirty.retain(|section, _| section.column() != key);
                if self.world.is_empty() {
                    // Soft cleanup: derived lookups are only worth keeping
                    // while any column remains.
                    self.model_cache.clear();
                }
                Vec::new()
            }
            ToWorker::BlockUpdate { pos, state_id, custom_block_models } => {
                if !self.world.set_block(pos, state_id) {
                    debug!(
                        "worker {}: block update at {:?} for unloaded column",
                        self.index, pos
                    );
                }
                if custom_block_models.is_some() {
                    self.world
                        .set_custom_block_models(ChunkColumnKey::containing(pos), custom_block_models);
                }
                Vec::new()
            }
            ToWorker::GetCustomBlockModel { pos } => {
                vec![FromWorker::CustomBlockModel {
                    pos,
                    model: self.world.custom_block_model(pos),
                }]
            }
            ToWorker::GetHeightmap { x, z } => {
                let heights = self
                    .world
                    .column(ChunkColumnKey::new(x, z))
                    .map(|column| column.heightmap())
                    .unwrap_or_default();
                vec![FromWorker::Heightmap { x, z, heights }]
            }
        }
    }

    /// Runs one rebuild pass over the dirty set.
    ///
    /// For every dirty key with a live section, builds geometry and emits
    /// one [`FromWorker::Geometry`]; in all cases emits exactly `pending`
    /// [`FromWorker::SectionFinished`] events and clears the key. A build
    /// failure for one section never aborts the pass for the others.
    pub fn tick(&mut self) -> Vec<FromWorker> {
        if !self.is_ready() || self.dirty.is_empty() {
            return Vec::new();
        }

        let mut output = Vec::new();
        let dirty = std::mem::take(&mut self.dirty);

        for (key, entry) in dirty {
            let mut process_time_ms = None;

            if self.world.has_section(key) {
                let started = Instant::now();
                let geometry = self.build_guarded(key, entry.mode);
                process_time_ms = Some(started.elapsed().as_secs_f64() * 1000.0);

                self.report_new_model_info(&mut output);
                output.push(FromWorker::Geometry {
                    key,
                    geometry,
                    worker_index: self.index,
                });
            }

            for _ in 0..entry.pending {
                output.push(FromWorker::SectionFinished {
                    key,
                    worker_index: self.index,
                    process_time_ms,
                });
            }
        }

        output
    }

    /// Runs the builder, converting a panic into an errored-but-present
    /// result so the rest of the tick proceeds.
    fn build_guarded(&mut self, key: SectionKey, mode: InstancingMode) -> GeometryOutput {
        let MesherWorker { world, builder, model_cache, .. } = self;
        match catch_unwind(AssertUnwindSafe(|| {
            builder.build_section(key, world, mode, model_cache)
        })) {
            Ok(geometry) => geometry,
            Err(_) => {
                error!("worker {}: geometry build panicked for {:?}", self.index, key);
                GeometryOutput {
                    had_errors: true,
                    ..GeometryOutput::default()
                }
            }
        }
    }

    fn report_new_model_info(&mut self, output: &mut Vec<FromWorker>) {
        let discovered = self.builder.take_model_info();
        if discovered.is_empty() {
            return;
        }
        let new_only: HashMap<String, serde_json::Value> = discovered
            .into_iter()
            .filter(|(cache_key, _)| self.sent_model_info.insert(cache_key.clone()))
            .collect();
        if !new_only.is_empty() {
            output.push(FromWorker::BlockStateModelInfo { info: new_only });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{ChunkColumn, Section};

    /// Builder stub that records build calls and can report model info.
    struct StubBuilder {
        /// Reported on every `take_model_info` call, simulating a builder
        /// that rediscovers the same cache keys on each build.
        repeat_info: HashMap<String, serde_json::Value>,
        panic_on: Option<SectionKey>,
    }

    impl StubBuilder {
        fn new() -> Self {
            StubBuilder {
                repeat_info: HashMap::new(),
                panic_on: None,
            }
        }
    }

    impl GeometryBuilder for StubBuilder {
        fn build_section(
            &mut self,
            key: SectionKey,
            _world: &LocalWorld,
            _mode: InstancingMode,
            _model_cache: &mut LruCache<String, serde_json::Value>,
        ) -> GeometryOutput {
            if self.panic_on == Some(key) {
                panic!("intentional test panic");
            }
            GeometryOutput {
                positions: vec![0.0; 9],
                indices: vec![0, 1, 2],
                ..GeometryOutput::default()
            }
        }

        fn take_model_info(&mut self) -> HashMap<String, serde_json::Value> {
            self.repeat_info.clone()
        }
    }

    /// Builder stub that records every `configure` payload it receives.
    struct ConfigRecordingBuilder {
        configured: std::sync::Arc<std::sync::Mutex<Vec<serde_json::Value>>>,
    }

    impl GeometryBuilder for ConfigRecordingBuilder {
        fn configure(
            &mut self,
            game_data: &serde_json::Value,
            models: &serde_json::Value,
            atlas: &serde_json::Value,
        ) {
            self.configured.lock().unwrap().push(serde_json::json!({
                "game_data": game_data,
                "models": models,
                "atlas": atlas,
            }));
        }

        fn build_section(
            &mut self,
            _key: SectionKey,
            _world: &LocalWorld,
            _mode: InstancingMode,
            _model_cache: &mut LruCache<String, serde_json::Value>,
        ) -> GeometryOutput {
            GeometryOutput::default()
        }
    }

    fn configured_worker() -> MesherWorker {
        let mut worker = MesherWorker::new(1, Box::new(StubBuilder::new()));
        worker.handle_message(ToWorker::GameData { data: serde_json::json!({}) });
        worker.handle_message(ToWorker::MesherData {
            models: serde_json::json!({}),
            atlas: serde_json::json!({}),
        });
        worker
    }

    fn load_test_column(worker: &mut MesherWorker, x: i32, z: i32) {
        let mut column = ChunkColumn::new();
        let mut section = Section::empty();
        section.set_block(0, 0, 0, 1);
        column.insert_section(0, section);
        worker.handle_message(ToWorker::Chunk {
            x,
            z,
            column,
            custom_block_models: None,
        });
    }

    fn dirty(x: i32, y: i32, z: i32) -> ToWorker {
        ToWorker::Dirty {
            x,
            y,
            z,
            added: true,
            mode: InstancingMode::Disabled,
        }
    }

    fn count_finished(messages: &[FromWorker], key: SectionKey) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, FromWorker::SectionFinished { key: k, .. } if *k == key))
            .count()
    }

    fn count_geometry(messages: &[FromWorker], key: SectionKey) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, FromWorker::Geometry { key: k, .. } if *k == key))
            .count()
    }

    #[test]
    fn readiness_progresses_through_both_config_messages() {
        let mut worker = MesherWorker::new(0, Box::new(StubBuilder::new()));
        assert_eq!(worker.readiness(), WorkerReadiness::Uninitialized);
        worker.handle_message(ToWorker::GameData { data: serde_json::json!({}) });
        assert_eq!(worker.readiness(), WorkerReadiness::AwaitingBaseData);
        worker.handle_message(ToWorker::MesherData {
            models: serde_json::json!({}),
            atlas: serde_json::json!({}),
        });
        assert_eq!(worker.readiness(), WorkerReadiness::Ready);
    }

    #[test]
    fn configuration_payloads_reach_the_builder() {
        let configured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut worker = MesherWorker::new(
            0,
            Box::new(ConfigRecordingBuilder { configured: configured.clone() }),
        );

        worker.handle_message(ToWorker::GameData {
            data: serde_json::json!({ "version": "1.20" }),
        });
        // Half the configuration is not enough to configure the builder.
        assert!(configured.lock().unwrap().is_empty());

        worker.handle_message(ToWorker::MesherData {
            models: serde_json::json!({ "stone": 1 }),
            atlas: serde_json::json!({ "width": 256 }),
        });
        {
            let calls = configured.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0]["game_data"]["version"], "1.20");
            assert_eq!(calls[0]["models"]["stone"], 1);
            assert_eq!(calls[0]["atlas"]["width"], 256);
        }

        // A resent payload (version change) reconfigures the builder.
        worker.handle_message(ToWorker::GameData {
            data: serde_json::json!({ "version": "1.21" }),
        });
        let calls = configured.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1]["game_data"]["version"], "1.21");
    }

    #[test]
    fn work_is_ignored_until_ready() {
        let mut worker = MesherWorker::new(0, Box::new(StubBuilder::new()));
        worker.handle_message(dirty(0, 0, 0));
        assert_eq!(worker.dirty_count(), 0);
        assert!(worker.tick().is_empty());
    }

    #[test]
    fn double_mark_emits_two_finishes_and_one_geometry() {
        let mut worker = configured_worker();
        load_test_column(&mut worker, 1, 1);

        worker.handle_message(dirty(16, 0, 16));
        worker.handle_message(dirty(17, 1, 17));

        let key = SectionKey { x: 16, y: 0, z: 16 };
        let output = worker.tick();
        assert_eq!(count_finished(&output, key), 2);
        assert_eq!(count_geometry(&output, key), 1);
        assert_eq!(worker.dirty_count(), 0);
    }

    #[test]
    fn missing_section_consumes_pending_without_geometry() {
        let mut worker = configured_worker();
        load_test_column(&mut worker, 0, 0);

        // Section y=64 was never loaded into the column.
        worker.handle_message(dirty(0, 64, 0));
        let key = SectionKey { x: 0, y: 64, z: 0 };
        let output = worker.tick();
        assert_eq!(count_finished(&output, key), 1);
        assert_eq!(count_geometry(&output, key), 0);
        match &output[0] {
            FromWorker::SectionFinished { process_time_ms, .. } => {
                assert!(process_time_ms.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unload_purges_the_columns_dirty_entries() {
        let mut worker = configured_worker();
        load_test_column(&mut worker, 0, 0);
        load_test_column(&mut worker, 1, 0);

        worker.handle_message(dirty(0, 0, 0));
        worker.handle_message(dirty(16, 0, 0));
        worker.handle_message(ToWorker::UnloadChunk { x: 0, z: 0 });

        let output = worker.tick();
        assert_eq!(count_finished(&output, SectionKey { x: 0, y: 0, z: 0 }), 0);
        assert_eq!(count_finished(&output, SectionKey { x: 16, y: 0, z: 0 }), 1);
    }

    #[test]
    fn builder_panic_degrades_to_errored_geometry() {
        let mut builder = StubBuilder::new();
        builder.panic_on = Some(SectionKey { x: 0, y: 0, z: 0 });
        let mut worker = MesherWorker::new(2, Box::new(builder));
        worker.handle_message(ToWorker::GameData { data: serde_json::json!({}) });
        worker.handle_message(ToWorker::MesherData {
            models: serde_json::json!({}),
            atlas: serde_json::json!({}),
        });
        load_test_column(&mut worker, 0, 0);
        load_test_column(&mut worker, 1, 0);

        worker.handle_message(dirty(0, 0, 0));
        worker.handle_message(dirty(16, 0, 0));
        let output = worker.tick();

        // The panicking section still produced an errored result and its
        // completion, and the healthy section was unaffected.
        let panicked = SectionKey { x: 0, y: 0, z: 0 };
        let healthy = SectionKey { x: 16, y: 0, z: 0 };
        assert_eq!(count_finished(&output, panicked), 1);
        assert_eq!(count_finished(&output, healthy), 1);
        assert!(output.iter().any(|m| matches!(
            m,
            FromWorker::Geometry { key, geometry, .. }
                if *key == panicked && geometry.had_errors
        )));
        assert!(output.iter().any(|m| matches!(
            m,
            FromWorker::Geometry { key, geometry, .. }
                if *key == healthy && !geometry.had_errors
        )));
    }

    #[test]
    fn model_info_is_reported_at_most_once_per_key() {
        let mut builder = StubBuilder::new();
        builder
            .repeat_info
            .insert("oak_stairs#0".to_string(), serde_json::json!({ "faces": 10 }));
        let mut worker = MesherWorker::new(0, Box::new(builder));
        worker.handle_message(ToWorker::GameData { data: serde_json::json!({}) });
        worker.handle_message(ToWorker::MesherData {
            models: serde_json::json!({}),
            atlas: serde_json::json!({}),
        });
        load_test_column(&mut worker, 0, 0);

        worker.handle_message(dirty(0, 0, 0));
        let first = worker.tick();
        assert!(first
            .iter()
            .any(|m| matches!(m, FromWorker::BlockStateModelInfo { .. })));

        // The builder rediscovers the same cache key on the next build;
        // the worker's already-sent set suppresses the repeat.
        worker.handle_message(dirty(0, 0, 0));
        let second = worker.tick();
        assert!(!second
            .iter()
            .any(|m| matches!(m, FromWorker::BlockStateModelInfo { .. })));
    }

    #[test]
    fn queries_are_answered_with_matching_responses() {
        let mut worker = configured_worker();
        load_test_column(&mut worker, 0, 0);

        let responses = worker.handle_message(ToWorker::GetHeightmap { x: 0, z: 0 });
        assert!(matches!(
            responses.as_slice(),
            [FromWorker::Heightmap { x: 0, z: 0, heights }] if heights.len() == 256
        ));

        let responses = worker.handle_message(ToWorker::GetCustomBlockModel {
            pos: Point3::new(0, 0, 0),
        });
        assert!(matches!(
            responses.as_slice(),
            [FromWorker::CustomBlockModel { model: None, .. }]
        ));
    }

    #[test]
    fn reset_clears_caches_but_keeps_configuration() {
        let mut worker = configured_worker();
        load_test_column(&mut worker, 0, 0);
        worker.handle_message(dirty(0, 0, 0));

        worker.handle_message(ToWorker::Reset);
        assert_eq!(worker.column_count(), 0);
        assert_eq!(worker.dirty_count(), 0);
        assert_eq!(worker.readiness(), WorkerReadiness::Ready);
    }
}
