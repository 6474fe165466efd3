//! End-to-end pipeline tests with real worker threads.
//!
//! These drive a [`ChunkStreamer`] against spawned mesher workers and a stub
//! geometry builder, asserting on the observable outcomes (pool bindings,
//! event hooks, counters) rather than on message-level internals. Timings
//! are tightened so the debounce window and worker ticks elapse quickly;
//! every wait is bounded by a generous deadline so a hung pipeline fails
//! instead of blocking the suite.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use cgmath::Point3;
use lru::LruCache;
use web_time::{Duration, Instant};

use voxel_streamer::{
    ChunkColumn, ChunkStreamer, GeometryBuilder, GeometryOutput, InstancingMode, LocalWorld,
    Section, SectionKey, StreamerConfig, StreamerEvents,
};
use voxel_streamer::protocol::ChunkColumnKey;

struct TestBuilder;

impl GeometryBuilder for TestBuilder {
    fn build_section(
        &mut self,
        key: SectionKey,
        _world: &LocalWorld,
        mode: InstancingMode,
        _model_cache: &mut LruCache<String, serde_json::Value>,
    ) -> GeometryOutput {
        let mut instanced = HashMap::new();
        if mode == InstancingMode::Enabled {
            instanced.insert(1u32, vec![[key.x as f32, key.y as f32, key.z as f32]]);
        }
        GeometryOutput {
            positions: vec![0.0; 9],
            normals: vec![0.0; 9],
            colors: vec![0.0; 9],
            uvs: vec![0.0; 6],
            indices: vec![0, 1, 2],
            instanced,
            ..GeometryOutput::default()
        }
    }
}

fn test_config() -> StreamerConfig {
    StreamerConfig {
        worker_count: 3,
        tick_interval: Duration::from_millis(5),
        debounce_window: Duration::from_millis(10),
        view_distance: 1,
        avg_sections_per_column: 2,
        max_sections_per_column: 8,
        pool_growth_increment: 4,
        pool_vertex_capacity: 16,
        ..StreamerConfig::default()
    }
}

fn streamer(config: StreamerConfig) -> ChunkStreamer {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut streamer = ChunkStreamer::new(config, |_| Box::new(TestBuilder));
    streamer.configure(
        serde_json::json!({ "version": 1 }),
        serde_json::json!({}),
        serde_json::json!({}),
    );
    streamer
}

fn column_with_sections(ys: &[i32]) -> ChunkColumn {
    let mut column = ChunkColumn::new();
    for &y in ys {
        let mut section = Section::empty();
        section.set_block(3, 4, 5, 1);
        column.insert_section(y, section);
    }
    column
}

/// Pumps the streamer until the predicate holds or the deadline passes.
fn pump_until(streamer: &mut ChunkStreamer, mut done: impl FnMut(&ChunkStreamer) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        streamer.update();
        if done(streamer) {
            return;
        }
        assert!(Instant::now() < deadline, "pipeline made no progress within 5s");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn column_load_builds_and_binds_every_section() {
    let mut s = streamer(test_config());
    let key = ChunkColumnKey::new(0, 0);
    s.add_column(key, column_with_sections(&[0, 16, 32, 48]), None);

    pump_until(&mut s, |s| s.is_column_finished(key));

    for y in [0, 16, 32, 48] {
        assert!(s.mesh_pool().is_bound(SectionKey { x: 0, y, z: 0 }));
    }
    assert_eq!(s.stats().sections_applied, 4);
    assert_eq!(s.waiting_section_count(), 0);
    s.shutdown(Duration::from_secs(1));
}

#[test]
fn column_finished_fires_once_per_load() {
    let mut s = streamer(test_config());
    let finishes = Rc::new(Cell::new(0u32));
    let counter = finishes.clone();
    s.set_events(
        StreamerEvents::default().on_column_finished(move |_| counter.set(counter.get() + 1)),
    );

    let key = ChunkColumnKey::new(1, -1);
    s.add_column(key, column_with_sections(&[0, 16]), None);
    pump_until(&mut s, |s| s.is_column_finished(key));

    // A few extra frames must not re-fire the event.
    for _ in 0..5 {
        s.update();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(finishes.get(), 1);
    s.shutdown(Duration::from_secs(1));
}

#[test]
fn remarking_a_section_completes_again() {
    let mut s = streamer(test_config());
    let key = ChunkColumnKey::new(0, 0);
    s.add_column(key, column_with_sections(&[0]), None);
    pump_until(&mut s, |s| s.is_column_finished(key));

    let section = SectionKey { x: 0, y: 0, z: 0 };
    s.mark_section_dirty(section, false);
    assert!(!s.is_column_finished(key));
    s.mark_section_dirty(section, false);

    pump_until(&mut s, |s| s.is_column_finished(key));
    assert_eq!(s.waiting_section_count(), 0);
    s.shutdown(Duration::from_secs(1));
}

#[test]
fn unload_mid_flight_leaves_no_bindings_or_pending_work() {
    let mut s = streamer(test_config());
    let key = ChunkColumnKey::new(0, 0);
    s.add_column(key, column_with_sections(&[0, 16, 32]), None);

    // Dispatch the load, then unload immediately so results race the unload.
    pump_until(&mut s, |s| s.is_column_loaded(key));
    s.remove_column(key);

    // Give the workers time to emit whatever they were building.
    let settle = Instant::now() + Duration::from_millis(100);
    while Instant::now() < settle {
        s.update();
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(!s.is_column_loaded(key));
    assert_eq!(s.waiting_section_count(), 0);
    for y in [0, 16, 32] {
        assert!(!s.mesh_pool().is_bound(SectionKey { x: 0, y, z: 0 }));
    }
    s.shutdown(Duration::from_secs(1));
}

#[test]
fn burst_of_loads_dispatches_as_one_batch() {
    let mut s = streamer(StreamerConfig {
        // Wide enough that the first update reliably lands inside the window.
        debounce_window: Duration::from_millis(150),
        ..test_config()
    });
    let loads = Rc::new(Cell::new(0u32));
    let counter = loads.clone();
    s.set_events(
        StreamerEvents::default().on_column_loaded(move |_| counter.set(counter.get() + 1)),
    );

    for x in 0..4 {
        s.add_column(ChunkColumnKey::new(x, 0), column_with_sections(&[0]), None);
    }
    // Nothing dispatches while the window is open.
    s.update();
    assert_eq!(loads.get(), 0);

    pump_until(&mut s, |_| loads.get() == 4);
    for x in 0..4 {
        assert!(s.is_column_loaded(ChunkColumnKey::new(x, 0)));
    }
    s.shutdown(Duration::from_secs(1));
}

#[test]
fn heightmap_query_round_trips_through_a_worker() {
    let mut s = streamer(test_config());
    let heights = Rc::new(Cell::new(None));
    let sink = heights.clone();
    s.set_events(StreamerEvents::default().on_heightmap(move |x, z, data| {
        assert_eq!((x, z), (0, 0));
        sink.set(Some(data[(5 * 16 + 3) as usize]));
    }));

    let key = ChunkColumnKey::new(0, 0);
    // column_with_sections puts a block at local (3, 4, 5) of the y=32 section.
    s.add_column(key, column_with_sections(&[32]), None);
    pump_until(&mut s, |s| s.is_column_loaded(key));

    s.request_heightmap(0, 0);
    pump_until(&mut s, |_| heights.get().is_some());
    assert_eq!(heights.get(), Some(36));
    s.shutdown(Duration::from_secs(1));
}

#[test]
fn instancing_mode_routes_placements_to_batches() {
    let mut s = streamer(test_config());
    s.set_instancing_mode(InstancingMode::Enabled);

    let key = ChunkColumnKey::new(0, 0);
    s.add_column(key, column_with_sections(&[0, 16]), None);
    pump_until(&mut s, |s| s.is_column_finished(key));

    assert_eq!(s.instanced().total_instances(), 2);

    s.remove_column(key);
    assert_eq!(s.instanced().total_instances(), 0);
    s.shutdown(Duration::from_secs(1));
}

#[test]
fn block_update_rebuilds_the_touched_sections() {
    let mut s = streamer(test_config());
    let key = ChunkColumnKey::new(0, 0);
    s.add_column(key, column_with_sections(&[0, 16]), None);
    pump_until(&mut s, |s| s.is_column_finished(key));
    let applied_before = s.stats().sections_applied;

    // y=16 boundary: both the block's section and the one below rebuild.
    s.set_block_state_id(Point3::new(4, 16, 4), 7, None);
    pump_until(&mut s, |s| s.is_column_finished(key));

    assert!(s.stats().sections_applied >= applied_before + 2);
    s.shutdown(Duration::from_secs(1));
}
