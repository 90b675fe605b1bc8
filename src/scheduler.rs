//! Streaming Scheduler (C6): one `update(observerPosition)` call per main-loop tick,
//! recomputing the required chunk set and issuing priority-ordered load/unload tasks
//! around the moving observer (spec.md §4.6).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::chunk::{ChunkPos, ChunkState};
use crate::config::{Config, CHUNK_SIDE};
use crate::mesh::MeshPipeline;
use crate::store::{chebyshev, ChunkStore};
use crate::workers::{PriorityPool, LOWEST_PRIORITY};

/// A task submitted to the scheduler's load/unload pool. Unloads always carry
/// [`LOWEST_PRIORITY`] so loads preempt them (spec.md §4.6).
enum StreamTask {
    Load(ChunkPos),
    UnloadDirty(ChunkPos),
    UnloadCleanBatch(Vec<ChunkPos>),
}

/// Owns the load/unload priority pool and the main-thread tick logic. Constructed once
/// per world; holds no global state.
pub struct StreamingScheduler {
    store: Arc<ChunkStore>,
    mesh: Arc<MeshPipeline>,
    pool: Arc<PriorityPool<StreamTask>>,
    config: Config,
    last_tick: Mutex<Option<Instant>>,
}

impl StreamingScheduler {
    pub fn new(store: Arc<ChunkStore>, mesh: Arc<MeshPipeline>, config: Config) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            store,
            mesh,
            pool: PriorityPool::new(),
            config: config.clone(),
            last_tick: Mutex::new(None),
        });

        let store = Arc::clone(&scheduler.store);
        scheduler.pool.spawn(config.load_threads, move || {
            let store = Arc::clone(&store);
            Box::new(move |task: StreamTask| run_stream_task(&store, task))
        });

        scheduler
    }

    /// One main-loop tick. Recomputes the required set only every `updateIntervalMs`;
    /// calls in between are cheap no-ops, matching spec.md §4.6's "recomputes ... every
    /// UPDATE_INTERVAL" phrasing rather than doing the full pass on every call.
    pub fn update(&self, observer: (f64, f64, f64)) {
        let now = Instant::now();
        {
            let mut last = self.last_tick.lock();
            let due = last.map_or(true, |t| {
                now.duration_since(t).as_millis() as u64 >= self.config.update_interval_ms
            });
            if !due {
                return;
            }
            *last = Some(now);
        }

        let player_chunk = (
            (observer.0 / CHUNK_SIDE as f64).floor() as i32,
            (observer.2 / CHUNK_SIDE as f64).floor() as i32,
        );
        self.mesh.set_observer(player_chunk);

        let load_radius = self.config.border_chunk_distance();
        let required: HashSet<ChunkPos> = (-load_radius..=load_radius)
            .flat_map(|dx| (-load_radius..=load_radius).map(move |dz| (dx, dz)))
            .filter(|&(dx, dz)| dx.abs().max(dz.abs()) <= load_radius)
            .map(|(dx, dz)| (player_chunk.0 + dx, player_chunk.1 + dz))
            .collect();

        self.issue_unloads(&required);
        self.issue_loads(&required, player_chunk);

        self.store.process_deferred_feature_population(10);
        self.ensure_render_ring(player_chunk);
        self.mesh.requeue_failed();
    }

    fn issue_unloads(&self, required: &HashSet<ChunkPos>) {
        let mut clean_batch = Vec::new();
        for pos in self.store.positions() {
            if required.contains(&pos) {
                continue;
            }
            let Some(handle) = self.store.get(pos) else { continue };
            if handle.read().dirty.needs_save() {
                self.pool.submit(StreamTask::UnloadDirty(pos), LOWEST_PRIORITY);
            } else {
                clean_batch.push(pos);
            }
        }
        if !clean_batch.is_empty() {
            self.pool.submit(StreamTask::UnloadCleanBatch(clean_batch), LOWEST_PRIORITY);
        }
    }

    fn issue_loads(&self, required: &HashSet<ChunkPos>, player_chunk: ChunkPos) {
        let mut to_load: Vec<(ChunkPos, i32)> = required
            .iter()
            .filter(|pos| !self.store.has(**pos))
            .map(|&pos| (pos, chebyshev(pos, player_chunk)))
            .collect();
        to_load.sort_by_key(|&(_, distance)| distance);

        for (pos, distance) in to_load {
            self.pool.submit(StreamTask::Load(pos), -distance);
        }
    }

    /// For every chunk within `renderDistance`, make sure it's either progressing
    /// toward renderable or already is; recovers silently-failed mesh builds and
    /// flags chunks stuck waiting on the upload budget (spec.md §4.6 step 5).
    fn ensure_render_ring(&self, player_chunk: ChunkPos) {
        let radius = self.config.render_distance;
        for dx in -radius..=radius {
            for dz in -radius..=radius {
                if dx.abs().max(dz.abs()) > radius {
                    continue;
                }
                self.ensure_ready_for_render((player_chunk.0 + dx, player_chunk.1 + dz));
            }
        }
    }

    fn ensure_ready_for_render(&self, pos: ChunkPos) {
        let Some(handle) = self.store.get(pos) else { return };

        let (has_features, renderable, generating, cpu_ready) = {
            let chunk = handle.read();
            (
                chunk.state.has_state(ChunkState::FeaturesPopulated),
                chunk.state.is_renderable(),
                chunk.state.has_state(ChunkState::MeshGenerating),
                chunk.state.has_state(ChunkState::MeshCpuReady),
            )
        };

        if !has_features {
            // Feature population for this chunk is handled by the neighbor-gated
            // deferred queue (`ChunkStore::process_deferred_feature_population`).
            return;
        }

        if !renderable && !generating && !cpu_ready {
            self.mesh.schedule(&handle);
        }

        if cpu_ready {
            self.mesh.warn_if_stuck_cpu_ready(&handle);
        }
    }

    /// Stop accepting new work, await the load pool for a bounded timeout, then
    /// force-cancel; flush the save repository (spec.md §4.6 `shutdown()`).
    pub fn shutdown(&self) {
        self.pool.shutdown(Duration::from_secs(5));
        self.mesh.shutdown(Duration::from_secs(5));
        self.store.repository().flush();
    }
}

fn run_stream_task(store: &Arc<ChunkStore>, task: StreamTask) {
    match task {
        StreamTask::Load(pos) => {
            store.get_or_create(pos);
        }
        StreamTask::UnloadDirty(pos) => {
            store.unload(pos);
        }
        StreamTask::UnloadCleanBatch(positions) => {
            for pos in positions {
                store.unload(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::chunk::Chunk as RawChunk;
    use crate::collab::{Generator, NullMemoryProbe, Renderer, Water, WaterSystem};
    use crate::error::ErrorReporter;
    use crate::save::SaveRepository;

    struct StubGenerator;
    impl Generator for StubGenerator {
        fn generate_terrain_only(&self, pos: ChunkPos) -> Result<RawChunk, String> {
            Ok(RawChunk::new(pos))
        }
        fn populate_features(&self, _chunk: &mut RawChunk, _neighbor_block: &dyn Fn(i32, i32, i32) -> BlockId) {}
    }

    struct NullWater;
    impl WaterSystem for NullWater {
        fn on_block_changed(&self, _wx: i32, _wy: i32, _wz: i32, _prev: BlockId, _next: BlockId) {}
        fn on_chunk_loaded(&self, _chunk: &RawChunk) {}
        fn on_chunk_unloaded(&self, _pos: ChunkPos) {}
        fn get_water_block(&self, _wx: i32, _wy: i32, _wz: i32) -> Option<Water> {
            None
        }
    }

    struct NullRenderer;
    impl Renderer for NullRenderer {
        fn upload_mesh(&self, _buffers: &crate::chunk::MeshBuffers) -> Result<crate::chunk::GpuHandles, String> {
            Ok(crate::chunk::GpuHandles(0))
        }
        fn delete_mesh(&self, _handles: crate::chunk::GpuHandles) {}
        fn draw_chunk(&self, _handles: crate::chunk::GpuHandles) {}
    }

    fn test_scheduler(dir: &std::path::Path, render_distance: i32) -> Arc<StreamingScheduler> {
        let errors = Arc::new(ErrorReporter::default());
        let repo = Arc::new(SaveRepository::open(dir, 1, Arc::clone(&errors)));
        let config = Config {
            render_distance,
            update_interval_ms: 0,
            ..Config::default()
        };
        let store = Arc::new(ChunkStore::new(
            repo,
            Arc::new(StubGenerator),
            Arc::new(NullWater),
            Arc::clone(&errors),
            config.clone(),
        ));
        let mesh = MeshPipeline::new(
            Arc::clone(&store),
            Arc::new(NullRenderer),
            Arc::new(NullMemoryProbe),
            Arc::clone(&errors),
            config.clone(),
        );
        StreamingScheduler::new(store, mesh, config)
    }

    #[test]
    fn required_set_matches_chebyshev_ring() {
        let load_radius = 2 + 1;
        let mut count = 0;
        for dx in -load_radius..=load_radius {
            for dz in -load_radius..=load_radius {
                if dx.abs().max(dz.abs()) <= load_radius {
                    count += 1;
                }
            }
        }
        // (2*radius + 1)^2 chunks in a square Chebyshev ball of the given radius.
        assert_eq!(count, (2 * load_radius + 1).pow(2));
    }

    #[test]
    fn update_loads_and_meshes_the_required_area() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = test_scheduler(dir.path(), 1);
        scheduler.update((0.0, 0.0, 0.0));

        // Give the bounded load pool a moment to drain the submitted tasks.
        std::thread::sleep(Duration::from_millis(200));

        let load_radius = scheduler.config.border_chunk_distance();
        let expected = (2 * load_radius + 1).pow(2) as usize;
        assert_eq!(scheduler.store.live_count(), expected as usize);
    }

    #[test]
    fn shutdown_drains_pools_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = test_scheduler(dir.path(), 0);
        scheduler.update((0.0, 0.0, 0.0));
        std::thread::sleep(Duration::from_millis(100));
        scheduler.shutdown();
    }
}
