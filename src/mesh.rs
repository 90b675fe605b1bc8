//! Mesh Pipeline (C5): CPU mesh build workers, bounded render-thread GPU upload with
//! an adaptive per-frame budget, and the retry/teardown bookkeeping around both.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::block::BlockId;
use crate::chunk::{ChunkPos, ChunkState, MeshBuffers, Vertex};
use crate::collab::{MemoryProbe, Renderer};
use crate::config::{Config, CHUNK_SIDE, WORLD_HEIGHT};
use crate::error::{ErrorClass, ErrorReporter, MeshError};
use crate::store::{chebyshev, ChunkHandle, ChunkStore};
use crate::workers::PriorityPool;

/// One mesh-build job: the target chunk plus the Chebyshev distance to the observer at
/// the moment it was scheduled, used only to derive the task's priority.
struct MeshTask {
    pos: ChunkPos,
}

/// A chunk that has been sitting in `MESH_CPU_READY` longer than plausible given the
/// current upload budget (spec.md §4.6 "stuck ... log a warning").
const STUCK_CPU_READY_WARN: Duration = Duration::from_secs(2);

/// Adaptive GPU upload batch size, following spec.md §4.5's threshold/shrink/memory-cap
/// rules. A fixed point under a steady frame-time signal is the testable property
/// (invariant 7, spec.md §8).
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveBudget {
    pub current: u32,
    min: u32,
    max: u32,
    high_frame_time_ms: f32,
    low_frame_time_ms: f32,
}

impl AdaptiveBudget {
    pub fn new(config: &Config) -> Self {
        Self {
            current: config.gl_batch_default,
            min: config.gl_batch_min,
            max: config.gl_batch_max,
            high_frame_time_ms: config.gl_high_frame_time_ms,
            low_frame_time_ms: config.gl_low_frame_time_ms,
        }
    }

    /// Apply one tick of feedback and return the (possibly unchanged) new budget.
    pub fn adapt(&mut self, queue_depth: usize, frame_time_ms: f32, high_memory_pressure: bool) -> u32 {
        let growth: i64 = if queue_depth > 150 {
            8
        } else if queue_depth > 100 {
            4
        } else if queue_depth > 50 {
            2
        } else {
            0
        };

        let mut next = self.current as i64 + growth;

        if growth == 0 && frame_time_ms > self.high_frame_time_ms && queue_depth < 50 {
            next -= 2;
        } else if growth == 0 && frame_time_ms < self.low_frame_time_ms {
            // Stable and cheap: nothing to do, hold steady rather than drift.
        }

        next = next.clamp(self.min as i64, self.max as i64);
        if high_memory_pressure {
            next = next.min(8);
        }

        self.current = next as u32;
        self.current
    }
}

/// Cached memory-pressure probe, refreshed at most every `memoryCheckIntervalMs`
/// (spec.md §4.5).
struct CachedMemoryProbe {
    probe: Arc<dyn MemoryProbe>,
    interval: Duration,
    last_checked: Mutex<(Instant, f32)>,
}

impl CachedMemoryProbe {
    fn new(probe: Arc<dyn MemoryProbe>, interval: Duration) -> Self {
        Self {
            probe,
            interval,
            last_checked: Mutex::new((Instant::now() - interval, 0.0)),
        }
    }

    fn fraction(&self) -> f32 {
        let mut cached = self.last_checked.lock();
        if cached.0.elapsed() >= self.interval {
            cached.0 = Instant::now();
            cached.1 = self.probe.heap_use_fraction();
        }
        cached.1
    }
}

/// Producer/consumer mesh pipeline: a priority-ordered build pool feeding a CPU-ready
/// queue that the render thread drains under an adaptive budget.
pub struct MeshPipeline {
    pool: Arc<PriorityPool<MeshTask>>,
    cpu_ready: Mutex<VecDeque<ChunkPos>>,
    /// Chunks whose build raised a transient error, retried by `requeueFailed`.
    transient_retry: Mutex<VecDeque<ChunkPos>>,
    store: Arc<ChunkStore>,
    renderer: Arc<dyn Renderer>,
    errors: Arc<ErrorReporter>,
    memory: CachedMemoryProbe,
    budget: Mutex<AdaptiveBudget>,
    config: Config,
    /// Packed `(cx, cz)` of the observer's current chunk, updated once per scheduler
    /// tick and read by build workers to key task priority.
    observer: AtomicI64,
}

impl MeshPipeline {
    pub fn new(
        store: Arc<ChunkStore>,
        renderer: Arc<dyn Renderer>,
        memory_probe: Arc<dyn MemoryProbe>,
        errors: Arc<ErrorReporter>,
        config: Config,
    ) -> Arc<Self> {
        let pipeline = Arc::new(Self {
            pool: PriorityPool::new(),
            cpu_ready: Mutex::new(VecDeque::new()),
            transient_retry: Mutex::new(VecDeque::new()),
            store,
            renderer,
            errors,
            memory: CachedMemoryProbe::new(
                memory_probe,
                Duration::from_millis(config.memory_check_interval_ms),
            ),
            budget: Mutex::new(AdaptiveBudget::new(&config)),
            observer: AtomicI64::new(0),
            config,
        });

        let worker_count = pipeline.config.mesh_threads;
        let spawned: Arc<Self> = Arc::clone(&pipeline);
        pipeline.pool.spawn(worker_count, move || {
            let pipeline = Arc::clone(&spawned);
            Box::new(move |task: MeshTask| pipeline.run_build(task.pos))
        });

        pipeline
    }

    pub fn set_observer(&self, chunk_pos: ChunkPos) {
        self.observer.store(pack(chunk_pos), Ordering::Relaxed);
    }

    fn observer_pos(&self) -> ChunkPos {
        unpack(self.observer.load(Ordering::Relaxed))
    }

    /// Enqueue a mesh build if the chunk is eligible (spec.md §4.5 `schedule`).
    /// A no-op (returning `false`) while a build is already in flight sets the
    /// re-run flag instead, so the mesh is rebuilt exactly once more after the
    /// current build completes.
    pub fn schedule(&self, handle: &ChunkHandle) -> bool {
        let pos = handle.read().pos;
        let eligible = {
            let chunk = handle.read();
            chunk.state.has_state(ChunkState::FeaturesPopulated)
                && !chunk.state.has_state(ChunkState::Unloading)
                && (!chunk.state.has_state(ChunkState::MeshGpuReady) || chunk.dirty.is_mesh_dirty())
        };
        if !eligible {
            return false;
        }

        let chunk = handle.read();
        if !chunk.state.add_state(ChunkState::MeshGenerating) {
            chunk.rebuild_requested.store(true, Ordering::Release);
            return false;
        }
        drop(chunk);

        let distance = chebyshev(pos, self.observer_pos());
        self.pool.submit(MeshTask { pos }, -distance);
        true
    }

    fn run_build(&self, pos: ChunkPos) {
        let Some(handle) = self.store.get(pos) else {
            return;
        };

        if handle.read().state.has_state(ChunkState::Unloading) {
            handle.read().state.remove_state(ChunkState::MeshGenerating);
            return;
        }

        let distance = chebyshev(pos, self.observer_pos());
        match self.build(&handle, pos, distance) {
            Ok(buffers) => {
                let mut chunk = handle.write();
                chunk.mesh = Some(buffers);
                chunk.failed_build_attempts.store(0, Ordering::Relaxed);
                chunk.state.add_state(ChunkState::MeshCpuReady);
                chunk.dirty.mark_mesh_clean();
                chunk.state.remove_state(ChunkState::MeshGenerating);
                chunk.mark_mesh_cpu_ready_now();
                drop(chunk);
                self.cpu_ready.lock().push_back(pos);
            }
            Err(err @ MeshError::Transient(_)) => {
                handle.read().state.remove_state(ChunkState::MeshGenerating);
                let attempts = handle.read().failed_build_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if attempts <= self.config.max_failed_chunk_retries {
                    self.transient_retry.lock().push_back(pos);
                } else {
                    let context = self.diagnostic_context(&handle);
                    self.errors
                        .report_with_context(ErrorClass::MaxRetriesExhausted, err.to_string(), Some(pos), Some(context));
                }
            }
            Err(err) => {
                // Fatal/GpuUpload variants never originate from `build`; handled for
                // exhaustiveness since `MeshError` also backs the upload path.
                handle.read().state.remove_state(ChunkState::MeshGenerating);
                let context = self.diagnostic_context(&handle);
                self.errors
                    .report_with_context(ErrorClass::MeshBuildFailure, err.to_string(), Some(pos), Some(context));
            }
        }

        if handle.read().rebuild_requested.swap(false, Ordering::AcqRel) {
            self.schedule(&handle);
        }
    }

    /// For each solid face, test the facing neighbor (possibly in an adjacent chunk);
    /// a missing neighbor is treated as air only at the load frontier, otherwise the
    /// build is deferred until the neighbor exists (spec.md §4.5).
    fn build(&self, handle: &ChunkHandle, pos: ChunkPos, distance: i32) -> Result<MeshBuffers, MeshError> {
        let at_frontier = distance >= self.config.border_chunk_distance();

        let blocks: Box<[BlockId]> = handle.read().blocks().to_vec().into_boxed_slice();
        let west = self.neighbor_blocks((pos.0 - 1, pos.1));
        let east = self.neighbor_blocks((pos.0 + 1, pos.1));
        let north = self.neighbor_blocks((pos.0, pos.1 - 1));
        let south = self.neighbor_blocks((pos.0, pos.1 + 1));

        if !at_frontier && (west.is_none() || east.is_none() || north.is_none() || south.is_none()) {
            return Err(MeshError::Transient(format!("chunk {pos:?} has a missing neighbor")));
        }

        let at = |lx: i32, y: i32, lz: i32| -> BlockId {
            if y < 0 || y >= WORLD_HEIGHT {
                return BlockId::AIR;
            }
            if lx < 0 {
                return west.as_ref().map(|b| index(b, CHUNK_SIDE - 1, y, lz)).unwrap_or(BlockId::AIR);
            }
            if lx >= CHUNK_SIDE {
                return east.as_ref().map(|b| index(b, 0, y, lz)).unwrap_or(BlockId::AIR);
            }
            if lz < 0 {
                return north.as_ref().map(|b| index(b, lx, y, CHUNK_SIDE - 1)).unwrap_or(BlockId::AIR);
            }
            if lz >= CHUNK_SIDE {
                return south.as_ref().map(|b| index(b, lx, y, 0)).unwrap_or(BlockId::AIR);
            }
            index(&blocks, lx, y, lz)
        };

        let mut out = MeshBuffers::default();
        for lx in 0..CHUNK_SIDE {
            for y in 0..WORLD_HEIGHT {
                for lz in 0..CHUNK_SIDE {
                    let block = index(&blocks, lx, y, lz);
                    if block.is_air() {
                        continue;
                    }
                    let info = block.info();

                    for &(dx, dy, dz, normal) in &FACES {
                        let neighbor = at(lx + dx, y + dy, lz + dz);
                        if !face_visible(info, neighbor.info()) {
                            continue;
                        }
                        let target = if info.is_water {
                            &mut out.water
                        } else if info.alpha_tested {
                            &mut out.alpha_tested
                        } else {
                            &mut out.opaque
                        };
                        emit_quad(target, pos, lx, y, lz, normal, block, &info);
                    }
                }
            }
        }

        Ok(out)
    }

    fn neighbor_blocks(&self, pos: ChunkPos) -> Option<Box<[BlockId]>> {
        self.store.get(pos).map(|h| h.read().blocks().to_vec().into_boxed_slice())
    }

    /// Retries chunks whose build raised a transient error, up to the per-chunk bound
    /// already tracked on the chunk (spec.md §4.5 `requeueFailed`).
    pub fn requeue_failed(&self) {
        let batch: Vec<ChunkPos> = self.transient_retry.lock().drain(..).collect();
        for pos in batch {
            if let Some(handle) = self.store.get(pos) {
                self.schedule(&handle);
            }
        }
    }

    /// Upload up to `budget` CPU-ready meshes to the GPU. Render-thread only.
    pub fn apply_pending_gpu_uploads(&self, budget: u32) -> usize {
        let mut uploaded = 0;
        for _ in 0..budget {
            let pos = match self.cpu_ready.lock().pop_front() {
                Some(pos) => pos,
                None => break,
            };
            let Some(handle) = self.store.get(pos) else { continue };

            if handle.read().state.has_state(ChunkState::Unloading) {
                // Discard: no GPU upload for a chunk that's being torn down.
                let mut chunk = handle.write();
                chunk.mesh = None;
                chunk.state.remove_state(ChunkState::MeshCpuReady);
                chunk.clear_mesh_cpu_ready_since();
                continue;
            }

            let buffers = handle.read().mesh.clone();
            let Some(buffers) = buffers else { continue };

            match self.renderer.upload_mesh(&buffers) {
                Ok(handles) => {
                    let mut chunk = handle.write();
                    chunk.gpu = Some(handles);
                    chunk.mesh = None;
                    chunk.state.remove_state(ChunkState::MeshCpuReady);
                    chunk.state.add_state(ChunkState::MeshGpuReady);
                    chunk.clear_mesh_cpu_ready_since();
                    uploaded += 1;
                }
                Err(err) => {
                    let context = self.diagnostic_context(&handle);
                    self.errors
                        .report_with_context(ErrorClass::GpuUploadFailure, err, Some(pos), Some(context));
                    // Previous mesh (if any) is untouched; chunk stays MESH_CPU_READY
                    // and is retried next frame.
                    self.cpu_ready.lock().push_front(pos);
                    break;
                }
            }
        }
        uploaded
    }

    /// Snapshot the chunk-state/dirty-flag/frame context the error reporter attaches to
    /// mesh-build and GPU-upload diagnostics (spec.md §7).
    fn diagnostic_context(&self, handle: &ChunkHandle) -> crate::error::DiagnosticContext {
        let chunk = handle.read();
        crate::error::DiagnosticContext {
            chunk_state_bits: chunk.state.bits(),
            blocks_dirty: chunk.dirty.is_blocks_dirty(),
            mesh_dirty: chunk.dirty.is_mesh_dirty(),
            frame: crate::error::FrameContext {
                gpu_budget: self.current_budget(),
                cpu_ready_queue_depth: self.cpu_ready_queue_depth(),
            },
        }
    }

    /// Delete GPU handles the chunk store queued during unload. Render-thread only.
    pub fn process_gpu_teardown(&self) {
        for handles in self.store.drain_gpu_teardown() {
            self.renderer.delete_mesh(handles);
        }
    }

    pub fn cpu_ready_queue_depth(&self) -> usize {
        self.cpu_ready.lock().len()
    }

    pub fn build_queue_depth(&self) -> usize {
        self.pool.queue_depth()
    }

    /// One frame's worth of adaptive-budget bookkeeping: consult queue depth, last
    /// frame time, and the cached memory probe (spec.md §4.5).
    pub fn adapt_budget(&self, frame_time_ms: f32) -> u32 {
        let queue_depth = self.cpu_ready_queue_depth();
        let high_pressure = self.memory.fraction() > self.config.high_memory_threshold;
        self.budget.lock().adapt(queue_depth, frame_time_ms, high_pressure)
    }

    pub fn current_budget(&self) -> u32 {
        self.budget.lock().current
    }

    /// Any chunk that's been `MESH_CPU_READY` long enough that the upload budget can't
    /// plausibly explain it yet (spec.md §4.6).
    pub fn warn_if_stuck_cpu_ready(&self, handle: &ChunkHandle) {
        let stuck = handle
            .read()
            .mesh_cpu_ready_elapsed()
            .is_some_and(|elapsed| elapsed > STUCK_CPU_READY_WARN);
        if stuck {
            tracing::warn!(pos = ?handle.read().pos, "chunk stuck in MESH_CPU_READY longer than the upload budget can explain");
        }
    }

    pub fn shutdown(&self, timeout: Duration) {
        self.pool.shutdown(timeout);
    }
}

const FACES: [(i32, i32, i32, [f32; 3]); 6] = [
    (1, 0, 0, [1.0, 0.0, 0.0]),
    (-1, 0, 0, [-1.0, 0.0, 0.0]),
    (0, 1, 0, [0.0, 1.0, 0.0]),
    (0, -1, 0, [0.0, -1.0, 0.0]),
    (0, 0, 1, [0.0, 0.0, 1.0]),
    (0, 0, -1, [0.0, 0.0, -1.0]),
];

#[inline]
fn index(blocks: &[BlockId], lx: i32, y: i32, lz: i32) -> BlockId {
    blocks[((lx * WORLD_HEIGHT + y) * CHUNK_SIDE + lz) as usize]
}

/// A face is visible if its own block is solid-enough to draw and the neighbor
/// doesn't occlude it (air, transparent, or a different water state never occludes a
/// water face, which would otherwise disappear between connected water cells).
fn face_visible(own: crate::block::BlockInfo, neighbor: crate::block::BlockInfo) -> bool {
    if neighbor.solid && !neighbor.transparent {
        return false;
    }
    if own.is_water && neighbor.is_water {
        return false;
    }
    true
}

fn emit_quad(
    out: &mut Vec<Vertex>,
    chunk_pos: ChunkPos,
    lx: i32,
    y: i32,
    lz: i32,
    normal: [f32; 3],
    block: BlockId,
    info: &crate::block::BlockInfo,
) {
    let base = glam::Vec3::new(
        (chunk_pos.0 * CHUNK_SIDE + lx) as f32,
        y as f32,
        (chunk_pos.1 * CHUNK_SIDE + lz) as f32,
    );
    let height = info.visual_height as f32 / 16.0;
    let tint = if block == BlockId::GRASS && normal[1] > 0.0 { 1.0 } else { 0.0 };
    let normal = glam::Vec3::from(normal);

    // Corners of the unit quad facing `normal`, wound so the two triangles below are
    // both counter-clockwise when viewed from the outside.
    let corners = face_corners(normal.into(), height);

    let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
    let quad: Vec<Vertex> = corners
        .iter()
        .zip(uvs)
        .map(|(offset, uv)| Vertex {
            position: base + glam::Vec3::from(*offset),
            uv,
            normal,
            ambient_occlusion: 1.0,
            tint,
        })
        .collect();

    // Two triangles: (0,1,2) and (0,2,3).
    out.push(quad[0]);
    out.push(quad[1]);
    out.push(quad[2]);
    out.push(quad[0]);
    out.push(quad[2]);
    out.push(quad[3]);
}

fn face_corners(normal: [f32; 3], height: f32) -> [[f32; 3]; 4] {
    match normal {
        [1.0, 0.0, 0.0] => [[1.0, 0.0, 0.0], [1.0, 0.0, 1.0], [1.0, height, 1.0], [1.0, height, 0.0]],
        [-1.0, 0.0, 0.0] => [[0.0, 0.0, 1.0], [0.0, 0.0, 0.0], [0.0, height, 0.0], [0.0, height, 1.0]],
        [0.0, 1.0, 0.0] => [[0.0, height, 0.0], [1.0, height, 0.0], [1.0, height, 1.0], [0.0, height, 1.0]],
        [0.0, -1.0, 0.0] => [[0.0, 0.0, 1.0], [1.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
        [0.0, 0.0, 1.0] => [[1.0, 0.0, 1.0], [0.0, 0.0, 1.0], [0.0, height, 1.0], [1.0, height, 1.0]],
        [0.0, 0.0, -1.0] => [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, height, 0.0], [0.0, height, 0.0]],
        _ => unreachable!("FACES only contains unit axis normals"),
    }
}

#[inline]
fn pack(pos: ChunkPos) -> i64 {
    ((pos.0 as i64) << 32) | (pos.1 as u32 as i64)
}

#[inline]
fn unpack(key: i64) -> ChunkPos {
    ((key >> 32) as i32, key as i32)
}
