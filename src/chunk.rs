//! Chunk state machine, dirty tracker and owned chunk data (C1 + §3 data model).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::block::BlockId;
use crate::config::{CHUNK_SIDE, WORLD_HEIGHT};

/// A single lifecycle state a chunk can be in. These are independent bits, not an
/// enumeration, because progress on terrain, features and meshing is tracked
/// separately (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkState {
    BlocksPopulated = 0b0000_0001,
    FeaturesPopulated = 0b0000_0010,
    MeshGenerating = 0b0000_0100,
    MeshCpuReady = 0b0000_1000,
    MeshGpuReady = 0b0001_0000,
    Unloading = 0b0010_0000,
}

/// A lock-free set of `ChunkState` bits with CAS transitions.
#[derive(Debug, Default)]
pub struct ChunkStateSet(AtomicU8);

impl ChunkStateSet {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    #[inline]
    pub fn has_state(&self, s: ChunkState) -> bool {
        self.0.load(Ordering::Acquire) & s as u8 != 0
    }

    pub fn has_any_state(&self, states: &[ChunkState]) -> bool {
        let bits = self.0.load(Ordering::Acquire);
        states.iter().any(|s| bits & *s as u8 != 0)
    }

    /// Both `FEATURES_POPULATED` and `MESH_GPU_READY` set, `UNLOADING` clear.
    pub fn is_renderable(&self) -> bool {
        let bits = self.0.load(Ordering::Acquire);
        let want = ChunkState::FeaturesPopulated as u8 | ChunkState::MeshGpuReady as u8;
        (bits & want == want) && (bits & ChunkState::Unloading as u8 == 0)
    }

    /// Attempt to set `s`. Fails (returns `false`, no mutation) when:
    /// - the chunk is already `UNLOADING` and `s == Unloading` (no re-entry),
    /// - `s == MeshGenerating` while a build is already in flight.
    pub fn add_state(&self, s: ChunkState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if s == ChunkState::Unloading && current & ChunkState::Unloading as u8 != 0 {
                return false;
            }
            if s == ChunkState::MeshGenerating && current & ChunkState::MeshGenerating as u8 != 0 {
                return false;
            }
            let next = current | s as u8;
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn remove_state(&self, s: ChunkState) {
        self.0.fetch_and(!(s as u8), Ordering::AcqRel);
    }

    /// Raw bitmask snapshot, used only for diagnostic context (spec.md §7).
    #[inline]
    pub fn bits(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

/// Independent dirty flags tracking divergence from the last saved/meshed state.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    blocks_dirty: AtomicBool,
    mesh_dirty: AtomicBool,
    /// Set on freshly generated chunks that contain transient residue (flowing
    /// water) which must be persisted even though no player edit occurred yet.
    transient_residue: AtomicBool,
}

impl DirtyTracker {
    pub fn mark_block_dirty(&self) {
        self.blocks_dirty.store(true, Ordering::Release);
    }

    pub fn mark_mesh_dirty(&self) {
        self.mesh_dirty.store(true, Ordering::Release);
    }

    pub fn mark_mesh_clean(&self) {
        self.mesh_dirty.store(false, Ordering::Release);
    }

    pub fn mark_transient_residue(&self) {
        self.transient_residue.store(true, Ordering::Release);
    }

    /// Clears `blocksDirty` only; `meshDirty` is untouched (spec.md §4.1).
    pub fn mark_saved(&self) {
        self.blocks_dirty.store(false, Ordering::Release);
        self.transient_residue.store(false, Ordering::Release);
    }

    pub fn needs_save(&self) -> bool {
        self.blocks_dirty.load(Ordering::Acquire) || self.transient_residue.load(Ordering::Acquire)
    }

    pub fn is_mesh_dirty(&self) -> bool {
        self.mesh_dirty.load(Ordering::Acquire)
    }

    pub fn is_blocks_dirty(&self) -> bool {
        self.blocks_dirty.load(Ordering::Acquire)
    }
}

/// Opaque CPU-side mesh buffers produced by the mesh pipeline (C5), grouped by the
/// render pass they belong to.
#[derive(Debug, Clone, Default)]
pub struct MeshBuffers {
    pub opaque: Vec<Vertex>,
    pub water: Vec<Vertex>,
    pub alpha_tested: Vec<Vertex>,
}

impl MeshBuffers {
    pub fn is_empty(&self) -> bool {
        self.opaque.is_empty() && self.water.is_empty() && self.alpha_tested.is_empty()
    }
}

/// One emitted quad vertex: position, atlas UV, normal, and the two per-vertex flags
/// named in spec.md §3 (isWater / isAlphaTested are carried at the face/group level
/// in `MeshBuffers`, so here they're the occlusion and tint flags a renderer expects).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub position: glam::Vec3,
    pub uv: [f32; 2],
    pub normal: glam::Vec3,
    pub ambient_occlusion: f32,
    pub tint: f32,
}

/// Opaque GPU handle placeholder. Real contents are owned and interpreted only by the
/// render-thread-side `Renderer` collaborator (spec.md §6); the core never dereferences
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuHandles(pub u64);

/// Ancillary per-block metadata the generator may attach, persisted sparsely
/// alongside the dense block array (spec.md §6 chunk payload).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AncillaryData {
    /// `(localX, y, localZ) -> snow layer count`.
    pub snow: Vec<(u8, u16, u8, u8)>,
    /// `(localX, y, localZ) -> (water level, flags)`.
    pub water: Vec<(u8, u16, u8, u8, u8)>,
}

/// `(cx, cz)` chunk coordinate.
pub type ChunkPos = (i32, i32);

/// An authoritative in-memory chunk: block grid, lifecycle state, dirty flags, and
/// whatever mesh/GPU artifacts have been produced for it so far.
pub struct Chunk {
    pub pos: ChunkPos,
    blocks: Box<[BlockId]>,
    pub state: ChunkStateSet,
    pub dirty: DirtyTracker,
    pub ancillary: AncillaryData,
    pub mesh: Option<MeshBuffers>,
    pub gpu: Option<GpuHandles>,
    /// Incremented whenever `schedule` is called while a build is already in flight;
    /// the mesh pipeline consults this to decide whether to re-run after completion.
    pub rebuild_requested: AtomicBool,
    /// Count of consecutive failed mesh builds, reset on success.
    pub failed_build_attempts: AtomicU8,
    /// When this chunk last reached `MESH_CPU_READY`, cleared once uploaded. Lets the
    /// streaming scheduler notice a chunk stuck waiting on the upload budget longer
    /// than the budget can explain (spec.md §4.6 `ensureReadyForRender`).
    cpu_ready_since: Mutex<Option<Instant>>,
}

#[inline]
fn block_index(lx: i32, y: i32, lz: i32) -> usize {
    debug_assert!((0..CHUNK_SIDE).contains(&lx));
    debug_assert!((0..WORLD_HEIGHT).contains(&y));
    debug_assert!((0..CHUNK_SIDE).contains(&lz));
    ((lx * WORLD_HEIGHT + y) * CHUNK_SIDE + lz) as usize
}

impl Chunk {
    pub fn new(pos: ChunkPos) -> Self {
        let volume = (CHUNK_SIDE * WORLD_HEIGHT * CHUNK_SIDE) as usize;
        Self {
            pos,
            blocks: vec![BlockId::AIR; volume].into_boxed_slice(),
            state: ChunkStateSet::new(),
            dirty: DirtyTracker::default(),
            ancillary: AncillaryData::default(),
            mesh: None,
            gpu: None,
            rebuild_requested: AtomicBool::new(false),
            failed_build_attempts: AtomicU8::new(0),
            cpu_ready_since: Mutex::new(None),
        }
    }

    pub fn from_blocks(pos: ChunkPos, blocks: Box<[BlockId]>) -> Self {
        let expected = (CHUNK_SIDE * WORLD_HEIGHT * CHUNK_SIDE) as usize;
        assert_eq!(blocks.len(), expected, "chunk block array has wrong length");
        Self {
            pos,
            blocks,
            state: ChunkStateSet::new(),
            dirty: DirtyTracker::default(),
            ancillary: AncillaryData::default(),
            mesh: None,
            gpu: None,
            rebuild_requested: AtomicBool::new(false),
            failed_build_attempts: AtomicU8::new(0),
            cpu_ready_since: Mutex::new(None),
        }
    }

    #[inline]
    pub fn block(&self, lx: i32, y: i32, lz: i32) -> BlockId {
        if !(0..WORLD_HEIGHT).contains(&y) {
            return BlockId::AIR;
        }
        self.blocks[block_index(lx, y, lz)]
    }

    /// Writes `block` at the local coordinate, returning whether it actually changed.
    /// Does not touch dirty flags; callers (C4) decide dirtying policy.
    pub fn set_block_local(&mut self, lx: i32, y: i32, lz: i32, block: BlockId) -> bool {
        if !(0..WORLD_HEIGHT).contains(&y) {
            return false;
        }
        let idx = block_index(lx, y, lz);
        if self.blocks[idx] == block {
            return false;
        }
        self.blocks[idx] = block;
        true
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [BlockId] {
        &mut self.blocks
    }

    /// Whether the chunk has any flowing (non-source) water anywhere, used to decide
    /// the transient-residue dirty rule at creation time (spec.md §4.4).
    pub fn has_flowing_water(&self) -> bool {
        self.blocks.iter().any(|b| b.is_flowing_water())
    }

    pub fn mark_mesh_cpu_ready_now(&self) {
        *self.cpu_ready_since.lock() = Some(Instant::now());
    }

    pub fn clear_mesh_cpu_ready_since(&self) {
        *self.cpu_ready_since.lock() = None;
    }

    /// How long this chunk has been sitting in `MESH_CPU_READY`, if it's there at all.
    pub fn mesh_cpu_ready_elapsed(&self) -> Option<std::time::Duration> {
        self.cpu_ready_since.lock().map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renderable_requires_features_and_gpu_mesh() {
        let set = ChunkStateSet::new();
        assert!(!set.is_renderable());
        set.add_state(ChunkState::FeaturesPopulated);
        assert!(!set.is_renderable());
        set.add_state(ChunkState::MeshGpuReady);
        assert!(set.is_renderable());
        set.add_state(ChunkState::Unloading);
        assert!(!set.is_renderable());
    }

    #[test]
    fn mesh_generating_is_exclusive() {
        let set = ChunkStateSet::new();
        assert!(set.add_state(ChunkState::MeshGenerating));
        assert!(!set.add_state(ChunkState::MeshGenerating));
        set.remove_state(ChunkState::MeshGenerating);
        assert!(set.add_state(ChunkState::MeshGenerating));
    }

    #[test]
    fn unloading_cannot_be_set_twice() {
        let set = ChunkStateSet::new();
        assert!(set.add_state(ChunkState::Unloading));
        assert!(!set.add_state(ChunkState::Unloading));
    }

    #[test]
    fn mark_saved_clears_blocks_dirty_not_mesh_dirty() {
        let dirty = DirtyTracker::default();
        dirty.mark_block_dirty();
        dirty.mark_mesh_dirty();
        assert!(dirty.needs_save());
        dirty.mark_saved();
        assert!(!dirty.needs_save());
        assert!(dirty.is_mesh_dirty());
    }

    #[test]
    fn transient_residue_keeps_needs_save_true() {
        let dirty = DirtyTracker::default();
        dirty.mark_transient_residue();
        assert!(dirty.needs_save());
        dirty.mark_saved();
        assert!(!dirty.needs_save());
    }

    #[test]
    fn set_block_local_reports_change() {
        let mut chunk = Chunk::new((0, 0));
        assert!(chunk.set_block_local(0, 64, 0, BlockId::STONE));
        assert!(!chunk.set_block_local(0, 64, 0, BlockId::STONE));
        assert_eq!(chunk.block(0, 64, 0), BlockId::STONE);
    }

    #[test]
    fn out_of_range_height_reads_as_air_and_rejects_writes() {
        let mut chunk = Chunk::new((0, 0));
        assert_eq!(chunk.block(0, -1, 0), BlockId::AIR);
        assert!(!chunk.set_block_local(0, WORLD_HEIGHT, 0, BlockId::STONE));
    }
}
