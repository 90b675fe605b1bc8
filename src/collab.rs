//! Interfaces to external collaborators (spec.md §6): terrain generation, the water
//! system, and the renderer. The core only fixes these seams; implementations live
//! outside this crate (or as test stubs).

use crate::block::BlockId;
use crate::chunk::{Chunk, ChunkPos, GpuHandles, MeshBuffers};

/// A water cell observed through the water system's query interface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Water {
    pub level: u8,
    pub source: bool,
}

impl Water {
    #[inline]
    pub fn is_source(&self) -> bool {
        self.source
    }
}

/// Terrain/feature generation, out of scope for this core but consumed through this
/// seam (spec.md §1, §4.4).
pub trait Generator: Send + Sync {
    /// Produce a terrain-only chunk: blocks set, no feature decoration. Must not read
    /// or write neighboring chunks. An `Err` aborts the in-flight `getOrCreate` for
    /// this position entirely; nothing is inserted into the map and the streaming
    /// scheduler may retry on a later tick (spec.md §7 "Generation failure").
    fn generate_terrain_only(&self, pos: ChunkPos) -> Result<Chunk, String>;

    /// Write feature blocks (trees, ore veins, decorations) into `chunk`. May read
    /// blocks from the eight neighbor chunks via `neighbor_block`, but must never
    /// create or mutate a neighbor.
    fn populate_features(&self, chunk: &mut Chunk, neighbor_block: &dyn Fn(i32, i32, i32) -> BlockId);
}

/// Water simulation hooks, out of scope for this core (spec.md §1, §6).
pub trait WaterSystem: Send + Sync {
    fn on_block_changed(&self, wx: i32, wy: i32, wz: i32, prev: BlockId, next: BlockId);
    fn on_chunk_loaded(&self, chunk: &Chunk);
    fn on_chunk_unloaded(&self, pos: ChunkPos);
    fn get_water_block(&self, wx: i32, wy: i32, wz: i32) -> Option<Water>;
}

/// Render-thread-only operations consuming the mesh pipeline's output (spec.md §6).
pub trait Renderer: Send + Sync {
    fn upload_mesh(&self, buffers: &MeshBuffers) -> Result<GpuHandles, String>;
    fn delete_mesh(&self, handles: GpuHandles);
    fn draw_chunk(&self, handles: GpuHandles);
}

/// Cached probe for process memory pressure, consulted by the mesh pipeline's adaptive
/// GPU upload budget (spec.md §4.5 "memory pressure" / §6 `memoryCheckIntervalMs`). The
/// probe itself is a collaborator: the core only needs a fraction in `[0.0, 1.0]`, not
/// an opinion on how heap use is measured on a given platform.
pub trait MemoryProbe: Send + Sync {
    /// Current heap use as a fraction of the configured maximum, `0.0..=1.0`.
    fn heap_use_fraction(&self) -> f32;
}

/// A probe that never reports pressure, for tests and headless tools that don't track
/// heap use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMemoryProbe;

impl MemoryProbe for NullMemoryProbe {
    fn heap_use_fraction(&self) -> f32 {
        0.0
    }
}
