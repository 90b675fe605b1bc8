//! Numeric knobs for the core, collected in one place instead of scattered constants.
//!
//! `Config` is a plain value owned by whoever constructs the world (tests included);
//! there is no global/static configuration anywhere in this crate (see spec's design
//! note on the source's singleton resource manager).

/// Chunk side length in blocks, both X and Z.
pub const CHUNK_SIDE: i32 = 16;
/// World column height in blocks.
pub const WORLD_HEIGHT: i32 = 256;
/// Chunk count per region file axis.
pub const REGION_SIDE: i32 = 32;

/// Tunable knobs for streaming, meshing and I/O. See spec.md §6.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Radius, in chunks, of the area that must be renderable around the observer.
    pub render_distance: i32,
    /// Size of the streaming load/unload pool. Clamped to `[4, 16]`.
    pub load_threads: usize,
    /// Size of the mesh-build pool. Clamped to `[2, 8]`.
    pub mesh_threads: usize,
    /// Scheduler tick interval.
    pub update_interval_ms: u64,
    /// Minimum adaptive GPU upload batch size.
    pub gl_batch_min: u32,
    /// Maximum adaptive GPU upload batch size.
    pub gl_batch_max: u32,
    /// Starting adaptive GPU upload batch size.
    pub gl_batch_default: u32,
    /// Frame time, in ms, above which the budget shrinks (when queue depth is small).
    pub gl_high_frame_time_ms: f32,
    /// Frame time, in ms, below which the budget is allowed to keep growing.
    pub gl_low_frame_time_ms: f32,
    /// How often the cached memory-pressure probe is refreshed.
    pub memory_check_interval_ms: u64,
    /// Fraction of max heap use, above which memory pressure caps the upload budget.
    pub high_memory_threshold: f32,
    /// Per-chunk mesh-build retry budget before a chunk is marked render-failed.
    pub max_failed_chunk_retries: u32,
}

impl Config {
    /// Border frontier: the outermost ring where meshing is still considered valid, one
    /// chunk further out than the render distance.
    #[inline]
    pub fn border_chunk_distance(&self) -> i32 {
        self.render_distance + 1
    }

    /// Clamp every knob into the range spec.md documents for it. Called once at
    /// construction; nothing in this crate mutates a `Config` after validation.
    pub fn validate(mut self) -> Self {
        self.load_threads = self.load_threads.clamp(4, 16);
        self.mesh_threads = self.mesh_threads.clamp(2, 8);
        self.gl_batch_min = self.gl_batch_min.max(1);
        self.gl_batch_max = self.gl_batch_max.max(self.gl_batch_min);
        self.gl_batch_default = self
            .gl_batch_default
            .clamp(self.gl_batch_min, self.gl_batch_max);
        self.render_distance = self.render_distance.max(0);
        self.max_failed_chunk_retries = self.max_failed_chunk_retries.max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            render_distance: 8,
            load_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .clamp(4, 16),
            mesh_threads: std::thread::available_parallelism()
                .map(|n| n.get() / 2 + 1)
                .unwrap_or(2)
                .clamp(2, 8),
            update_interval_ms: 100,
            gl_batch_min: 4,
            gl_batch_max: 128,
            gl_batch_default: 32,
            gl_high_frame_time_ms: 18.0,
            gl_low_frame_time_ms: 14.0,
            memory_check_interval_ms: 2000,
            high_memory_threshold: 0.80,
            max_failed_chunk_retries: 3,
        }
        .validate()
    }
}
