//! Chunk Store (C4): authoritative in-memory chunk map, position cache, and the
//! neighbor-gated deferred feature population queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::block::BlockId;
use crate::chunk::{Chunk, ChunkPos, ChunkState, GpuHandles};
use crate::collab::{Generator, WaterSystem};
use crate::config::{Config, CHUNK_SIDE};
use crate::error::{ErrorClass, ErrorReporter};
use crate::save::SaveRepository;

pub type ChunkHandle = Arc<RwLock<Chunk>>;

/// The eight neighbor offsets in a fixed, stable order; each one's index is the bit
/// position it occupies in a chunk's neighbor-populated bitmask.
const NEIGHBOR_OFFSETS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

const ALL_NEIGHBORS_MASK: u8 = 0xFF;

fn offset_index(dx: i32, dz: i32) -> usize {
    NEIGHBOR_OFFSETS
        .iter()
        .position(|&(ox, oz)| ox == dx && oz == dz)
        .expect("(dx, dz) must be one of the eight neighbor offsets")
}

#[inline]
fn pack_pos(pos: ChunkPos) -> i64 {
    ((pos.0 as i64) << 32) | (pos.1 as u32 as i64)
}

/// Chebyshev (chessboard) distance between two chunk positions: the natural streaming
/// distance for a square load region (spec.md glossary).
#[inline]
pub fn chebyshev(a: ChunkPos, b: ChunkPos) -> i32 {
    (a.0 - b.0).abs().max((a.1 - b.1).abs())
}

#[inline]
pub fn world_to_chunk(wx: i32, wz: i32) -> (ChunkPos, i32, i32) {
    let cx = wx.div_euclid(CHUNK_SIDE);
    let cz = wz.div_euclid(CHUNK_SIDE);
    let lx = wx.rem_euclid(CHUNK_SIDE);
    let lz = wz.rem_euclid(CHUNK_SIDE);
    ((cx, cz), lx, lz)
}

/// Outcome of attempting to unload a chunk, used by the caller (the streaming
/// scheduler) to decide whether a save needs to be awaited on a worker thread.
pub enum UnloadOutcome {
    /// Nothing to do: the chunk wasn't live.
    NotLive,
    /// Another unload was already in flight for this chunk.
    AlreadyUnloading,
    /// The chunk was clean; it has already been fully removed and queued for GPU
    /// teardown.
    CleanedImmediately,
    /// The chunk was dirty; its save completed and it has now been removed from the
    /// live map.
    SavedAndRemoved,
    /// The save failed; the chunk was never removed from the live map and is back to
    /// normal (non-unloading) operation.
    SaveFailedRestored,
}

pub struct ChunkStore {
    /// `IndexMap` rather than `HashMap`: the streaming scheduler snapshots this every
    /// tick via `positions()`, and a stable iteration order keeps that snapshot (and
    /// any logging derived from it) reproducible across ticks.
    live: RwLock<IndexMap<ChunkPos, ChunkHandle>>,
    position_cache: parking_lot::Mutex<HashMap<i64, Arc<ChunkPos>>>,
    neighbor_bits: parking_lot::Mutex<HashMap<ChunkPos, u8>>,
    feature_pending: parking_lot::Mutex<VecDeque<ChunkPos>>,
    gpu_teardown: parking_lot::Mutex<VecDeque<GpuHandles>>,
    repository: Arc<SaveRepository>,
    generator: Arc<dyn Generator>,
    water: Arc<dyn WaterSystem>,
    errors: Arc<ErrorReporter>,
    config: Config,
}

impl ChunkStore {
    pub fn new(
        repository: Arc<SaveRepository>,
        generator: Arc<dyn Generator>,
        water: Arc<dyn WaterSystem>,
        errors: Arc<ErrorReporter>,
        config: Config,
    ) -> Self {
        Self {
            live: RwLock::new(IndexMap::new()),
            position_cache: parking_lot::Mutex::new(HashMap::new()),
            neighbor_bits: parking_lot::Mutex::new(HashMap::new()),
            feature_pending: parking_lot::Mutex::new(VecDeque::new()),
            gpu_teardown: parking_lot::Mutex::new(VecDeque::new()),
            repository,
            generator,
            water,
            errors,
            config,
        }
    }

    pub fn get(&self, pos: ChunkPos) -> Option<ChunkHandle> {
        self.live.read().get(&pos).cloned()
    }

    pub fn has(&self, pos: ChunkPos) -> bool {
        self.live.read().contains_key(&pos)
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    /// Snapshot of every currently-live chunk position, used by the streaming
    /// scheduler to diff against the required set each tick (spec.md §4.6).
    pub fn positions(&self) -> Vec<ChunkPos> {
        self.live.read().keys().copied().collect()
    }

    pub fn repository(&self) -> &Arc<SaveRepository> {
        &self.repository
    }

    /// Returns the interned, shared position value for `pos`, allocating a new one if
    /// this is the first time it's been seen. Purely an allocation-avoidance device
    /// (spec.md §3); bounded and pruned so it can't grow unboundedly.
    pub fn intern_pos(&self, pos: ChunkPos) -> Arc<ChunkPos> {
        let key = pack_pos(pos);
        let mut cache = self.position_cache.lock();
        if let Some(existing) = cache.get(&key) {
            return Arc::clone(existing);
        }
        if cache.len() >= 200_000 || cache.len() > 2 * self.live_count().max(1) {
            cache.retain(|k, _| self.live.read().contains_key(&unpack_pos(*k)));
        }
        let interned = Arc::new(pos);
        cache.insert(key, Arc::clone(&interned));
        interned
    }

    /// Fast path returns the existing chunk; otherwise loads from the save repository
    /// if present, else asks the generator for a terrain-only chunk. Feature population
    /// is deferred (spec.md §4.4).
    /// Returns `None` if the position isn't loaded and the generator fails to produce
    /// one: no entry is inserted into the map, and the caller (typically the streaming
    /// scheduler) may retry on a later tick (spec.md §7 "Generation failure").
    pub fn get_or_create(&self, pos: ChunkPos) -> Option<ChunkHandle> {
        if let Some(existing) = self.get(pos) {
            return Some(existing);
        }

        let chunk = self.load_or_generate(pos)?;
        let handle = Arc::new(RwLock::new(chunk));

        let mut live = self.live.write();
        let handle = match live.entry(pos) {
            indexmap::map::Entry::Occupied(existing) => Arc::clone(existing.get()),
            indexmap::map::Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&handle));
                handle
            }
        };
        drop(live);

        self.water.on_chunk_loaded(&handle.read());
        self.note_blocks_populated(pos);
        Some(handle)
    }

    fn load_or_generate(&self, pos: ChunkPos) -> Option<Chunk> {
        match self.repository.load_chunk(pos).wait() {
            Ok(Some(data)) => {
                let mut chunk = Chunk::from_blocks(pos, data.blocks);
                chunk.ancillary = data.ancillary;
                chunk.state.add_state(ChunkState::BlocksPopulated);
                if data.features_populated {
                    chunk.state.add_state(ChunkState::FeaturesPopulated);
                }
                Some(chunk)
            }
            Ok(None) => self.generate(pos),
            Err(()) => {
                self.errors
                    .report(ErrorClass::TransientIo, "chunk load I/O channel dropped", Some(pos));
                self.generate(pos)
            }
        }
    }

    fn generate(&self, pos: ChunkPos) -> Option<Chunk> {
        match self.generator.generate_terrain_only(pos) {
            Ok(mut chunk) => {
                chunk.state.add_state(ChunkState::BlocksPopulated);
                if chunk.has_flowing_water() {
                    chunk.dirty.mark_transient_residue();
                }
                Some(chunk)
            }
            Err(reason) => {
                self.errors.report(ErrorClass::GenerationFailure, reason, Some(pos));
                None
            }
        }
    }

    /// Writes `block` at world coordinates if it differs from the current value,
    /// dirtying the owning chunk and any face-adjacent neighbor whose mesh the edit
    /// touches, then notifying the water collaborator.
    pub fn set_block(&self, wx: i32, wy: i32, wz: i32, block: BlockId) -> bool {
        let (pos, lx, lz) = world_to_chunk(wx, wz);
        let Some(handle) = self.get(pos) else { return false };

        let prev = {
            let chunk = handle.read();
            chunk.block(lx, wy, lz)
        };
        if prev == block {
            return false;
        }

        {
            let mut chunk = handle.write();
            if !chunk.set_block_local(lx, wy, lz, block) {
                return false;
            }
            chunk.dirty.mark_block_dirty();
            chunk.dirty.mark_mesh_dirty();
            if block.is_flowing_water() {
                chunk.dirty.mark_transient_residue();
            }
        }

        for (dx, dz, boundary) in [
            (-1, 0, lx == 0),
            (1, 0, lx == CHUNK_SIDE - 1),
            (0, -1, lz == 0),
            (0, 1, lz == CHUNK_SIDE - 1),
        ] {
            if boundary {
                if let Some(neighbor) = self.get((pos.0 + dx, pos.1 + dz)) {
                    neighbor.write().dirty.mark_mesh_dirty();
                }
            }
        }

        self.water.on_block_changed(wx, wy, wz, prev, block);
        true
    }

    /// Save-then-unload if `needsSave()`, else immediate cleanup (spec.md §4.4).
    pub fn unload(&self, pos: ChunkPos) -> UnloadOutcome {
        let handle = match self.get(pos) {
            Some(h) => h,
            None => return UnloadOutcome::NotLive,
        };

        if !handle.read().state.add_state(ChunkState::Unloading) {
            self.errors.report(
                ErrorClass::StateMachineMisuse,
                "unload requested on a chunk already UNLOADING",
                Some(pos),
            );
            return UnloadOutcome::AlreadyUnloading;
        }

        let needs_save = handle.read().dirty.needs_save();
        if !needs_save {
            self.live.write().shift_remove(&pos);
            self.finish_cleanup(pos, &handle);
            return UnloadOutcome::CleanedImmediately;
        }

        // The chunk stays in the live map for the duration of the save: a concurrent
        // `get_or_create(pos)` must keep observing this handle (and its in-flight edit)
        // until the save is known to have completed, per spec.md invariant 4 ("removed
        // from the live map only after needsSave has been cleared") and testable
        // property 3. Removing it before the save resolves would let a concurrent
        // load race in, find nothing, and fabricate a second handle for `pos`.
        match self.repository.save_chunk(&handle.read()).wait() {
            Ok(()) => {
                handle.write().dirty.mark_saved();
                self.live.write().shift_remove(&pos);
                self.finish_cleanup(pos, &handle);
                UnloadOutcome::SavedAndRemoved
            }
            Err(err) => {
                self.errors.report(ErrorClass::TransientIo, err.to_string(), Some(pos));
                handle.write().state.remove_state(ChunkState::Unloading);
                UnloadOutcome::SaveFailedRestored
            }
        }
    }

    fn finish_cleanup(&self, pos: ChunkPos, handle: &ChunkHandle) {
        if let Some(gpu) = handle.write().gpu.take() {
            self.gpu_teardown.lock().push_back(gpu);
        }
        self.water.on_chunk_unloaded(pos);
        self.neighbor_bits.lock().remove(&pos);
    }

    /// Drains GPU handles queued by unloads; called from the render thread
    /// (spec.md §4.5 `processGpuTeardown`).
    pub fn drain_gpu_teardown(&self) -> Vec<GpuHandles> {
        self.gpu_teardown.lock().drain(..).collect()
    }

    /// Called whenever a chunk reaches `BLOCKS_POPULATED`: updates the incremental
    /// neighbor bitmask for each of its eight neighbors and queues any neighbor whose
    /// bitmask has just become complete for feature population.
    fn note_blocks_populated(&self, pos: ChunkPos) {
        let mut bits = self.neighbor_bits.lock();
        let mut newly_ready = Vec::new();
        for &(dx, dz) in &NEIGHBOR_OFFSETS {
            let neighbor_pos = (pos.0 + dx, pos.1 + dz);
            let bit_in_neighbor = offset_index(-dx, -dz);
            let entry = bits.entry(neighbor_pos).or_insert(0);
            let was_ready = *entry == ALL_NEIGHBORS_MASK;
            *entry |= 1 << bit_in_neighbor;
            if !was_ready && *entry == ALL_NEIGHBORS_MASK {
                newly_ready.push(neighbor_pos);
            }
        }
        drop(bits);

        if !newly_ready.is_empty() {
            let mut pending = self.feature_pending.lock();
            for pos in newly_ready {
                pending.push_back(pos);
            }
        }
    }

    /// Drains up to `max` entries from the feature-pending queue, populating only
    /// those whose neighbors are still all present and blocks-populated; chunks that
    /// were evicted in the meantime are simply dropped rather than re-queued.
    pub fn process_deferred_feature_population(&self, max: usize) {
        let mut batch = Vec::with_capacity(max);
        {
            let mut pending = self.feature_pending.lock();
            for _ in 0..max {
                match pending.pop_front() {
                    Some(pos) => batch.push(pos),
                    None => break,
                }
            }
        }

        for pos in batch {
            let Some(handle) = self.get(pos) else { continue };
            if handle.read().state.has_state(ChunkState::FeaturesPopulated) {
                continue;
            }

            let all_neighbors_present = NEIGHBOR_OFFSETS.iter().all(|&(dx, dz)| {
                self.get((pos.0 + dx, pos.1 + dz))
                    .map(|n| n.read().state.has_state(ChunkState::BlocksPopulated))
                    .unwrap_or(false)
            });
            if !all_neighbors_present {
                self.feature_pending.lock().push_back(pos);
                continue;
            }

            let neighbor_block = |wx: i32, wy: i32, wz: i32| -> BlockId {
                let (npos, lx, lz) = world_to_chunk(wx, wz);
                if npos == pos {
                    return handle.read().block(lx, wy, lz);
                }
                self.get(npos)
                    .map(|n| n.read().block(lx, wy, lz))
                    .unwrap_or(BlockId::AIR)
            };

            {
                let mut chunk = handle.write();
                self.generator.populate_features(&mut chunk, &neighbor_block);
                chunk.state.add_state(ChunkState::FeaturesPopulated);
                chunk.dirty.mark_block_dirty();
                chunk.dirty.mark_mesh_dirty();
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[inline]
fn unpack_pos(key: i64) -> ChunkPos {
    ((key >> 32) as i32, key as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk as RawChunk;
    use crate::collab::Water;
    use crate::save::SaveRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubGenerator {
        calls: AtomicUsize,
    }
    impl Generator for StubGenerator {
        fn generate_terrain_only(&self, pos: ChunkPos) -> Result<RawChunk, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
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

    /// Fails the first call for a given position, succeeds on every call after.
    struct FlakyGenerator {
        calls: AtomicUsize,
    }
    impl Generator for FlakyGenerator {
        fn generate_terrain_only(&self, pos: ChunkPos) -> Result<RawChunk, String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("simulated generator failure".to_string())
            } else {
                Ok(RawChunk::new(pos))
            }
        }
        fn populate_features(&self, _chunk: &mut RawChunk, _neighbor_block: &dyn Fn(i32, i32, i32) -> BlockId) {}
    }

    fn test_store(dir: &std::path::Path) -> ChunkStore {
        let errors = Arc::new(ErrorReporter::default());
        let repo = Arc::new(SaveRepository::open(dir, 1, Arc::clone(&errors)));
        ChunkStore::new(
            repo,
            Arc::new(StubGenerator { calls: AtomicUsize::new(0) }),
            Arc::new(NullWater),
            errors,
            Config::default(),
        )
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let a = store.get_or_create((0, 0)).unwrap();
        let b = store.get_or_create((0, 0)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn set_block_dirties_owner_and_boundary_neighbor() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.get_or_create((0, 0)).unwrap();
        store.get_or_create((1, 0)).unwrap();

        assert!(store.set_block(CHUNK_SIDE - 1, 64, 0, BlockId::STONE));

        let owner = store.get((0, 0)).unwrap();
        assert!(owner.read().dirty.is_blocks_dirty());
        let neighbor = store.get((1, 0)).unwrap();
        assert!(neighbor.read().dirty.is_mesh_dirty());
    }

    #[test]
    fn neighbor_gating_queues_only_when_all_eight_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        for dx in -1..=1 {
            for dz in -1..=1 {
                if dx == 0 && dz == 0 {
                    continue;
                }
                store.get_or_create((dx, dz)).unwrap();
            }
        }
        store.get_or_create((0, 0)).unwrap();
        store.process_deferred_feature_population(10);
        assert!(store.get((0, 0)).unwrap().read().state.has_state(ChunkState::FeaturesPopulated));
    }

    #[test]
    fn clean_unload_removes_chunk_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.get_or_create((5, 5)).unwrap();
        let outcome = store.unload((5, 5));
        assert!(matches!(outcome, UnloadOutcome::CleanedImmediately));
        assert!(!store.has((5, 5)));
    }

    #[test]
    fn double_unload_is_reported_as_state_machine_misuse() {
        let dir = tempfile::tempdir().unwrap();
        let errors = Arc::new(ErrorReporter::default());
        let repo = Arc::new(SaveRepository::open(dir.path(), 1, Arc::clone(&errors)));
        let store = ChunkStore::new(
            repo,
            Arc::new(StubGenerator { calls: AtomicUsize::new(0) }),
            Arc::new(NullWater),
            Arc::clone(&errors),
            Config::default(),
        );
        let handle = store.get_or_create((6, 6)).unwrap();
        // Hold UNLOADING manually to simulate a second concurrent unload attempt.
        assert!(handle.read().state.add_state(ChunkState::Unloading));
        let outcome = store.unload((6, 6));
        assert!(matches!(outcome, UnloadOutcome::AlreadyUnloading));
        assert_eq!(errors.count(ErrorClass::StateMachineMisuse), 1);
    }

    #[test]
    fn dirty_unload_saves_before_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.get_or_create((2, 2)).unwrap();
        store.set_block(2 * CHUNK_SIDE, 64, 2 * CHUNK_SIDE, BlockId::STONE);
        let outcome = store.unload((2, 2));
        assert!(matches!(outcome, UnloadOutcome::SavedAndRemoved));
        assert!(!store.has((2, 2)));

        // Reloading from disk should observe the saved edit.
        let reloaded = store.get_or_create((2, 2)).unwrap();
        assert_eq!(reloaded.read().block(0, 64, 0), BlockId::STONE);
    }

    #[test]
    fn concurrent_get_or_create_sees_live_handle_until_save_completes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store(dir.path()));

        let pos = (2, 2);
        let handle = store.get_or_create(pos).unwrap();
        store.set_block(2 * CHUNK_SIDE, 64, 2 * CHUNK_SIDE, BlockId::STONE);
        assert!(handle.read().dirty.needs_save());

        // Saturate the single I/O worker with a run of dummy saves ahead of the real
        // one, so the target chunk's save stays queued/in-flight long enough for the
        // race below to have a real window, rather than resolving instantly.
        for i in 0..64 {
            let mut filler = RawChunk::new((1000 + i, 1000 + i));
            for x in 0..CHUNK_SIDE {
                for z in 0..CHUNK_SIDE {
                    filler.set_block_local(x, 64, z, BlockId(((x * CHUNK_SIDE + z) % 7 + 1) as u16));
                }
            }
            store.repository().save_chunk(&filler);
        }

        let store_for_unload = Arc::clone(&store);
        let unloader = std::thread::spawn(move || store_for_unload.unload(pos));

        // While the save is (plausibly) still in flight, a concurrent get_or_create
        // must keep returning the SAME handle, never fabricate a second one for `pos`.
        for _ in 0..20_000 {
            if let Some(seen) = store.get_or_create(pos) {
                assert!(
                    Arc::ptr_eq(&seen, &handle),
                    "a concurrent load must not create a second handle for a chunk whose save is still pending"
                );
            }
        }

        let outcome = unloader.join().unwrap();
        assert!(matches!(outcome, UnloadOutcome::SavedAndRemoved));
    }

    #[test]
    fn generation_failure_is_not_inserted_but_retry_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let errors = Arc::new(ErrorReporter::default());
        let repo = Arc::new(SaveRepository::open(dir.path(), 1, Arc::clone(&errors)));
        let store = ChunkStore::new(
            repo,
            Arc::new(FlakyGenerator { calls: AtomicUsize::new(0) }),
            Arc::new(NullWater),
            Arc::clone(&errors),
            Config::default(),
        );

        assert!(store.get_or_create((10, 10)).is_none());
        assert!(!store.has((10, 10)));
        assert_eq!(errors.count(ErrorClass::GenerationFailure), 1);

        let retried = store.get_or_create((10, 10));
        assert!(retried.is_some());
        assert!(store.has((10, 10)));
    }
}
