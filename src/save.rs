//! Save Repository (C3): serializes whole entities (chunks, world metadata, player
//! data) over the region file store, with corruption recovery and a small dedicated
//! I/O thread pool (spec.md §4.3).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::block::BlockId;
use crate::chunk::{AncillaryData, Chunk, ChunkPos};
use crate::config::{CHUNK_SIDE, WORLD_HEIGHT};
use crate::error::{ErrorClass, ErrorReporter};
use crate::io::{ReadExt, WriteExt};
use crate::record::{Record, Value};
use crate::region::{RegionDir, RegionError};

const CHUNK_PAYLOAD_VERSION: u8 = 1;
const ENCODING_DENSE: u8 = 0;
const ENCODING_RLE: u8 = 1;
const FEATURES_POPULATED_BIT: u8 = 0b1;

/// Decoded chunk contents, ready for `ChunkStore` to wrap into a live `Chunk`.
#[derive(Debug)]
pub struct ChunkData {
    pub blocks: Box<[BlockId]>,
    pub ancillary: AncillaryData,
    pub features_populated: bool,
}

/// A handle to a result that will be produced by the I/O pool, standing in for the
/// spec's `Future<T>` without pulling in an async runtime the rest of the crate
/// doesn't use.
pub struct SaveHandle<T> {
    receiver: Receiver<T>,
}

impl<T> SaveHandle<T> {
    pub fn wait(self) -> T {
        self.receiver.recv().expect("save I/O worker dropped without responding")
    }
}

enum Job {
    SaveChunk {
        pos: ChunkPos,
        payload: Vec<u8>,
        respond: Sender<Result<(), RegionError>>,
    },
    LoadChunk {
        pos: ChunkPos,
        respond: Sender<Result<Option<ChunkData>, ()>>,
    },
    ChunkExists {
        pos: ChunkPos,
        respond: Sender<bool>,
    },
    Flush {
        respond: Sender<()>,
    },
}

/// Facade over the region store that serializes whole entities and runs I/O on a
/// small dedicated thread pool (default size 2).
pub struct SaveRepository {
    sender: Sender<Job>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    world_dir: PathBuf,
    errors: Arc<ErrorReporter>,
}

impl SaveRepository {
    pub fn open(world_dir: impl Into<PathBuf>, io_threads: usize, errors: Arc<ErrorReporter>) -> Self {
        let world_dir = world_dir.into();
        let regions_dir = world_dir.join("region");
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let region_dir = Arc::new(Mutex::new(RegionDir::new(regions_dir)));
        let mut handles = Vec::new();
        for _ in 0..io_threads.max(1) {
            let receiver = receiver.clone();
            let region_dir = Arc::clone(&region_dir);
            let errors = Arc::clone(&errors);
            handles.push(std::thread::spawn(move || run_io_worker(receiver, region_dir, errors)));
        }

        Self {
            sender,
            handles: Mutex::new(handles),
            world_dir,
            errors,
        }
    }

    /// Serialize and persist `chunk`. Returns a handle resolving once a region write
    /// (not necessarily an fsync) has completed.
    pub fn save_chunk(&self, chunk: &Chunk) -> SaveHandle<Result<(), RegionError>> {
        let payload = encode_chunk_payload(
            chunk.pos,
            chunk.blocks(),
            &chunk.ancillary,
            chunk.state.has_state(crate::chunk::ChunkState::FeaturesPopulated),
        );
        let (respond, receiver) = bounded(1);
        let _ = self.sender.send(Job::SaveChunk {
            pos: chunk.pos,
            payload,
            respond,
        });
        SaveHandle { receiver }
    }

    /// Load and decode a chunk. On decode failure the repository deletes the slot and
    /// resolves to `Ok(None)` so the caller regenerates (spec.md §4.3 recovery policy).
    pub fn load_chunk(&self, pos: ChunkPos) -> SaveHandle<Result<Option<ChunkData>, ()>> {
        let (respond, receiver) = bounded(1);
        let _ = self.sender.send(Job::LoadChunk { pos, respond });
        SaveHandle { receiver }
    }

    pub fn chunk_exists(&self, pos: ChunkPos) -> SaveHandle<bool> {
        let (respond, receiver) = bounded(1);
        let _ = self.sender.send(Job::ChunkExists { pos, respond });
        SaveHandle { receiver }
    }

    pub fn flush(&self) {
        let (respond, receiver) = bounded(1);
        let _ = self.sender.send(Job::Flush { respond });
        let _ = receiver.recv();
    }

    pub fn close(self) {
        self.flush();
        drop(self.sender);
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }

    fn world_metadata_path(&self) -> PathBuf {
        self.world_dir.join("world.dat")
    }

    fn player_data_path(&self) -> PathBuf {
        self.world_dir.join("player.dat")
    }

    pub fn save_world(&self, metadata: &WorldMetadata) -> io::Result<()> {
        atomic_write_record(&self.world_dir, &self.world_metadata_path(), &metadata.to_record())
    }

    pub fn load_world(&self) -> Option<WorldMetadata> {
        let record = read_record(&self.world_metadata_path())?;
        WorldMetadata::from_record(&record)
    }

    pub fn save_player(&self, player: &PlayerData) -> io::Result<()> {
        atomic_write_record(&self.world_dir, &self.player_data_path(), &player.to_record())
    }

    pub fn load_player(&self) -> Option<PlayerData> {
        let record = read_record(&self.player_data_path())?;
        PlayerData::from_record(&record)
    }
}

use std::io;

/// Small bound on retries for transient I/O (spec.md §7: "retried by the repository up
/// to a small bound; surfaced as `None` ... if retries fail"), mirroring the per-chunk
/// `max_failed_chunk_retries` precedent the mesh pipeline (C5) uses for its own retry
/// budget.
const IO_RETRY_ATTEMPTS: u32 = 3;
const IO_RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Whether a region-level error is the kind a retry can plausibly help with (a
/// short/interrupted read or write), as opposed to genuine corruption (a bad header
/// entry, an impossible length prefix) that retrying would just reproduce. A region
/// file that simply doesn't exist yet is neither: see [`is_missing`].
fn is_transient(err: &RegionError) -> bool {
    matches!(err, RegionError::Io(io_err) if io_err.kind() != io::ErrorKind::NotFound)
}

/// Whether `err` is just "no region file here yet" (`ensure_region(.., create: false)`
/// on a chunk that was never saved). This is the ordinary first-load case, not a fault:
/// it must resolve straight to `Ok(None)`, with no retry and no error report.
fn is_missing(err: &RegionError) -> bool {
    matches!(err, RegionError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound)
}

/// Retry `attempt` up to [`IO_RETRY_ATTEMPTS`] times with a linear backoff, stopping
/// immediately on a non-transient error.
fn with_io_retry<T>(mut attempt: impl FnMut() -> Result<T, RegionError>) -> Result<T, RegionError> {
    let mut last_err = None;
    for try_index in 0..IO_RETRY_ATTEMPTS {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                last_err = Some(err);
                if try_index + 1 < IO_RETRY_ATTEMPTS {
                    std::thread::sleep(IO_RETRY_BACKOFF * (try_index + 1));
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

fn run_io_worker(receiver: Receiver<Job>, region_dir: Arc<Mutex<RegionDir>>, errors: Arc<ErrorReporter>) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::SaveChunk { pos, payload, respond } => {
                let result = with_io_retry(|| {
                    let mut regions = region_dir.lock();
                    let region = regions.ensure_region(pos.0, pos.1, true)?;
                    region.write_chunk(pos.0 & 31, pos.1 & 31, &payload)
                });
                if let Err(err) = &result {
                    errors.report(ErrorClass::TransientIo, err.to_string(), Some(pos));
                }
                let _ = respond.send(result);
            }
            Job::LoadChunk { pos, respond } => {
                let result = load_chunk_sync(&region_dir, pos, &errors);
                let _ = respond.send(result);
            }
            Job::ChunkExists { pos, respond } => {
                let mut regions = region_dir.lock();
                let exists = match regions.ensure_region(pos.0, pos.1, false) {
                    Ok(region) => region.has_chunk(pos.0 & 31, pos.1 & 31),
                    Err(_) => false,
                };
                let _ = respond.send(exists);
            }
            Job::Flush { respond } => {
                let _ = region_dir.lock().flush_all();
                let _ = respond.send(());
            }
        }
    }
}

fn load_chunk_sync(
    region_dir: &Arc<Mutex<RegionDir>>,
    pos: ChunkPos,
    errors: &ErrorReporter,
) -> Result<Option<ChunkData>, ()> {
    let read_result = with_io_retry(|| {
        let mut regions = region_dir.lock();
        let region = regions.ensure_region(pos.0, pos.1, false)?;
        region.read_chunk(pos.0 & 31, pos.1 & 31)
    });

    let payload = match read_result {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(None),
        Err(err) if is_missing(&err) => return Ok(None),
        Err(err) if is_transient(&err) => {
            errors.report(ErrorClass::TransientIo, err.to_string(), Some(pos));
            return Ok(None);
        }
        Err(err) => {
            errors.report(ErrorClass::Corruption, err.to_string(), Some(pos));
            delete_slot(region_dir, pos);
            return Ok(None);
        }
    };

    match decode_chunk_payload(pos, &payload) {
        Ok(data) => Ok(Some(data)),
        Err(err) => {
            errors.report(ErrorClass::Corruption, err.to_string(), Some(pos));
            delete_slot(region_dir, pos);
            Ok(None)
        }
    }
}

fn delete_slot(region_dir: &Arc<Mutex<RegionDir>>, pos: ChunkPos) {
    let mut regions = region_dir.lock();
    if let Ok(region) = regions.ensure_region(pos.0, pos.1, false) {
        let _ = region.delete_chunk(pos.0 & 31, pos.1 & 31);
    }
}

/// Encode a chunk's blocks and ancillary data into the wire payload described in
/// spec.md §6. Picks dense vs. RLE encoding by whichever is smaller.
fn encode_chunk_payload(
    pos: ChunkPos,
    blocks: &[BlockId],
    ancillary: &AncillaryData,
    features_populated: bool,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u8_be(CHUNK_PAYLOAD_VERSION).unwrap();
    out.write_i32::<LE>(pos.0).unwrap();
    out.write_i32::<LE>(pos.1).unwrap();

    let dense_len = 2 * blocks.len();
    let runs = run_length_encode(blocks);
    let rle_len = 4 + runs.len() * 4;

    if rle_len < dense_len {
        out.write_u8_be(ENCODING_RLE).unwrap();
        out.write_u32_be(runs.len() as u32).unwrap();
        for (id, len) in &runs {
            out.write_u16_be(*id).unwrap();
            out.write_u16_be(*len).unwrap();
        }
    } else {
        out.write_u8_be(ENCODING_DENSE).unwrap();
        for block in blocks {
            out.write_u16_be(block.0).unwrap();
        }
    }

    out.write_u16_be(ancillary.snow.len() as u16).unwrap();
    for &(lx, y, lz, layers) in &ancillary.snow {
        out.write_u8_be(lx).unwrap();
        out.write_u16_be(y).unwrap();
        out.write_u8_be(lz).unwrap();
        out.write_u8_be(layers).unwrap();
    }

    out.write_u16_be(ancillary.water.len() as u16).unwrap();
    for &(lx, y, lz, level, flags) in &ancillary.water {
        out.write_u8_be(lx).unwrap();
        out.write_u16_be(y).unwrap();
        out.write_u8_be(lz).unwrap();
        out.write_u8_be(level).unwrap();
        out.write_u8_be(flags).unwrap();
    }

    let flags = if features_populated { FEATURES_POPULATED_BIT } else { 0 };
    out.write_u8_be(flags).unwrap();

    out
}

/// Run-length-encode `blocks`, splitting runs longer than `u16::MAX` into multiple
/// entries since `runLen` is a `u16`.
fn run_length_encode(blocks: &[BlockId]) -> Vec<(u16, u16)> {
    let mut runs = Vec::new();
    let mut iter = blocks.iter();
    let Some(&first) = iter.next() else { return runs };
    let mut current = first;
    let mut count: u32 = 1;

    for &block in iter {
        if block == current && count < u16::MAX as u32 {
            count += 1;
        } else {
            runs.push((current.0, count as u16));
            current = block;
            count = 1;
        }
    }
    runs.push((current.0, count as u16));
    runs
}

fn decode_chunk_payload(requested: ChunkPos, bytes: &[u8]) -> Result<ChunkData, SaveDecodeError> {
    let mut cursor = io::Cursor::new(bytes);

    let version = cursor.read_u8_be()?;
    if version != CHUNK_PAYLOAD_VERSION {
        return Err(SaveDecodeError::UnsupportedVersion(version));
    }

    let cx = cursor.read_i32::<LE>()?;
    let cz = cursor.read_i32::<LE>()?;
    if (cx, cz) != requested {
        return Err(SaveDecodeError::CoordinateMismatch {
            requested,
            found: (cx, cz),
        });
    }

    let volume = (CHUNK_SIDE * WORLD_HEIGHT * CHUNK_SIDE) as usize;
    let encoding = cursor.read_u8_be()?;
    let blocks: Box<[BlockId]> = match encoding {
        ENCODING_DENSE => {
            let mut blocks = Vec::with_capacity(volume);
            for _ in 0..volume {
                blocks.push(BlockId(cursor.read_u16_be()?));
            }
            blocks.into_boxed_slice()
        }
        ENCODING_RLE => {
            let run_count = cursor.read_u32_be()?;
            let mut blocks = Vec::with_capacity(volume);
            for _ in 0..run_count {
                let id = cursor.read_u16_be()?;
                let len = cursor.read_u16_be()?;
                blocks.extend(std::iter::repeat(BlockId(id)).take(len as usize));
            }
            if blocks.len() != volume {
                return Err(SaveDecodeError::BlockCountMismatch {
                    expected: volume,
                    found: blocks.len(),
                });
            }
            blocks.into_boxed_slice()
        }
        other => return Err(SaveDecodeError::UnsupportedEncoding(other)),
    };

    let snow_count = cursor.read_u16_be()?;
    let mut snow = Vec::with_capacity(snow_count as usize);
    for _ in 0..snow_count {
        let lx = cursor.read_u8_be()?;
        let y = cursor.read_u16_be()?;
        let lz = cursor.read_u8_be()?;
        let layers = cursor.read_u8_be()?;
        snow.push((lx, y, lz, layers));
    }

    let water_count = cursor.read_u16_be()?;
    let mut water = Vec::with_capacity(water_count as usize);
    for _ in 0..water_count {
        let lx = cursor.read_u8_be()?;
        let y = cursor.read_u16_be()?;
        let lz = cursor.read_u8_be()?;
        let level = cursor.read_u8_be()?;
        let flags = cursor.read_u8_be()?;
        water.push((lx, y, lz, level, flags));
    }

    let flags = cursor.read_u8_be()?;
    let features_populated = flags & FEATURES_POPULATED_BIT != 0;

    Ok(ChunkData {
        blocks,
        ancillary: AncillaryData { snow, water },
        features_populated,
    })
}

#[derive(Debug, thiserror::Error)]
enum SaveDecodeError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported chunk payload version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported block encoding tag {0}")]
    UnsupportedEncoding(u8),
    #[error("payload coordinates {found:?} do not match requested {requested:?}")]
    CoordinateMismatch {
        requested: ChunkPos,
        found: ChunkPos,
    },
    #[error("RLE payload decoded to {found} blocks, expected {expected}")]
    BlockCountMismatch { expected: usize, found: usize },
}

/// World-level metadata persisted once per world (spec.md §6).
#[derive(Debug, Clone, PartialEq)]
pub struct WorldMetadata {
    pub name: String,
    pub seed: i64,
    pub spawn: (f32, f32, f32),
    pub created_at: i64,
    pub last_played_at: i64,
    pub total_playtime_ms: i64,
    pub version: String,
    pub schema_version: i32,
}

impl WorldMetadata {
    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("name", Value::Str(self.name.clone()));
        record.insert("seed", Value::I64(self.seed));
        record.insert(
            "spawn",
            Value::List(vec![
                Value::F32(self.spawn.0),
                Value::F32(self.spawn.1),
                Value::F32(self.spawn.2),
            ]),
        );
        record.insert("created_at", Value::I64(self.created_at));
        record.insert("last_played_at", Value::I64(self.last_played_at));
        record.insert("total_playtime_ms", Value::I64(self.total_playtime_ms));
        record.insert("version", Value::Str(self.version.clone()));
        record.insert("schema_version", Value::I64(self.schema_version as i64));
        record
    }

    fn from_record(record: &Record) -> Option<Self> {
        let spawn = record.get_list("spawn")?;
        let spawn = (
            value_f32(spawn.first()?)?,
            value_f32(spawn.get(1)?)?,
            value_f32(spawn.get(2)?)?,
        );
        Some(Self {
            name: record.get_str("name")?.to_owned(),
            seed: record.get_i64("seed")?,
            spawn,
            created_at: record.get_i64("created_at")?,
            last_played_at: record.get_i64("last_played_at")?,
            total_playtime_ms: record.get_i64("total_playtime_ms")?,
            version: record.get_str("version")?.to_owned(),
            schema_version: record.get_i64("schema_version")? as i32,
        })
    }
}

fn value_f32(value: &Value) -> Option<f32> {
    match value {
        Value::F32(v) => Some(*v),
        _ => None,
    }
}

/// A single inventory slot: `None` for empty, `Some((block_id, count))` otherwise.
pub type InventorySlot = Option<(u16, u8)>;

/// Player state persisted once per world (spec.md §6). 36 inventory slots: 0..9
/// hotbar, 9..36 main inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerData {
    pub position: (f64, f64, f64),
    pub look: (f32, f32),
    pub health: f32,
    pub flying: bool,
    pub game_mode: i32,
    pub inventory: Vec<InventorySlot>,
    pub selected_hotbar_slot: u8,
}

impl PlayerData {
    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(
            "position",
            Value::List(vec![
                Value::F64(self.position.0),
                Value::F64(self.position.1),
                Value::F64(self.position.2),
            ]),
        );
        record.insert(
            "look",
            Value::List(vec![Value::F32(self.look.0), Value::F32(self.look.1)]),
        );
        record.insert("health", Value::F32(self.health));
        record.insert("flying", Value::Bool(self.flying));
        record.insert("game_mode", Value::I64(self.game_mode as i64));
        record.insert(
            "inventory",
            Value::List(
                self.inventory
                    .iter()
                    .map(|slot| match slot {
                        None => Value::List(Vec::new()),
                        Some((id, count)) => Value::List(vec![Value::I64(*id as i64), Value::I64(*count as i64)]),
                    })
                    .collect(),
            ),
        );
        record.insert("selected_hotbar_slot", Value::I64(self.selected_hotbar_slot as i64));
        record
    }

    fn from_record(record: &Record) -> Option<Self> {
        let position = record.get_list("position")?;
        let look = record.get_list("look")?;
        let inventory = record
            .get_list("inventory")?
            .iter()
            .map(|slot| match slot {
                Value::List(items) if items.len() == 2 => {
                    let id = match &items[0] {
                        Value::I64(v) => *v as u16,
                        _ => return None,
                    };
                    let count = match &items[1] {
                        Value::I64(v) => *v as u8,
                        _ => return None,
                    };
                    Some(Some((id, count)))
                }
                Value::List(items) if items.is_empty() => Some(None),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            position: (
                value_f64(position.first()?)?,
                value_f64(position.get(1)?)?,
                value_f64(position.get(2)?)?,
            ),
            look: (value_f32(look.first()?)?, value_f32(look.get(1)?)?),
            health: record.get_f32("health")?,
            flying: record.get_bool("flying")?,
            game_mode: record.get_i64("game_mode")? as i32,
            inventory,
            selected_hotbar_slot: record.get_i64("selected_hotbar_slot")? as u8,
        })
    }
}

fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::F64(v) => Some(*v),
        _ => None,
    }
}

/// Atomically replace `path` with `record`'s encoding via a temp file in the same
/// directory followed by a rename (spec.md §6).
fn atomic_write_record(dir: &Path, path: &Path, record: &Record) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut buf = Vec::new();
    record
        .write_to(&mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, &buf)?;
    tmp.persist(path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(())
}

fn read_record(path: &Path) -> Option<Record> {
    let bytes = std::fs::read(path).ok()?;
    Record::read_from(&mut io::Cursor::new(bytes)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn sample_blocks() -> Box<[BlockId]> {
        let volume = (CHUNK_SIDE * WORLD_HEIGHT * CHUNK_SIDE) as usize;
        let mut blocks = vec![BlockId::STONE; volume];
        blocks[0] = BlockId::AIR;
        blocks[volume - 1] = BlockId::WATER_FLOWING;
        blocks.into_boxed_slice()
    }

    #[test]
    fn with_io_retry_recovers_after_transient_failures_within_the_bound() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32, RegionError> = with_io_retry(|| {
            let n = attempts.fetch_add(1, Ordering::Relaxed);
            if n + 1 < IO_RETRY_ATTEMPTS {
                Err(RegionError::Io(io::Error::new(io::ErrorKind::Interrupted, "short read")))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::Relaxed), IO_RETRY_ATTEMPTS);
    }

    #[test]
    fn with_io_retry_gives_up_after_the_bound() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), RegionError> = with_io_retry(|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            Err(RegionError::Io(io::Error::new(io::ErrorKind::Interrupted, "short read")))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), IO_RETRY_ATTEMPTS);
    }

    #[test]
    fn with_io_retry_does_not_retry_non_transient_errors() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), RegionError> = with_io_retry(|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            Err(RegionError::IllegalRange)
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn loading_a_never_saved_chunk_is_a_silent_fast_path() {
        let dir = tempfile::tempdir().unwrap();
        let errors = Arc::new(ErrorReporter::default());
        let repo = SaveRepository::open(dir.path(), 1, Arc::clone(&errors));
        let loaded = repo.load_chunk((17, -3)).wait();
        assert!(matches!(loaded, Ok(None)), "a chunk with no region file yet must load as absent");
        assert_eq!(errors.count(ErrorClass::TransientIo), 0, "an absent region must not be reported as a transient I/O fault");
        assert_eq!(errors.count(ErrorClass::Corruption), 0);
        repo.close();
    }

    #[test]
    fn chunk_payload_round_trips_through_rle_or_dense() {
        let pos = (3, -4);
        let blocks = sample_blocks();
        let ancillary = AncillaryData {
            snow: vec![(1, 70, 2, 3)],
            water: vec![(5, 63, 5, 7, 0)],
        };
        let payload = encode_chunk_payload(pos, &blocks, &ancillary, true);
        let decoded = decode_chunk_payload(pos, &payload).unwrap();
        assert_eq!(decoded.blocks, blocks);
        assert_eq!(decoded.ancillary, ancillary);
        assert!(decoded.features_populated);
    }

    #[test]
    fn coordinate_mismatch_is_rejected() {
        let pos = (1, 1);
        let blocks = sample_blocks();
        let payload = encode_chunk_payload(pos, &blocks, &AncillaryData::default(), false);
        let err = decode_chunk_payload((2, 2), &payload);
        assert!(matches!(err, Err(SaveDecodeError::CoordinateMismatch { .. })));
    }

    #[test]
    fn world_metadata_round_trips_through_record() {
        let meta = WorldMetadata {
            name: "overworld".into(),
            seed: -123,
            spawn: (8.5, 70.0, 8.5),
            created_at: 1000,
            last_played_at: 2000,
            total_playtime_ms: 500,
            version: "0.2.0".into(),
            schema_version: 1,
        };
        let record = meta.to_record();
        let decoded = WorldMetadata::from_record(&record).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn player_data_round_trips_through_record() {
        let player = PlayerData {
            position: (0.0, 70.0, 0.0),
            look: (0.0, 0.0),
            health: 20.0,
            flying: false,
            game_mode: 0,
            inventory: {
                let mut inv = vec![None; 36];
                inv[0] = Some((1, 64));
                inv
            },
            selected_hotbar_slot: 0,
        };
        let record = player.to_record();
        let decoded = PlayerData::from_record(&record).unwrap();
        assert_eq!(decoded, player);
    }
}
