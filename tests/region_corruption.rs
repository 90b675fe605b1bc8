//! On-disk corruption recovery through the real save repository, not just the
//! in-memory region backend: a slot whose declared payload length overruns its
//! sector run must be treated as missing, deleted, and regenerable.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use chunkcore::chunk::Chunk;
use chunkcore::error::{ErrorClass, ErrorReporter};
use chunkcore::save::SaveRepository;

const FIRST_PAYLOAD_SECTOR_OFFSET: u64 = 2 * 4096;

#[test]
fn corrupted_payload_length_is_recovered_and_can_be_regenerated() {
    let dir = tempfile::tempdir().unwrap();

    let errors = Arc::new(ErrorReporter::default());
    let repo = SaveRepository::open(dir.path(), 1, Arc::clone(&errors));
    let chunk = Chunk::new((0, 0));
    repo.save_chunk(&chunk).wait().unwrap();
    repo.close();

    let region_path = dir.path().join("region").join("r.0.0.mcr");
    assert!(region_path.is_file());

    // Overwrite the first payload sector's declared length prefix with a value far
    // larger than the sector run actually allocated to this slot.
    let mut file = OpenOptions::new().write(true).open(&region_path).unwrap();
    file.seek(SeekFrom::Start(FIRST_PAYLOAD_SECTOR_OFFSET)).unwrap();
    file.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
    file.flush().unwrap();
    drop(file);

    let errors = Arc::new(ErrorReporter::default());
    let repo = SaveRepository::open(dir.path(), 1, Arc::clone(&errors));

    let loaded = repo.load_chunk((0, 0)).wait();
    assert!(matches!(loaded, Ok(None)), "corrupted slot must load as absent, got {loaded:?}");
    assert_eq!(errors.count(ErrorClass::Corruption), 1);
    assert!(!repo.chunk_exists((0, 0)).wait(), "corrupted slot must be cleared, not just skipped");

    // The slot is free again: saving a freshly generated chunk at the same position
    // must succeed and round-trip.
    let mut regenerated = Chunk::new((0, 0));
    regenerated.set_block_local(3, 70, 3, chunkcore::block::BlockId::STONE);
    repo.save_chunk(&regenerated).wait().unwrap();

    let reloaded = repo.load_chunk((0, 0)).wait().unwrap().expect("freshly saved chunk must load");
    let reloaded = Chunk::from_blocks((0, 0), reloaded.blocks);
    assert_eq!(reloaded.block(3, 70, 3), chunkcore::block::BlockId::STONE);

    repo.close();
}
