//! # Chunk Space Integration Tests
//!
//! Exercises the cache through its public surface with a real driver attached:
//! FIFO eviction order, pinning, write-back of evicted dirty chunks, and the
//! exactly-once guarantee of concurrent dirty declarations.
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test chunk_space -- --nocapture
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use chronostore::chunk::{ChunkKind, Coord};
use chronostore::encoding::decode_long;
use chronostore::error::store_error;
use chronostore::{ChunkSpace, MemoryDriver, StoreError};

fn at(obj: i64) -> Coord {
    Coord::new(0, 0, obj)
}

fn space_with_driver(capacity: usize) -> (Arc<ChunkSpace>, Arc<MemoryDriver>) {
    let space = ChunkSpace::new(capacity).unwrap();
    let driver = Arc::new(MemoryDriver::new());
    space.set_driver(driver.clone());
    (space, driver)
}

#[test]
fn third_chunk_evicts_the_first() {
    let (space, _driver) = space_with_driver(2);
    let a = space.create(at(1), ChunkKind::LongTree).unwrap();
    space.create(at(2), ChunkKind::LongTree).unwrap();
    space.create(at(3), ChunkKind::LongTree).unwrap();

    assert!(a.is_removed());
    assert!(space.get(at(1)).is_none());
    assert!(space.get(at(2)).is_some());
    assert!(space.get(at(3)).is_some());
    assert_eq!(space.size(), 2);
}

#[test]
fn pinned_chunks_are_skipped_by_eviction() {
    let (space, _driver) = space_with_driver(2);
    let a = space.create_pinned(at(1), ChunkKind::LongTree).unwrap();
    space.create(at(2), ChunkKind::LongTree).unwrap();
    space.create(at(3), ChunkKind::LongTree).unwrap();

    assert!(!a.is_removed());
    assert!(space.get(at(1)).is_some());
    assert!(space.get(at(2)).is_none());
}

#[test]
fn fully_pinned_space_reports_exhaustion() {
    let (space, _driver) = space_with_driver(2);
    space.create_pinned(at(1), ChunkKind::LongTree).unwrap();
    space.create_pinned(at(2), ChunkKind::LongTree).unwrap();

    let err = space.create(at(3), ChunkKind::LongTree).unwrap_err();
    assert_eq!(
        store_error(&err),
        Some(&StoreError::CapacityExhausted { capacity: 2 })
    );
    assert_eq!(space.size(), 2);
}

#[test]
fn evicted_dirty_chunk_is_written_back() {
    let (space, driver) = space_with_driver(1);
    let a = space.create(at(1), ChunkKind::LongLongMap).unwrap();
    a.as_long_map().unwrap().put(4, 16);
    assert!(a.is_dirty());
    let expected = a.serialize();

    space.create(at(2), ChunkKind::LongLongMap).unwrap();
    assert!(a.is_removed());
    assert!(!a.is_dirty());
    assert_eq!(driver.payload(at(1)), Some(expected));
}

#[test]
fn evicted_clean_chunk_is_not_written() {
    let (space, driver) = space_with_driver(1);
    space.create(at(1), ChunkKind::LongTree).unwrap();
    space.create(at(2), ChunkKind::LongTree).unwrap();
    assert!(driver.is_empty());
}

#[test]
fn remove_refuses_pinned_and_dirty_chunks() {
    let (space, _driver) = space_with_driver(4);
    let pinned = space.create_pinned(at(1), ChunkKind::LongTree).unwrap();
    let dirty = space.create(at(2), ChunkKind::LongTree).unwrap();
    dirty.as_tree().unwrap().insert(1, 0);
    space.create(at(3), ChunkKind::LongTree).unwrap();

    assert!(!space.remove(at(1)));
    assert!(!space.remove(at(2)));
    assert!(space.remove(at(3)));
    assert!(!space.remove(at(3)));

    pinned.dec();
    assert!(space.remove(at(1)));
    assert_eq!(space.resident(), vec![at(2)]);
}

#[test]
fn clone_installs_an_independent_dirty_copy() {
    let (space, _driver) = space_with_driver(4);
    let source = space.create(at(1), ChunkKind::LongLongTree).unwrap();
    source.as_tree().unwrap().insert(1, 2);
    source.as_tree().unwrap().insert(3, 4);
    let copy = space.clone_chunk(&source, Coord::new(0, 5, 1)).unwrap();
    assert!(copy.is_dirty());
    assert_eq!(
        copy.as_tree().unwrap().entries(),
        source.as_tree().unwrap().entries()
    );

    copy.as_tree().unwrap().insert(100, 1);
    assert_ne!(
        copy.as_tree().unwrap().size(),
        source.as_tree().unwrap().size()
    );
}

#[test]
fn concurrent_dirty_declarations_drain_exactly_once() {
    let (space, _driver) = space_with_driver(4_096);
    let threads = 8;
    let per_thread = 400;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let space = Arc::clone(&space);
            thread::spawn(move || {
                let mut drained = Vec::new();
                for i in 0..per_thread {
                    let coord = at((t * per_thread + i) as i64);
                    let chunk = space.create(coord, ChunkKind::LongLongMap).unwrap();
                    chunk.as_long_map().unwrap().put(i as i64, t as i64);
                    // Dirtying again must not declare twice.
                    chunk.as_long_map().unwrap().put(-1, 0);
                    if i % 64 == 0 {
                        drained.extend(space.detach_dirties());
                    }
                }
                drained
            })
        })
        .collect();

    let mut all: Vec<Coord> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.extend(space.detach_dirties());

    let unique: HashSet<Coord> = all.iter().copied().collect();
    assert_eq!(all.len(), threads * per_thread);
    assert_eq!(unique.len(), threads * per_thread);
    assert!(space.detach_dirties().is_empty());
}

#[test]
fn written_back_map_payload_is_decodable() {
    let (space, driver) = space_with_driver(1);
    let a = space.create(at(1), ChunkKind::LongLongMap).unwrap();
    a.as_long_map().unwrap().put(1, 2);
    space.create(at(2), ChunkKind::LongTree).unwrap();

    let payload = driver.payload(at(1)).unwrap();
    let count = payload
        .strip_prefix('#')
        .and_then(|rest| rest.split('/').next())
        .unwrap();
    assert_eq!(decode_long(count).unwrap(), 1);
}

#[test]
fn only_the_most_recent_chunks_stay_resident() {
    let (space, _driver) = space_with_driver(5);
    for obj in 0..20 {
        space.create(at(obj), ChunkKind::LongLongMap).unwrap();
    }

    let mut resident = space.resident();
    resident.sort();
    assert_eq!(resident, (15..20).map(at).collect::<Vec<_>>());
    assert_eq!(space.size(), 5);
}
