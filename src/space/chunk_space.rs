//! # Chunk Space
//!
//! A fixed-capacity cache of chunks keyed by coordinate. The space never grows:
//! when every slot is taken, inserting a new chunk evicts an unpinned one.
//!
//! ## Layout
//!
//! ```text
//! SlotTable
//! ├── heads:  bucket → first slot of its chain      (capacity entries)
//! ├── next:   slot → next slot in the same chain    (capacity entries)
//! ├── coords: slot → coordinate of the occupant
//! ├── values: slot → Option<Arc<Chunk>>
//! ├── ring:   FIFO of slot indices, pre-filled 0..capacity
//! └── free:   slots emptied by `remove`
//! ```
//!
//! Coordinates hash to `(universe ^ time ^ obj) mod capacity`; collisions are
//! chained through `next`, the same technique the hash map chunk uses.
//!
//! ## Victim Selection
//!
//! The ring starts with every slot, so the first `capacity` inserts take free
//! slots in order. A slot emptied by `remove` goes on the free list and is
//! taken before any candidate is evicted; it leaves its old ring position and
//! rejoins at the back with its new occupant. Otherwise an insert dequeues
//! candidates from the front:
//!
//! 1. Free slot: use it.
//! 2. Pinned occupant (counter > 0): requeue at the back, try the next one.
//! 3. Unpinned occupant: unlink it, use the slot.
//!
//! The reused slot is enqueued at the back. Rejecting `capacity` candidates in
//! a row fails with `StoreError::CapacityExhausted`; the space does not grow.
//! This is FIFO over insertion, not LRU: reading a chunk does not protect it.
//!
//! ## Write-Back
//!
//! An evicted chunk is flagged `REMOVED`. If it is dirty it is serialized and
//! handed to the driver; the dirty bit is cleared on acknowledgement and the
//! chunk is freed after the driver answers. Write-back runs after the slot
//! table lock is released, so a driver that calls back synchronously may use
//! the space again.
//!
//! ## Pinning
//!
//! `get_pinned`, `create_pinned` and `clone_pinned` raise the pin counter while
//! still holding the table lock, so a chunk cannot be evicted between being
//! found and being pinned.
//!
//! ## Thread Safety
//!
//! - The slot table is guarded by a `parking_lot::RwLock`: lookups share it,
//!   inserts, removals and evictions take it exclusively
//! - Chunk flags and pin counters are atomics
//! - The dirty list is lock-free (see [`super::dirty`])

use std::sync::{Arc, Weak};

use eyre::{bail, ensure, eyre, Result};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::dirty::{DirtyBatch, DirtyList};
use super::ring::FifoRing;
use crate::chunk::{Chunk, ChunkData, ChunkKind, Coord};
use crate::config::{DIRTY_BIT, MIN_CACHE_SIZE, REMOVED_BIT, UNDEFINED};
use crate::driver::ContentDeliveryDriver;
use crate::error::StoreError;

#[inline]
fn bucket_of(coord: &Coord, capacity: usize) -> usize {
    (coord.slot_hash() & 0x7FFF_FFFF) as usize % capacity
}

struct SlotTable {
    heads: Vec<i32>,
    next: Vec<i32>,
    coords: Vec<Coord>,
    values: Vec<Option<Arc<Chunk>>>,
    ring: FifoRing,
    free: Vec<u32>,
    count: usize,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self {
            heads: vec![UNDEFINED; capacity],
            next: vec![UNDEFINED; capacity],
            coords: vec![Coord::new(0, 0, 0); capacity],
            values: vec![None; capacity],
            ring: FifoRing::filled(capacity),
            free: Vec::new(),
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.heads.len()
    }

    fn find(&self, coord: &Coord) -> Option<usize> {
        let mut m = self.heads[bucket_of(coord, self.capacity())];
        while m != UNDEFINED {
            let slot = m as usize;
            if self.values[slot].is_some() && self.coords[slot] == *coord {
                return Some(slot);
            }
            m = self.next[slot];
        }
        None
    }

    fn link(&mut self, slot: usize, coord: Coord) {
        let bucket = bucket_of(&coord, self.capacity());
        self.coords[slot] = coord;
        self.next[slot] = self.heads[bucket];
        self.heads[bucket] = slot as i32;
    }

    fn unlink(&mut self, slot: usize) {
        let bucket = bucket_of(&self.coords[slot], self.capacity());
        let mut previous = UNDEFINED;
        let mut m = self.heads[bucket];
        while m != UNDEFINED {
            if m as usize == slot {
                let after = self.next[slot];
                if previous == UNDEFINED {
                    self.heads[bucket] = after;
                } else {
                    self.next[previous as usize] = after;
                }
                self.next[slot] = UNDEFINED;
                return;
            }
            previous = m;
            m = self.next[m as usize];
        }
    }

    /// Picks a slot for a new entry. Returns the slot and the chunk evicted
    /// from it, already unlinked.
    fn take_slot(&mut self) -> Result<(usize, Option<Arc<Chunk>>)> {
        let capacity = self.capacity();
        if let Some(slot) = self.free.pop() {
            self.ring.withdraw(slot);
            return Ok((slot as usize, None));
        }
        for _ in 0..capacity {
            let slot = self
                .ring
                .dequeue()
                .ok_or_else(|| eyre!("victim ring is empty"))? as usize;
            let pinned = match &self.values[slot] {
                None => return Ok((slot, None)),
                Some(chunk) => chunk.is_pinned(),
            };
            if pinned {
                self.ring.enqueue(slot as u32);
                continue;
            }
            self.unlink(slot);
            self.count -= 1;
            return Ok((slot, self.values[slot].take()));
        }
        debug_assert_eq!(self.ring.len(), capacity);
        bail!(StoreError::CapacityExhausted { capacity })
    }
}

pub struct ChunkSpace {
    capacity: usize,
    table: RwLock<SlotTable>,
    dirty: DirtyList,
    driver: RwLock<Option<Arc<dyn ContentDeliveryDriver>>>,
    self_ref: Weak<ChunkSpace>,
}

impl std::fmt::Debug for ChunkSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSpace")
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .finish()
    }
}

impl ChunkSpace {
    pub fn new(capacity: usize) -> Result<Arc<Self>> {
        ensure!(
            capacity >= MIN_CACHE_SIZE,
            "chunk space needs at least {} slot(s), got {}",
            MIN_CACHE_SIZE,
            capacity
        );
        ensure!(
            capacity <= i32::MAX as usize,
            "chunk space capacity {} exceeds slot index range",
            capacity
        );
        Ok(Arc::new_cyclic(|self_ref| Self {
            capacity,
            table: RwLock::new(SlotTable::new(capacity)),
            dirty: DirtyList::new(),
            driver: RwLock::new(None),
            self_ref: self_ref.clone(),
        }))
    }

    /// Driver that receives write-backs of evicted dirty chunks.
    pub fn set_driver(&self, driver: Arc<dyn ContentDeliveryDriver>) {
        *self.driver.write() = Some(driver);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident chunks.
    pub fn size(&self) -> usize {
        self.table.read().count
    }

    pub fn get(&self, coord: Coord) -> Option<Arc<Chunk>> {
        let table = self.table.read();
        table.find(&coord).and_then(|slot| table.values[slot].clone())
    }

    /// Like [`get`](Self::get), but raises the pin counter before the table
    /// lock is released.
    pub fn get_pinned(&self, coord: Coord) -> Option<Arc<Chunk>> {
        let table = self.table.read();
        let chunk = table.find(&coord).and_then(|slot| table.values[slot].clone())?;
        chunk.inc();
        Some(chunk)
    }

    /// Inserts an empty chunk of `kind`, or returns the chunk already resident
    /// at `coord`.
    pub fn create(&self, coord: Coord, kind: ChunkKind) -> Result<Arc<Chunk>> {
        self.install(coord, ChunkData::new(kind), false)
            .map(|(chunk, _)| chunk)
    }

    pub fn create_pinned(&self, coord: Coord, kind: ChunkKind) -> Result<Arc<Chunk>> {
        self.install(coord, ChunkData::new(kind), true)
            .map(|(chunk, _)| chunk)
    }

    /// Copies `source` to `coord`. The copy starts dirty.
    pub fn clone_chunk(&self, source: &Chunk, coord: Coord) -> Result<Arc<Chunk>> {
        self.clone_inner(source, coord, false)
    }

    pub fn clone_pinned(&self, source: &Chunk, coord: Coord) -> Result<Arc<Chunk>> {
        self.clone_inner(source, coord, true)
    }

    fn clone_inner(&self, source: &Chunk, coord: Coord, pin: bool) -> Result<Arc<Chunk>> {
        let (chunk, inserted) = self.install(coord, source.copy_data(), pin)?;
        if inserted {
            chunk.mark_dirty();
        }
        Ok(chunk)
    }

    fn install(&self, coord: Coord, data: ChunkData, pin: bool) -> Result<(Arc<Chunk>, bool)> {
        let (chunk, evicted) = {
            let mut table = self.table.write();
            if let Some(existing) = table
                .find(&coord)
                .and_then(|slot| table.values[slot].clone())
            {
                if pin {
                    existing.inc();
                }
                return Ok((existing, false));
            }

            let (slot, evicted) = table.take_slot()?;
            let chunk = Arc::new(Chunk::with_data(coord, data, self.self_ref.clone()));
            if pin {
                chunk.inc();
            }
            table.link(slot, coord);
            table.values[slot] = Some(Arc::clone(&chunk));
            table.count += 1;
            table.ring.enqueue(slot as u32);
            (chunk, evicted)
        };

        if let Some(victim) = evicted {
            self.retire(victim);
        }
        Ok((chunk, true))
    }

    fn retire(&self, victim: Arc<Chunk>) {
        victim.set_flags(REMOVED_BIT, 0);
        if !victim.is_dirty() {
            trace!(coord = %victim.coord(), "evicted clean chunk");
            victim.free();
            return;
        }

        let driver = self.driver.read().clone();
        let Some(driver) = driver else {
            warn!(coord = %victim.coord(), "evicted dirty chunk with no driver to write it back");
            victim.free();
            return;
        };

        let coord = victim.coord();
        let payload = victim.serialize();
        debug!(%coord, bytes = payload.len(), "writing back evicted dirty chunk");
        driver.put(
            &[coord],
            &[payload],
            None,
            Box::new(move |result| {
                match result {
                    Ok(()) => {
                        victim.set_flags(0, DIRTY_BIT);
                    }
                    Err(e) => {
                        warn!(%coord, error = %e, "write-back of evicted chunk failed");
                    }
                }
                victim.free();
            }),
        );
    }

    /// Drops the chunk at `coord` from the index and frees it. Pinned or dirty
    /// chunks stay resident; returns whether the chunk was removed.
    pub fn remove(&self, coord: Coord) -> bool {
        let removed = {
            let mut table = self.table.write();
            let Some(slot) = table.find(&coord) else {
                return false;
            };
            match &table.values[slot] {
                Some(chunk) if chunk.is_pinned() || chunk.is_dirty() => return false,
                _ => {}
            }
            table.unlink(slot);
            table.count -= 1;
            table.free.push(slot as u32);
            table.values[slot].take()
        };

        match removed {
            Some(chunk) => {
                chunk.set_flags(REMOVED_BIT, 0);
                chunk.free();
                true
            }
            None => false,
        }
    }

    pub fn declare_dirty(&self, coord: Coord) {
        trace!(%coord, "chunk declared dirty");
        self.dirty.push(coord);
    }

    /// Takes every coordinate declared dirty since the previous call.
    pub fn detach_dirties(&self) -> DirtyBatch {
        self.dirty.detach()
    }

    /// Coordinates of all resident chunks, in slot order.
    pub fn resident(&self) -> Vec<Coord> {
        let table = self.table.read();
        table
            .values
            .iter()
            .flatten()
            .map(|chunk| chunk.coord())
            .collect()
    }

    /// Frees every resident chunk and forgets pending dirty declarations.
    pub fn clear(&self) {
        let chunks: Vec<Arc<Chunk>> = {
            let mut table = self.table.write();
            let chunks = table.values.iter_mut().filter_map(Option::take).collect();
            *table = SlotTable::new(self.capacity);
            chunks
        };
        drop(self.dirty.detach());
        debug!(chunks = chunks.len(), "chunk space cleared");
        for chunk in chunks {
            chunk.set_flags(REMOVED_BIT, 0);
            chunk.free();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;

    fn at(obj: i64) -> Coord {
        Coord::new(0, 0, obj)
    }

    #[test]
    fn create_then_get() {
        let space = ChunkSpace::new(4).unwrap();
        let chunk = space.create(at(1), ChunkKind::LongTree).unwrap();
        assert_eq!(chunk.coord(), at(1));
        assert!(Arc::ptr_eq(&space.get(at(1)).unwrap(), &chunk));
        assert!(space.get(at(2)).is_none());
        assert_eq!(space.size(), 1);
    }

    #[test]
    fn create_returns_resident_chunk() {
        let space = ChunkSpace::new(4).unwrap();
        let first = space.create(at(1), ChunkKind::LongTree).unwrap();
        let second = space.create(at(1), ChunkKind::LongLongMap).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(space.size(), 1);
    }

    #[test]
    fn oldest_insert_is_evicted_first() {
        let space = ChunkSpace::new(2).unwrap();
        space.create(at(1), ChunkKind::LongTree).unwrap();
        space.create(at(2), ChunkKind::LongTree).unwrap();
        let evicted = space.get(at(1)).unwrap();
        space.create(at(3), ChunkKind::LongTree).unwrap();

        assert!(space.get(at(1)).is_none());
        assert!(space.get(at(2)).is_some());
        assert!(space.get(at(3)).is_some());
        assert!(evicted.is_removed());
        assert_eq!(space.size(), 2);
    }

    #[test]
    fn pinned_chunk_survives_eviction_pressure() {
        let space = ChunkSpace::new(3).unwrap();
        let pinned = space.create_pinned(at(0), ChunkKind::LongTree).unwrap();
        for obj in 1..50 {
            space.create(at(obj), ChunkKind::LongTree).unwrap();
            assert!(space.get(at(0)).is_some());
        }
        assert!(!pinned.is_removed());
        assert_eq!(space.size(), 3);
    }

    #[test]
    fn all_pinned_exhausts_capacity() {
        let space = ChunkSpace::new(2).unwrap();
        space.create_pinned(at(1), ChunkKind::LongTree).unwrap();
        space.create_pinned(at(2), ChunkKind::LongTree).unwrap();
        let err = space.create(at(3), ChunkKind::LongTree).unwrap_err();
        assert_eq!(
            store_error(&err),
            Some(&StoreError::CapacityExhausted { capacity: 2 })
        );
        assert!(space.get(at(1)).is_some());
        assert!(space.get(at(2)).is_some());
    }

    #[test]
    fn dirty_declared_once_per_drain() {
        let space = ChunkSpace::new(4).unwrap();
        let chunk = space.create(at(1), ChunkKind::LongTree).unwrap();
        let tree = chunk.as_tree().unwrap();
        tree.insert(1, 0);
        tree.insert(2, 0);
        assert_eq!(space.detach_dirties().len(), 1);

        tree.insert(3, 0);
        assert!(space.detach_dirties().is_empty());

        chunk.set_flags(0, DIRTY_BIT);
        tree.insert(4, 0);
        assert_eq!(
            space.detach_dirties().into_iter().collect::<Vec<_>>(),
            vec![at(1)]
        );
    }

    #[test]
    fn clone_copies_content_and_starts_dirty() {
        let space = ChunkSpace::new(4).unwrap();
        let source = space.create(at(1), ChunkKind::LongLongTree).unwrap();
        source.as_tree().unwrap().insert(5, 50);
        space.detach_dirties();

        let copy = space.clone_chunk(&source, at(2)).unwrap();
        assert_eq!(copy.as_tree().unwrap().lookup_value(5), Some(50));
        assert!(copy.is_dirty());
        assert_eq!(
            space.detach_dirties().into_iter().collect::<Vec<_>>(),
            vec![at(2)]
        );

        copy.as_tree().unwrap().insert(6, 60);
        assert_eq!(source.as_tree().unwrap().lookup(6), None);
    }

    #[test]
    fn remove_refuses_pinned_and_dirty_chunks() {
        let space = ChunkSpace::new(4).unwrap();
        let pinned = space.create_pinned(at(1), ChunkKind::LongTree).unwrap();
        let dirty = space.create(at(2), ChunkKind::LongTree).unwrap();
        dirty.as_tree().unwrap().insert(1, 0);
        space.create(at(3), ChunkKind::LongTree).unwrap();

        assert!(!space.remove(at(1)));
        assert!(!space.remove(at(2)));
        assert!(space.remove(at(3)));
        assert!(!space.remove(at(3)));
        assert!(!pinned.is_removed());
        assert_eq!(space.resident(), vec![at(1), at(2)]);
    }

    #[test]
    fn removed_slot_is_reused() {
        let space = ChunkSpace::new(2).unwrap();
        space.create(at(1), ChunkKind::LongTree).unwrap();
        space.create(at(2), ChunkKind::LongTree).unwrap();
        assert!(space.remove(at(2)));
        space.create(at(3), ChunkKind::LongTree).unwrap();
        assert!(space.get(at(1)).is_some());
        assert_eq!(space.size(), 2);

        // the reused slot rejoined the ring behind at(1)
        space.create(at(4), ChunkKind::LongTree).unwrap();
        assert!(space.get(at(1)).is_none());
        assert!(space.get(at(3)).is_some());
        space.create(at(5), ChunkKind::LongTree).unwrap();
        assert!(space.get(at(3)).is_none());
        assert!(space.get(at(4)).is_some());
    }

    #[test]
    fn colliding_coordinates_chain() {
        let space = ChunkSpace::new(8).unwrap();
        for obj in [1, 9, 17, 25] {
            space.create(at(obj), ChunkKind::LongTree).unwrap();
        }
        assert!(space.remove(at(9)));
        for obj in [1, 17, 25] {
            assert!(space.get(at(obj)).is_some(), "lost {}", obj);
        }
    }

    #[test]
    fn clear_frees_everything() {
        let space = ChunkSpace::new(4).unwrap();
        let chunk = space.create(at(1), ChunkKind::LongTree).unwrap();
        chunk.as_tree().unwrap().insert(1, 0);
        space.clear();
        assert_eq!(space.size(), 0);
        assert!(chunk.is_removed());
        assert!(space.detach_dirties().is_empty());
        space.create(at(1), ChunkKind::LongTree).unwrap();
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(ChunkSpace::new(0).is_err());
    }
}
