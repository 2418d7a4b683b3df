//! # Chunk Space Managers
//!
//! A thin layer over [`ChunkSpace`] that decides when chunks are pinned and
//! when an unpinned chunk leaves the cache.
//!
//! | Manager                | Pins | Removes at count ≤ 0 |
//! |------------------------|------|----------------------|
//! | `CountingSpaceManager` | yes  | yes, unless dirty    |
//! | `NoopSpaceManager`     | no   | no (eviction only)   |
//!
//! ## Mark/Unmark Protocol
//!
//! 1. `get_and_mark` / `create_and_mark` / `clone_and_mark` return a pinned chunk
//! 2. Caller reads or mutates it
//! 3. `unmark` / `unmark_chunk` drops the pin
//! 4. With the counting manager, a chunk whose count reaches zero while clean
//!    is flagged `REMOVED` and dropped from the space. A dirty chunk stays
//!    resident until a save clears its dirty bit and releases it.

use std::sync::Arc;

use eyre::Result;
use tracing::{trace, warn};

use super::ChunkSpace;
use crate::chunk::{Chunk, ChunkKind, Coord};

pub trait ChunkSpaceManager: Send + Sync {
    fn space(&self) -> &Arc<ChunkSpace>;

    /// Pinned chunk at `coord`, or `None` if it is not resident.
    fn get_and_mark(&self, coord: Coord) -> Option<Arc<Chunk>>;

    fn create_and_mark(&self, coord: Coord, kind: ChunkKind) -> Result<Arc<Chunk>>;

    fn clone_and_mark(&self, source: &Chunk, coord: Coord) -> Result<Arc<Chunk>>;

    fn unmark(&self, coord: Coord);

    fn mark_chunk(&self, chunk: &Chunk);

    fn unmark_chunk(&self, chunk: &Chunk);

    fn unmark_all(&self, chunks: &[Arc<Chunk>]) {
        for chunk in chunks {
            self.unmark_chunk(chunk);
        }
    }
}

#[derive(Debug)]
pub struct CountingSpaceManager {
    space: Arc<ChunkSpace>,
}

impl CountingSpaceManager {
    pub fn new(space: Arc<ChunkSpace>) -> Self {
        Self { space }
    }

    fn release(&self, chunk: &Chunk) {
        let count = chunk.dec();
        if count < 0 {
            warn!(coord = %chunk.coord(), count, "chunk unmarked more often than marked");
        }
        if count <= 0 && !chunk.is_dirty() && self.space.remove(chunk.coord()) {
            trace!(coord = %chunk.coord(), "released unpinned chunk");
        }
    }
}

impl ChunkSpaceManager for CountingSpaceManager {
    fn space(&self) -> &Arc<ChunkSpace> {
        &self.space
    }

    fn get_and_mark(&self, coord: Coord) -> Option<Arc<Chunk>> {
        let chunk = self.space.get_pinned(coord)?;
        if chunk.is_removed() {
            chunk.dec();
            return None;
        }
        Some(chunk)
    }

    fn create_and_mark(&self, coord: Coord, kind: ChunkKind) -> Result<Arc<Chunk>> {
        self.space.create_pinned(coord, kind)
    }

    fn clone_and_mark(&self, source: &Chunk, coord: Coord) -> Result<Arc<Chunk>> {
        self.space.clone_pinned(source, coord)
    }

    fn unmark(&self, coord: Coord) {
        if let Some(chunk) = self.space.get(coord) {
            self.release(&chunk);
        }
    }

    fn mark_chunk(&self, chunk: &Chunk) {
        chunk.inc();
    }

    fn unmark_chunk(&self, chunk: &Chunk) {
        self.release(chunk);
    }
}

/// Pass-through manager: nothing is pinned, chunks leave only by eviction.
#[derive(Debug)]
pub struct NoopSpaceManager {
    space: Arc<ChunkSpace>,
}

impl NoopSpaceManager {
    pub fn new(space: Arc<ChunkSpace>) -> Self {
        Self { space }
    }
}

impl ChunkSpaceManager for NoopSpaceManager {
    fn space(&self) -> &Arc<ChunkSpace> {
        &self.space
    }

    fn get_and_mark(&self, coord: Coord) -> Option<Arc<Chunk>> {
        self.space.get(coord)
    }

    fn create_and_mark(&self, coord: Coord, kind: ChunkKind) -> Result<Arc<Chunk>> {
        self.space.create(coord, kind)
    }

    fn clone_and_mark(&self, source: &Chunk, coord: Coord) -> Result<Arc<Chunk>> {
        self.space.clone_chunk(source, coord)
    }

    fn unmark(&self, _coord: Coord) {}

    fn mark_chunk(&self, _chunk: &Chunk) {}

    fn unmark_chunk(&self, _chunk: &Chunk) {}
}
