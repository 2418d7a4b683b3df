//! # Chunks
//!
//! A chunk is the unit of cached, persistable state. Every chunk lives at one
//! coordinate `(universe, time, obj)` and carries:
//!
//! ```text
//! Chunk {
//!     coord:   Coord,       // owning coordinate
//!     flags:   AtomicU64,   // bit 0 DIRTY, bit 1 REMOVED
//!     counter: AtomicI32,   // pin count, > 0 means not evictable
//!     data:    ChunkData,   // kind-specific payload
//!     space:   Weak<..>,    // owning cache, receives dirty declarations
//! }
//! ```
//!
//! ## Kinds
//!
//! | Kind           | Tag | Payload                      |
//! |----------------|-----|------------------------------|
//! | `ObjectIndex`  | 1   | `StringLongMap`              |
//! | `LongLongMap`  | 2   | `LongLongMap`                |
//! | `LongTree`     | 3   | `OrderedIndex` (key set)     |
//! | `LongLongTree` | 4   | `OrderedIndex` (key → value) |
//!
//! Serialization, decoding, release and copying dispatch over [`ChunkData`]
//! with exhaustive matches.
//!
//! ## Dirty Tracking
//!
//! Mutations go through the typed views returned by [`Chunk::as_tree`],
//! [`Chunk::as_long_map`] and [`Chunk::as_object_index`]. A mutation that
//! changes content sets the DIRTY bit; only the clean→dirty transition
//! declares the chunk to its owning space, so each chunk appears at most once
//! in the dirty set between two drains.
//!
//! The views carry no `init` or `clear`. Replacing the content goes through
//! [`Chunk::init`] (decoding a payload that came from the backing store) and
//! [`Chunk::free`], neither of which dirties the chunk.

pub mod map;
pub mod tree;

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Weak;

use eyre::{bail, Result};

use crate::config::{DIRTY_BIT, NULL_LONG, REMOVED_BIT};
use crate::error::StoreError;
use crate::space::ChunkSpace;

pub use map::{HashMapChunk, KeyHash, LongLongMap, MapKey, StringLongMap};
pub use tree::OrderedIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coord {
    pub universe: i64,
    pub time: i64,
    pub obj: i64,
}

impl Coord {
    pub const fn new(universe: i64, time: i64, obj: i64) -> Self {
        Self {
            universe,
            time,
            obj,
        }
    }

    /// True for coordinates reserved for store metadata (indexes, counters).
    pub fn is_metadata(&self) -> bool {
        self.universe == NULL_LONG || self.time == NULL_LONG || self.obj == NULL_LONG
    }

    pub(crate) fn slot_hash(&self) -> i32 {
        (self.universe ^ self.time ^ self.obj) as i32
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.universe, self.time, self.obj)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkKind {
    ObjectIndex = 1,
    LongLongMap = 2,
    LongTree = 3,
    LongLongTree = 4,
}

impl ChunkKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(ChunkKind::ObjectIndex),
            2 => Ok(ChunkKind::LongLongMap),
            3 => Ok(ChunkKind::LongTree),
            4 => Ok(ChunkKind::LongLongTree),
            _ => bail!("unknown chunk kind tag {}", tag),
        }
    }
}

#[derive(Debug)]
pub enum ChunkData {
    ObjectIndex(StringLongMap),
    LongLongMap(LongLongMap),
    LongTree(OrderedIndex),
    LongLongTree(OrderedIndex),
}

impl ChunkData {
    pub fn new(kind: ChunkKind) -> Self {
        match kind {
            ChunkKind::ObjectIndex => ChunkData::ObjectIndex(StringLongMap::new()),
            ChunkKind::LongLongMap => ChunkData::LongLongMap(LongLongMap::new()),
            ChunkKind::LongTree => ChunkData::LongTree(OrderedIndex::key_set()),
            ChunkKind::LongLongTree => ChunkData::LongLongTree(OrderedIndex::key_value()),
        }
    }

    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkData::ObjectIndex(_) => ChunkKind::ObjectIndex,
            ChunkData::LongLongMap(_) => ChunkKind::LongLongMap,
            ChunkData::LongTree(_) => ChunkKind::LongTree,
            ChunkData::LongLongTree(_) => ChunkKind::LongLongTree,
        }
    }

    fn serialize(&self) -> String {
        match self {
            ChunkData::ObjectIndex(map) => map.serialize(),
            ChunkData::LongLongMap(map) => map.serialize(),
            ChunkData::LongTree(tree) | ChunkData::LongLongTree(tree) => tree.serialize(),
        }
    }

    fn init(&self, payload: &str) -> Result<()> {
        match self {
            ChunkData::ObjectIndex(map) => map.init(payload),
            ChunkData::LongLongMap(map) => map.init(payload),
            ChunkData::LongTree(tree) | ChunkData::LongLongTree(tree) => tree.init(payload),
        }
    }

    fn free(&self) {
        match self {
            ChunkData::ObjectIndex(map) => map.clear(),
            ChunkData::LongLongMap(map) => map.clear(),
            ChunkData::LongTree(tree) | ChunkData::LongLongTree(tree) => tree.clear(),
        }
    }

    fn duplicate(&self) -> Self {
        match self {
            ChunkData::ObjectIndex(map) => ChunkData::ObjectIndex(map.duplicate()),
            ChunkData::LongLongMap(map) => ChunkData::LongLongMap(map.duplicate()),
            ChunkData::LongTree(tree) => ChunkData::LongTree(tree.duplicate()),
            ChunkData::LongLongTree(tree) => ChunkData::LongLongTree(tree.duplicate()),
        }
    }
}

pub struct Chunk {
    coord: Coord,
    flags: AtomicU64,
    counter: AtomicI32,
    data: ChunkData,
    space: Weak<ChunkSpace>,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("coord", &self.coord)
            .field("kind", &self.kind())
            .field("flags", &self.flags())
            .field("counter", &self.counter())
            .finish()
    }
}

impl Chunk {
    /// A chunk that belongs to no space. Dirty transitions are tracked on
    /// the flags only.
    pub fn detached(coord: Coord, kind: ChunkKind) -> Self {
        Self::with_data(coord, ChunkData::new(kind), Weak::new())
    }

    pub(crate) fn with_data(coord: Coord, data: ChunkData, space: Weak<ChunkSpace>) -> Self {
        Self {
            coord,
            flags: AtomicU64::new(0),
            counter: AtomicI32::new(0),
            data,
            space,
        }
    }

    pub fn coord(&self) -> Coord {
        self.coord
    }

    pub fn universe(&self) -> i64 {
        self.coord.universe
    }

    pub fn time(&self) -> i64 {
        self.coord.time
    }

    pub fn obj(&self) -> i64 {
        self.coord.obj
    }

    pub fn kind(&self) -> ChunkKind {
        self.data.kind()
    }

    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    pub fn flags(&self) -> u64 {
        self.flags.load(Ordering::Acquire)
    }

    /// Atomically sets `set` and clears `clear`. Returns the previous flags.
    pub fn set_flags(&self, set: u64, clear: u64) -> u64 {
        let mut current = self.flags.load(Ordering::Acquire);
        loop {
            let next = (current & !clear) | set;
            match self.flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags() & DIRTY_BIT != 0
    }

    pub fn is_removed(&self) -> bool {
        self.flags() & REMOVED_BIT != 0
    }

    pub fn counter(&self) -> i32 {
        self.counter.load(Ordering::Acquire)
    }

    /// Returns the new pin count.
    pub fn inc(&self) -> i32 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the new pin count.
    pub fn dec(&self) -> i32 {
        self.counter.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn is_pinned(&self) -> bool {
        self.counter() > 0
    }

    pub fn mark_dirty(&self) {
        let previous = self.flags.fetch_or(DIRTY_BIT, Ordering::AcqRel);
        if previous & DIRTY_BIT == 0 {
            if let Some(space) = self.space.upgrade() {
                space.declare_dirty(self.coord);
            }
        }
    }

    pub fn serialize(&self) -> String {
        self.data.serialize()
    }

    /// Replaces the content with a payload from the backing store.
    pub fn init(&self, payload: &str) -> Result<()> {
        self.data.init(payload).map_err(|e| {
            StoreError::decode(format!("{} chunk at {}: {:#}", self.kind(), self.coord, e)).into()
        })
    }

    /// Releases the payload's storage.
    pub fn free(&self) {
        self.data.free();
    }

    /// Deep copy of the payload, for installing under another coordinate.
    pub(crate) fn copy_data(&self) -> ChunkData {
        self.data.duplicate()
    }

    pub fn as_tree(&self) -> Option<TreeChunk<'_>> {
        match &self.data {
            ChunkData::LongTree(index) | ChunkData::LongLongTree(index) => {
                Some(TreeChunk { chunk: self, index })
            }
            _ => None,
        }
    }

    pub fn as_long_map(&self) -> Option<MapChunk<'_, i64>> {
        match &self.data {
            ChunkData::LongLongMap(map) => Some(MapChunk { chunk: self, map }),
            _ => None,
        }
    }

    pub fn as_object_index(&self) -> Option<MapChunk<'_, String>> {
        match &self.data {
            ChunkData::ObjectIndex(map) => Some(MapChunk { chunk: self, map }),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChunkKind::ObjectIndex => "object index",
            ChunkKind::LongLongMap => "long map",
            ChunkKind::LongTree => "long tree",
            ChunkKind::LongLongTree => "long-long tree",
        };
        f.write_str(name)
    }
}

/// Ordered index view of a chunk. Exposes reads and the mutators that keep
/// the dirty bit in step; `init` and `clear` stay on [`Chunk`].
#[derive(Debug, Clone, Copy)]
pub struct TreeChunk<'a> {
    chunk: &'a Chunk,
    index: &'a OrderedIndex,
}

impl TreeChunk<'_> {
    /// Returns `true` when a node was added, which also dirties the chunk.
    pub fn insert(&self, key: i64, value: i64) -> bool {
        let added = self.index.insert(key, value);
        if added {
            self.chunk.mark_dirty();
        }
        added
    }

    pub fn delete(&self, key: i64) -> Result<()> {
        self.index.delete(key)
    }

    pub fn has_values(&self) -> bool {
        self.index.has_values()
    }

    pub fn size(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.index.capacity()
    }

    pub fn lookup(&self, key: i64) -> Option<i64> {
        self.index.lookup(key)
    }

    pub fn lookup_value(&self, key: i64) -> Option<i64> {
        self.index.lookup_value(key)
    }

    pub fn previous_or_equal(&self, key: i64) -> Option<i64> {
        self.index.previous_or_equal(key)
    }

    pub fn previous_or_equal_value(&self, key: i64) -> Option<i64> {
        self.index.previous_or_equal_value(key)
    }

    pub fn range<F>(&self, start: i64, end: i64, visitor: F)
    where
        F: FnMut(i64),
    {
        self.index.range(start, end, visitor)
    }

    pub fn keys(&self) -> Vec<i64> {
        self.index.keys()
    }

    pub fn entries(&self) -> Vec<(i64, i64)> {
        self.index.entries()
    }

    pub fn serialize(&self) -> String {
        self.index.serialize()
    }
}

/// Hash map view of a chunk. `put` and a successful `remove` dirty the chunk.
#[derive(Debug, Clone, Copy)]
pub struct MapChunk<'a, K: MapKey> {
    chunk: &'a Chunk,
    map: &'a HashMapChunk<K>,
}

impl<K: MapKey> MapChunk<'_, K> {
    pub fn put(&self, key: K, value: i64) -> bool {
        let added = self.map.put(key, value);
        self.chunk.mark_dirty();
        added
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<i64>
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.chunk.mark_dirty();
        }
        removed
    }

    pub fn size(&self) -> usize {
        self.map.size()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        self.map.contains(key)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<i64>
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        self.map.get(key)
    }

    pub fn each<F>(&self, visitor: F)
    where
        F: FnMut(&K, i64),
    {
        self.map.each(visitor)
    }

    pub fn entries(&self) -> Vec<(K, i64)> {
        self.map.entries()
    }

    pub fn serialize(&self) -> String {
        self.map.serialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;

    const AT: Coord = Coord::new(0, 0, 1);

    #[test]
    fn set_flags_sets_and_clears_atomically() {
        let chunk = Chunk::detached(AT, ChunkKind::LongTree);
        assert_eq!(chunk.set_flags(DIRTY_BIT | REMOVED_BIT, 0), 0);
        assert_eq!(chunk.set_flags(0, DIRTY_BIT), DIRTY_BIT | REMOVED_BIT);
        assert!(!chunk.is_dirty());
        assert!(chunk.is_removed());
    }

    #[test]
    fn pin_counter_reports_new_value() {
        let chunk = Chunk::detached(AT, ChunkKind::LongLongMap);
        assert_eq!(chunk.inc(), 1);
        assert_eq!(chunk.inc(), 2);
        assert_eq!(chunk.dec(), 1);
        assert!(chunk.is_pinned());
        assert_eq!(chunk.dec(), 0);
        assert!(!chunk.is_pinned());
    }

    #[test]
    fn tree_view_dirties_only_on_change() {
        let chunk = Chunk::detached(AT, ChunkKind::LongLongTree);
        let tree = chunk.as_tree().unwrap();
        assert!(tree.insert(10, 1));
        assert!(chunk.is_dirty());

        chunk.set_flags(0, DIRTY_BIT);
        assert!(!tree.insert(10, 2));
        assert!(!chunk.is_dirty());
        assert_eq!(tree.lookup_value(10), Some(1));
    }

    #[test]
    fn map_view_dirties_on_put_and_remove() {
        let chunk = Chunk::detached(AT, ChunkKind::ObjectIndex);
        let map = chunk.as_object_index().unwrap();
        map.put("x".to_string(), 4);
        assert!(chunk.is_dirty());

        chunk.set_flags(0, DIRTY_BIT);
        assert_eq!(map.remove("missing"), None);
        assert!(!chunk.is_dirty());
        assert_eq!(map.remove("x"), Some(4));
        assert!(chunk.is_dirty());
    }

    #[test]
    fn view_reads_do_not_dirty() {
        let chunk = Chunk::detached(AT, ChunkKind::LongLongTree);
        let source = OrderedIndex::key_value();
        source.insert(0, 5);
        source.insert(2, 1);
        chunk.init(&source.serialize()).unwrap();
        let tree = chunk.as_tree().unwrap();
        assert_eq!(tree.keys(), vec![0, 2]);
        assert_eq!(tree.previous_or_equal_value(1), Some(5));
        assert!(tree.delete(0).is_err());
        assert_eq!(tree.serialize(), chunk.serialize());
        assert!(!chunk.is_dirty());

        let map = Chunk::detached(AT, ChunkKind::LongLongMap);
        map.as_long_map().unwrap().put(3, 9);
        map.set_flags(0, DIRTY_BIT);
        let view = map.as_long_map().unwrap();
        assert!(view.contains(&3));
        assert_eq!(view.entries(), vec![(3, 9)]);
        assert!(!map.is_dirty());
    }

    #[test]
    fn views_match_kind() {
        let chunk = Chunk::detached(AT, ChunkKind::LongLongMap);
        assert!(chunk.as_tree().is_none());
        assert!(chunk.as_object_index().is_none());
        assert!(chunk.as_long_map().is_some());
    }

    #[test]
    fn init_reports_decode_error_and_keeps_clean() {
        let chunk = Chunk::detached(AT, ChunkKind::LongTree);
        let err = chunk.init("not a tree").unwrap_err();
        assert!(matches!(store_error(&err), Some(StoreError::Decode { .. })));
        assert!(!chunk.is_dirty());
    }

    #[test]
    fn serialize_then_init_for_every_kind() {
        for kind in [
            ChunkKind::ObjectIndex,
            ChunkKind::LongLongMap,
            ChunkKind::LongTree,
            ChunkKind::LongLongTree,
        ] {
            let chunk = Chunk::detached(AT, kind);
            match kind {
                ChunkKind::ObjectIndex => {
                    chunk.as_object_index().unwrap().put("a".into(), 1);
                }
                ChunkKind::LongLongMap => {
                    chunk.as_long_map().unwrap().put(1, 2);
                }
                ChunkKind::LongTree | ChunkKind::LongLongTree => {
                    chunk.as_tree().unwrap().insert(3, 4);
                }
            }
            let copy = Chunk::detached(AT, kind);
            copy.init(&chunk.serialize()).unwrap();
            assert_eq!(copy.serialize(), chunk.serialize(), "{}", kind);
            assert_eq!(ChunkKind::from_tag(kind.tag()).unwrap(), kind);
        }
    }

    #[test]
    fn free_empties_payload() {
        let chunk = Chunk::detached(AT, ChunkKind::LongTree);
        chunk.as_tree().unwrap().insert(1, 0);
        chunk.free();
        assert!(chunk.as_tree().unwrap().is_empty());
    }

    #[test]
    fn slot_hash_truncates_the_xor() {
        assert_eq!(Coord::new(3, 5, 0).slot_hash(), 6);
        assert_eq!(Coord::new(0, 0, (1 << 32) | 7).slot_hash(), 7);
        assert_eq!(Coord::new(0, 0, -1).slot_hash(), -1);
    }

    #[test]
    fn metadata_coordinates() {
        assert!(Coord::new(NULL_LONG, NULL_LONG, NULL_LONG).is_metadata());
        assert!(Coord::new(crate::config::END_OF_TIME, NULL_LONG, 3).is_metadata());
        assert!(!AT.is_metadata());
    }
}
