//! # Hash Map Chunk
//!
//! An open-addressed hash table from keys to 64-bit values, stored as parallel
//! dense arrays with explicit collision chains. Two instantiations are used by
//! the store:
//!
//! - [`LongLongMap`]: `i64 → i64`, e.g. the global universe→parent index
//! - [`StringLongMap`]: `String → i64`, e.g. an object's name→id index
//!
//! ## Layout
//!
//! ```text
//! heads:  bucket → first slot of its chain, or -1
//!
//! slot:     0        1        2        3      ...  capacity-1
//! keys:   [ k0     , k1     , k2     , -      , ...]
//! values: [ v0     , v1     , v2     , -      , ...]
//! next:   [ -2     , 0      , -1     , -1     , ...]
//!                              ^ tombstone
//! ```
//!
//! `next` doubles as the slot state: `-1` is an empty or tombstoned slot, `-2`
//! ends a chain, anything else links to the next slot of the same bucket.
//!
//! ## Insertion and Removal
//!
//! A new entry is appended at slot `count + dropped` and becomes the head of
//! its bucket. Removal unlinks the slot and tombstones it; the slot is not
//! reused until the next rehash. When `count + dropped` would exceed the
//! threshold the table is rehashed: live entries are compacted to the front in
//! slot order, tombstones are discarded, and capacity doubles only if the live
//! entries alone would exceed the threshold.
//!
//! ## Serialization
//!
//! ```text
//! #<count>/<key>:<value>,<key>:<value>,...
//! ```
//!
//! Entries are written in slot order. Keys use the integer or string text
//! encoding, values the integer encoding.
//!
//! ## Thread Safety
//!
//! Readers share a `parking_lot::RwLock`; `put`, `remove` and `clear` take it
//! exclusively. Mutating the same key from two threads concurrently (for
//! example a `put` racing a `remove`) still has no defined winner: callers
//! serialize mutation per chunk.

use std::borrow::Borrow;
use std::fmt::Debug;

use eyre::{ensure, Result};
use parking_lot::RwLock;

use crate::config::{CACHE_LOAD_FACTOR, MAP_INITIAL_CAPACITY, UNDEFINED};
use crate::encoding::{encode_int, encode_long, encode_str, Cursor};

const CHAIN_END: i32 = -2;

/// Hash used to pick a bucket.
pub trait KeyHash {
    fn key_hash(&self) -> i32;
}

impl KeyHash for i64 {
    #[inline]
    fn key_hash(&self) -> i32 {
        let bits = *self as u64;
        (bits ^ (bits >> 32)) as i32
    }
}

impl KeyHash for str {
    #[inline]
    fn key_hash(&self) -> i32 {
        self.bytes()
            .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(b as i32))
    }
}

impl KeyHash for String {
    #[inline]
    fn key_hash(&self) -> i32 {
        self.as_str().key_hash()
    }
}

/// Key types a [`HashMapChunk`] can store and persist.
pub trait MapKey: KeyHash + Clone + Eq + Default + Debug + Send + Sync + 'static {
    fn encode_key(&self, out: &mut String);
    fn decode_key(cursor: &mut Cursor<'_>) -> Result<Self>;
}

impl MapKey for i64 {
    fn encode_key(&self, out: &mut String) {
        encode_long(*self, out);
    }

    fn decode_key(cursor: &mut Cursor<'_>) -> Result<Self> {
        cursor.read_long()
    }
}

impl MapKey for String {
    fn encode_key(&self, out: &mut String) {
        encode_str(self, out);
    }

    fn decode_key(cursor: &mut Cursor<'_>) -> Result<Self> {
        cursor.read_str()
    }
}

#[inline]
fn bucket_of(hash: i32, capacity: usize) -> usize {
    (hash & 0x7FFF_FFFF) as usize % capacity
}

fn threshold_for(capacity: usize) -> usize {
    (capacity as f64 * CACHE_LOAD_FACTOR) as usize
}

#[derive(Debug, Clone)]
struct MapState<K> {
    keys: Vec<K>,
    values: Vec<i64>,
    next: Vec<i32>,
    heads: Vec<i32>,
    count: usize,
    dropped: usize,
    threshold: usize,
}

impl<K: MapKey> MapState<K> {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            keys: vec![K::default(); capacity],
            values: vec![0; capacity],
            next: vec![UNDEFINED; capacity],
            heads: vec![UNDEFINED; capacity],
            count: 0,
            dropped: 0,
            threshold: threshold_for(capacity),
        }
    }

    fn capacity(&self) -> usize {
        self.heads.len()
    }

    fn find<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        let mut m = self.heads[bucket_of(key.key_hash(), self.capacity())];
        while m >= 0 {
            if self.keys[m as usize].borrow() == key {
                return Some(m as usize);
            }
            m = self.next[m as usize];
        }
        None
    }

    fn live_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count + self.dropped).filter(move |&i| self.next[i] != UNDEFINED)
    }

    fn rehash(&mut self) {
        let mut capacity = self.capacity();
        while self.count + 1 > threshold_for(capacity) {
            capacity *= 2;
        }
        let mut live = Vec::with_capacity(self.count);
        for i in 0..self.count + self.dropped {
            if self.next[i] != UNDEFINED {
                live.push((std::mem::take(&mut self.keys[i]), self.values[i]));
            }
        }
        *self = MapState::with_capacity(capacity);
        for (key, value) in live {
            self.append(key, value);
        }
    }

    fn append(&mut self, key: K, value: i64) {
        let slot = self.count + self.dropped;
        let bucket = bucket_of(key.key_hash(), self.capacity());
        let head = self.heads[bucket];
        self.keys[slot] = key;
        self.values[slot] = value;
        self.next[slot] = if head >= 0 { head } else { CHAIN_END };
        self.heads[bucket] = slot as i32;
        self.count += 1;
    }

    fn put(&mut self, key: K, value: i64) -> bool {
        if let Some(slot) = self.find::<K>(&key) {
            self.values[slot] = value;
            return false;
        }
        if self.count + self.dropped + 1 > self.threshold {
            self.rehash();
        }
        self.append(key, value);
        true
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<i64>
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        let bucket = bucket_of(key.key_hash(), self.capacity());
        let mut previous = UNDEFINED;
        let mut m = self.heads[bucket];
        while m >= 0 {
            let slot = m as usize;
            let after = self.next[slot];
            if self.keys[slot].borrow() == key {
                if previous < 0 {
                    self.heads[bucket] = if after >= 0 { after } else { UNDEFINED };
                } else {
                    self.next[previous as usize] = after;
                }
                self.next[slot] = UNDEFINED;
                self.keys[slot] = K::default();
                self.count -= 1;
                self.dropped += 1;
                return Some(self.values[slot]);
            }
            previous = m;
            m = after;
        }
        None
    }

    fn entries(&self) -> Vec<(K, i64)> {
        self.live_slots()
            .map(|i| (self.keys[i].clone(), self.values[i]))
            .collect()
    }

    fn serialize(&self) -> String {
        let mut out = String::with_capacity(4 + self.count * 8);
        out.push('#');
        encode_int(self.count as i32, &mut out);
        out.push('/');
        for (n, i) in self.live_slots().enumerate() {
            if n > 0 {
                out.push(',');
            }
            self.keys[i].encode_key(&mut out);
            out.push(':');
            encode_long(self.values[i], &mut out);
        }
        out
    }

    fn decode(payload: &str) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        cursor.expect(b'#')?;
        let count = cursor.read_int()?;
        ensure!(count >= 0, "negative map size {}", count);
        // The shortest entry is an empty key followed by `:` and one digit.
        ensure!(
            count as usize <= payload.len() / 2,
            "map size {} exceeds payload of {} bytes",
            count,
            payload.len()
        );
        cursor.expect(b'/')?;

        let count = count as usize;
        let mut state = MapState::with_capacity(if count == 0 { 1 } else { count << 1 });
        for i in 0..count {
            if i > 0 {
                cursor.expect(b',')?;
            }
            let key = K::decode_key(&mut cursor)?;
            cursor.expect(b':')?;
            let value = cursor.read_long()?;
            ensure!(state.put(key, value), "duplicate key in map entry {}", i);
        }
        ensure!(
            cursor.is_at_end(),
            "trailing data at offset {} after {} entries",
            cursor.position(),
            count
        );
        Ok(state)
    }
}

/// Hash map chunk payload.
#[derive(Debug)]
pub struct HashMapChunk<K: MapKey> {
    state: RwLock<MapState<K>>,
}

pub type LongLongMap = HashMapChunk<i64>;
pub type StringLongMap = HashMapChunk<String>;

impl<K: MapKey> Default for HashMapChunk<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: MapKey> HashMapChunk<K> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MapState::with_capacity(MAP_INITIAL_CAPACITY)),
        }
    }

    pub fn size(&self) -> usize {
        self.state.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.read().capacity()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        self.state.read().find(key).is_some()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<i64>
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        let state = self.state.read();
        state.find(key).map(|slot| state.values[slot])
    }

    /// Inserts or updates. Returns `true` when the key was not present.
    pub fn put(&self, key: K, value: i64) -> bool {
        self.state.write().put(key, value)
    }

    /// Returns the removed value.
    pub fn remove<Q>(&self, key: &Q) -> Option<i64>
    where
        K: Borrow<Q>,
        Q: KeyHash + Eq + ?Sized,
    {
        self.state.write().remove(key)
    }

    /// Calls `visitor` for every live entry, in slot order.
    pub fn each<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, i64),
    {
        for (key, value) in self.entries() {
            visitor(&key, value);
        }
    }

    pub fn entries(&self) -> Vec<(K, i64)> {
        self.state.read().entries()
    }

    pub fn clear(&self) {
        *self.state.write() = MapState::with_capacity(MAP_INITIAL_CAPACITY);
    }

    pub fn serialize(&self) -> String {
        self.state.read().serialize()
    }

    /// Replaces the content with the decoded `payload`. On error the current
    /// content is left untouched.
    pub fn init(&self, payload: &str) -> Result<()> {
        let decoded = MapState::decode(payload)?;
        *self.state.write() = decoded;
        Ok(())
    }

    pub fn duplicate(&self) -> Self {
        Self {
            state: RwLock::new(self.state.read().clone()),
        }
    }
}
