//! # chronostore - Temporal Multiversion Object Store Core
//!
//! chronostore keeps the state of objects across universes (branches) and
//! points in time. Every piece of state lives in a *chunk* addressed by a
//! `(universe, time, object)` coordinate. Chunks are held in a bounded cache,
//! tracked for modification, and persisted through a pluggable content
//! delivery driver.
//!
//! ## Quick Start
//!
//! ```ignore
//! use chronostore::{ChunkKind, Coord, StoreBuilder};
//!
//! let manager = StoreBuilder::new().cache_size(10_000).build()?;
//! manager.connect(Box::new(|result| result.expect("connect")));
//!
//! let obj = manager.next_object_key()?;
//! let chunk = manager
//!     .space_manager()
//!     .create_and_mark(Coord::new(0, 0, obj), ChunkKind::LongTree)?;
//! chunk.as_tree().expect("tree chunk").insert(42, 0);
//! manager.release(&chunk);
//!
//! manager.save(Box::new(|result| result.expect("save")));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      DataManager (connect/save/keys)     │
//! ├─────────────────────────────────────────┤
//! │   ChunkSpaceManager (pin accounting)     │
//! ├─────────────────────────────────────────┤
//! │ ChunkSpace (slots, FIFO eviction, dirty) │
//! ├────────────────────┬────────────────────┤
//! │ OrderedIndex chunk │  Hash map chunks   │
//! ├────────────────────┴────────────────────┤
//! │   Text codec (zigzag 6-bit digits)       │
//! ├─────────────────────────────────────────┤
//! │      ContentDeliveryDriver (trait)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Key Layout
//!
//! Object and universe ids are 53-bit integers: a 16-bit peer prefix handed
//! out by the driver on connect, followed by a 37-bit per-prefix counter.
//! Keys stay below [`config::END_OF_TIME`] so they never collide with the
//! sentinel values used for metadata coordinates.
//!
//! ## Module Overview
//!
//! - [`config`]: Sentinels, key layout and cache sizing constants
//! - [`error`]: `StoreError` carried inside `eyre::Report`
//! - [`encoding`]: Integer and string text codec, payload cursor
//! - [`keys`]: Prefix-scoped key allocation
//! - [`chunk`]: Coordinates, chunk kinds, ordered index and hash map payloads
//! - [`space`]: Chunk cache, dirty list, pin managers
//! - [`driver`]: Content delivery driver trait and in-memory driver
//! - [`manager`]: Data manager orchestration and builder

pub mod chunk;
pub mod config;
pub mod driver;
pub mod encoding;
pub mod error;
pub mod keys;
pub mod manager;
pub mod space;

pub use chunk::{Chunk, ChunkKind, Coord, HashMapChunk, LongLongMap, OrderedIndex, StringLongMap};
pub use driver::{ContentDeliveryDriver, ContentUpdateListener, MemoryDriver};
pub use error::StoreError;
pub use keys::KeyCalculator;
pub use manager::{DataManager, StoreBuilder, SubscriptionId};
pub use space::{ChunkSpace, ChunkSpaceManager, CountingSpaceManager, NoopSpaceManager};
