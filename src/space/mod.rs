//! # Chunk Space Module
//!
//! The bounded cache that holds every loaded chunk, and the managers that pin
//! chunks while they are in use.
//!
//! ## Module Organization
//!
//! - [`chunk_space`]: Slot table, collision chains, FIFO victim selection, write-back
//! - [`dirty`]: Lock-free take-all list of dirty coordinates
//! - [`manager`]: Counting and no-op pin managers
//! - `ring`: FIFO of slot indices

pub mod chunk_space;
pub mod dirty;
pub mod manager;
mod ring;

pub use chunk_space::ChunkSpace;
pub use dirty::{DirtyBatch, DirtyList};
pub use manager::{ChunkSpaceManager, CountingSpaceManager, NoopSpaceManager};
