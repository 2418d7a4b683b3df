//! # Content Delivery Driver
//!
//! This module provides the `ContentDeliveryDriver` trait, the boundary between
//! the chunk cache and whatever actually stores payloads: a database, a remote
//! peer network, or plain memory in tests.
//!
//! ## Callback Interface
//!
//! Every operation completes through a callback instead of a return value, so
//! a driver may answer synchronously (in-memory) or from another thread
//! (network):
//!
//! ```text
//! fn get(&self, keys: &[Coord], callback: Callback<Vec<Option<String>>>);
//! fn put(&self, keys: &[Coord], payloads: &[String], exclude: Option<ListenerId>, callback: Callback<()>);
//! ```
//!
//! Callers must not hold locks that the callback needs.
//!
//! ## Update Listeners
//!
//! Drivers notify registered [`ContentUpdateListener`]s when keys change. A
//! writer that already has the new content passes its own listener id as
//! `exclude` to `put` so it is not told about its own write.
//!
//! ## Backends
//!
//! | Backend        | Scope        | Durable |
//! |----------------|--------------|---------|
//! | `MemoryDriver` | process-local| No      |
//!
//! ## Thread Safety
//!
//! `ContentDeliveryDriver` requires `Send + Sync`: the chunk space writes back
//! evicted chunks from whichever thread triggered the eviction.

mod memory;

pub use memory::MemoryDriver;

use std::sync::Arc;

use eyre::Result;

use crate::chunk::Coord;

/// Completion callback carrying the operation's outcome.
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Handle returned by [`ContentDeliveryDriver::add_update_listener`].
pub type ListenerId = u64;

/// Message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub topic: String,
    pub keys: Vec<Coord>,
    pub values: Vec<String>,
}

/// Receives change notifications from a driver.
pub trait ContentUpdateListener: Send + Sync {
    /// Called with the batch of coordinates whose payloads changed.
    fn on_keys_update(&self, keys: &[Coord]);

    /// Called with a message sent by a peer.
    fn on_message(&self, _message: &PeerMessage) {}
}

/// Backing store consumed by the chunk cache and the data manager.
pub trait ContentDeliveryDriver: Send + Sync {
    /// Opens the backing store.
    fn connect(&self, callback: Callback<()>);

    /// Releases the backing store.
    fn close(&self, callback: Callback<()>);

    /// Fetches payloads; missing keys yield `None` at their position.
    fn get(&self, keys: &[Coord], callback: Callback<Vec<Option<String>>>);

    /// Stores `payloads[i]` under `keys[i]` and notifies every update
    /// listener except `exclude`.
    fn put(
        &self,
        keys: &[Coord],
        payloads: &[String],
        exclude: Option<ListenerId>,
        callback: Callback<()>,
    );

    /// Atomically increments the counter stored at `key` and returns the
    /// value it held before the increment.
    fn atomic_get_increment(&self, key: Coord, callback: Callback<i16>);

    fn add_update_listener(&self, listener: Arc<dyn ContentUpdateListener>) -> ListenerId;

    fn remove_update_listener(&self, id: ListenerId);

    /// Delivers `message` to `peer`.
    fn send_to_peer(&self, peer: &str, message: PeerMessage, callback: Callback<()>);
}
