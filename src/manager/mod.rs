//! # Data Manager
//!
//! The orchestrator that ties the chunk space, the pin manager and the content
//! delivery driver together. It owns the peer's key allocation state, the
//! global universe index and the local change subscriptions.
//!
//! ## Connection Sequence
//!
//! ```text
//! connect(cb)
//!   └─ driver.connect
//!        └─ driver.atomic_get_increment(PREFIX_COUNTER)      -> prefix
//!             └─ driver.get([universe counter, object counter, universe index])
//!                  └─ restore key calculators, pin universe index chunk
//!                       └─ cb(Ok(()))
//! ```
//!
//! Every failure along the chain ends in `cb(Err(..))`; nothing is retried.
//!
//! ## Metadata Records
//!
//! | Coordinate                            | Payload                          |
//! |---------------------------------------|----------------------------------|
//! | `(END_OF_TIME, NULL, NULL)`           | peer prefix counter (driver)     |
//! | `(BEGINNING_OF_TIME, NULL, prefix)`   | universe key counter             |
//! | `(END_OF_TIME, NULL, prefix)`         | object key counter               |
//! | `(NULL, NULL, NULL)`                  | universe → parent universe map   |
//!
//! Counters are written with [`encode_long`]. A missing or empty counter
//! payload means no key has been issued yet under that prefix.
//!
//! ## Save
//!
//! `save` drains the dirty set, clears each chunk's dirty bit before its
//! payload is produced, and ships all payloads plus both counters in a single
//! driver `put`. A mutation racing with the save re-dirties the chunk and is
//! picked up by the next save. The manager's own update listener is excluded
//! from the `put`, and the saved object coordinates are dispatched to local
//! subscribers once the driver acknowledges.
//!
//! ## Remote Updates
//!
//! The manager registers an update listener with the driver. When another
//! writer changes keys, resident chunks that carry no local modifications are
//! reloaded from the driver, then subscribers of the touched objects are told.
//! Dirty chunks are left alone; their local content wins until saved.

mod builder;
mod listener;

pub use builder::StoreBuilder;
pub use listener::{ListenerRegistry, SubscriptionId, UpdateHandler};

use std::sync::{Arc, Weak};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chunk::{Chunk, ChunkKind, Coord};
use crate::config::{BEGINNING_OF_TIME, DIRTY_BIT, END_OF_TIME, NULL_LONG};
use crate::driver::{Callback, ContentDeliveryDriver, ContentUpdateListener, ListenerId};
use crate::encoding::{decode_long, encode_long};
use crate::error::StoreError;
use crate::keys::KeyCalculator;
use crate::space::{ChunkSpace, ChunkSpaceManager};

/// Driver-side counter handing out one prefix per connecting peer.
pub const PREFIX_COUNTER: Coord = Coord::new(END_OF_TIME, NULL_LONG, NULL_LONG);

/// Map chunk recording the parent of every universe.
pub const GLOBAL_UNIVERSE_INDEX: Coord = Coord::new(NULL_LONG, NULL_LONG, NULL_LONG);

/// Model keys are process-local and always use prefix 0.
const MODEL_PREFIX: i16 = 0;

pub fn universe_counter_key(prefix: i16) -> Coord {
    Coord::new(BEGINNING_OF_TIME, NULL_LONG, prefix as i64)
}

pub fn object_counter_key(prefix: i16) -> Coord {
    Coord::new(END_OF_TIME, NULL_LONG, prefix as i64)
}

fn parse_counter(payload: Option<&str>) -> Result<i64> {
    match payload {
        None | Some("") => Ok(0),
        Some(text) => decode_long(text).wrap_err("corrupt key counter record"),
    }
}

fn encode_counter(value: i64) -> String {
    let mut out = String::new();
    encode_long(value, &mut out);
    out
}

#[derive(Debug)]
struct Session {
    prefix: i16,
    universe_keys: KeyCalculator,
    object_keys: KeyCalculator,
}

/// Forwards driver notifications to the manager without keeping it alive.
struct UpdateRelay {
    manager: Weak<DataManager>,
}

impl ContentUpdateListener for UpdateRelay {
    fn on_keys_update(&self, keys: &[Coord]) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_keys_update(keys);
        }
    }
}

pub struct DataManager {
    space_manager: Arc<dyn ChunkSpaceManager>,
    driver: Arc<dyn ContentDeliveryDriver>,
    session: Mutex<Option<Session>>,
    model_keys: Mutex<KeyCalculator>,
    listener_id: ListenerId,
    subscriptions: ListenerRegistry,
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("space", self.space_manager.space())
            .field("session", &*self.session.lock())
            .field("listener_id", &self.listener_id)
            .finish()
    }
}

impl DataManager {
    /// Creates a manager and registers its update listener with `driver`.
    ///
    /// Most callers go through [`StoreBuilder`], which also attaches the
    /// driver to the chunk space for eviction write-back.
    pub fn new(
        space_manager: Arc<dyn ChunkSpaceManager>,
        driver: Arc<dyn ContentDeliveryDriver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let listener_id = driver.add_update_listener(Arc::new(UpdateRelay {
                manager: weak.clone(),
            }));
            Self {
                space_manager,
                driver,
                session: Mutex::new(None),
                model_keys: Mutex::new(KeyCalculator::new(MODEL_PREFIX, 0)),
                listener_id,
                subscriptions: ListenerRegistry::new(),
            }
        })
    }

    pub fn space(&self) -> &Arc<ChunkSpace> {
        self.space_manager.space()
    }

    pub fn space_manager(&self) -> &Arc<dyn ChunkSpaceManager> {
        &self.space_manager
    }

    pub fn driver(&self) -> &Arc<dyn ContentDeliveryDriver> {
        &self.driver
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Prefix assigned by the driver on connect.
    pub fn prefix(&self) -> Option<i16> {
        self.session.lock().as_ref().map(|session| session.prefix)
    }

    /// Number of resident chunks.
    pub fn space_size(&self) -> usize {
        self.space().size()
    }

    pub fn connect(self: &Arc<Self>, callback: Callback<()>) {
        if self.is_connected() {
            callback(Ok(()));
            return;
        }
        let this = Arc::clone(self);
        self.driver.connect(Box::new(move |result| {
            if let Err(e) = result {
                callback(Err(e.wrap_err("content delivery driver failed to connect")));
                return;
            }
            this.acquire_prefix(callback);
        }));
    }

    fn acquire_prefix(self: Arc<Self>, callback: Callback<()>) {
        let this = Arc::clone(&self);
        self.driver.atomic_get_increment(
            PREFIX_COUNTER,
            Box::new(move |result| match result {
                Ok(prefix) => this.load_session(prefix, callback),
                Err(e) => callback(Err(e.wrap_err("failed to allocate a peer prefix"))),
            }),
        );
    }

    fn load_session(self: Arc<Self>, prefix: i16, callback: Callback<()>) {
        let keys = [
            universe_counter_key(prefix),
            object_counter_key(prefix),
            GLOBAL_UNIVERSE_INDEX,
        ];
        let this = Arc::clone(&self);
        self.driver.get(
            &keys,
            Box::new(move |result| {
                callback(result.and_then(|payloads| this.restore_session(prefix, payloads)))
            }),
        );
    }

    fn restore_session(&self, prefix: i16, payloads: Vec<Option<String>>) -> Result<()> {
        ensure!(
            payloads.len() == 3,
            StoreError::driver(format!(
                "expected 3 connection records, got {}",
                payloads.len()
            ))
        );
        let universe_counter = parse_counter(payloads[0].as_deref())?;
        let object_counter = parse_counter(payloads[1].as_deref())?;

        let index = self
            .space_manager
            .create_and_mark(GLOBAL_UNIVERSE_INDEX, ChunkKind::LongLongMap)?;
        if let Some(payload) = payloads[2].as_deref().filter(|p| !p.is_empty()) {
            if index.is_dirty() {
                debug!("keeping locally modified universe index");
            } else if let Err(e) = index.init(payload) {
                warn!(error = %e, "skipping corrupt global universe index");
            }
        }

        let mut session = self.session.lock();
        if session.is_some() {
            // A concurrent connect finished first; drop the extra pin.
            drop(session);
            self.space_manager.unmark_chunk(&index);
            return Ok(());
        }
        *session = Some(Session {
            prefix,
            universe_keys: KeyCalculator::new(prefix, universe_counter),
            object_keys: KeyCalculator::new(prefix, object_counter),
        });
        debug!(prefix, universe_counter, object_counter, "data manager connected");
        Ok(())
    }

    pub fn save(self: &Arc<Self>, callback: Callback<()>) {
        let dirty = self.space().detach_dirties();
        if dirty.is_empty() {
            callback(Ok(()));
            return;
        }

        let mut keys = Vec::with_capacity(dirty.len() + 2);
        let mut payloads = Vec::with_capacity(dirty.len() + 2);
        for coord in &dirty {
            let Some(chunk) = self.space_manager.get_and_mark(*coord) else {
                continue;
            };
            let previous = chunk.set_flags(0, DIRTY_BIT);
            if previous & DIRTY_BIT != 0 && !chunk.is_removed() {
                keys.push(*coord);
                payloads.push(chunk.serialize());
            }
            self.space_manager.unmark_chunk(&chunk);
        }

        if let Some(session) = self.session.lock().as_ref() {
            keys.push(universe_counter_key(session.prefix));
            payloads.push(encode_counter(session.universe_keys.last_computed_index()));
            keys.push(object_counter_key(session.prefix));
            payloads.push(encode_counter(session.object_keys.last_computed_index()));
        }
        if keys.is_empty() {
            callback(Ok(()));
            return;
        }

        let saved: Vec<Coord> = keys.iter().copied().filter(|k| !k.is_metadata()).collect();
        debug!(records = keys.len(), objects = saved.len(), "saving dirty chunks");
        let this = Arc::clone(self);
        self.driver.put(
            &keys,
            &payloads,
            Some(self.listener_id),
            Box::new(move |result| {
                if result.is_ok() {
                    this.subscriptions.dispatch(&saved);
                }
                callback(result);
            }),
        );
    }

    /// Ends the session and closes the driver. Unsaved chunks stay resident.
    pub fn close(&self, callback: Callback<()>) {
        let Some(session) = self.session.lock().take() else {
            callback(Ok(()));
            return;
        };
        self.space_manager.unmark(GLOBAL_UNIVERSE_INDEX);
        debug!(prefix = session.prefix, "data manager closing");
        self.driver.close(callback);
    }

    pub fn next_universe_key(&self) -> Result<i64> {
        let mut session = self.session.lock();
        let session = session.as_mut().ok_or(StoreError::NotConnected)?;
        session.universe_keys.next_key()
    }

    pub fn next_object_key(&self) -> Result<i64> {
        let mut session = self.session.lock();
        let session = session.as_mut().ok_or(StoreError::NotConnected)?;
        session.object_keys.next_key()
    }

    /// Next meta-model key. Available without a connection.
    pub fn next_model_key(&self) -> Result<i64> {
        self.model_keys.lock().next_key()
    }

    /// Records `parent` as the parent of `universe` unless one is already set.
    pub fn init_universe(&self, universe: i64, parent: i64) -> Result<()> {
        let index = self.universe_index()?;
        let result = match index.as_long_map() {
            Some(map) => {
                if !map.contains(&universe) {
                    map.put(universe, parent);
                }
                Ok(())
            }
            None => Err(StoreError::decode("global universe index is not a map").into()),
        };
        self.space_manager.unmark_chunk(&index);
        result
    }

    pub fn parent_universe(&self, universe: i64) -> Result<Option<i64>> {
        let index = self.universe_index()?;
        let parent = index.as_long_map().and_then(|map| map.get(&universe));
        self.space_manager.unmark_chunk(&index);
        Ok(parent)
    }

    fn universe_index(&self) -> Result<Arc<Chunk>> {
        if !self.is_connected() {
            return Err(StoreError::NotConnected.into());
        }
        self.precise_chunk(GLOBAL_UNIVERSE_INDEX)
    }

    /// Pinned resident chunk at `coord`. Release it with [`Self::release`].
    pub fn precise_chunk(&self, coord: Coord) -> Result<Arc<Chunk>> {
        self.space_manager
            .get_and_mark(coord)
            .ok_or_else(|| StoreError::CacheMiss { coord }.into())
    }

    pub fn release(&self, chunk: &Chunk) {
        self.space_manager.unmark_chunk(chunk);
    }

    /// Resolves each request to a pinned chunk, loading missing ones from the
    /// driver. Entries the driver does not know, or whose payload does not
    /// decode, come back as `None`.
    pub fn lookup_chunks(
        self: &Arc<Self>,
        requests: Vec<(Coord, ChunkKind)>,
        callback: Callback<Vec<Option<Arc<Chunk>>>>,
    ) {
        let mut results: Vec<Option<Arc<Chunk>>> = vec![None; requests.len()];
        let mut missing = Vec::new();
        for (slot, (coord, _)) in requests.iter().enumerate() {
            match self.space_manager.get_and_mark(*coord) {
                Some(chunk) => results[slot] = Some(chunk),
                None => missing.push(slot),
            }
        }
        if missing.is_empty() {
            callback(Ok(results));
            return;
        }

        let keys: Vec<Coord> = missing.iter().map(|&slot| requests[slot].0).collect();
        let this = Arc::clone(self);
        self.driver.get(
            &keys,
            Box::new(move |result| {
                let payloads = match result {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        this.release_all(&results);
                        callback(Err(e));
                        return;
                    }
                };
                for (slot, payload) in missing.into_iter().zip(payloads) {
                    let Some(payload) = payload else {
                        continue;
                    };
                    let (coord, kind) = requests[slot];
                    let chunk = match this.space_manager.create_and_mark(coord, kind) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            this.release_all(&results);
                            callback(Err(e));
                            return;
                        }
                    };
                    if !chunk.is_dirty() {
                        if let Err(e) = chunk.init(&payload) {
                            warn!(%coord, error = %e, "skipping undecodable chunk payload");
                            this.space_manager.unmark_chunk(&chunk);
                            continue;
                        }
                    }
                    results[slot] = Some(chunk);
                }
                callback(Ok(results));
            }),
        );
    }

    fn release_all(&self, chunks: &[Option<Arc<Chunk>>]) {
        for chunk in chunks.iter().flatten() {
            self.space_manager.unmark_chunk(chunk);
        }
    }

    /// Registers `handler` for changes to object `obj`.
    pub fn subscribe(
        &self,
        obj: i64,
        handler: impl Fn(&[Coord]) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscriptions.subscribe(obj, Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    fn on_keys_update(self: Arc<Self>, keys: &[Coord]) {
        let stale: Vec<Coord> = keys
            .iter()
            .copied()
            .filter(|key| {
                self.space()
                    .get(*key)
                    .is_some_and(|chunk| !chunk.is_dirty() && !chunk.is_removed())
            })
            .collect();
        let changed: Vec<Coord> = keys.to_vec();
        if stale.is_empty() {
            self.subscriptions.dispatch(&changed);
            return;
        }

        debug!(chunks = stale.len(), "reloading chunks changed by another writer");
        let request = stale.clone();
        let this = Arc::clone(&self);
        self.driver.get(
            &request,
            Box::new(move |result| {
                match result {
                    Ok(payloads) => this.refresh(&stale, payloads),
                    Err(e) => warn!(error = %e, "failed to reload updated chunks"),
                }
                this.subscriptions.dispatch(&changed);
            }),
        );
    }

    fn refresh(&self, keys: &[Coord], payloads: Vec<Option<String>>) {
        for (key, payload) in keys.iter().zip(payloads) {
            let Some(payload) = payload else {
                continue;
            };
            let Some(chunk) = self.space().get(*key) else {
                continue;
            };
            if chunk.is_dirty() || chunk.is_removed() {
                continue;
            }
            if let Err(e) = chunk.init(&payload) {
                warn!(%key, error = %e, "skipping undecodable chunk payload");
            }
        }
    }
}

impl Drop for DataManager {
    fn drop(&mut self) {
        self.driver.remove_update_listener(self.listener_id);
    }
}
