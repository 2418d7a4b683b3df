//! Per-object change subscriptions.
//!
//! Handlers are registered for one object id and receive the coordinates of
//! that object that changed, either through a local save or a remote update.
//! Metadata coordinates are never dispatched. Handlers run after the registry
//! lock is released, so a handler may subscribe or unsubscribe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::chunk::Coord;

pub type SubscriptionId = u64;

pub type UpdateHandler = Arc<dyn Fn(&[Coord]) + Send + Sync>;

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    by_obj: RwLock<HashMap<i64, SmallVec<[(SubscriptionId, UpdateHandler); 2]>>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("objects", &self.by_obj.read().len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, obj: i64, handler: UpdateHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.by_obj
            .write()
            .entry(obj)
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut by_obj = self.by_obj.write();
        let mut found = false;
        by_obj.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            found |= handlers.len() != before;
            !handlers.is_empty()
        });
        found
    }

    pub fn is_empty(&self) -> bool {
        self.by_obj.read().is_empty()
    }

    pub fn dispatch(&self, keys: &[Coord]) {
        let mut grouped: HashMap<i64, SmallVec<[Coord; 4]>> = HashMap::new();
        for key in keys.iter().filter(|k| !k.is_metadata()) {
            grouped.entry(key.obj).or_default().push(*key);
        }
        if grouped.is_empty() {
            return;
        }

        let calls: Vec<(UpdateHandler, SmallVec<[Coord; 4]>)> = {
            let by_obj = self.by_obj.read();
            grouped
                .into_iter()
                .filter_map(|(obj, coords)| by_obj.get(&obj).map(|handlers| (handlers, coords)))
                .flat_map(|(handlers, coords)| {
                    handlers
                        .iter()
                        .map(move |(_, handler)| (Arc::clone(handler), coords.clone()))
                })
                .collect()
        };
        for (handler, coords) in calls {
            handler(&coords);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NULL_LONG;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<Coord>>>, UpdateHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: UpdateHandler = Arc::new(move |keys: &[Coord]| {
            sink.lock().extend_from_slice(keys);
        });
        (seen, handler)
    }

    #[test]
    fn dispatch_routes_by_object() {
        let registry = ListenerRegistry::new();
        let (seen_a, handler_a) = recorder();
        let (seen_b, handler_b) = recorder();
        registry.subscribe(1, handler_a);
        registry.subscribe(2, handler_b);

        registry.dispatch(&[Coord::new(0, 5, 1), Coord::new(0, 6, 3), Coord::new(0, 7, 1)]);
        assert_eq!(*seen_a.lock(), vec![Coord::new(0, 5, 1), Coord::new(0, 7, 1)]);
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn metadata_keys_are_not_dispatched() {
        let registry = ListenerRegistry::new();
        let (seen, handler) = recorder();
        registry.subscribe(NULL_LONG, handler);
        registry.dispatch(&[Coord::new(NULL_LONG, NULL_LONG, NULL_LONG)]);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let registry = ListenerRegistry::new();
        let (seen, handler) = recorder();
        let id = registry.subscribe(1, handler);
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert!(registry.is_empty());
        registry.dispatch(&[Coord::new(0, 0, 1)]);
        assert!(seen.lock().is_empty());
    }
}
