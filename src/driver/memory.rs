//! In-memory content delivery driver.
//!
//! Payloads live in a `hashbrown::HashMap` behind a `parking_lot::Mutex`.
//! Every operation completes synchronously on the calling thread. Atomic
//! counters are stored as decimal payloads and wrap from `i16::MAX` to
//! `i16::MIN`. Peer messages are looped back to the local listeners.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::bail;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{
    Callback, ContentDeliveryDriver, ContentUpdateListener, ListenerId, PeerMessage,
};
use crate::chunk::Coord;
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryDriver {
    store: Mutex<HashMap<Coord, String>>,
    listeners: RwLock<HashMap<ListenerId, Arc<dyn ContentUpdateListener>>>,
    next_listener: AtomicU64,
    connected: AtomicBool,
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("entries", &self.len())
            .field("listeners", &self.listeners.read().len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of stored payloads.
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored payload at `key`, if any.
    pub fn payload(&self, key: Coord) -> Option<String> {
        self.store.lock().get(&key).cloned()
    }

    fn listeners_except(&self, exclude: Option<ListenerId>) -> Vec<Arc<dyn ContentUpdateListener>> {
        self.listeners
            .read()
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

impl ContentDeliveryDriver for MemoryDriver {
    fn connect(&self, callback: Callback<()>) {
        self.connected.store(true, Ordering::Release);
        callback(Ok(()));
    }

    fn close(&self, callback: Callback<()>) {
        self.connected.store(false, Ordering::Release);
        callback(Ok(()));
    }

    fn get(&self, keys: &[Coord], callback: Callback<Vec<Option<String>>>) {
        let payloads = {
            let store = self.store.lock();
            keys.iter().map(|key| store.get(key).cloned()).collect()
        };
        callback(Ok(payloads));
    }

    fn put(
        &self,
        keys: &[Coord],
        payloads: &[String],
        exclude: Option<ListenerId>,
        callback: Callback<()>,
    ) {
        if keys.len() != payloads.len() {
            callback(Err(StoreError::driver(format!(
                "{} keys but {} payloads",
                keys.len(),
                payloads.len()
            ))
            .into()));
            return;
        }
        {
            let mut store = self.store.lock();
            for (key, payload) in keys.iter().zip(payloads) {
                store.insert(*key, payload.clone());
            }
        }
        trace!(keys = keys.len(), "memory driver stored batch");
        for listener in self.listeners_except(exclude) {
            listener.on_keys_update(keys);
        }
        callback(Ok(()));
    }

    fn atomic_get_increment(&self, key: Coord, callback: Callback<i16>) {
        let result = (|| {
            let mut store = self.store.lock();
            let previous = match store.get(&key) {
                Some(text) => match text.parse::<i16>() {
                    Ok(value) => value,
                    Err(e) => bail!(StoreError::driver(format!(
                        "counter at {} holds {:?}: {}",
                        key, text, e
                    ))),
                },
                None => 0,
            };
            store.insert(key, previous.wrapping_add(1).to_string());
            Ok(previous)
        })();
        callback(result);
    }

    fn add_update_listener(&self, listener: Arc<dyn ContentUpdateListener>) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::AcqRel);
        self.listeners.write().insert(id, listener);
        id
    }

    fn remove_update_listener(&self, id: ListenerId) {
        self.listeners.write().remove(&id);
    }

    fn send_to_peer(&self, peer: &str, message: PeerMessage, callback: Callback<()>) {
        trace!(peer, topic = %message.topic, "memory driver loopback message");
        for listener in self.listeners_except(None) {
            listener.on_message(&message);
        }
        callback(Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn wait<T: Send + 'static>(op: impl FnOnce(Callback<T>)) -> eyre::Result<T> {
        let (tx, rx) = mpsc::channel();
        op(Box::new(move |result| {
            tx.send(result).unwrap();
        }));
        rx.recv().unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        keys: Mutex<Vec<Coord>>,
        messages: Mutex<Vec<PeerMessage>>,
    }

    impl ContentUpdateListener for Recorder {
        fn on_keys_update(&self, keys: &[Coord]) {
            self.keys.lock().extend_from_slice(keys);
        }

        fn on_message(&self, message: &PeerMessage) {
            self.messages.lock().push(message.clone());
        }
    }

    #[test]
    fn put_then_get() {
        let driver = MemoryDriver::new();
        let a = Coord::new(0, 0, 1);
        let b = Coord::new(0, 0, 2);
        wait(|cb| driver.put(&[a], &["x".to_string()], None, cb)).unwrap();
        let got = wait(|cb| driver.get(&[a, b], cb)).unwrap();
        assert_eq!(got, vec![Some("x".to_string()), None]);
    }

    #[test]
    fn mismatched_batch_is_rejected() {
        let driver = MemoryDriver::new();
        let result = wait(|cb| driver.put(&[Coord::new(0, 0, 1)], &[], None, cb));
        assert!(result.is_err());
        assert!(driver.is_empty());
    }

    #[test]
    fn atomic_increment_returns_previous_and_wraps() {
        let driver = MemoryDriver::new();
        let key = Coord::new(1, 1, 1);
        assert_eq!(wait(|cb| driver.atomic_get_increment(key, cb)).unwrap(), 0);
        assert_eq!(wait(|cb| driver.atomic_get_increment(key, cb)).unwrap(), 1);

        wait(|cb| driver.put(&[key], &[i16::MAX.to_string()], None, cb)).unwrap();
        assert_eq!(
            wait(|cb| driver.atomic_get_increment(key, cb)).unwrap(),
            i16::MAX
        );
        assert_eq!(driver.payload(key), Some(i16::MIN.to_string()));
    }

    #[test]
    fn put_skips_excluded_listener() {
        let driver = MemoryDriver::new();
        let mine = Arc::new(Recorder::default());
        let other = Arc::new(Recorder::default());
        let mine_id = driver.add_update_listener(mine.clone());
        driver.add_update_listener(other.clone());

        let key = Coord::new(0, 0, 9);
        wait(|cb| driver.put(&[key], &["p".to_string()], Some(mine_id), cb)).unwrap();
        assert!(mine.keys.lock().is_empty());
        assert_eq!(*other.keys.lock(), vec![key]);

        driver.remove_update_listener(mine_id);
        let message = PeerMessage {
            topic: "ping".to_string(),
            keys: vec![],
            values: vec![],
        };
        wait(|cb| driver.send_to_peer("*", message.clone(), cb)).unwrap();
        assert!(mine.messages.lock().is_empty());
        assert_eq!(*other.messages.lock(), vec![message]);
    }
}
