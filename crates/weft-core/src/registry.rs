//! The stream table: stream id to live stream object.
//!
//! One registry instance backs one map; a connection keeps separate
//! registries for its requester streams, its responder sending subscriptions
//! and its responder channel processors. All operations are safe under
//! concurrent callers; `allocate` performs id assignment and insertion in a
//! single critical section so a freshly drawn id can never collide.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::stream_id::StreamIdSupplier;

#[derive(Debug)]
pub struct StreamRegistry<V> {
    inner: Mutex<Inner<V>>,
}

#[derive(Debug)]
struct Inner<V> {
    ids: StreamIdSupplier,
    streams: HashMap<u32, V>,
}

impl<V: Clone> StreamRegistry<V> {
    pub fn new(ids: StreamIdSupplier) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ids,
                streams: HashMap::new(),
            }),
        }
    }

    /// Draw a fresh id and insert `value` under it, atomically.
    pub fn allocate(&self, value: V) -> u32 {
        let mut inner = self.inner.lock();
        let Inner { ids, streams } = &mut *inner;
        let id = ids.next_id(streams);
        streams.insert(id, value);
        id
    }

    /// Draw a fresh id without inserting anything (fire-and-forget streams
    /// expect no response and keep no table entry).
    pub fn next_id(&self) -> u32 {
        let mut inner = self.inner.lock();
        let Inner { ids, streams } = &mut *inner;
        ids.next_id(streams)
    }

    /// Insert under a peer-assigned id. Returns false if the id is taken.
    pub fn register(&self, id: u32, value: V) -> bool {
        let mut inner = self.inner.lock();
        if inner.streams.contains_key(&id) {
            return false;
        }
        inner.streams.insert(id, value);
        true
    }

    pub fn get(&self, id: u32) -> Option<V> {
        self.inner.lock().streams.get(&id).cloned()
    }

    pub fn remove(&self, id: u32) -> Option<V> {
        self.inner.lock().streams.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.lock().streams.contains_key(&id)
    }

    /// Drain every entry, leaving the table empty. Used at termination.
    pub fn take_all(&self) -> Vec<(u32, V)> {
        self.inner.lock().streams.drain().collect()
    }

    /// Live stream ids, sorted. Diagnostics only.
    pub fn ids(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut ids: Vec<u32> = inner.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
