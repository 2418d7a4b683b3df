//! # Lock-Free Dirty List
//!
//! Records which chunks were modified since the last save, without ever
//! blocking the threads that modify them.
//!
//! ## Structure
//!
//! A take-all stack (Treiber stack without pop) of coordinates:
//!
//! ```text
//! head: AtomicPtr ──> [coord C] ──> [coord B] ──> [coord A] ──> null
//! ```
//!
//! - `push`: allocate a node, point it at the current head, CAS the head to the
//!   node, retry on contention.
//! - `detach`: `swap(null)` the head. The caller now owns the whole old list
//!   and the structure is immediately empty for concurrent pushers.
//!
//! Because the drain is a single atomic exchange, every push lands either in
//! the detached batch or in the fresh list, never both and never neither.
//!
//! ## Memory Reclamation
//!
//! Nodes are freed only by the thread that detached them, after the exchange.
//! A pusher stores the observed head in its own node's `next` and never
//! dereferences it.
//!
//! ## Ordering
//!
//! [`DirtyBatch`] yields coordinates in the order they were declared.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::chunk::Coord;

struct Node {
    coord: Coord,
    next: *mut Node,
}

#[derive(Debug)]
pub struct DirtyList {
    head: AtomicPtr<Node>,
}

impl Default for DirtyList {
    fn default() -> Self {
        Self::new()
    }
}

impl DirtyList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, coord: Coord) {
        let node = Box::into_raw(Box::new(Node {
            coord,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `node` is not yet published, this thread owns it.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Atomically takes every coordinate pushed so far.
    pub fn detach(&self) -> DirtyBatch {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut coords = Vec::new();
        while !node.is_null() {
            // SAFETY: the swap made this thread the sole owner of the chain;
            // each node was created by `Box::into_raw` in `push`.
            let boxed = unsafe { Box::from_raw(node) };
            coords.push(boxed.coord);
            node = boxed.next;
        }
        coords.reverse();
        DirtyBatch { coords }
    }
}

impl Drop for DirtyList {
    fn drop(&mut self) {
        drop(self.detach());
    }
}

/// Coordinates detached from a [`DirtyList`], oldest declaration first.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirtyBatch {
    coords: Vec<Coord>,
}

impl DirtyBatch {
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Coord> {
        self.coords.iter()
    }
}

impl IntoIterator for DirtyBatch {
    type Item = Coord;
    type IntoIter = std::vec::IntoIter<Coord>;

    fn into_iter(self) -> Self::IntoIter {
        self.coords.into_iter()
    }
}

impl<'a> IntoIterator for &'a DirtyBatch {
    type Item = &'a Coord;
    type IntoIter = std::slice::Iter<'a, Coord>;

    fn into_iter(self) -> Self::IntoIter {
        self.coords.iter()
    }
}
