//! Fixed FIFO of slot indices used for victim selection.
//!
//! Every slot of the space is enqueued once at construction, so the ring
//! always holds each slot exactly once outside of an in-progress scan.

use std::collections::VecDeque;

#[derive(Debug)]
pub(crate) struct FifoRing {
    slots: VecDeque<u32>,
}

impl FifoRing {
    pub(crate) fn filled(capacity: usize) -> Self {
        Self {
            slots: (0..capacity as u32).collect(),
        }
    }

    pub(crate) fn dequeue(&mut self) -> Option<u32> {
        self.slots.pop_front()
    }

    pub(crate) fn enqueue(&mut self, slot: u32) {
        self.slots.push_back(slot);
    }

    /// Drops `slot` from its current position. The caller enqueues it again
    /// once the slot holds a new occupant.
    pub(crate) fn withdraw(&mut self, slot: u32) {
        if let Some(position) = self.slots.iter().position(|&s| s == slot) {
            self.slots.remove(position);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeued_slots_go_to_the_back() {
        let mut ring = FifoRing::filled(3);
        let first = ring.dequeue().unwrap();
        ring.enqueue(first);
        assert_eq!(ring.dequeue(), Some(1));
        assert_eq!(ring.dequeue(), Some(2));
        assert_eq!(ring.dequeue(), Some(0));
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn withdrawn_slot_keeps_the_others_in_order() {
        let mut ring = FifoRing::filled(4);
        ring.withdraw(1);
        assert_eq!(ring.len(), 3);
        ring.enqueue(1);
        assert_eq!(ring.dequeue(), Some(0));
        assert_eq!(ring.dequeue(), Some(2));
        assert_eq!(ring.dequeue(), Some(3));
        assert_eq!(ring.dequeue(), Some(1));
    }
}
