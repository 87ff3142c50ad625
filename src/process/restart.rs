//! Queue of worker indices waiting to be respawned.
//!
//! Single producer (the death-detection path), single consumer (the restart
//! tick). Storage is allocated up front; `push` and `pop` neither allocate nor
//! lock, so the producer may run anywhere, including a signal handler.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Bounded FIFO of pending worker indices `1..=capacity`, each at most once.
pub struct RestartQueue {
    slots: Box<[AtomicUsize]>,
    /// `pending[i]` is set while index `i` is queued. Slot 0 is unused.
    pending: Box<[AtomicBool]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl RestartQueue {
    /// Queue for worker indices `1..=capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            pending: (0..=capacity).map(|_| AtomicBool::new(false)).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Queue `index` for restart.
    ///
    /// Returns false if the index is out of range or already pending.
    pub fn push(&self, index: usize) -> bool {
        if index == 0 || index >= self.pending.len() {
            return false;
        }
        if self.pending[index].swap(true, Ordering::AcqRel) {
            return false;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.slots.len() {
            // Unreachable while every index is queued at most once.
            self.pending[index].store(false, Ordering::Release);
            return false;
        }
        self.slots[tail % self.slots.len()].store(index, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Oldest pending index.
    pub fn pop(&self) -> Option<usize> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let index = self.slots[head % self.slots.len()].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        self.pending[index].store(false, Ordering::Release);
        Some(index)
    }

    pub fn is_pending(&self, index: usize) -> bool {
        self.pending
            .get(index)
            .is_some_and(|p| p.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending index.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn test_fifo_order() {
        let queue = RestartQueue::new(4);
        assert!(queue.push(3));
        assert!(queue.push(1));
        assert!(queue.push(4));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_index_rejected_while_pending() {
        let queue = RestartQueue::new(3);
        assert!(queue.push(2));
        assert!(!queue.push(2));
        assert!(queue.is_pending(2));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(), Some(2));
        assert!(!queue.is_pending(2));
        assert!(queue.push(2));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let queue = RestartQueue::new(2);
        assert!(!queue.push(0));
        assert!(!queue.push(3));
        assert!(queue.is_empty());

        let empty = RestartQueue::new(0);
        assert!(!empty.push(1));
        assert_eq!(empty.pop(), None);
    }

    #[test]
    fn test_wraps_around() {
        let queue = RestartQueue::new(2);
        for _ in 0..10 {
            assert!(queue.push(1));
            assert!(queue.push(2));
            assert_eq!(queue.pop(), Some(1));
            assert_eq!(queue.pop(), Some(2));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = RestartQueue::new(3);
        queue.push(1);
        queue.push(2);
        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.is_pending(1));
    }

    proptest! {
        /// Behaves like a deduplicating FIFO under any push/pop sequence.
        #[test]
        fn prop_matches_dedup_fifo(ops in proptest::collection::vec((any::<bool>(), 0usize..10), 0..200)) {
            let capacity = 8;
            let queue = RestartQueue::new(capacity);
            let mut model: VecDeque<usize> = VecDeque::new();

            for (is_push, index) in ops {
                if is_push {
                    let expected = (1..=capacity).contains(&index) && !model.contains(&index);
                    prop_assert_eq!(queue.push(index), expected);
                    if expected {
                        model.push_back(index);
                    }
                } else {
                    prop_assert_eq!(queue.pop(), model.pop_front());
                }
                prop_assert_eq!(queue.len(), model.len());
                prop_assert!(queue.len() <= capacity);
            }
        }
    }
}
