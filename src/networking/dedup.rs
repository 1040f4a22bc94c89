//! Bounded duplicate-suppression window
//!
//! A fixed-capacity ring of recently seen values with a hash index beside it,
//! giving O(1) membership tests and O(1) FIFO eviction. The reliable packet
//! layer uses it to drop resent packets whose sequence number it has already
//! processed.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hash;
use thiserror::Error;

/// Errors raised by [`DedupWindow`] precondition checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DedupError {
    #[error("Dedup window capacity must be greater than zero")]
    ZeroCapacity,

    #[error("Dedup window is empty")]
    Empty,
}

/// Ring state guarded by the window's lock
#[derive(Debug, Clone)]
struct Ring<T> {
    slots: Vec<Option<T>>,
    /// Oldest occupied slot
    head: usize,
    /// Next free slot
    tail: usize,
    len: usize,
    membership: HashSet<T>,
}

impl<T: Eq + Hash + Clone> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            head: 0,
            tail: 0,
            len: 0,
            membership: HashSet::with_capacity(capacity),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn advance(&self, cursor: usize) -> usize {
        (cursor + 1) % self.capacity()
    }

    fn retreat(&self, cursor: usize) -> usize {
        (cursor + self.capacity() - 1) % self.capacity()
    }

    fn pop_oldest(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = self.advance(self.head);
        self.len -= 1;
        if let Some(ref v) = value {
            self.membership.remove(v);
        }
        value
    }

    fn pop_newest(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.tail = self.retreat(self.tail);
        let value = self.slots[self.tail].take();
        self.len -= 1;
        if let Some(ref v) = value {
            self.membership.remove(v);
        }
        value
    }

    /// Remove an existing copy of `value` from the middle of the ring,
    /// closing the gap so occupied slots stay contiguous.
    fn remove_existing(&mut self, value: &T) {
        let Some(offset) = (0..self.len)
            .find(|i| self.slots[(self.head + i) % self.capacity()].as_ref() == Some(value))
        else {
            return;
        };

        for i in offset..self.len - 1 {
            let from = (self.head + i + 1) % self.capacity();
            let to = (self.head + i) % self.capacity();
            self.slots[to] = self.slots[from].take();
        }
        self.tail = self.retreat(self.tail);
        self.slots[self.tail] = None;
        self.len -= 1;
        self.membership.remove(value);
    }

    fn push(&mut self, value: T) {
        if self.membership.contains(&value) {
            self.remove_existing(&value);
        }
        if self.len == self.capacity() {
            self.pop_oldest();
        }
        self.slots[self.tail] = Some(value.clone());
        self.tail = self.advance(self.tail);
        self.len += 1;
        self.membership.insert(value);
    }

    fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.membership.clear();
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }
}

/// Thread-safe window over the last `capacity` values inserted.
///
/// Every operation takes the same exclusive lock, so the window can be shared
/// behind an `Arc` between the receive path and anything inspecting it.
///
/// `enqueue` of a value that is already present moves it to the newest
/// position instead of storing a second copy; membership and slot contents
/// therefore always agree.
#[derive(Debug)]
pub struct DedupWindow<T> {
    ring: Mutex<Ring<T>>,
}

impl<T: Eq + Hash + Clone> DedupWindow<T> {
    /// Create an empty window holding at most `capacity` values
    pub fn new(capacity: usize) -> Result<Self, DedupError> {
        if capacity == 0 {
            return Err(DedupError::ZeroCapacity);
        }
        Ok(Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
        })
    }

    /// Fixed capacity chosen at construction
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().len == 0
    }

    pub fn is_full(&self) -> bool {
        let ring = self.ring.lock();
        ring.len == ring.capacity()
    }

    /// True if `value` is currently in the window
    pub fn contains(&self, value: &T) -> bool {
        self.ring.lock().membership.contains(value)
    }

    /// Insert `value` as the newest element, evicting the oldest when full
    pub fn enqueue(&self, value: T) {
        self.ring.lock().push(value);
    }

    /// Insert `value` unless it is already present.
    ///
    /// Returns `false` and leaves the window untouched for a duplicate.
    pub fn try_enqueue(&self, value: T) -> bool {
        let mut ring = self.ring.lock();
        if ring.membership.contains(&value) {
            return false;
        }
        ring.push(value);
        true
    }

    /// Remove and return the oldest element
    pub fn dequeue(&self) -> Result<T, DedupError> {
        self.ring.lock().pop_oldest().ok_or(DedupError::Empty)
    }

    /// Remove and return the most recently inserted element
    pub fn dequeue_last(&self) -> Result<T, DedupError> {
        self.ring.lock().pop_newest().ok_or(DedupError::Empty)
    }

    /// Drop every element; capacity is unchanged
    pub fn clear(&self) {
        self.ring.lock().clear();
    }

    /// Contents ordered oldest to newest
    pub fn snapshot(&self) -> Vec<T> {
        let ring = self.ring.lock();
        (0..ring.len)
            .filter_map(|i| ring.slots[(ring.head + i) % ring.capacity()].clone())
            .collect()
    }
}

impl<T: Eq + Hash + Clone> Clone for DedupWindow<T> {
    /// Independent copy taken under the source's lock
    fn clone(&self) -> Self {
        let ring = self.ring.lock().clone();
        Self {
            ring: Mutex::new(ring),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(DedupWindow::<u32>::new(0).unwrap_err(), DedupError::ZeroCapacity);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let window = DedupWindow::new(4).unwrap();
        for seq in 0..20u32 {
            window.enqueue(seq);
            assert!(window.len() <= 4);
            window.try_enqueue(seq + 100);
            assert!(window.len() <= 4);
        }
        assert!(window.is_full());
        assert_eq!(window.capacity(), 4);
    }

    #[test]
    fn test_fifo_eviction() {
        let window = DedupWindow::new(3).unwrap();
        for seq in 1..=4u32 {
            window.enqueue(seq);
        }

        // 1 was evicted by the fourth insert
        assert!(!window.contains(&1));
        assert_eq!(window.dequeue().unwrap(), 2);
        assert_eq!(window.snapshot(), vec![3, 4]);
    }

    #[test]
    fn test_membership_mirrors_contents() {
        let window = DedupWindow::new(3).unwrap();
        window.enqueue("a".to_string());
        window.enqueue("b".to_string());
        window.enqueue("c".to_string());
        window.enqueue("d".to_string());

        assert!(!window.contains(&"a".to_string()));
        for v in ["b", "c", "d"] {
            assert!(window.contains(&v.to_string()));
        }

        window.dequeue().unwrap();
        assert!(!window.contains(&"b".to_string()));
        window.dequeue_last().unwrap();
        assert!(!window.contains(&"d".to_string()));
        assert_eq!(window.snapshot(), vec!["c".to_string()]);
    }

    #[test]
    fn test_try_enqueue_rejects_duplicates() {
        let window = DedupWindow::new(8).unwrap();
        assert!(window.try_enqueue(42u32));
        assert_eq!(window.len(), 1);

        assert!(!window.try_enqueue(42));
        assert_eq!(window.len(), 1);

        assert!(window.try_enqueue(43));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_dequeue_last_undoes_enqueue() {
        let window = DedupWindow::new(5).unwrap();
        window.enqueue(1u32);
        window.enqueue(2);
        let before = window.snapshot();

        window.enqueue(9);
        assert_eq!(window.dequeue_last().unwrap(), 9);

        assert_eq!(window.snapshot(), before);
        assert!(!window.contains(&9));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_dequeue_last_when_full_and_wrapped() {
        let window = DedupWindow::new(3).unwrap();
        for seq in 1..=5u32 {
            window.enqueue(seq);
        }
        assert!(window.is_full());

        assert_eq!(window.dequeue_last().unwrap(), 5);
        assert_eq!(window.dequeue_last().unwrap(), 4);
        assert_eq!(window.dequeue_last().unwrap(), 3);
        assert_eq!(window.dequeue_last(), Err(DedupError::Empty));

        // Cursors stay consistent after unwinding across the wrap point
        window.enqueue(7);
        window.enqueue(8);
        assert_eq!(window.snapshot(), vec![7, 8]);
    }

    #[test]
    fn test_clear_empties() {
        let window = DedupWindow::new(4).unwrap();
        for seq in 0..6u32 {
            window.enqueue(seq);
        }
        window.clear();

        assert!(window.is_empty());
        for seq in 0..6u32 {
            assert!(!window.contains(&seq));
        }
        assert_eq!(window.capacity(), 4);

        window.enqueue(10);
        assert_eq!(window.snapshot(), vec![10]);
    }

    #[test]
    fn test_dequeue_on_empty_is_an_error() {
        let window = DedupWindow::<u32>::new(2).unwrap();
        assert_eq!(window.dequeue(), Err(DedupError::Empty));
        assert_eq!(window.dequeue_last(), Err(DedupError::Empty));
    }

    #[test]
    fn test_enqueue_duplicate_moves_to_newest() {
        let window = DedupWindow::new(4).unwrap();
        window.enqueue(1u32);
        window.enqueue(2);
        window.enqueue(3);
        window.enqueue(1);

        assert_eq!(window.snapshot(), vec![2, 3, 1]);
        assert_eq!(window.len(), 3);

        assert_eq!(window.dequeue().unwrap(), 2);
        assert_eq!(window.dequeue().unwrap(), 3);
        assert_eq!(window.dequeue().unwrap(), 1);
        assert!(!window.contains(&1));
        assert!(window.is_empty());
    }

    #[test]
    fn test_enqueue_duplicate_across_wrap() {
        let window = DedupWindow::new(3).unwrap();
        for seq in 1..=4u32 {
            window.enqueue(seq);
        }
        // Ring is [4, 2, 3] with head on 2
        window.enqueue(2);
        assert_eq!(window.snapshot(), vec![3, 4, 2]);
        assert!(window.contains(&2));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_clone_is_independent() {
        let window = DedupWindow::new(3).unwrap();
        window.enqueue(1u32);
        window.enqueue(2);

        let copy = window.clone();
        window.enqueue(3);
        window.dequeue().unwrap();

        assert_eq!(copy.snapshot(), vec![1, 2]);
        assert_eq!(copy.capacity(), 3);
        assert_eq!(window.snapshot(), vec![2, 3]);
    }

    #[test]
    fn test_concurrent_try_enqueue() {
        let window = Arc::new(DedupWindow::new(1024).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    (0..256u32).filter(|seq| window.try_enqueue(*seq)).count()
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 256);
        assert_eq!(window.len(), 256);
    }
}
