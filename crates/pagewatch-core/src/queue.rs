//! Bounded single-producer/single-consumer event queue.
//!
//! A ring buffer over a fixed slot array with monotonically increasing
//! head/tail counters: no per-event allocation, wait-free on both sides,
//! tail-drop when full. The fast-path handler is the only producer and
//! the enrichment worker the only consumer; concurrent calls on the same
//! side are not supported.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity SPSC FIFO.
///
/// `head` and `tail` count operations, not slots; the slot index is the
/// counter modulo capacity, so `tail - head` is always the current depth
/// and the full/empty states never alias.
pub struct EventQueue<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    /// Next slot to pop. Written only by the consumer.
    head: AtomicUsize,
    /// Next slot to push. Written only by the producer.
    tail: AtomicUsize,
}

// SAFETY: slot access is partitioned by the head/tail protocol — the
// producer only writes slots in [tail, head+capacity), the consumer only
// reads slots in [head, tail) — with release/acquire pairs ordering the
// hand-off. T itself must still be sendable across the thread boundary.
unsafe impl<T: Send> Send for EventQueue<T> {}
unsafe impl<T: Send> Sync for EventQueue<T> {}

impl<T> EventQueue<T> {
    /// Create a queue holding at most `capacity` events (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side. Returns `false` (dropping `value`) when the queue is
    /// at capacity; existing entries are never overwritten.
    pub fn enqueue(&self, value: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity {
            return false;
        }
        // SAFETY: the slot at `tail` is outside [head, tail) so the
        // consumer does not touch it until the release store below.
        unsafe {
            (*self.slots[tail % self.capacity].get()).write(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side; non-blocking.
    pub fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: head < tail, so the producer's release store published
        // this slot and will not rewrite it until head advances past it.
        let value = unsafe { (*self.slots[head % self.capacity].get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Current number of queued events. Eventually consistent when read
    /// from a third thread.
    pub fn depth(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Drop for EventQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for pos in head..tail {
            // SAFETY: entries in [head, tail) were written and never read.
            unsafe {
                (*self.slots[pos % self.capacity].get()).assume_init_drop();
            }
        }
    }
}
