//! Single-producer / single-consumer ring buffer between capture and
//! encode.
//!
//! The queue is a latency valve: a full queue rejects the push and hands
//! the item back, so the producer can return the buffer to its pool and
//! move on to a newer frame. Neither side ever blocks.
//!
//! One slot always stays empty to tell "full" from "empty", so a queue of
//! capacity `N` holds at most `N - 1` items.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::VrsError;

struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next slot to read. Written only by the consumer.
    head: CachePadded<AtomicUsize>,
    /// Next slot to write. Written only by the producer.
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: a slot is touched by the producer only while it lies outside
// [head, tail) and by the consumer only while inside it; the
// acquire/release pairs on head and tail hand each slot over.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            // SAFETY: slots in [head, tail) are initialized and nobody
            // else can observe them once the ring is being dropped.
            unsafe { self.slots[head].get_mut().assume_init_drop() };
            head = (head + 1) & self.mask;
        }
    }
}

/// Create a queue with `capacity` slots.
///
/// `capacity` must be a power of two and at least 2.
pub fn spsc_queue<T>(capacity: usize) -> Result<(Producer<T>, Consumer<T>), VrsError> {
    if capacity < 2 || !capacity.is_power_of_two() {
        return Err(VrsError::InvalidConfig(
            "queue capacity must be a power of two >= 2",
        ));
    }
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let ring = Arc::new(Ring {
        slots,
        mask: capacity - 1,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });
    Ok((
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    ))
}

// ── Producer ─────────────────────────────────────────────────────

/// Writing half. Not `Clone`, so there is only ever one producer.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Producer<T> {
    /// Push `item`, or hand it back if the queue is full.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let next = (tail + 1) & ring.mask;
        if next == ring.head.load(Ordering::Acquire) {
            return Err(item);
        }
        // SAFETY: `tail` is outside [head, tail), so the consumer is not
        // reading it and no initialized value lives there.
        unsafe { (*ring.slots[tail].get()).write(item) };
        ring.tail.store(next, Ordering::Release);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slots, including the one that always stays empty.
    pub fn capacity(&self) -> usize {
        self.ring.mask + 1
    }
}

// ── Consumer ─────────────────────────────────────────────────────

/// Reading half. Not `Clone`, so there is only ever one consumer.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Consumer<T> {
    /// Pop the oldest item, or `None` if the queue is empty.
    pub fn try_pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        if head == ring.tail.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: `head` is inside [head, tail), published by the
        // producer's release store on `tail`.
        let item = unsafe { (*ring.slots[head].get()).assume_init_read() };
        ring.head.store((head + 1) & ring.mask, Ordering::Release);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.mask + 1
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").field("len", &self.len()).finish()
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("len", &self.len()).finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
