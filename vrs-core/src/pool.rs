//! Reusable buffer pools for raw and compressed frames.
//!
//! Both pools follow the same policy: `acquire` never blocks (an empty
//! free list means a fresh allocation) and `release` keeps at most twice
//! the configured pool size, discarding the rest. The mutex guards only
//! the free-list push/pop, never a pixel copy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::frame::{CompressedFrame, RawFrame};

// ── Pool core ────────────────────────────────────────────────────

/// Counters describing pool pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated after construction because the list was empty.
    pub allocations: u64,
    /// Buffers destroyed on release because the list was over its cap.
    pub discards: u64,
    pub free: usize,
}

struct Pool<T> {
    free: Mutex<VecDeque<T>>,
    pool_size: usize,
    buffer_capacity: usize,
    allocations: AtomicU64,
    discards: AtomicU64,
}

impl<T> Pool<T> {
    fn new(pool_size: usize, buffer_capacity: usize, make: impl Fn(usize) -> T) -> Self {
        let free = (0..pool_size).map(|_| make(buffer_capacity)).collect();
        Self {
            free: Mutex::new(free),
            pool_size,
            buffer_capacity,
            allocations: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    fn list(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A poisoned free list still holds valid buffers.
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self, make: impl FnOnce(usize) -> T) -> T {
        if let Some(item) = self.list().pop_front() {
            return item;
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        make(self.buffer_capacity)
    }

    fn release(&self, item: T) {
        let mut list = self.list();
        if list.len() >= self.pool_size * 2 {
            drop(list);
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }
        list.push_back(item);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            free: self.list().len(),
        }
    }
}

// ── FramePool ────────────────────────────────────────────────────

/// Pool of raw capture buffers.
pub struct FramePool {
    inner: Pool<RawFrame>,
}

impl FramePool {
    /// Pre-allocate `pool_size` frames of `buffer_capacity` bytes.
    pub fn new(buffer_capacity: usize, pool_size: usize) -> Self {
        Self {
            inner: Pool::new(pool_size, buffer_capacity, RawFrame::with_capacity),
        }
    }

    /// Take an exclusively owned, reset frame. Never blocks.
    pub fn acquire(&self) -> RawFrame {
        let mut frame = self.inner.acquire(RawFrame::with_capacity);
        frame.reset();
        frame
    }

    /// Return a frame to the free list.
    pub fn release(&self, frame: RawFrame) {
        self.inner.release(frame);
    }

    pub fn free_count(&self) -> usize {
        self.inner.list().len()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}

// ── CompressedPool ───────────────────────────────────────────────

/// Pool of compressed output buffers.
pub struct CompressedPool {
    inner: Pool<CompressedFrame>,
}

impl CompressedPool {
    pub fn new(buffer_capacity: usize, pool_size: usize) -> Self {
        Self {
            inner: Pool::new(pool_size, buffer_capacity, CompressedFrame::with_capacity),
        }
    }

    /// Take an exclusively owned, empty compressed frame. Never blocks.
    pub fn acquire(&self) -> CompressedFrame {
        let mut frame = self.inner.acquire(CompressedFrame::with_capacity);
        frame.reset();
        frame
    }

    pub fn release(&self, frame: CompressedFrame) {
        self.inner.release(frame);
    }

    /// Return every frame in `in_flight` that no session references
    /// any more. Frames still held elsewhere stay in the list.
    ///
    /// Returns the number of reclaimed frames.
    pub fn reclaim(&self, in_flight: &mut Vec<Arc<CompressedFrame>>) -> usize {
        let mut reclaimed = 0;
        let mut i = 0;
        while i < in_flight.len() {
            if Arc::strong_count(&in_flight[i]) == 1 {
                let shared = in_flight.swap_remove(i);
                if let Ok(frame) = Arc::try_unwrap(shared) {
                    self.release(frame);
                    reclaimed += 1;
                }
            } else {
                i += 1;
            }
        }
        reclaimed
    }

    pub fn free_count(&self) -> usize {
        self.inner.list().len()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}

// ── Tests ────────────────────────────────────────────────────────
