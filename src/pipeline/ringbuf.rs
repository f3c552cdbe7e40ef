//! Bounded frame queue with drop-oldest backpressure

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::debug;

use crate::capture::Frame;

/// Frame queue shared by one capture worker and one delivery adapter.
///
/// Holds at most `capacity` access units. Pushing into a full queue evicts
/// the oldest entry first. The mutex is held only for the O(1) push/pop.
pub struct FrameQueue {
    ring: Mutex<HeapRb<Frame>>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl FrameQueue {
    /// `capacity` is clamped to at least one entry
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: append a frame, returning the evicted oldest frame if full
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let evicted = {
            let mut ring = self.ring.lock();
            ring.push_overwrite(frame)
        };

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        if let Some(ref old) = evicted {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Queue full, dropped frame seq={} size={}",
                old.meta.sequence,
                old.len()
            );
        }
        evicted
    }

    /// Consumer: take the oldest frame
    pub fn pop(&self) -> Option<Frame> {
        self.pop_with_remaining().map(|(frame, _)| frame)
    }

    /// Consumer: take the oldest frame along with the number still queued
    pub fn pop_with_remaining(&self) -> Option<(Frame, usize)> {
        let popped = {
            let mut ring = self.ring.lock();
            ring.try_pop().map(|frame| (frame, ring.occupied_len()))
        };
        if popped.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        popped
    }

    pub fn len(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity().get()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
